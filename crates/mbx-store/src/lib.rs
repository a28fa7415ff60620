//! Collaborator contracts consumed by the sync engine, with bundled
//! implementations: an in-memory and a JSON-file metadata store, a tokio-fs
//! local store, an OpenDAL-backed remote store, and archive extractors.

pub mod archive;
pub mod local;
pub mod metadata;
pub mod remote;

pub use archive::{is_archive, ArchiveExtractor, NoopExtractor, UnzipCommandExtractor};
pub use local::{FsLocalStore, LocalStore};
pub use metadata::{JsonMetadataStore, MemoryMetadataStore, MetadataStore};
pub use remote::{OpendalRemoteStore, RemoteFileInfo, RemoteStore};
