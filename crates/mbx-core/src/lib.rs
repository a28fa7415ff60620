pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::{CacheStrategy, NetworkType, SyncConfig, SyncStrategy};
pub use error::{MbxError, MbxResult};
pub use retry::RetryPolicy;
pub use types::{
    unix_now, BatchSyncResult, FileMetadata, ProgressFn, SyncProgress, SyncResult, SyncStatus,
};
