//! MirrorBox synchronization engine.
//!
//! Reconciles files between a local store and a remote store under a
//! configurable strategy. The pieces, leaves first:
//!
//! - [`gate`]: pure network-suitability check.
//! - [`engine`]: the per-file reconciliation state machine, conflict
//!   detection and resolution, and the bounded-concurrency batch run.
//! - [`cache`]: eviction policies over downloaded content.
//! - [`autosync`]: the periodic batch trigger.
//! - [`client`]: the facade applications talk to.
//!
//! Collaborators (metadata, local bytes, remote bytes, archive extraction)
//! are trait objects from `mbx-store`, injected at construction.

pub mod autosync;
pub mod cache;
pub mod client;
pub mod engine;
pub mod gate;

mod batch;

pub use autosync::AutoSync;
pub use cache::CacheManager;
pub use client::{ProgressStream, SyncClient};
pub use engine::{SyncEngine, SyncOutcome};
pub use gate::{allows, NetworkMonitor, NetworkState, StaticNetworkMonitor, Transport};
