//! savesync-core: save file synchronisation engine
//!
//! Tracks application save files by content checksum, stores their paths in
//! a machine-independent form, decides between push and pull from recorded
//! usage, and migrates legacy flat remote folders into the structured layout.

pub mod compare;
pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod migrate;
pub mod path;
pub mod record;
pub mod remote;
pub mod store;
pub mod tracker;

pub use compare::{ComparisonStatus, Recommendation, SyncComparison, compare};
pub use config::{ItemConfig, SaveSyncConfig};
pub use engine::{
    EngineSettings, SmartAction, SmartSyncOutcome, SyncEngine, TrackedItem, TransferReport,
};
pub use error::{Result, SyncError};
pub use hash::ContentHash;
pub use migrate::{MigrationOutcome, MigrationPlan};
pub use path::{PathRoots, PortablePath};
pub use record::{ChecksumRecord, ConflictPolicy, RecordSet, UsageSample};
pub use remote::{Direction, RemoteTransport, TransportError};
pub use store::{FsRecordStore, ItemKey, RecordStore};
pub use tracker::{ChangeTracker, ScanOutcome};
