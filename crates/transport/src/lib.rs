//! savesync-transport: remote storage backends
//!
//! Implementations of [`savesync_core::RemoteTransport`].

pub mod local;
pub mod rclone;

pub use local::LocalTransport;
pub use rclone::RcloneTransport;
