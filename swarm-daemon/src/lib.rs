//! Swarm Daemon Library
//!
//! Per-transfer lifecycle coordination for peer-to-peer swarm downloads: a
//! [`TransferManager`] owning the shared infrastructure, and one coordinator
//! task per transfer driving pluggable collaborators.

pub mod collaborators;
pub mod config;
pub mod constants;
pub mod error;
pub mod feedback;
pub mod logging;
pub mod manager;
pub mod resume;
pub mod shared;
pub mod transfers;
pub mod upnp;

pub use config::{Config, ConfigError, ConfigKey};
pub use error::{ErrorCategory, ManagerError, TransferError, classify};
pub use feedback::Feedback;
pub use manager::{Completion, ErrorSink, TransferManager};
pub use transfers::{TransferHandle, TransferInfo, TransferState, TransferStatus};
