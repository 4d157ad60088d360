//! Messages and tunables shared across the daemon

use std::time::Duration;

// =============================================================================
// Listener
// =============================================================================

/// Pending-connection backlog for the shared listen socket
pub const LISTEN_BACKLOG: i32 = 128;

// =============================================================================
// Error reports
// =============================================================================

pub const ERR_DISK_FULL: &str = "OS reports disk full";
pub const ERR_DISK_PREFIX: &str = "IO error: ";
pub const ERR_LISTENER: &str = "could not open a listen port";
pub const ERR_LISTEN_FAILED: &str = "Couldn't listen: ";
pub const ERR_ALREADY_RUNNING: &str = "transfer is already running: ";
pub const ERR_TRANSFER_PANICKED: &str = "transfer task panicked: ";
pub const ERR_VERIFY_PANICKED: &str = "verification worker panicked: ";
pub const ERR_CLOSE_AFTER_FAILURE: &str = "additional error when closing down due to error: ";

// =============================================================================
// Activity lines
// =============================================================================

pub const MSG_ACTIVITY_CHECKING: &str = "checking existing data";
pub const MSG_ACTIVITY_DOWNLOADING: &str = "downloading";
pub const MSG_ACTIVITY_SEEDING: &str = "seeding";
pub const MSG_ACTIVITY_SHUT_DOWN: &str = "shut down";
pub const MSG_ACTIVITY_FAILED: &str = "download failed: ";
pub const MSG_ACTIVITY_DISK_ERROR: &str = "killed by IO error: ";
pub const MSG_ACTIVITY_INTERNAL_ERROR: &str = "killed by internal exception: ";

// =============================================================================
// Warnings
// =============================================================================

pub const WARN_NO_LISTEN_PORT: &str = "not listening for peers, reporting port 0: ";
pub const WARN_RESUME_DISCARDED: &str = "discarding resume data, rechecking existing data: ";
pub const WARN_RESUME_WRITE: &str = "could not save resume data: ";
pub const WARN_RESUME_DELETE: &str = "could not remove resume data: ";

// =============================================================================
// UPnP
// =============================================================================

pub const MSG_UPNP_CONFIGURED: &str = "UPnP port forwarding configured";
pub const MSG_UPNP_REDISCOVERING: &str = "attempting to rediscover UPnP gateway";
pub const MSG_UPNP_REDISCOVERED: &str = "UPnP gateway rediscovered, port mapping restored";
pub const WARN_UPNP_FAILED: &str = "UPnP setup failed, forward the listen port manually: ";
pub const WARN_UPNP_RENEW_FAILED: &str = "UPnP lease renewal failed: ";
pub const WARN_UPNP_REMAP_FAILED: &str = "UPnP remap after port change failed: ";
pub const WARN_UPNP_REDISCOVER_FAILED: &str = "UPnP rediscovery failed: ";
pub const WARN_UPNP_PORT_EXPIRE: &str = "UPnP port mapping will expire when the lease runs out";
pub const WARN_UPNP_REMOVE_FAILED: &str = "could not remove UPnP port mapping: ";

/// Delay before retrying a failed remap through rediscovery
pub const UPNP_REMAP_RETRY_DELAY: Duration = Duration::from_secs(30);
