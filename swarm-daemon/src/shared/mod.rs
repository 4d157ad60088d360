//! Infrastructure shared by every transfer in a manager

pub mod file_pool;
pub mod listener;
pub mod rate_limiter;
pub mod scheduler;

use std::sync::Arc;

use crate::config::Config;

pub use file_pool::{FilePool, FilePoolError, FileReservation, PooledFile};
pub use listener::{
    IncomingPeer, Listener, ListenerError, ListenerRegistration, PortReservation,
};
pub use rate_limiter::{RateLimiter, RateRegistration};
pub use scheduler::{Reclaimable, Scheduler};

/// Handles to the shared services, cheap to clone into each transfer
#[derive(Clone)]
pub struct SharedContext {
    pub scheduler: Arc<Scheduler>,
    pub file_pool: Arc<FilePool>,
    pub rate_limiter: Arc<RateLimiter>,
    pub listener: Arc<Listener>,
}

impl SharedContext {
    /// Build unbound services from manager configuration
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: &Config) -> Self {
        Self {
            scheduler: Arc::new(Scheduler::new()),
            file_pool: Arc::new(FilePool::new(config.max_files_open)),
            rate_limiter: Arc::new(RateLimiter::new(
                config.max_upload_rate,
                config.upload_unit_size,
            )),
            listener: Arc::new(Listener::new(config.bind, config.socket_timeout())),
        }
    }
}
