//! Transfer manager
//!
//! Owns the infrastructure shared by every transfer (scheduler, file pool,
//! rate limiter, listener), starts transfers as isolated contexts, and
//! applies manager-wide options.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use swarm_common::{ErrorLevel, InfoHash, Metainfo};

use crate::collaborators::CollaboratorFactory;
use crate::config::{Config, ConfigKey, MANAGER_OPTIONS};
use crate::constants::*;
use crate::error::{ManagerError, TransferError};
use crate::feedback::Feedback;
use crate::resume;
use crate::shared::SharedContext;
use crate::transfers::{self, TransferHandle, TransferInfo, TransferParts, fraction_done};
use crate::upnp::{UpnpGateway, spawn_lease_renewal_task};

/// Receives manager-level problems that belong to no single transfer
pub type ErrorSink = Arc<dyn Fn(ErrorLevel, &str) + Send + Sync>;

type TransferMap = Arc<Mutex<HashMap<InfoHash, TransferHandle>>>;

/// Completion of on-disk data for a transfer that is not running
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub fraction: f64,
    /// Per-file fractions in metainfo order, when requested
    pub files: Option<Vec<f64>>,
}

pub struct TransferManager {
    config: Mutex<Config>,
    shared: SharedContext,
    factory: Arc<dyn CollaboratorFactory>,
    error_sink: ErrorSink,
    transfers: TransferMap,
    upnp: Option<Arc<UpnpGateway>>,
    upnp_renewal: Option<JoinHandle<()>>,
}

impl TransferManager {
    /// Build the shared infrastructure and open a listen port
    ///
    /// If no port in `[min_port, max_port]` can be bound this fails, unless
    /// `listen_fail_ok` is set; then a critical error goes to `error_sink`
    /// and the manager runs without listening.
    pub async fn new(
        config: Config,
        factory: Arc<dyn CollaboratorFactory>,
        error_sink: ErrorSink,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let shared = SharedContext::new(&config);

        let port = match shared.listener.open_port(config.min_port, config.max_port) {
            Ok(port) => Some(port),
            Err(err) if config.listen_fail_ok => {
                let text = format!("{ERR_LISTEN_FAILED}{err}");
                error!(critical = true, "{text}");
                error_sink(ErrorLevel::Critical, &text);
                None
            }
            Err(err) => return Err(err.into()),
        };

        let (upnp, upnp_renewal) = match port {
            Some(port) if config.upnp => Self::setup_upnp(&config, port, &error_sink).await,
            _ => (None, None),
        };

        info!(port = ?port, bind = %config.bind, "transfer manager ready");
        Ok(Self {
            config: Mutex::new(config),
            shared,
            factory,
            error_sink,
            transfers: Arc::new(Mutex::new(HashMap::new())),
            upnp,
            upnp_renewal,
        })
    }

    async fn setup_upnp(
        config: &Config,
        port: u16,
        error_sink: &ErrorSink,
    ) -> (Option<Arc<UpnpGateway>>, Option<JoinHandle<()>>) {
        match UpnpGateway::setup(config.bind, port).await {
            Ok(gateway) => {
                let gateway = Arc::new(gateway);
                let renewal = spawn_lease_renewal_task(gateway.clone());
                (Some(gateway), Some(renewal))
            }
            Err(err) => {
                let text = format!("{WARN_UPNP_FAILED}{err}");
                warn!("{text}");
                error_sink(ErrorLevel::Warning, &text);
                (None, None)
            }
        }
    }

    /// Start a transfer without waiting for it
    ///
    /// The transfer runs as an isolated context. The coordinator turns
    /// collaborator panics into internal failures and closes itself; if its
    /// failure handling panics too, the context reports it through
    /// `feedback` and other transfers keep running.
    pub fn start_transfer(
        &self,
        metainfo: Metainfo,
        config: Config,
        feedback: Arc<dyn Feedback>,
        dest: PathBuf,
    ) -> Result<TransferHandle, TransferError> {
        let info = TransferInfo::from_metainfo(&metainfo);
        let info_hash = info.info_hash;

        let mut transfers = self.transfers.lock().expect("transfers lock poisoned");
        if transfers.contains_key(&info_hash) {
            return Err(TransferError::user(format!("{ERR_ALREADY_RUNNING}{info_hash}")));
        }

        let (handle, coordinator) = transfers::create(TransferParts {
            info: info.clone(),
            metainfo,
            dest,
            config,
            shared: self.shared.clone(),
            factory: self.factory.clone(),
            feedback: feedback.clone(),
        });
        transfers.insert(info_hash, handle.clone());
        drop(transfers);

        let forget = ForgetOnExit {
            info_hash,
            transfers: self.transfers.clone(),
        };
        let label = format!("transfer {}", info.name);
        self.shared.scheduler.spawn_isolated(
            label,
            async move {
                let _forget = forget;
                coordinator.await;
            },
            move |message| {
                feedback.exception(&info, &format!("{ERR_TRANSFER_PANICKED}{message}"));
                feedback.failed(&info, false);
            },
        );
        Ok(handle)
    }

    /// Apply a manager option
    ///
    /// Only rate limit, upload unit size, open-file limit and the port range
    /// are accepted; anything else is ignored. Port range changes rebind
    /// once the range is valid and tell every transfer about a new port.
    pub fn set_option(&self, name: &str, value: &str) -> Result<(), ManagerError> {
        let Ok(key) = ConfigKey::from_str(name) else {
            debug!(option = %name, "ignoring unknown manager option");
            return Ok(());
        };
        if !MANAGER_OPTIONS.contains(&key) {
            debug!(option = %name, "not a manager option");
            return Ok(());
        }

        let mut config = self.config.lock().expect("manager config lock poisoned");
        let mut updated = config.clone();
        if !updated.apply(key, value)? {
            return Ok(());
        }

        match key {
            ConfigKey::MaxUploadRate => self.shared.rate_limiter.set_rate(updated.max_upload_rate),
            ConfigKey::UploadUnitSize => {
                updated.validate()?;
                self.shared.rate_limiter.set_unit_size(updated.upload_unit_size);
            }
            ConfigKey::MaxFilesOpen => self.shared.file_pool.set_max_files_open(updated.max_files_open),
            ConfigKey::MinPort | ConfigKey::MaxPort => {
                if updated.min_port <= updated.max_port {
                    self.rebind(&updated);
                }
            }
            _ => {}
        }
        *config = updated;
        Ok(())
    }

    fn rebind(&self, config: &Config) {
        let before = self.shared.listener.current_port();
        match self.shared.listener.open_port(config.min_port, config.max_port) {
            Ok(port) if Some(port) != before => {
                info!(port, "listen port changed");
                for handle in self.transfers() {
                    handle.change_port();
                }
                self.remap_upnp(port);
            }
            Ok(_) => {}
            Err(err) => {
                let text = format!("{ERR_LISTEN_FAILED}{err}");
                error!(critical = true, "{text}");
                (self.error_sink)(ErrorLevel::Critical, &text);
            }
        }
    }

    fn remap_upnp(&self, port: u16) {
        let Some(gateway) = self.upnp.clone() else {
            return;
        };
        let scheduler = self.shared.scheduler.clone();
        tokio::spawn(async move {
            let Err(err) = gateway.remap(port).await else {
                return;
            };
            warn!(port, error = %err, "{WARN_UPNP_REMAP_FAILED}");
            scheduler.schedule_after(UPNP_REMAP_RETRY_DELAY, async move {
                match gateway.rediscover_and_remap().await {
                    Ok(()) => info!("{MSG_UPNP_REDISCOVERED}"),
                    Err(err) => warn!(error = %err, "{WARN_UPNP_REDISCOVER_FAILED}"),
                }
            });
        });
    }

    /// Estimate how much of a transfer is already on disk, without starting it
    ///
    /// Returns `None` when no data directory is configured, the files cannot
    /// be probed, or the resume file is unreadable or does not match.
    /// Zero-byte content is complete, but has no per-file answer.
    pub fn estimate_completion(
        &self,
        config: &Config,
        metainfo: &Metainfo,
        dest: &Path,
        want_file_list: bool,
    ) -> Option<Completion> {
        let data_dir = config.data_dir.as_ref()?;
        let total = metainfo.total_bytes();
        if total == 0 {
            if want_file_list {
                return None;
            }
            return Some(Completion {
                fraction: 1.0,
                files: None,
            });
        }

        let files = metainfo.file_paths(dest);
        let mut verifier = match self.factory.probe_storage(metainfo, &files) {
            Ok(verifier) => verifier,
            Err(err) => {
                debug!(info_hash = %metainfo.info_hash, error = %err, "cannot probe storage");
                return None;
            }
        };
        let resume = match resume::read_resume(data_dir, &metainfo.info_hash) {
            Ok(resume) => resume,
            Err(err) => {
                debug!(info_hash = %metainfo.info_hash, error = %err, "unreadable resume data");
                return None;
            }
        };
        if let Some(data) = resume.as_ref() {
            if let Err(err) = verifier.verify_resume(data) {
                debug!(info_hash = %metainfo.info_hash, error = %err, "resume data does not match");
                return None;
            }
        }

        let estimate = match verifier.estimate(resume.as_ref(), want_file_list) {
            Ok(estimate) => estimate,
            Err(err) => {
                debug!(info_hash = %metainfo.info_hash, error = %err, "estimate failed");
                return None;
            }
        };
        let files = if want_file_list {
            let left = estimate.file_amounts_left?;
            let fractions = metainfo
                .files
                .iter()
                .zip(left)
                .map(|(file, left)| fraction_done(file.length, left))
                .collect();
            Some(fractions)
        } else {
            None
        };
        Some(Completion {
            fraction: fraction_done(total, estimate.amount_left),
            files,
        })
    }

    pub fn transfer(&self, info_hash: &InfoHash) -> Option<TransferHandle> {
        self.transfers
            .lock()
            .expect("transfers lock poisoned")
            .get(info_hash)
            .cloned()
    }

    /// Handles to every transfer whose task is still running
    pub fn transfers(&self) -> Vec<TransferHandle> {
        self.transfers
            .lock()
            .expect("transfers lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.shared.listener.current_port()
    }

    pub fn config(&self) -> Config {
        self.config.lock().expect("manager config lock poisoned").clone()
    }

    pub fn shared(&self) -> &SharedContext {
        &self.shared
    }

    /// Shut down every transfer, then release the port and its UPnP mapping
    pub async fn shutdown(&self) {
        for handle in self.transfers() {
            handle.shutdown().await;
        }
        if let Some(renewal) = self.upnp_renewal.as_ref() {
            renewal.abort();
        }
        if let Some(gateway) = self.upnp.as_ref() {
            if let Err(err) = gateway.remove_port_mapping().await {
                warn!(error = %err, "{WARN_UPNP_REMOVE_FAILED}");
            }
        }
        self.shared.listener.close();
        info!("transfer manager shut down");
    }
}

/// Removes a transfer from the manager's table when its task exits
struct ForgetOnExit {
    info_hash: InfoHash,
    transfers: TransferMap,
}

impl Drop for ForgetOnExit {
    fn drop(&mut self) {
        if let Ok(mut transfers) = self.transfers.lock() {
            transfers.remove(&self.info_hash);
        }
    }
}
