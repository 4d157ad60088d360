//! The per-transfer coordinator
//!
//! One coordinator task owns all of a transfer's state. It starts the
//! transfer in stages (reserve files, open storage, load resume data, verify
//! in the background, wire collaborators, announce), then serves commands,
//! collaborator events and routed peer connections until it closes.
//!
//! Collaborators that exist only after a stage completes are `Option` fields.
//! `close` tears down whatever was built, in a fixed order, and hands the
//! collaborators to the scheduler for deferred reclamation.

use std::any::Any;
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use swarm_common::peer_id::make_peer_id;
use swarm_common::{ErrorLevel, Metainfo};

use crate::collaborators::{
    BlockVerifier, Choker, CollaboratorFactory, ConnectionContext, PeerConnectionManager, PeerId,
    PiecePicker, StatsAggregator, StatsContext, Storage, StorageContext, TrackerClient,
    TrackerContext, VerificationOutcome,
};
use crate::config::{Config, ConfigKey, TRANSFER_OPTIONS};
use crate::constants::*;
use crate::error::{ErrorCategory, TransferError};
use crate::feedback::Feedback;
use crate::resume::{self, ResumeData};
use crate::shared::scheduler::panic_message;
use crate::shared::{
    FileReservation, IncomingPeer, ListenerRegistration, PortReservation, RateRegistration,
    Reclaimable, SharedContext,
};

use super::bans::BanList;
use super::command::{CoordinatorLink, TransferCommand, TransferEvent};
use super::rate_measure::RateMeasure;
use super::types::{LoggedError, Snapshot, TransferInfo, TransferState, TransferStatus, fraction_done};
use super::upload_slots::auto_upload_slots;
use super::verify::{VerificationRun, VerifyControl};

/// Everything a coordinator is built from
pub(crate) struct TransferParts {
    pub info: TransferInfo,
    pub metainfo: Metainfo,
    pub dest: PathBuf,
    pub config: Config,
    pub shared: SharedContext,
    pub factory: Arc<dyn CollaboratorFactory>,
    pub feedback: Arc<dyn Feedback>,
}

pub(crate) struct Transfer {
    info: TransferInfo,
    metainfo: Metainfo,
    dest: PathBuf,
    config: Config,
    shared: SharedContext,
    factory: Arc<dyn CollaboratorFactory>,
    feedback: Arc<dyn Feedback>,

    state: TransferState,
    started: bool,
    finished: bool,
    is_seed: bool,
    closed: bool,
    /// Set once the transfer begins closing; polled by the verifier
    done: Arc<AtomicBool>,
    /// Whether the tracker has been told about us, so leaving needs announcing
    announced: bool,
    activity: String,
    fraction: f64,
    errors: Vec<LoggedError>,

    upload_slots: usize,
    peer_id: PeerId,
    bans: BanList,
    reserved_ports: Vec<PortReservation>,

    file_reservation: Option<FileReservation>,
    storage: Option<Box<dyn Storage>>,
    verifier: Option<Box<dyn BlockVerifier>>,
    verification: Option<VerificationRun>,
    verify_control: VerifyControl,
    choker: Option<Box<dyn Choker>>,
    picker: Option<Box<dyn PiecePicker>>,
    rate_registration: Option<RateRegistration>,
    connections: Option<Box<dyn PeerConnectionManager>>,
    registration: Option<ListenerRegistration>,
    tracker: Option<Box<dyn TrackerClient>>,
    stats: Option<Box<dyn StatsAggregator>>,
    upload: Arc<RateMeasure>,
    download: Arc<RateMeasure>,

    link: CoordinatorLink,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    snapshot: watch::Sender<Snapshot>,
    pending_shutdowns: Vec<oneshot::Sender<()>>,
}

impl Transfer {
    pub(crate) fn new(parts: TransferParts, snapshot: watch::Sender<Snapshot>) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let (link, events) = CoordinatorLink::new(parts.info.total_bytes);
        Self {
            info: parts.info,
            metainfo: parts.metainfo,
            dest: parts.dest,
            config: parts.config,
            shared: parts.shared,
            factory: parts.factory,
            feedback: parts.feedback,
            state: TransferState::Created,
            started: false,
            finished: false,
            is_seed: false,
            closed: false,
            verify_control: VerifyControl::new(done.clone()),
            done,
            announced: false,
            activity: String::new(),
            fraction: 0.0,
            errors: Vec::new(),
            upload_slots: 0,
            peer_id: make_peer_id(),
            bans: BanList::new(),
            reserved_ports: Vec::new(),
            file_reservation: None,
            storage: None,
            verifier: None,
            verification: None,
            choker: None,
            picker: None,
            rate_registration: None,
            connections: None,
            registration: None,
            tracker: None,
            stats: None,
            upload: Arc::new(RateMeasure::default()),
            download: Arc::new(RateMeasure::default()),
            link,
            events,
            snapshot,
            pending_shutdowns: Vec::new(),
        }
    }

    /// Drive the transfer until it closes or every handle is dropped
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TransferCommand>) {
        info!(transfer = %self.info.name, info_hash = %self.info.info_hash, "starting transfer");
        let started = AssertUnwindSafe(self.start(&mut commands))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panicked(payload)));
        if let Err(err) = started {
            self.handle_failure(err).await;
        }
        if self.stop_requested() && !self.closed {
            if let Err(payload) = AssertUnwindSafe(self.shutdown()).catch_unwind().await {
                self.handle_failure(panicked(payload)).await;
            }
        }
        self.answer_pending_shutdowns();

        while !self.closed {
            let dispatched = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        AssertUnwindSafe(self.handle_command(command)).catch_unwind().await
                    }
                    None => AssertUnwindSafe(self.shutdown()).catch_unwind().await.map(drop),
                },
                Some(event) = self.events.recv() => {
                    AssertUnwindSafe(self.handle_event(event)).catch_unwind().await
                }
                Some(peer) = next_peer(&mut self.registration) => {
                    panic::catch_unwind(AssertUnwindSafe(|| self.handle_incoming(peer)))
                }
            };
            if let Err(payload) = dispatched {
                self.handle_failure(panicked(payload)).await;
            }
        }
        self.answer_pending_shutdowns();
        debug!(transfer = %self.info.name, "coordinator exiting");
    }

    // ==========================================================================
    // Startup
    // ==========================================================================

    async fn start(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<TransferCommand>,
    ) -> Result<(), TransferError> {
        self.upload_slots = auto_upload_slots(self.config.max_uploads, self.config.max_upload_rate);

        let files = self.metainfo.file_paths(&self.dest);
        self.file_reservation = Some(self.shared.file_pool.reserve(self.info.info_hash, &files)?);

        let opened = self.factory.open_storage(StorageContext {
            metainfo: &self.metainfo,
            files: &files,
            file_pool: self.shared.file_pool.clone(),
            config: &self.config,
        })?;
        self.storage = Some(opened.storage);
        let mut verifier = opened.verifier;

        let resume = self.load_resume(verifier.as_mut());

        self.state = TransferState::Verifying;
        self.set_activity(MSG_ACTIVITY_CHECKING, 0.0);
        self.verification = Some(VerificationRun::spawn(
            &self.shared.scheduler,
            verifier,
            resume,
            self.verify_control.clone(),
        ));

        let Some(outcome) = self.await_verification(commands).await? else {
            return Ok(());
        };
        self.link.set_amount_left(outcome.amount_left);
        if outcome.amount_left == 0 {
            self.finish()?;
        }

        self.wire_collaborators(&outcome)?;

        if let Some(tracker) = self.tracker.as_mut() {
            tracker.begin();
        }
        self.announced = true;

        self.started = true;
        if !self.finished {
            self.state = TransferState::Downloading;
            let fraction = fraction_done(self.info.total_bytes, outcome.amount_left);
            self.set_activity(MSG_ACTIVITY_DOWNLOADING, fraction);
        } else {
            self.publish();
        }
        info!(transfer = %self.info.name, slots = self.upload_slots, "transfer started");
        self.feedback.started(&self.info);
        Ok(())
    }

    /// Wait for the verification run while serving commands
    ///
    /// # Returns
    /// * `Ok(Some(outcome))` - Verification finished and the transfer continues
    /// * `Ok(None)` - The transfer was asked to stop
    async fn await_verification(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<TransferCommand>,
    ) -> Result<Option<VerificationOutcome>, TransferError> {
        let mut commands_open = true;
        loop {
            let Some(run) = self.verification.as_mut() else {
                return Ok(None);
            };
            tokio::select! {
                joined = run => {
                    self.verification = None;
                    let (verifier, result) = joined?;
                    self.verifier = Some(verifier);
                    if self.stop_requested() {
                        return Ok(None);
                    }
                    return result.map(Some);
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.command_while_verifying(command),
                    None => {
                        commands_open = false;
                        self.request_stop();
                    }
                },
            }
        }
    }

    fn command_while_verifying(&mut self, command: TransferCommand) {
        match command {
            TransferCommand::Status {
                include_spew,
                include_file_info,
                reply,
            } => {
                let _ = reply.send(self.status(include_spew, include_file_info));
            }
            TransferCommand::SetOption { name, value } => self.set_option(&name, &value),
            TransferCommand::ChangePort => {
                debug!(transfer = %self.info.name, "port resolved once verification finishes");
            }
            TransferCommand::Shutdown { reply } => {
                self.request_stop();
                self.pending_shutdowns.extend(reply);
            }
        }
    }

    fn wire_collaborators(&mut self, outcome: &VerificationOutcome) -> Result<(), TransferError> {
        let info_hash = self.info.info_hash;

        self.choker = Some(self.factory.choker(self.upload_slots, &self.config));

        let mut picker = self.factory.piece_picker(&self.metainfo, &outcome.have);
        if self.finished {
            picker.mark_complete();
        }
        debug!(
            have = picker.have_count(),
            pieces = self.metainfo.piece_count(),
            "piece picker ready"
        );
        self.picker = Some(picker);

        self.rate_registration = Some(self.shared.rate_limiter.register(info_hash));

        self.peer_id = make_peer_id();
        self.connections = Some(self.factory.connection_manager(ConnectionContext {
            info: self.info.clone(),
            peer_id: self.peer_id,
            link: self.link.clone(),
            upload: self.upload.clone(),
            download: self.download.clone(),
            rate_limiter: self.shared.rate_limiter.clone(),
            min_peers: self.config.min_peers,
            max_connections: self.config.max_connections,
        }));
        self.registration = Some(self.shared.listener.register(info_hash)?);

        let port = self.resolve_port();
        self.tracker = Some(self.factory.tracker_client(TrackerContext {
            info: self.info.clone(),
            announce: self.metainfo.announce.clone(),
            peer_id: self.peer_id,
            port,
            ip: self.config.ip,
            is_seed: self.is_seed,
            link: self.link.clone(),
            upload: self.upload.clone(),
            download: self.download.clone(),
        })?);

        self.stats = Some(self.factory.stats_aggregator(StatsContext {
            info: self.info.clone(),
            piece_count: self.metainfo.piece_count(),
            upload: self.upload.clone(),
            download: self.download.clone(),
            link: self.link.clone(),
        }));
        Ok(())
    }

    /// Load and validate the resume file; any problem means full verification
    fn load_resume(&mut self, verifier: &mut dyn BlockVerifier) -> Option<ResumeData> {
        let data_dir = self.config.data_dir.clone()?;
        let data = match resume::read_resume(&data_dir, &self.info.info_hash) {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(err) => {
                self.error(ErrorLevel::Warning, &format!("{WARN_RESUME_DISCARDED}{err}"));
                return None;
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(|| verifier.verify_resume(&data))) {
            Ok(Ok(())) => {
                debug!(transfer = %self.info.name, "resume data accepted");
                Some(data)
            }
            Ok(Err(err)) => {
                self.error(ErrorLevel::Warning, &format!("{WARN_RESUME_DISCARDED}{err}"));
                None
            }
            Err(payload) => {
                let message = panic_message(payload);
                self.error(ErrorLevel::Warning, &format!("{WARN_RESUME_DISCARDED}{message}"));
                None
            }
        }
    }

    // ==========================================================================
    // Running
    // ==========================================================================

    async fn handle_command(&mut self, command: TransferCommand) {
        match command {
            TransferCommand::Status {
                include_spew,
                include_file_info,
                reply,
            } => {
                let _ = reply.send(self.status(include_spew, include_file_info));
            }
            TransferCommand::SetOption { name, value } => self.set_option(&name, &value),
            TransferCommand::ChangePort => self.change_port(),
            TransferCommand::Shutdown { reply } => {
                self.shutdown().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    async fn handle_event(&mut self, event: TransferEvent) {
        if self.closed {
            return;
        }
        match event {
            TransferEvent::KickPeer(addr) => {
                if let Some(connections) = self.connections.as_mut() {
                    connections.kick(addr);
                }
            }
            TransferEvent::BanPeer(ip) => self.ban_peer(ip),
            TransferEvent::DataFlunked(addr) => {
                if self.config.retaliate_to_garbled_data {
                    self.ban_peer(addr.ip());
                } else if let Some(connections) = self.connections.as_mut() {
                    connections.kick(addr);
                }
            }
            TransferEvent::DownloadComplete => {
                if let Err(err) = self.finish() {
                    self.handle_failure(err).await;
                }
            }
            TransferEvent::AnnounceCompleted => self.release_stale_ports(),
            TransferEvent::NoPeers { level, text } => self.internal_shutdown(level, &text).await,
            TransferEvent::Error { level, text } => self.error(level, &text),
            TransferEvent::Failure(err) => self.handle_failure(err).await,
        }
    }

    fn handle_incoming(&mut self, peer: IncomingPeer) {
        if self.bans.is_banned(peer.addr.ip()) {
            debug!(peer = %peer.addr, "refusing banned peer");
            return;
        }
        if let Some(connections) = self.connections.as_mut() {
            connections.accept(peer);
        }
    }

    fn ban_peer(&mut self, ip: IpAddr) {
        if self.bans.ban(ip) {
            info!(transfer = %self.info.name, peer = %ip, "banned peer");
        }
        if let Some(connections) = self.connections.as_mut() {
            connections.ban(ip);
        }
    }

    fn status(&self, include_spew: bool, include_file_info: bool) -> TransferStatus {
        let mut status = match self.stats.as_ref() {
            Some(stats) if self.started && !self.closed => {
                stats.gather(include_spew, include_file_info)
            }
            _ => TransferStatus::local(self.activity.clone(), self.current_fraction(), self.state),
        };
        status.activity = self.activity.clone();
        status.state = self.state;
        status.errors = self.errors.clone();
        status
    }

    fn current_fraction(&self) -> f64 {
        if self.state == TransferState::Verifying {
            let total = self.info.total_bytes;
            return fraction_done(total, total.saturating_sub(self.verify_control.checked()));
        }
        self.fraction
    }

    /// Apply a runtime option; unknown, disallowed and unchanged values are ignored
    fn set_option(&mut self, name: &str, value: &str) {
        if self.closed {
            return;
        }
        let Ok(key) = ConfigKey::from_str(name) else {
            debug!(option = %name, "ignoring unknown transfer option");
            return;
        };
        if !TRANSFER_OPTIONS.contains(&key) {
            debug!(option = %name, "option cannot change on a running transfer");
            return;
        }
        match self.config.apply(key, value) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                debug!(error = %err, "ignoring invalid transfer option");
                return;
            }
        }

        match key {
            ConfigKey::MaxUploadRate | ConfigKey::MaxUploads => {
                self.upload_slots =
                    auto_upload_slots(self.config.max_uploads, self.config.max_upload_rate);
                if let Some(choker) = self.choker.as_mut() {
                    choker.set_max_uploads(self.upload_slots);
                }
            }
            ConfigKey::MinPeers | ConfigKey::MaxConnections => {
                if let Some(connections) = self.connections.as_mut() {
                    connections
                        .set_connection_limits(self.config.min_peers, self.config.max_connections);
                }
            }
            ConfigKey::ForwardedPort => self.change_port(),
            _ => {}
        }
    }

    // ==========================================================================
    // Ports
    // ==========================================================================

    /// Port to report to the tracker
    ///
    /// A forwarded port releases every listener reservation. Otherwise the
    /// listener's current port is reserved; a repeat of the newest
    /// reservation is not stacked.
    fn resolve_port(&mut self) -> u16 {
        if self.config.forwarded_port != 0 {
            self.reserved_ports.clear();
            return self.config.forwarded_port;
        }
        match self.shared.listener.reserve_port() {
            Ok(reservation) => {
                let port = reservation.port();
                let repeat = self
                    .reserved_ports
                    .last()
                    .is_some_and(|newest| newest.port() == port);
                if !repeat {
                    self.reserved_ports.push(reservation);
                }
                port
            }
            Err(err) => {
                self.error(ErrorLevel::Warning, &format!("{WARN_NO_LISTEN_PORT}{err}"));
                0
            }
        }
    }

    fn change_port(&mut self) {
        if self.closed || self.tracker.is_none() {
            return;
        }
        let port = self.resolve_port();
        self.peer_id = make_peer_id();
        if let Some(connections) = self.connections.as_mut() {
            connections.set_peer_id(self.peer_id);
        }
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.change_port(self.peer_id, port);
        }
        info!(transfer = %self.info.name, port, "reporting new port");
    }

    /// The tracker knows our newest port; older reservations can go
    fn release_stale_ports(&mut self) {
        let newest = self.reserved_ports.pop();
        self.reserved_ports.clear();
        self.reserved_ports.extend(newest);
    }

    // ==========================================================================
    // Completion and checkpoints
    // ==========================================================================

    fn finish(&mut self) -> Result<(), TransferError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.is_seed = true;
        if let Some(storage) = self.storage.as_mut() {
            storage.close()?;
        }
        if self.announced {
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.announce_completed();
            }
        }
        if let Some(picker) = self.picker.as_mut() {
            picker.mark_complete();
        }
        self.state = TransferState::Seeding;
        self.set_activity(MSG_ACTIVITY_SEEDING, 1.0);
        if self.config.check_hashes {
            self.save_resume(true);
        }
        info!(transfer = %self.info.name, "download complete");
        self.feedback.finished(&self.info);
        Ok(())
    }

    /// Write the resume file
    ///
    /// Outside of completion this only runs for a started, unfinished
    /// transfer. Failures are warnings.
    fn save_resume(&mut self, on_finish: bool) {
        if !on_finish && (self.finished || !self.started) {
            return;
        }
        let Some(data_dir) = self.config.data_dir.clone() else {
            return;
        };
        let Some(verifier) = self.verifier.as_ref() else {
            return;
        };
        let data = verifier.resume_data();
        match resume::write_resume(&data_dir, &self.info.info_hash, &data) {
            Ok(()) => debug!(transfer = %self.info.name, "saved resume data"),
            Err(err) => self.error(ErrorLevel::Warning, &format!("{WARN_RESUME_WRITE}{err}")),
        }
    }

    // ==========================================================================
    // Shutdown and failure
    // ==========================================================================

    fn stop_requested(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Close and checkpoint the transfer
    ///
    /// # Returns
    /// `true` if closing failed and the failure was already reported
    async fn shutdown(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if let Err(err) = self.close().await {
            self.handle_failure(err).await;
            return true;
        }
        self.save_resume(false);
        self.reclaim_verifier();
        self.set_activity(MSG_ACTIVITY_SHUT_DOWN, 0.0);
        info!(transfer = %self.info.name, "transfer shut down");
        false
    }

    /// Stop after the tracker gave up, without announcing our departure
    async fn internal_shutdown(&mut self, level: ErrorLevel, text: &str) {
        self.announced = false;
        self.error(level, text);
        if !self.shutdown().await {
            self.feedback.failed(&self.info, true);
        }
    }

    /// Report `err` by category, close, and notify failure
    async fn handle_failure(&mut self, err: TransferError) {
        let category = err.category();
        match category {
            ErrorCategory::External => self.error(ErrorLevel::Error, &err.to_string()),
            ErrorCategory::Fatal | ErrorCategory::Disk => {
                self.error(ErrorLevel::Critical, &err.report_text())
            }
            ErrorCategory::Internal => {
                let text = err.report_text();
                self.record_error(ErrorLevel::Critical, &text);
                self.feedback.exception(&self.info, &text);
            }
        }

        if let Err(close_err) = self.close().await {
            self.error(
                ErrorLevel::Error,
                &format!("{ERR_CLOSE_AFTER_FAILURE}{close_err}"),
            );
        }
        self.reclaim_verifier();

        if category == ErrorCategory::External {
            self.set_activity(err.activity_text(), 0.0);
            self.feedback.failed(&self.info, true);
            return;
        }

        self.state = TransferState::Failed;
        self.set_activity(err.activity_text(), 0.0);
        if let Some(data_dir) = self.config.data_dir.clone() {
            if let Err(delete_err) = resume::delete_resume(&data_dir, &self.info.info_hash) {
                self.error(
                    ErrorLevel::Warning,
                    &format!("{WARN_RESUME_DELETE}{delete_err}"),
                );
            }
        }
        self.feedback.failed(&self.info, false);
    }

    /// Tear down in order; storage close errors surface after the rest ran
    async fn close(&mut self) -> Result<(), TransferError> {
        if self.closed {
            return Ok(());
        }
        self.request_stop();
        let mut reclaim: Vec<Reclaimable> = Vec::new();

        if let Some(mut tracker) = self.tracker.take() {
            if self.announced {
                tracker.stop();
            }
            reclaim.push(Box::new(tracker));
        }
        if let Some(run) = self.verification.take() {
            match run.await {
                Ok((verifier, _)) => self.verifier = Some(verifier),
                Err(err) => warn!(error = %err, "verification worker failed while closing"),
            }
        }
        self.closed = true;

        self.file_reservation = None;
        self.registration = None;
        self.reserved_ports.clear();
        if let Some(mut connections) = self.connections.take() {
            connections.close_all();
            reclaim.push(Box::new(connections));
        }
        let storage_result = match self.storage.take() {
            Some(mut storage) => {
                let result = storage.close();
                reclaim.push(Box::new(storage));
                result
            }
            None => Ok(()),
        };
        self.rate_registration = None;
        if let Some(choker) = self.choker.take() {
            reclaim.push(Box::new(choker));
        }
        if let Some(picker) = self.picker.take() {
            reclaim.push(Box::new(picker));
        }
        if let Some(stats) = self.stats.take() {
            reclaim.push(Box::new(stats));
        }

        self.state = TransferState::Closed;
        self.publish();
        debug!(transfer = %self.info.name, count = reclaim.len(), "transfer closed");
        self.shared.scheduler.defer_reclaim(reclaim);
        storage_result
    }

    fn reclaim_verifier(&mut self) {
        if let Some(verifier) = self.verifier.take() {
            let item: Reclaimable = Box::new(verifier);
            self.shared.scheduler.defer_reclaim(vec![item]);
        }
    }

    fn answer_pending_shutdowns(&mut self) {
        for reply in self.pending_shutdowns.drain(..) {
            let _ = reply.send(());
        }
    }

    // ==========================================================================
    // Reporting
    // ==========================================================================

    fn error(&mut self, level: ErrorLevel, text: &str) {
        self.record_error(level, text);
        self.feedback.error(&self.info, level, text);
    }

    fn record_error(&mut self, level: ErrorLevel, text: &str) {
        match level {
            ErrorLevel::Info => info!(transfer = %self.info.name, "{text}"),
            ErrorLevel::Warning => warn!(transfer = %self.info.name, "{text}"),
            ErrorLevel::Error => error!(transfer = %self.info.name, "{text}"),
            ErrorLevel::Critical => error!(transfer = %self.info.name, critical = true, "{text}"),
        }
        self.errors.push(LoggedError {
            at: Utc::now(),
            level,
            text: text.to_string(),
        });
    }

    fn set_activity(&mut self, activity: impl Into<String>, fraction: f64) {
        self.activity = activity.into();
        self.fraction = fraction;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(Snapshot {
            state: self.state,
            activity: self.activity.clone(),
            fraction_done: self.current_fraction(),
            started: self.started,
            finished: self.finished,
            is_seed: self.is_seed,
            closed: self.closed,
        });
    }
}

/// Internal error for a panic caught on the coordinator task
fn panicked(payload: Box<dyn Any + Send>) -> TransferError {
    TransferError::internal(format!("{ERR_TRANSFER_PANICKED}{}", panic_message(payload)))
}

/// Next routed connection, or never if the transfer is not registered
async fn next_peer(registration: &mut Option<ListenerRegistration>) -> Option<IncomingPeer> {
    match registration {
        Some(registration) => registration.accept().await,
        None => std::future::pending().await,
    }
}
