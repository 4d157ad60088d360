//! Shared test utilities: mock collaborators recording into a journal

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use swarm_common::{Bitfield, ErrorLevel, FileEntry, InfoHash, Metainfo};
use swarm_daemon::collaborators::{
    BlockVerifier, Choker, CollaboratorFactory, CompletionEstimate, ConnectionContext,
    OpenedStorage, PeerConnectionManager, PeerId, PiecePicker, StatsAggregator, StatsContext,
    Storage, StorageContext, TrackerClient, TrackerContext, VerificationOutcome,
};
use swarm_daemon::config::Config;
use swarm_daemon::error::TransferError;
use swarm_daemon::feedback::Feedback;
use swarm_daemon::manager::{ErrorSink, TransferManager};
use swarm_daemon::resume::{self, ResumeData};
use swarm_daemon::shared::IncomingPeer;
use swarm_daemon::transfers::{
    CoordinatorLink, TransferInfo, TransferState, TransferStatus, VerifyControl,
};

pub const PIECES: usize = 4;

/// How a mock collaborator fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    Shutdown,
    User,
    Disk,
    Internal,
    Panic,
}

impl FailKind {
    pub fn raise(self, context: &str) -> TransferError {
        match self {
            FailKind::Shutdown => TransferError::shutdown(format!("{context} refused")),
            FailKind::User => TransferError::user(format!("{context} rejected")),
            FailKind::Disk => TransferError::disk(context, io::Error::other("device unplugged")),
            FailKind::Internal => TransferError::internal(format!("{context} broke")),
            FailKind::Panic => panic!("{context} panicked"),
        }
    }
}

/// Knobs for the mock collaborators
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Bytes left after verification
    pub amount_left: u64,
    pub file_amounts_left: Option<Vec<u64>>,
    /// Time verification takes; cancellation is observed every few ms
    pub verify_delay: Duration,
    pub reject_resume: bool,
    pub open_failure: Option<FailKind>,
    pub probe_failure: Option<FailKind>,
    pub check_failure: Option<FailKind>,
    pub close_failure: Option<FailKind>,
    pub tracker_failure: Option<FailKind>,
    pub panic_in_picker: bool,
    pub panic_on_kick: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            amount_left: 1000,
            file_amounts_left: None,
            verify_delay: Duration::ZERO,
            reject_resume: false,
            open_failure: None,
            probe_failure: None,
            check_failure: None,
            close_failure: None,
            tracker_failure: None,
            panic_in_picker: false,
            panic_on_kick: false,
        }
    }
}

/// Everything the mocks observed, shared by all transfers of a factory
#[derive(Default)]
pub struct MockState {
    behavior: Mutex<Behavior>,
    journal: Mutex<Vec<String>>,
    links: Mutex<Vec<CoordinatorLink>>,
    accepted: Mutex<Vec<SocketAddr>>,
    tracker_ports: Mutex<Vec<u16>>,
    choker_slots: Mutex<Vec<usize>>,
}

impl MockState {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            ..Default::default()
        })
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior.lock().unwrap().clone()
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.journal.lock().unwrap().push(entry.into());
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.journal().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    /// Index of the first journal entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.journal().iter().position(|e| e == entry)
    }

    /// Link handed to the most recent connection manager
    pub fn link(&self) -> CoordinatorLink {
        self.links
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a connection manager was created")
    }

    pub fn accepted(&self) -> Vec<SocketAddr> {
        self.accepted.lock().unwrap().clone()
    }

    pub fn tracker_ports(&self) -> Vec<u16> {
        self.tracker_ports.lock().unwrap().clone()
    }

    pub fn choker_slots(&self) -> Vec<usize> {
        self.choker_slots.lock().unwrap().clone()
    }
}

pub struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new(state: Arc<MockState>) -> Self {
        Self { state }
    }

    fn verifier(&self, metainfo: &Metainfo, files: &[PathBuf]) -> MockVerifier {
        MockVerifier {
            state: self.state.clone(),
            pieces: metainfo.piece_count(),
            total: metainfo.total_bytes(),
            files: files.to_vec(),
        }
    }
}

impl CollaboratorFactory for MockFactory {
    fn open_storage(&self, ctx: StorageContext<'_>) -> Result<OpenedStorage, TransferError> {
        self.state.record("open_storage");
        if let Some(kind) = self.state.behavior().open_failure {
            return Err(kind.raise("open_storage"));
        }
        Ok(OpenedStorage {
            storage: Box::new(MockStorage {
                state: self.state.clone(),
            }),
            verifier: Box::new(self.verifier(ctx.metainfo, ctx.files)),
        })
    }

    fn probe_storage(
        &self,
        metainfo: &Metainfo,
        files: &[PathBuf],
    ) -> Result<Box<dyn BlockVerifier>, TransferError> {
        self.state.record("probe_storage");
        if let Some(kind) = self.state.behavior().probe_failure {
            return Err(kind.raise("probe_storage"));
        }
        Ok(Box::new(self.verifier(metainfo, files)))
    }

    fn choker(&self, max_uploads: usize, _config: &Config) -> Box<dyn Choker> {
        self.state.record("choker");
        self.state.choker_slots.lock().unwrap().push(max_uploads);
        Box::new(MockChoker {
            state: self.state.clone(),
        })
    }

    fn piece_picker(&self, _metainfo: &Metainfo, have: &Bitfield) -> Box<dyn PiecePicker> {
        self.state.record("piece_picker");
        if self.state.behavior().panic_in_picker {
            panic!("piece picker exploded");
        }
        Box::new(MockPicker {
            state: self.state.clone(),
            have: have.count(),
        })
    }

    fn connection_manager(&self, ctx: ConnectionContext) -> Box<dyn PeerConnectionManager> {
        self.state.record("connection_manager");
        self.state.links.lock().unwrap().push(ctx.link.clone());
        Box::new(MockConnections {
            state: self.state.clone(),
        })
    }

    fn tracker_client(&self, ctx: TrackerContext) -> Result<Box<dyn TrackerClient>, TransferError> {
        self.state.record("tracker_client");
        if let Some(kind) = self.state.behavior().tracker_failure {
            return Err(kind.raise("tracker_client"));
        }
        self.state.tracker_ports.lock().unwrap().push(ctx.port);
        Ok(Box::new(MockTracker {
            state: self.state.clone(),
        }))
    }

    fn stats_aggregator(&self, _ctx: StatsContext) -> Box<dyn StatsAggregator> {
        self.state.record("stats_aggregator");
        Box::new(MockStats)
    }
}

struct MockStorage {
    state: Arc<MockState>,
}

impl Storage for MockStorage {
    fn close(&mut self) -> Result<(), TransferError> {
        self.state.record("storage.close");
        match self.state.behavior().close_failure {
            Some(kind) => Err(kind.raise("storage.close")),
            None => Ok(()),
        }
    }
}

struct MockVerifier {
    state: Arc<MockState>,
    pieces: usize,
    total: u64,
    files: Vec<PathBuf>,
}

impl MockVerifier {
    fn have(&self, amount_left: u64) -> Bitfield {
        if amount_left == 0 {
            Bitfield::full(self.pieces)
        } else {
            Bitfield::new(self.pieces)
        }
    }
}

impl BlockVerifier for MockVerifier {
    fn verify_resume(&mut self, resume: &ResumeData) -> Result<(), TransferError> {
        self.state.record("verify_resume");
        let stamps = resume::stamp_files(&self.files)
            .map_err(|err| TransferError::disk("stamp files", err))?;
        if self.state.behavior().reject_resume || !resume.matches_files(&stamps) {
            return Err(TransferError::user("files changed since the checkpoint"));
        }
        Ok(())
    }

    fn check_blocks(
        &mut self,
        control: &VerifyControl,
        resume: Option<&ResumeData>,
    ) -> Result<VerificationOutcome, TransferError> {
        self.state
            .record(format!("check_blocks resume={}", resume.is_some()));
        let behavior = self.state.behavior();
        let step = Duration::from_millis(5);
        let mut waited = Duration::ZERO;
        while waited < behavior.verify_delay {
            if control.is_cancelled() {
                return Err(TransferError::shutdown("verification cancelled"));
            }
            std::thread::sleep(step);
            waited += step;
            control.add_checked(1);
        }
        if let Some(kind) = behavior.check_failure {
            return Err(kind.raise("check_blocks"));
        }
        Ok(VerificationOutcome {
            have: self.have(behavior.amount_left),
            amount_left: behavior.amount_left,
        })
    }

    fn resume_data(&self) -> ResumeData {
        let left = self.state.behavior().amount_left;
        ResumeData {
            have: self.have(left),
            verified_bytes: self.total.saturating_sub(left),
            files: resume::stamp_files(&self.files).unwrap_or_default(),
        }
    }

    fn estimate(
        &mut self,
        resume: Option<&ResumeData>,
        want_file_list: bool,
    ) -> Result<CompletionEstimate, TransferError> {
        self.state
            .record(format!("estimate resume={}", resume.is_some()));
        let behavior = self.state.behavior();
        Ok(CompletionEstimate {
            amount_left: behavior.amount_left,
            file_amounts_left: if want_file_list {
                behavior.file_amounts_left
            } else {
                None
            },
        })
    }
}

struct MockChoker {
    state: Arc<MockState>,
}

impl Choker for MockChoker {
    fn set_max_uploads(&mut self, slots: usize) {
        self.state.record(format!("choker.set_max_uploads {slots}"));
        self.state.choker_slots.lock().unwrap().push(slots);
    }
}

struct MockPicker {
    state: Arc<MockState>,
    have: usize,
}

impl PiecePicker for MockPicker {
    fn have_count(&self) -> usize {
        self.have
    }

    fn mark_complete(&mut self) {
        self.state.record("picker.mark_complete");
        self.have = PIECES;
    }
}

struct MockConnections {
    state: Arc<MockState>,
}

impl PeerConnectionManager for MockConnections {
    fn accept(&mut self, peer: IncomingPeer) {
        self.state.record("connections.accept");
        self.state.accepted.lock().unwrap().push(peer.addr);
    }

    fn kick(&mut self, addr: SocketAddr) {
        self.state.record(format!("connections.kick {}", addr.ip()));
        if self.state.behavior().panic_on_kick {
            panic!("kick exploded");
        }
    }

    fn ban(&mut self, ip: IpAddr) {
        self.state.record(format!("connections.ban {ip}"));
    }

    fn set_peer_id(&mut self, _peer_id: PeerId) {
        self.state.record("connections.set_peer_id");
    }

    fn set_connection_limits(&mut self, min_peers: usize, max_connections: usize) {
        self.state
            .record(format!("connections.set_limits {min_peers} {max_connections}"));
    }

    fn close_all(&mut self) {
        self.state.record("connections.close_all");
    }
}

struct MockTracker {
    state: Arc<MockState>,
}

impl TrackerClient for MockTracker {
    fn begin(&mut self) {
        self.state.record("tracker.begin");
    }

    fn announce_completed(&mut self) {
        self.state.record("tracker.announce_completed");
    }

    fn change_port(&mut self, _peer_id: PeerId, port: u16) {
        self.state.record(format!("tracker.change_port {port}"));
        self.state.tracker_ports.lock().unwrap().push(port);
    }

    fn stop(&mut self) {
        self.state.record("tracker.stop");
    }
}

struct MockStats;

impl StatsAggregator for MockStats {
    fn gather(&self, include_spew: bool, _include_file_info: bool) -> TransferStatus {
        let mut status = TransferStatus::local("from stats", 0.5, TransferState::Downloading);
        status.peers = 3;
        if include_spew {
            status.spew = Some(Vec::new());
        }
        status
    }
}

// ============================================================================
// Feedback
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackEvent {
    Started,
    Finished,
    Failed { external: bool },
    Error { level: ErrorLevel, text: String },
    Exception(String),
}

#[derive(Default)]
pub struct RecordingFeedback {
    events: Mutex<Vec<FeedbackEvent>>,
}

impl RecordingFeedback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<FeedbackEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn has(&self, event: &FeedbackEvent) -> bool {
        self.events().contains(event)
    }

    /// Texts of errors reported at `level`
    pub fn errors_at(&self, level: ErrorLevel) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FeedbackEvent::Error { level: l, text } if l == level => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn failed(&self) -> Option<bool> {
        self.events().into_iter().find_map(|event| match event {
            FeedbackEvent::Failed { external } => Some(external),
            _ => None,
        })
    }

    /// Every `failed` notification, in order
    pub fn failures(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FeedbackEvent::Failed { external } => Some(external),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: FeedbackEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Feedback for RecordingFeedback {
    fn started(&self, _transfer: &TransferInfo) {
        self.push(FeedbackEvent::Started);
    }

    fn finished(&self, _transfer: &TransferInfo) {
        self.push(FeedbackEvent::Finished);
    }

    fn failed(&self, _transfer: &TransferInfo, external: bool) {
        self.push(FeedbackEvent::Failed { external });
    }

    fn error(&self, _transfer: &TransferInfo, level: ErrorLevel, text: &str) {
        self.push(FeedbackEvent::Error {
            level,
            text: text.to_string(),
        });
    }

    fn exception(&self, transfer: &TransferInfo, text: &str) {
        self.push(FeedbackEvent::Exception(text.to_string()));
        self.error(transfer, ErrorLevel::Critical, text);
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Metainfo with one file per length; more than one file makes a batch
pub fn test_metainfo(seed: u8, lengths: &[u64]) -> Metainfo {
    Metainfo {
        info_hash: InfoHash::new([seed; 20]),
        name: format!("transfer-{seed}"),
        announce: "http://tracker.invalid/announce".to_string(),
        piece_length: 16384,
        pieces: vec!["00".repeat(20); PIECES],
        files: lengths
            .iter()
            .enumerate()
            .map(|(i, length)| FileEntry {
                path: PathBuf::from(format!("file-{i}.bin")),
                length: *length,
            })
            .collect(),
        batch: lengths.len() > 1,
    }
}

/// Empty checkpoint stamped with the current state of the files under `dest`
pub fn checkpoint(metainfo: &Metainfo, dest: &Path) -> ResumeData {
    ResumeData {
        have: Bitfield::new(PIECES),
        verified_bytes: 0,
        files: resume::stamp_files(&metainfo.file_paths(dest)).unwrap(),
    }
}

pub fn test_config(data_dir: Option<&Path>) -> Config {
    Config {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        min_port: 42000,
        max_port: 42999,
        data_dir: data_dir.map(Path::to_path_buf),
        ..Config::default()
    }
}

pub fn silent_sink() -> ErrorSink {
    Arc::new(|_: ErrorLevel, _: &str| {})
}

pub type SinkLog = Arc<Mutex<Vec<(ErrorLevel, String)>>>;

pub fn recording_sink() -> (ErrorSink, SinkLog) {
    let log: SinkLog = Arc::new(Mutex::new(Vec::new()));
    let sink_log = log.clone();
    let sink: ErrorSink = Arc::new(move |level: ErrorLevel, text: &str| {
        sink_log.lock().unwrap().push((level, text.to_string()));
    });
    (sink, log)
}

pub async fn test_manager(behavior: Behavior) -> (TransferManager, Arc<MockState>) {
    let state = MockState::new(behavior);
    let factory = Arc::new(MockFactory::new(state.clone()));
    let manager = TransferManager::new(test_config(None), factory, silent_sink())
        .await
        .expect("manager starts");
    (manager, state)
}

/// Poll `condition` for up to five seconds
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
