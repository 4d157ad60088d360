//! Interfaces to the components a transfer coordinates
//!
//! Storage, hash verification, choking, piece selection, peer connections,
//! tracker announces and statistics are implemented outside this crate. A
//! [`CollaboratorFactory`] builds them for each transfer; the coordinator
//! drives them through these traits and receives their callbacks through a
//! [`CoordinatorLink`].

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use swarm_common::peer_id::PEER_ID_LEN;
use swarm_common::{Bitfield, Metainfo};

use crate::config::Config;
use crate::error::TransferError;
use crate::resume::ResumeData;
use crate::shared::{FilePool, IncomingPeer, RateLimiter};
use crate::transfers::command::CoordinatorLink;
use crate::transfers::rate_measure::RateMeasure;
use crate::transfers::types::{TransferInfo, TransferStatus};
use crate::transfers::verify::VerifyControl;

pub type PeerId = [u8; PEER_ID_LEN];

/// Result of verifying existing data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub have: Bitfield,
    pub amount_left: u64,
}

/// Completion estimate from on-disk data, without starting a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEstimate {
    pub amount_left: u64,
    /// Bytes still missing for each file, in metainfo order
    pub file_amounts_left: Option<Vec<u64>>,
}

/// On-disk content of a transfer
pub trait Storage: Send {
    /// Flush buffers and reopen files read-only
    ///
    /// Called once on completion and again when the transfer closes.
    fn close(&mut self) -> Result<(), TransferError>;
}

/// Piece hash checking
///
/// `check_blocks` runs on a blocking worker thread and must return promptly
/// once `control` reports cancellation.
pub trait BlockVerifier: Send {
    /// Validate a checkpoint against the files on disk
    fn verify_resume(&mut self, resume: &ResumeData) -> Result<(), TransferError>;

    /// Verify existing data, trusting `resume` where it applies
    fn check_blocks(
        &mut self,
        control: &VerifyControl,
        resume: Option<&ResumeData>,
    ) -> Result<VerificationOutcome, TransferError>;

    /// Checkpoint of the currently verified pieces
    fn resume_data(&self) -> ResumeData;

    fn estimate(
        &mut self,
        resume: Option<&ResumeData>,
        want_file_list: bool,
    ) -> Result<CompletionEstimate, TransferError>;
}

pub trait Choker: Send {
    fn set_max_uploads(&mut self, slots: usize);
}

pub trait PiecePicker: Send {
    fn have_count(&self) -> usize;

    /// Every piece is present; stop requesting
    fn mark_complete(&mut self);
}

pub trait PeerConnectionManager: Send {
    /// Take over a connection routed by the listener
    fn accept(&mut self, peer: IncomingPeer);

    fn kick(&mut self, addr: SocketAddr);

    /// Drop every connection from `ip`
    fn ban(&mut self, ip: IpAddr);

    fn set_peer_id(&mut self, peer_id: PeerId);

    fn set_connection_limits(&mut self, min_peers: usize, max_connections: usize);

    fn close_all(&mut self);
}

pub trait TrackerClient: Send {
    /// Start announcing
    fn begin(&mut self);

    fn announce_completed(&mut self);

    fn change_port(&mut self, peer_id: PeerId, port: u16);

    /// Announce departure and stop
    fn stop(&mut self);
}

pub trait StatsAggregator: Send {
    fn gather(&self, include_spew: bool, include_file_info: bool) -> TransferStatus;
}

/// What storage needs to open a transfer's files
pub struct StorageContext<'a> {
    pub metainfo: &'a Metainfo,
    pub files: &'a [PathBuf],
    pub file_pool: Arc<FilePool>,
    pub config: &'a Config,
}

pub struct OpenedStorage {
    pub storage: Box<dyn Storage>,
    pub verifier: Box<dyn BlockVerifier>,
}

pub struct ConnectionContext {
    pub info: TransferInfo,
    pub peer_id: PeerId,
    pub link: CoordinatorLink,
    pub upload: Arc<RateMeasure>,
    pub download: Arc<RateMeasure>,
    pub rate_limiter: Arc<RateLimiter>,
    pub min_peers: usize,
    pub max_connections: usize,
}

pub struct TrackerContext {
    pub info: TransferInfo,
    pub announce: String,
    pub peer_id: PeerId,
    /// Port reported to the tracker; 0 if nothing is listening
    pub port: u16,
    pub ip: Option<IpAddr>,
    pub is_seed: bool,
    pub link: CoordinatorLink,
    pub upload: Arc<RateMeasure>,
    pub download: Arc<RateMeasure>,
}

pub struct StatsContext {
    pub info: TransferInfo,
    pub piece_count: usize,
    pub upload: Arc<RateMeasure>,
    pub download: Arc<RateMeasure>,
    pub link: CoordinatorLink,
}

/// Builds the collaborators for each transfer
pub trait CollaboratorFactory: Send + Sync {
    fn open_storage(&self, ctx: StorageContext<'_>) -> Result<OpenedStorage, TransferError>;

    /// Read-only verifier for completion estimates
    fn probe_storage(
        &self,
        metainfo: &Metainfo,
        files: &[PathBuf],
    ) -> Result<Box<dyn BlockVerifier>, TransferError>;

    fn choker(&self, max_uploads: usize, config: &Config) -> Box<dyn Choker>;

    fn piece_picker(&self, metainfo: &Metainfo, have: &Bitfield) -> Box<dyn PiecePicker>;

    fn connection_manager(&self, ctx: ConnectionContext) -> Box<dyn PeerConnectionManager>;

    fn tracker_client(&self, ctx: TrackerContext) -> Result<Box<dyn TrackerClient>, TransferError>;

    fn stats_aggregator(&self, ctx: StatsContext) -> Box<dyn StatsAggregator>;
}
