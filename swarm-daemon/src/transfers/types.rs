//! Status and identity types exposed by a transfer

use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::AsRefStr;

use swarm_common::{ErrorLevel, InfoHash, Metainfo};

/// Identity of a transfer, passed to every feedback callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferInfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub total_bytes: u64,
}

impl TransferInfo {
    pub fn from_metainfo(metainfo: &Metainfo) -> Self {
        Self {
            info_hash: metainfo.info_hash,
            name: metainfo.name.clone(),
            total_bytes: metainfo.total_bytes(),
        }
    }
}

/// Lifecycle position of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Created,
    Verifying,
    Downloading,
    Seeding,
    Closed,
    Failed,
}

/// Entry in a transfer's error log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedError {
    pub at: DateTime<Utc>,
    pub level: ErrorLevel,
    pub text: String,
}

/// Per-peer detail included when spew is requested
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSpew {
    pub addr: SocketAddr,
    pub client: String,
    pub down_rate: f64,
    pub up_rate: f64,
    pub is_seed: bool,
}

/// Per-file completion included when file info is requested
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub fraction_done: f64,
}

/// Status report for one transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStatus {
    pub activity: String,
    pub fraction_done: f64,
    pub state: TransferState,
    pub down_rate: f64,
    pub up_rate: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub peers: usize,
    pub seeds: usize,
    /// Estimated seconds until complete, when known
    pub time_left: Option<f64>,
    pub spew: Option<Vec<PeerSpew>>,
    pub files: Option<Vec<FileStatus>>,
    pub errors: Vec<LoggedError>,
}

impl TransferStatus {
    /// Status built only from the coordinator's own state
    pub fn local(activity: impl Into<String>, fraction_done: f64, state: TransferState) -> Self {
        Self {
            activity: activity.into(),
            fraction_done,
            state,
            down_rate: 0.0,
            up_rate: 0.0,
            downloaded: 0,
            uploaded: 0,
            peers: 0,
            seeds: 0,
            time_left: None,
            spew: None,
            files: None,
            errors: Vec::new(),
        }
    }

    /// Uploaded over downloaded; `None` before anything is downloaded
    pub fn share_ratio(&self) -> Option<f64> {
        share_ratio(self.uploaded, self.downloaded)
    }
}

/// Snapshot published by the coordinator on every state change
///
/// Callers read it without a round trip, which also covers transfers whose
/// coordinator task has exited.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: TransferState,
    pub activity: String,
    pub fraction_done: f64,
    pub started: bool,
    pub finished: bool,
    pub is_seed: bool,
    pub closed: bool,
}

impl Snapshot {
    pub fn created() -> Self {
        Self {
            state: TransferState::Created,
            activity: String::new(),
            fraction_done: 0.0,
            started: false,
            finished: false,
            is_seed: false,
            closed: false,
        }
    }
}

/// Completion fraction from a total and the bytes still missing
///
/// Always floating-point; empty content counts as complete.
pub fn fraction_done(total: u64, left: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    let done = total.saturating_sub(left) as f64 / total as f64;
    done.clamp(0.0, 1.0)
}

pub fn share_ratio(uploaded: u64, downloaded: u64) -> Option<f64> {
    if downloaded == 0 {
        return None;
    }
    Some(uploaded as f64 / downloaded as f64)
}
