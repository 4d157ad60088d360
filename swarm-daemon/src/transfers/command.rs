//! Messages into a transfer's coordinator task
//!
//! Callers talk to a transfer through [`TransferCommand`]s sent by its
//! handle. Collaborators report back through a [`CoordinatorLink`], which
//! queues [`TransferEvent`]s; nothing outside the coordinator mutates its
//! state directly.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};

use swarm_common::ErrorLevel;

use crate::error::TransferError;

use super::types::TransferStatus;

pub(crate) enum TransferCommand {
    Status {
        include_spew: bool,
        include_file_info: bool,
        reply: oneshot::Sender<TransferStatus>,
    },
    SetOption {
        name: String,
        value: String,
    },
    ChangePort,
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Callback from a collaborator, handled on the coordinator task
#[derive(Debug)]
pub enum TransferEvent {
    KickPeer(SocketAddr),
    BanPeer(IpAddr),
    /// A peer sent data that failed verification
    DataFlunked(SocketAddr),
    DownloadComplete,
    /// The tracker acknowledged an announce
    AnnounceCompleted,
    /// The tracker found no peers and the transfer should stop
    NoPeers {
        level: ErrorLevel,
        text: String,
    },
    Error {
        level: ErrorLevel,
        text: String,
    },
    Failure(TransferError),
}

/// Collaborators' handle back to their coordinator
///
/// Sends after the transfer closed are dropped silently.
#[derive(Clone)]
pub struct CoordinatorLink {
    events: mpsc::UnboundedSender<TransferEvent>,
    amount_left: Arc<AtomicU64>,
}

impl CoordinatorLink {
    pub(crate) fn new(amount_left: u64) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Self {
            events,
            amount_left: Arc::new(AtomicU64::new(amount_left)),
        };
        (link, rx)
    }

    fn send(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    pub fn kick_peer(&self, addr: SocketAddr) {
        self.send(TransferEvent::KickPeer(addr));
    }

    pub fn ban_peer(&self, ip: IpAddr) {
        self.send(TransferEvent::BanPeer(ip));
    }

    pub fn data_flunked(&self, addr: SocketAddr) {
        self.send(TransferEvent::DataFlunked(addr));
    }

    /// Bytes of content not yet verified
    pub fn amount_left(&self) -> u64 {
        self.amount_left.load(Ordering::Relaxed)
    }

    pub(crate) fn set_amount_left(&self, left: u64) {
        self.amount_left.store(left, Ordering::Relaxed);
    }

    /// Record a newly verified piece of `bytes` length
    ///
    /// Reports completion when nothing is left.
    pub fn piece_verified(&self, bytes: u64) {
        let previous = self
            .amount_left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                Some(left.saturating_sub(bytes))
            })
            .unwrap_or_default();
        if previous > 0 && previous <= bytes {
            self.download_complete();
        }
    }

    pub fn download_complete(&self) {
        self.send(TransferEvent::DownloadComplete);
    }

    pub fn announce_completed(&self) {
        self.send(TransferEvent::AnnounceCompleted);
    }

    pub fn no_peers(&self, level: ErrorLevel, text: impl Into<String>) {
        self.send(TransferEvent::NoPeers {
            level,
            text: text.into(),
        });
    }

    pub fn report_error(&self, level: ErrorLevel, text: impl Into<String>) {
        self.send(TransferEvent::Error {
            level,
            text: text.into(),
        });
    }

    /// Hand a failure to the coordinator for classification
    pub fn fail(&self, err: TransferError) {
        self.send(TransferEvent::Failure(err));
    }
}
