//! Transfers and the handles used to drive them
//!
//! Each transfer runs as a coordinator task (see `transfer.rs`). A
//! [`TransferHandle`] sends it commands and reads the snapshot it publishes.

mod bans;
pub mod command;
pub mod rate_measure;
mod transfer;
pub mod types;
pub mod upload_slots;
pub mod verify;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use swarm_common::InfoHash;

pub use bans::BanList;
pub use command::{CoordinatorLink, TransferEvent};
pub use rate_measure::RateMeasure;
pub use types::{
    FileStatus, LoggedError, PeerSpew, Snapshot, TransferInfo, TransferState, TransferStatus,
    fraction_done, share_ratio,
};
pub use upload_slots::auto_upload_slots;
pub use verify::VerifyControl;

use command::TransferCommand;
pub(crate) use transfer::TransferParts;
use transfer::Transfer;

/// Build a transfer's coordinator
///
/// # Returns
/// The handle, and the coordinator future that must be spawned to run it
pub(crate) fn create(
    parts: TransferParts,
) -> (TransferHandle, impl Future<Output = ()> + Send + 'static) {
    let info = Arc::new(parts.info.clone());
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::created());
    let transfer = Transfer::new(parts, snapshot_tx);

    let handle = TransferHandle {
        info,
        commands: commands_tx,
        snapshot: snapshot_rx,
    };
    (handle, transfer.run(commands_rx))
}

/// Cloneable handle to a running transfer
///
/// Commands are processed in order on the coordinator task. Once the
/// transfer has closed they are dropped and reads fall back to the last
/// published snapshot.
#[derive(Clone)]
pub struct TransferHandle {
    info: Arc<TransferInfo>,
    commands: mpsc::UnboundedSender<TransferCommand>,
    snapshot: watch::Receiver<Snapshot>,
}

impl TransferHandle {
    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info.info_hash
    }

    /// Latest published snapshot, without a round trip
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.snapshot.borrow().closed
    }

    /// Current status report
    ///
    /// Spew and per-file detail are only gathered when asked for.
    pub async fn status(&self, include_spew: bool, include_file_info: bool) -> TransferStatus {
        let (reply, rx) = oneshot::channel();
        let command = TransferCommand::Status {
            include_spew,
            include_file_info,
            reply,
        };
        if self.commands.send(command).is_ok() {
            if let Ok(status) = rx.await {
                return status;
            }
        }
        let snapshot = self.snapshot();
        TransferStatus::local(snapshot.activity, snapshot.fraction_done, snapshot.state)
    }

    /// Change a runtime option
    ///
    /// Unknown names, options that cannot change on a running transfer,
    /// invalid values and values equal to the current one are ignored.
    pub fn set_option(&self, name: &str, value: &str) {
        let _ = self.commands.send(TransferCommand::SetOption {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Report the manager's current listen port to the tracker
    pub fn change_port(&self) {
        let _ = self.commands.send(TransferCommand::ChangePort);
    }

    /// Shut the transfer down, waiting until it has closed
    ///
    /// Calling this on a closed transfer returns immediately.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        let command = TransferCommand::Shutdown { reply: Some(reply) };
        if self.commands.send(command).is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until `condition` holds for the published snapshot
    ///
    /// Returns the last snapshot if the coordinator exits first.
    pub async fn wait_until<F>(&self, mut condition: F) -> Snapshot
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let reached = match rx.wait_for(|snapshot| condition(snapshot)).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        reached
    }

    /// Wait until the transfer has started or closed
    pub async fn wait_started(&self) -> Snapshot {
        self.wait_until(|snapshot| snapshot.started || snapshot.closed)
            .await
    }

    pub async fn wait_closed(&self) -> Snapshot {
        self.wait_until(|snapshot| snapshot.closed).await
    }
}
