//! Callbacks from transfers to the embedding application

use swarm_common::ErrorLevel;

use crate::transfers::TransferInfo;

/// Receives lifecycle notifications for one or more transfers
///
/// Callbacks run on the transfer's coordinator task and should return quickly.
pub trait Feedback: Send + Sync {
    /// The transfer finished verification and is exchanging data
    fn started(&self, transfer: &TransferInfo);

    /// All content is present and verified
    fn finished(&self, transfer: &TransferInfo);

    /// The transfer stopped because of a failure
    ///
    /// `external` is true when the cause came from outside the transfer,
    /// such as a tracker refusal; resume data is kept in that case.
    fn failed(&self, transfer: &TransferInfo, external: bool);

    fn error(&self, transfer: &TransferInfo, level: ErrorLevel, text: &str);

    /// Unexpected internal failure with full diagnostics
    fn exception(&self, transfer: &TransferInfo, text: &str) {
        self.error(transfer, ErrorLevel::Critical, text);
    }
}
