//! Background verification of existing data
//!
//! Hash checking is CPU and disk bound, so it runs on the blocking pool.
//! The coordinator keeps handling commands while it runs. Cancellation is
//! cooperative: closing the transfer sets the shared done flag, which the
//! verifier polls through [`VerifyControl`].

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

use crate::collaborators::{BlockVerifier, VerificationOutcome};
use crate::constants::ERR_VERIFY_PANICKED;
use crate::error::TransferError;
use crate::resume::ResumeData;
use crate::shared::Scheduler;
use crate::shared::scheduler::panic_message;

/// Progress and cancellation shared with a running verifier
#[derive(Clone, Debug)]
pub struct VerifyControl {
    done: Arc<AtomicBool>,
    checked: Arc<AtomicU64>,
}

impl VerifyControl {
    pub fn new(done: Arc<AtomicBool>) -> Self {
        Self {
            done,
            checked: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The transfer is closing; stop as soon as possible
    pub fn is_cancelled(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Record `bytes` more as checked, returning the new total
    pub fn add_checked(&self, bytes: u64) -> u64 {
        self.checked.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn checked(&self) -> u64 {
        self.checked.load(Ordering::Relaxed)
    }
}

type Joined = (Box<dyn BlockVerifier>, Result<VerificationOutcome, TransferError>);

/// A verification running on the blocking pool
///
/// Resolves to the verifier, handed back for later checkpoints, and the
/// verification result.
pub(crate) struct VerificationRun {
    handle: JoinHandle<Joined>,
}

impl VerificationRun {
    pub(crate) fn spawn(
        scheduler: &Scheduler,
        mut verifier: Box<dyn BlockVerifier>,
        resume: Option<ResumeData>,
        control: VerifyControl,
    ) -> Self {
        let handle = scheduler.spawn_blocking(move || {
            let checked = panic::catch_unwind(AssertUnwindSafe(|| {
                verifier.check_blocks(&control, resume.as_ref())
            }));
            // Built on the worker so a captured backtrace shows this thread
            let result = checked.unwrap_or_else(|payload| {
                Err(TransferError::internal(format!(
                    "{ERR_VERIFY_PANICKED}{}",
                    panic_message(payload)
                )))
            });
            (verifier, result)
        });
        Self { handle }
    }
}

impl Future for VerificationRun {
    type Output = Result<Joined, TransferError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| {
            joined.map_err(|err| TransferError::Internal {
                message: format!("verification worker failed: {err}"),
                trace: String::new(),
            })
        })
    }
}
