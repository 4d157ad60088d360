//! Task scheduling shared by every transfer
//!
//! Each transfer runs as an isolated context: a task whose panic is caught
//! and reported through a callback instead of taking the runtime down. The
//! scheduler also owns deferred reclamation, which drops a closed transfer's
//! collaborators on a later pass rather than inside `close`.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Something to drop on a later reclamation pass
pub type Reclaimable = Box<dyn Any + Send>;

pub struct Scheduler {
    handle: Handle,
    live_contexts: Arc<AtomicUsize>,
    reclaim_passes: Arc<AtomicU64>,
}

impl Scheduler {
    /// Scheduler on the current tokio runtime
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            live_contexts: Arc::new(AtomicUsize::new(0)),
            reclaim_passes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `future` as an isolated context
    ///
    /// If the future panics, `on_panic` receives the panic message. Locals
    /// owned by the future are dropped during unwinding either way.
    ///
    /// # Returns
    /// A handle that completes once the context and any panic callback finish
    pub fn spawn_isolated<F, P>(&self, label: String, future: F, on_panic: P) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
        P: FnOnce(String) + Send + 'static,
    {
        let live = self.live_contexts.clone();
        live.fetch_add(1, Ordering::SeqCst);
        let task = self.handle.spawn(future);

        self.handle.spawn(async move {
            match task.await {
                Ok(()) => debug!(context = %label, "context finished"),
                Err(err) if err.is_panic() => {
                    let message = panic_message(err.into_panic());
                    error!(context = %label, panic = %message, "context panicked");
                    on_panic(message);
                }
                Err(_) => debug!(context = %label, "context cancelled"),
            }
            live.fetch_sub(1, Ordering::SeqCst);
        })
    }

    /// Run `future` after `delay`
    pub fn schedule_after<F>(&self, delay: Duration, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            future.await;
        })
    }

    /// Run blocking work on the runtime's blocking pool
    pub fn spawn_blocking<F, R>(&self, work: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(work)
    }

    /// Drop `items` on a later pass, off the caller's stack
    ///
    /// # Returns
    /// A handle that completes once the items are dropped
    pub fn defer_reclaim(&self, items: Vec<Reclaimable>) -> JoinHandle<()> {
        let passes = self.reclaim_passes.clone();
        self.handle.spawn(async move {
            tokio::task::yield_now().await;
            let count = items.len();
            drop(items);
            passes.fetch_add(1, Ordering::SeqCst);
            debug!(count, "reclaimed closed transfer state");
        })
    }

    /// Completed reclamation passes
    pub fn reclaim_passes(&self) -> u64 {
        self.reclaim_passes.load(Ordering::SeqCst)
    }

    /// Isolated contexts that have not finished yet
    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    async fn explode(message: &'static str) {
        panic!("{message}");
    }

    #[tokio::test]
    async fn test_spawn_isolated_reports_panic() {
        let scheduler = Scheduler::new();
        let (tx, rx) = oneshot::channel();
        let done = scheduler.spawn_isolated(
            "panicky".to_string(),
            explode("collaborator blew up"),
            move |message| {
                let _ = tx.send(message);
            },
        );
        done.await.unwrap();
        assert_eq!(rx.await.unwrap(), "collaborator blew up");
        assert_eq!(scheduler.live_contexts(), 0);
    }

    #[tokio::test]
    async fn test_spawn_isolated_normal_exit_skips_callback() {
        let scheduler = Scheduler::new();
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let done = scheduler.spawn_isolated("quiet".to_string(), async {}, move |_| {
            *flag.lock().unwrap() = true;
        });
        done.await.unwrap();
        assert!(!*called.lock().unwrap());
    }

    #[tokio::test]
    async fn test_panic_does_not_affect_sibling_context() {
        let scheduler = Scheduler::new();
        let (tx, rx) = oneshot::channel();
        let bad = scheduler.spawn_isolated("bad".to_string(), explode("x"), |_| {});
        let good = scheduler.spawn_isolated(
            "good".to_string(),
            async move {
                tokio::task::yield_now().await;
                let _ = tx.send(42);
            },
            |_| {},
        );
        bad.await.unwrap();
        good.await.unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_defer_reclaim_drops_items() {
        struct DropFlag(Arc<Mutex<bool>>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                *self.0.lock().unwrap() = true;
            }
        }

        let scheduler = Scheduler::new();
        let dropped = Arc::new(Mutex::new(false));
        scheduler
            .defer_reclaim(vec![Box::new(DropFlag(dropped.clone()))])
            .await
            .unwrap();
        assert!(*dropped.lock().unwrap());
        assert_eq!(scheduler.reclaim_passes(), 1);
    }

    #[tokio::test]
    async fn test_schedule_after_runs_later() {
        let scheduler = Scheduler::new();
        let (tx, rx) = oneshot::channel();
        scheduler.schedule_after(Duration::from_millis(10), async move {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
    }
}
