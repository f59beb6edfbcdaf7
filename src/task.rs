use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, ErrorReporter, report_failure};

/// Abort signal handed to one run of a [`CancellableTask`]
#[derive(Debug, Clone)]
pub struct RunToken {
    generation: u64,
    token: CancellationToken,
}

impl RunToken {
    /// Sequence number of the run, starting at 1 for the first run of an owner
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the run has been aborted
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    /// Fails with [`EngineError::Cancelled`] if the run has been aborted.
    ///
    /// Callers mutating shared state must make this the last check before the
    /// write, with no await in between.
    pub fn checkpoint(&self) -> Result<(), EngineError> {
        if self.is_aborted() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    live: Option<CancellationToken>,
    /// Spawned runs whose body has not returned yet, aborted ones included
    in_flight: usize,
}

/// Runs async work for one owner, keeping at most one run un-aborted.
///
/// Starting a run aborts the previous one first. Aborting is cooperative:
/// the work observes its [`RunToken`] at its own checkpoints and still runs
/// its cleanup. Failures go to the [`ErrorReporter`], cancellations do not.
#[derive(Clone)]
pub struct CancellableTask {
    name: &'static str,
    slot: Arc<Mutex<Slot>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl CancellableTask {
    pub fn new(name: &'static str, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(Slot::default())),
            reporter,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mint(&self, slot: &mut Slot) -> RunToken {
        slot.generation += 1;
        let token = CancellationToken::new();
        slot.live = Some(token.clone());
        RunToken {
            generation: slot.generation,
            token,
        }
    }

    /// Aborts the live run, if any, and mints the token for the next one
    pub fn begin(&self) -> RunToken {
        let mut slot = self.slot();
        self.supersede(&mut slot);
        self.mint(&mut slot)
    }

    /// Mints a token only when no run is live or still winding down
    pub fn try_begin(&self) -> Option<RunToken> {
        let mut slot = self.slot();
        if Self::busy(&slot) {
            return None;
        }
        Some(self.mint(&mut slot))
    }

    fn busy(slot: &Slot) -> bool {
        slot.live.is_some() || slot.in_flight > 0
    }

    fn supersede(&self, slot: &mut Slot) {
        if let Some(previous) = slot.live.take() {
            debug!(task = self.name, generation = slot.generation, "superseding run");
            previous.cancel();
        }
    }

    /// Schedules `work` and returns without waiting for it.
    ///
    /// The join handle yields `None` when the run failed or was cancelled.
    pub fn invoke<F, Fut, T>(&self, work: F) -> JoinHandle<Option<T>>
    where
        F: FnOnce(RunToken) -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        T: Send + 'static,
    {
        let run = {
            let mut slot = self.slot();
            self.supersede(&mut slot);
            let run = self.mint(&mut slot);
            slot.in_flight += 1;
            run
        };
        self.spawn(run, work)
    }

    /// Like [`invoke`](Self::invoke) but refuses to start while another run
    /// is in flight, even one that was already cancelled
    pub fn try_invoke<F, Fut, T>(&self, work: F) -> Result<JoinHandle<Option<T>>, EngineError>
    where
        F: FnOnce(RunToken) -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        T: Send + 'static,
    {
        let run = {
            let mut slot = self.slot();
            if Self::busy(&slot) {
                return Err(EngineError::TransferInProgress(self.name.to_string()));
            }
            let run = self.mint(&mut slot);
            slot.in_flight += 1;
            run
        };
        Ok(self.spawn(run, work))
    }

    fn spawn<F, Fut, T>(&self, run: RunToken, work: F) -> JoinHandle<Option<T>>
    where
        F: FnOnce(RunToken) -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        T: Send + 'static,
    {
        let body = work(run.clone());
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = body.await;
            this.finish(&run);
            match outcome {
                Ok(value) => Some(value),
                Err(err) => {
                    report_failure(this.reporter.as_ref(), &err);
                    None
                }
            }
        })
    }

    fn finish(&self, run: &RunToken) {
        let mut slot = self.slot();
        slot.in_flight = slot.in_flight.saturating_sub(1);
        if slot.generation == run.generation {
            slot.live = None;
        }
    }

    /// Aborts the live run, if any. A spawned run keeps the slot busy for
    /// [`try_invoke`](Self::try_invoke) until its body returns.
    pub fn cancel(&self) {
        if let Some(token) = self.slot().live.take() {
            token.cancel();
        }
    }

    /// True while a run is live or an aborted one has not returned yet
    pub fn is_running(&self) -> bool {
        Self::busy(&self.slot())
    }

    pub fn generation(&self) -> u64 {
        self.slot().generation
    }
}

impl std::fmt::Debug for CancellableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableTask")
            .field("name", &self.name)
            .field("slot", &*self.slot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelReporter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, oneshot};

    fn task() -> (CancellableTask, tokio::sync::mpsc::UnboundedReceiver<crate::ErrorReport>) {
        let (reporter, rx) = ChannelReporter::new();
        (CancellableTask::new("test", Arc::new(reporter)), rx)
    }

    #[test]
    fn test_begin_aborts_previous_token() {
        let (task, _rx) = task();
        let first = task.begin();
        assert!(!first.is_aborted());
        let second = task.begin();
        assert!(first.is_aborted());
        assert!(!second.is_aborted());
        assert_eq!((first.generation(), second.generation()), (1, 2));
    }

    #[tokio::test]
    async fn test_second_run_supersedes_first() {
        let (task, mut rx) = task();
        let published = Arc::new(Mutex::new(Vec::new()));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let (started_tx, started_rx) = oneshot::channel();

        let run1 = {
            let published = published.clone();
            let cleanups = cleanups.clone();
            let gate = gate.clone();
            task.invoke(move |run| async move {
                let _ = started_tx.send(());
                gate.notified().await;
                cleanups.fetch_add(1, Ordering::SeqCst);
                run.checkpoint()?;
                published.lock().unwrap().push(run.generation());
                Ok(())
            })
        };
        started_rx.await.unwrap();

        let aborted_before_run2 = Arc::new(Mutex::new(None));
        let run2 = {
            let published = published.clone();
            let cleanups = cleanups.clone();
            let seen = aborted_before_run2.clone();
            let first_token_state = task.slot().live.clone();
            task.invoke(move |run| async move {
                *seen.lock().unwrap() = first_token_state.map(|t| t.is_cancelled());
                cleanups.fetch_add(1, Ordering::SeqCst);
                run.checkpoint()?;
                published.lock().unwrap().push(run.generation());
                Ok(())
            })
        };
        gate.notify_one();

        assert_eq!(run1.await.unwrap(), None);
        assert_eq!(run2.await.unwrap(), Some(()));
        assert_eq!(*aborted_before_run2.lock().unwrap(), Some(true));
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
        assert_eq!(*published.lock().unwrap(), vec![2]);
        assert!(rx.try_recv().is_err(), "cancellation must stay silent");
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let (task, mut rx) = task();
        let handle = task.invoke(|_run| async {
            Err::<(), _>(anyhow::anyhow!("device unplugged"))
        });
        assert_eq!(handle.await.unwrap(), None);
        assert_eq!(rx.recv().await.unwrap().message, "device unplugged");
    }

    #[tokio::test]
    async fn test_try_invoke_refuses_while_live() {
        let (task, _rx) = task();
        let gate = Arc::new(Notify::new());
        let waiter = gate.clone();
        let first = task
            .try_invoke(move |_run| async move {
                waiter.notified().await;
                Ok(1)
            })
            .unwrap();
        let refused = task.try_invoke(|_run| async { Ok(2) });
        assert!(matches!(refused, Err(EngineError::TransferInProgress(_))));
        gate.notify_one();
        assert_eq!(first.await.unwrap(), Some(1));
        let second = task.try_invoke(|_run| async { Ok(3) }).unwrap();
        assert_eq!(second.await.unwrap(), Some(3));
    }

    #[test]
    fn test_aborted_wakes_on_supersede() {
        let (task, _rx) = task();
        let run = task.begin();
        let mut aborted = tokio_test::task::spawn(run.aborted());
        tokio_test::assert_pending!(aborted.poll());
        let _next = task.begin();
        assert!(aborted.is_woken());
        tokio_test::assert_ready!(aborted.poll());
        assert!(matches!(run.checkpoint(), Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_exclusive_slot_until_it_returns() {
        let (task, mut rx) = task();
        let gate = Arc::new(Notify::new());
        let waiter = gate.clone();
        let first = task
            .try_invoke(move |run| async move {
                waiter.notified().await;
                run.checkpoint()?;
                Ok(1)
            })
            .unwrap();

        task.cancel();
        assert!(task.is_running());
        let refused = task.try_invoke(|_run| async { Ok(2) });
        assert!(matches!(refused, Err(EngineError::TransferInProgress(_))));

        gate.notify_one();
        assert_eq!(first.await.unwrap(), None);
        assert!(!task.is_running());
        let next = task.try_invoke(|_run| async { Ok(3) }).unwrap();
        assert_eq!(next.await.unwrap(), Some(3));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_clears_live_run() {
        let (task, _rx) = task();
        let run = task.begin();
        assert!(task.is_running());
        task.cancel();
        assert!(run.is_aborted());
        assert!(!task.is_running());
        assert_eq!(task.generation(), 1);
    }
}
