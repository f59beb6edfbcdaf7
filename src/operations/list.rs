use anyhow::Context;
use futures::stream::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::ErrorReporter;
use crate::link::{DeviceLink, SyncSession};
use crate::task::{CancellableTask, RunToken};
use crate::types::{Entry, EntryType, EngineConfigArc, ListItem, ListSnapshot};
use crate::utils::resolve;

/// The published snapshot plus the last one that finished loading
pub(crate) struct Snapshots {
    tx: watch::Sender<ListSnapshot>,
    settled: Mutex<ListSnapshot>,
}

impl Snapshots {
    fn new(initial: ListSnapshot) -> Self {
        let (tx, _) = watch::channel(initial.clone());
        Self {
            tx,
            settled: Mutex::new(initial),
        }
    }

    fn settled(&self) -> MutexGuard<'_, ListSnapshot> {
        self.settled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> ListSnapshot {
        self.tx.borrow().clone()
    }

    fn publish(&self, snapshot: ListSnapshot) {
        if !snapshot.loading {
            *self.settled() = snapshot.clone();
        }
        self.tx.send_replace(snapshot);
    }

    /// Republishes the last complete listing under `generation`
    fn restore(&self, generation: u64) {
        let settled = self.settled().clone();
        self.tx.send_replace(ListSnapshot {
            generation,
            ..settled
        });
    }
}

/// Lists remote directories and publishes snapshots of the current one.
///
/// Each [`list`](Self::list) supersedes the previous run. Observers read the
/// latest [`ListSnapshot`] through [`subscribe`](Self::subscribe); a snapshot
/// is always replaced whole, never patched.
#[derive(Clone)]
pub struct DirectorySync {
    link: Arc<dyn DeviceLink>,
    config: EngineConfigArc,
    task: CancellableTask,
    state: Arc<Snapshots>,
}

impl DirectorySync {
    pub(crate) fn new(
        link: Arc<dyn DeviceLink>,
        config: EngineConfigArc,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            link,
            config,
            task: CancellableTask::new("list", reporter),
            state: Arc::new(Snapshots::new(ListSnapshot::empty("/"))),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ListSnapshot> {
        self.state.tx.subscribe()
    }

    pub fn snapshot(&self) -> ListSnapshot {
        self.state.current()
    }

    /// Path of the latest snapshot
    pub fn path(&self) -> String {
        self.state.tx.borrow().path.clone()
    }

    /// Starts listing `path`, aborting any listing still in flight.
    ///
    /// The handle yields the final snapshot, or `None` if the run failed or
    /// was superseded.
    pub fn list(&self, path: impl Into<String>) -> JoinHandle<Option<ListSnapshot>> {
        let path = resolve(["/", path.into().as_str()]);
        let link = self.link.clone();
        let state = self.state.clone();
        let interval = self.config.snapshot_interval();
        self.task
            .invoke(move |run| async move { ls(link, path, run, state, interval).await })
    }

    /// Lists the current path again
    pub fn refresh(&self) -> JoinHandle<Option<ListSnapshot>> {
        self.list(self.path())
    }

    /// Aborts the listing in flight, if any, and puts the last complete
    /// listing back in place of its loading snapshot
    pub fn cancel(&self) {
        self.task.cancel();
        if self.is_loading() {
            self.state.restore(self.task.generation());
        }
    }

    pub fn is_loading(&self) -> bool {
        self.state.tx.borrow().loading
    }
}

impl std::fmt::Debug for DirectorySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorySync")
            .field("task", &self.task)
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

/// Lists the contents of a remote directory
///
/// The session is disposed exactly once whatever the outcome. On failure no
/// partial listing is published: if this run is still the current one, the
/// last complete listing is restored with loading cleared.
///
/// # Errors
///
/// Returns an error if:
/// - The sync session cannot be opened
/// - The directory cannot be opened or a read fails
/// - Probing a symlink target fails
/// - The run is superseded or cancelled ([`EngineError::Cancelled`](crate::EngineError::Cancelled))
pub(crate) async fn ls(
    link: Arc<dyn DeviceLink>,
    path: String,
    run: RunToken,
    state: Arc<Snapshots>,
    interval: Duration,
) -> Result<ListSnapshot, anyhow::Error> {
    run.checkpoint()?;
    let carried = state.current().items;
    state.publish(ListSnapshot {
        path: path.clone(),
        items: carried,
        loading: true,
        generation: run.generation(),
    });

    let listed = match link.open_session().await {
        Ok(session) => {
            debug!("sync session opened to list {:?}", path);
            let listed = collect_entries(session.as_ref(), &path, &run, &state, interval).await;
            session.dispose().await;
            listed
        }
        Err(e) => Err(e.context(format!("Failed to open sync session for {path}"))),
    };

    match listed {
        Ok(items) => {
            run.checkpoint()?;
            let snapshot = ListSnapshot {
                path,
                items,
                loading: false,
                generation: run.generation(),
            };
            state.publish(snapshot.clone());
            info!("Listed {:?}: {} entries", snapshot.path, snapshot.items.len());
            Ok(snapshot)
        }
        Err(e) => {
            if !run.is_aborted() {
                state.restore(run.generation());
            }
            Err(e)
        }
    }
}

fn snapshot_ticker(interval: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Publishes the direct entries gathered so far while the run is current
fn publish_progress(
    state: &Snapshots,
    path: &str,
    items: &[ListItem],
    run: &RunToken,
) {
    if run.is_aborted() {
        return;
    }
    state.publish(ListSnapshot {
        path: path.to_string(),
        items: items.to_vec(),
        loading: true,
        generation: run.generation(),
    });
}

async fn collect_entries(
    session: &dyn SyncSession,
    path: &str,
    run: &RunToken,
    state: &Snapshots,
    interval: Duration,
) -> Result<Vec<ListItem>, anyhow::Error> {
    let mut dir_stream = session
        .open_directory_stream(path)
        .await
        .with_context(|| format!("Failed to open remote dir {path}"))?;
    let mut items: Vec<ListItem> = Vec::new();
    let mut links: Vec<Entry> = Vec::new();
    let mut ticker = snapshot_ticker(interval);

    loop {
        run.checkpoint()?;
        tokio::select! {
            _ = ticker.tick() => publish_progress(state, path, &items, run),
            entry_opt = dir_stream.next() => {
                match entry_opt {
                    Some(Ok(entry)) => {
                        if entry.is_dot_entry() {
                            continue;
                        }
                        match entry.entry_type {
                            EntryType::Symlink => links.push(entry),
                            _ => items.push(ListItem::from(entry)),
                        }
                    }
                    Some(Err(e)) => {
                        return Err(e.context(format!("Failed to ls remote directory {path}")));
                    }
                    None => break,
                }
            }
        }
    }

    for link in links {
        run.checkpoint()?;
        let target = resolve([path, link.name.as_str()]);
        let probe = session.probe_is_directory(&target);
        tokio::pin!(probe);
        let is_dir = loop {
            tokio::select! {
                result = &mut probe => {
                    break result.with_context(|| format!("Failed to probe symlink {target}"))?;
                }
                _ = ticker.tick() => publish_progress(state, path, &items, run),
            }
        };
        items.push(ListItem::resolved_link(link, is_dir));
    }

    run.checkpoint()?;
    Ok(items)
}

