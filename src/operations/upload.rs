use anyhow::Context;
use bytes::{Bytes, BytesMut};
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{EngineError, ErrorReporter, is_cancellation};
use crate::link::{ByteStream, ChunkSink, DeviceLink, SyncSession};
use crate::operations::list::DirectorySync;
use crate::task::{CancellableTask, RunToken};
use crate::types::{
    EngineConfigArc, FileTransferOperationResult, S_IFREG, TransferSession, TransferSource,
    TransferStatus,
};

/// Splits a byte stream into frames of at most `max` bytes.
///
/// Input is coalesced, so every frame except the last is exactly `max` bytes
/// long and no frame is ever empty.
#[derive(Debug)]
pub struct ChunkSplitter {
    max: usize,
    pending: BytesMut,
}

impl ChunkSplitter {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            pending: BytesMut::new(),
        }
    }

    /// Buffers `data` and returns every full frame now available
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::with_capacity(self.pending.len() / self.max);
        while self.pending.len() >= self.max {
            frames.push(self.pending.split_to(self.max).freeze());
        }
        frames
    }

    /// The remaining partial frame, if any
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}

/// Counts bytes passing from the splitter to the writer
pub struct ProgressObserver<F: FnMut(u64)> {
    total: u64,
    on_progress: F,
}

impl<F: FnMut(u64)> ProgressObserver<F> {
    pub fn new(on_progress: F) -> Self {
        Self {
            total: 0,
            on_progress,
        }
    }

    /// Called once per frame with the running total
    pub fn observe(&mut self, frame: &[u8]) -> u64 {
        self.total += frame.len() as u64;
        (self.on_progress)(self.total);
        self.total
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Uploads one file at a time and tracks its throughput.
///
/// The current [`TransferSession`] is published on a watch channel; it is
/// `None` whenever no upload runs.
#[derive(Clone)]
pub struct TransferPipeline {
    link: Arc<dyn DeviceLink>,
    config: EngineConfigArc,
    task: CancellableTask,
    state: Arc<watch::Sender<Option<TransferSession>>>,
    listing: DirectorySync,
}

impl TransferPipeline {
    pub(crate) fn new(
        link: Arc<dyn DeviceLink>,
        config: EngineConfigArc,
        reporter: Arc<dyn ErrorReporter>,
        listing: DirectorySync,
    ) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            link,
            config,
            task: CancellableTask::new("upload", reporter),
            state: Arc::new(state),
            listing,
        }
    }

    /// Starts uploading `source` to the absolute `destination`.
    ///
    /// Failures are reported and make the handle yield `None`; a cancelled
    /// upload yields [`FileTransferOperationResult::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TransferInProgress`] while another upload runs.
    /// Uploads are not queued.
    pub fn transfer(
        &self,
        source: TransferSource,
        destination: impl Into<String>,
    ) -> Result<JoinHandle<Option<FileTransferOperationResult>>, EngineError> {
        let destination = destination.into();
        let link = self.link.clone();
        let config = self.config.clone();
        let state = self.state.clone();
        let listing = self.listing.clone();
        self.task.try_invoke(move |run| async move {
            put(link, config, source, destination, run, state, listing).await
        })
    }

    /// Aborts the running upload at its next frame boundary
    pub fn cancel(&self) {
        self.task.cancel()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TransferSession>> {
        self.state.subscribe()
    }

    pub fn session(&self) -> Option<TransferSession> {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

impl std::fmt::Debug for TransferPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPipeline")
            .field("task", &self.task)
            .field("session", &self.session())
            .finish_non_exhaustive()
    }
}

/// Applies `update` to the published session only if run `generation` owns it
fn update_owned(
    state: &watch::Sender<Option<TransferSession>>,
    generation: u64,
    update: impl FnOnce(&mut TransferSession),
) {
    state.send_if_modified(|session| match session {
        Some(session) if session.generation == generation => {
            update(session);
            true
        }
        _ => false,
    });
}

/// Unpublishes the session of run `generation`, leaving any other in place
fn take_owned(
    state: &watch::Sender<Option<TransferSession>>,
    generation: u64,
) -> Option<TransferSession> {
    let mut taken = None;
    state.send_if_modified(|session| {
        if session.as_ref().is_some_and(|s| s.generation == generation) {
            taken = session.take();
            true
        } else {
            false
        }
    });
    taken
}

fn sample(state: &watch::Sender<Option<TransferSession>>, generation: u64) {
    update_owned(state, generation, TransferSession::sample);
}

async fn sample_speed(
    state: Arc<watch::Sender<Option<TransferSession>>>,
    generation: u64,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => sample(&state, generation),
        }
    }
}

/// Uploads a local byte source to the device
///
/// 1. Opens a sync session and a writer with `S_IFREG | upload_permission`
/// 2. Re-chunks the source into frames no larger than `max_packet_size`
/// 3. Counts each frame before handing it to the writer
/// 4. Samples the speed on an independent timer, plus once after the last frame
/// 5. Releases the writer and the session, then refreshes the listing
///
/// # Errors
///
/// Returns an error if:
/// - The session or the writer cannot be opened
/// - Reading the source or writing a frame fails
/// - Committing the file fails
pub(crate) async fn put(
    link: Arc<dyn DeviceLink>,
    config: EngineConfigArc,
    source: TransferSource,
    destination: String,
    run: RunToken,
    state: Arc<watch::Sender<Option<TransferSession>>>,
    listing: DirectorySync,
) -> Result<FileTransferOperationResult, anyhow::Error> {
    let upload_time = Instant::now();
    let TransferSource {
        name,
        size,
        modified,
        stream,
    } = source;
    state.send_replace(Some(TransferSession::start(
        &name,
        &destination,
        size,
        run.generation(),
    )));

    let upload = match link.open_session().await {
        Ok(session) => {
            let mode = S_IFREG | (config.upload_permission & 0o7777);
            let written = write_file(
                session.as_ref(),
                stream,
                &destination,
                mode,
                modified,
                &config,
                &run,
                &state,
            )
            .await;
            session.dispose().await;
            written
        }
        Err(e) => Err(e.context("Failed to open sync session for upload")),
    };

    let status = match &upload {
        Ok(_) => TransferStatus::Completed,
        Err(e) if is_cancellation(e) => TransferStatus::Cancelled,
        Err(_) => TransferStatus::Failed,
    };
    let mut finished = take_owned(&state, run.generation())
        .unwrap_or_else(|| TransferSession::start(&name, &destination, size, run.generation()));
    finished.status = status;

    listing.refresh();

    let time_taken = upload_time.elapsed();
    match upload {
        Ok(written) => {
            info!(
                "File {:?} uploaded to {:?} ({} bytes). Time taken {:?}",
                name, destination, written, time_taken,
            );
            Ok(FileTransferOperationResult::Completed(finished.progress()))
        }
        Err(e) if status == TransferStatus::Cancelled => {
            info!("Upload of {:?} cancelled after {:?}: {}", name, time_taken, e);
            Ok(FileTransferOperationResult::Cancelled {
                src_file: name,
                dest_file: destination,
            })
        }
        Err(e) => {
            error!("Upload of {:?} failed after {:?}", name, time_taken);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_file(
    session: &dyn SyncSession,
    stream: ByteStream,
    destination: &str,
    mode: u32,
    mtime: u64,
    config: &EngineConfigArc,
    run: &RunToken,
    state: &Arc<watch::Sender<Option<TransferSession>>>,
) -> Result<u64, anyhow::Error> {
    let mut sink = session
        .open_writer(destination, mode, mtime)
        .await
        .with_context(|| format!("Failed to open {destination} for writing"))?;
    info!("Remote file created path: {:?}", destination);

    let stop_sampling = CancellationToken::new();
    let sampler = tokio::spawn(sample_speed(
        state.clone(),
        run.generation(),
        config.sample_interval(),
        stop_sampling.clone(),
    ));

    let written = pump_frames(sink.as_mut(), stream, config.max_packet_size, run, state).await;

    stop_sampling.cancel();
    if let Err(e) = sampler.await {
        warn!("speed sampler ended abnormally: {:?}", e);
    }
    sample(state, run.generation());

    let closed = sink
        .close(written.is_ok())
        .await
        .with_context(|| format!("Failed to commit {destination}"));
    let written = written?;
    closed?;
    Ok(written)
}

async fn pump_frames(
    sink: &mut dyn ChunkSink,
    mut stream: ByteStream,
    max_packet_size: usize,
    run: &RunToken,
    state: &watch::Sender<Option<TransferSession>>,
) -> Result<u64, anyhow::Error> {
    let mut splitter = ChunkSplitter::new(max_packet_size);
    let mut progress = ProgressObserver::new(|total| {
        update_owned(state, run.generation(), |session| session.transferred_bytes = total)
    });

    while let Some(data) = stream.next().await {
        let data = data.context("Failed to read upload source")?;
        for frame in splitter.push(&data) {
            run.checkpoint()?;
            progress.observe(&frame);
            sink.write_chunk(frame).await?;
        }
    }
    if let Some(frame) = splitter.finish() {
        run.checkpoint()?;
        progress.observe(&frame);
        sink.write_chunk(frame).await?;
    }
    Ok(progress.total())
}
