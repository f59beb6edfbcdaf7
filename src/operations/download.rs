use anyhow::{Context, anyhow};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::link::{DeviceLink, SyncSession};
use crate::types::{EngineConfigArc, FileTransferOperationResult, FileTransferProgress};

/// Downloads a file from the device to local storage
///
/// 1. Opens a sync session and a reader on the remote file
/// 2. Sends chunks to a writer task over a bounded MPSC channel
/// 3. Creates parent directories for the local file
/// 4. Stops at the next chunk once `cancel_token` fires
///
/// The session is disposed on every path.
///
/// # Returns
///
/// - `Completed` with the number of bytes written
/// - `Cancelled` if the operation was cancelled
///
/// # Errors
///
/// Returns an error if:
/// - The session or the remote reader cannot be opened
/// - Reading from the device fails
/// - The local file or its parent directories cannot be created or written
pub(crate) async fn get(
    link: Arc<dyn DeviceLink>,
    config: EngineConfigArc,
    remote_path: String,
    local_path: String,
    cancel_token: CancellationToken,
) -> Result<FileTransferOperationResult, anyhow::Error> {
    let session = link
        .open_session()
        .await
        .context("Failed to open sync session for download")?;
    let result = read_file(session.as_ref(), &config, &remote_path, &local_path, cancel_token).await;
    session.dispose().await;
    result
}

async fn read_file(
    session: &dyn SyncSession,
    config: &EngineConfigArc,
    remote_path: &str,
    local_path: &str,
    cancel_token: CancellationToken,
) -> Result<FileTransferOperationResult, anyhow::Error> {
    let download_time = Instant::now();
    let mut remote_file = session
        .open_reader(remote_path)
        .await
        .with_context(|| format!("Failed to open remote file {remote_path}"))?;
    info!("Remote file opened: {:?}", remote_path);

    let (tx, mut rx) = mpsc::channel::<Bytes>(config.download_queue_depth.max(1));

    // Writing to local file
    let local_target = local_path.to_string();
    let write_handle: JoinHandle<Result<u64, io::Error>> = tokio::spawn(async move {
        if let Some(parent) = Path::new(&local_target).parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to create parent directory: {:?}", e),
                )
            })?;
        }
        let mut local_file = fs::File::create(&local_target).await?;
        info!("Local file created: {:?}", local_target);

        let mut written = 0u64;
        while let Some(buffer) = rx.recv().await {
            local_file.write_all(&buffer).await?;
            written += buffer.len() as u64;
        }
        local_file.flush().await?;
        Ok(written)
    });

    // Reading from remote file
    let mut is_cancelled = false;
    let mut download_error: Option<anyhow::Error> = None;
    loop {
        if cancel_token.is_cancelled() {
            info!("Download cancelled by user");
            is_cancelled = true;
            break;
        }
        match remote_file.next().await {
            Some(Ok(buffer)) => {
                if tx.send(buffer).await.is_err() {
                    // the writer task ended early; its error surfaces below
                    break;
                }
            }
            Some(Err(e)) => {
                error!("Error reading remote file: {:?}", e);
                download_error = Some(anyhow!("Error reading from remote file {remote_path}: {e}"));
                break;
            }
            None => {
                info!("End of remote file reached");
                break;
            }
        }
    }

    drop(tx);
    let written = write_handle.await??;

    // Intermediate remote file read error causing the read loop to terminate
    if let Some(err) = download_error {
        return Err(err);
    }

    let time_taken = download_time.elapsed();
    info!(
        "File {:?} downloaded. Time taken {:?}",
        remote_path, time_taken,
    );

    if is_cancelled {
        Ok(FileTransferOperationResult::Cancelled {
            src_file: remote_path.to_string(),
            dest_file: local_path.to_string(),
        })
    } else {
        Ok(FileTransferOperationResult::Completed(FileTransferProgress {
            src_file: remote_path.to_string(),
            dest_file: local_path.to_string(),
            file_size: written,
            transferred_bytes: written,
            bytes_per_second: bytes_per_second(written, time_taken.as_secs_f64()),
            percentage_progress: 100.0_f64,
        }))
    }
}

fn bytes_per_second(bytes: u64, seconds: f64) -> u64 {
    if seconds <= 0.0 {
        bytes
    } else {
        (bytes as f64 / seconds) as u64
    }
}
