// demos/advanced_usage.rs
// Run with: cargo run --example advanced_usage

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use rusty_adb_files::memory::InMemoryDevice;
use rusty_adb_files::view::{breadcrumbs, format_speed};
use rusty_adb_files::{
    ChannelReporter, DeviceFileManager, EngineConfig, FileTransferOperationResult, TransferSource,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    // Example 1: Progressive listing of a slow directory, superseded midway
    example_superseded_listing().await?;

    // Example 2: Upload with live speed readout and cancellation
    example_upload_progress().await?;

    // Example 3: Batch delete where one item fails
    example_batch_delete().await?;

    Ok(())
}

fn slow_device() -> InMemoryDevice {
    let mut device = InMemoryDevice::new().with_dir("/system");
    for i in 0..12 {
        device = device.with_file(&format!("/sdcard/Photos/IMG_{i:04}.jpg"), vec![0u8; 2048]);
    }
    device.with_entry_delay(Duration::from_millis(250))
}

/// Example 1: the second `ls` aborts the first; only its result is published
async fn example_superseded_listing() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n=== Example 1: Superseded Listing ===");

    let (reporter, _errors) = ChannelReporter::new();
    let manager = DeviceFileManager::new(
        Arc::new(slow_device()),
        EngineConfig::default(),
        Arc::new(reporter),
    );

    let mut snapshots = manager.subscribe_listing();
    let watcher = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            println!(
                "  [gen {}] {} entries of {}{}",
                snapshot.generation,
                snapshot.items.len(),
                snapshot.path,
                if snapshot.loading { " (loading)" } else { "" }
            );
        }
    });

    let photos = manager.ls("/sdcard/Photos");
    tokio::time::sleep(Duration::from_millis(1600)).await;
    let root = manager.ls("/");

    println!("first run published: {:?}", photos.await?.map(|s| s.path));
    println!("second run published: {:?}", root.await?.map(|s| s.path));
    for crumb in breadcrumbs("/sdcard/Photos") {
        println!("  crumb {} -> {}", crumb.text, crumb.key);
    }

    drop(manager);
    watcher.abort();
    Ok(())
}

/// Example 2: watch the transfer session while uploading, then cancel one
async fn example_upload_progress() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n=== Example 2: Upload Progress ===");

    let device = InMemoryDevice::new()
        .with_dir("/sdcard/Download")
        .with_write_delay(Duration::from_millis(20));
    let (reporter, _errors) = ChannelReporter::new();
    let manager = DeviceFileManager::new(
        Arc::new(device.clone()),
        EngineConfig::new(4096),
        Arc::new(reporter),
    );

    let mut sessions = manager.subscribe_transfers();
    let watcher = tokio::spawn(async move {
        while sessions.changed().await.is_ok() {
            let session = sessions.borrow_and_update().clone();
            if let Some(session) = session {
                if let Some(line) =
                    format_speed(session.transferred_bytes, session.total_bytes, session.speed)
                {
                    println!("  {} {}", session.source, line);
                }
            }
        }
    });

    // a source arriving in uneven pieces, as a file reader would deliver it
    let pieces: Vec<Result<Bytes, anyhow::Error>> =
        (0..50).map(|_| Ok(Bytes::from(vec![1u8; 3000]))).collect();
    let source =
        TransferSource::from_stream("video.mp4", 150_000, 1_700_000_000, stream::iter(pieces).boxed());
    let result = manager.put_to(source, "/sdcard/Download/video.mp4")?.await?;
    if let Some(FileTransferOperationResult::Completed(progress)) = result {
        println!("✅ Uploaded {} bytes", progress.transferred_bytes);
    }

    let source = TransferSource::from_bytes("big.bin", Bytes::from(vec![0u8; 400_000]), 0);
    let handle = manager.put_to(source, "/sdcard/Download/big.bin")?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.cancel_transfer();
    if let Some(FileTransferOperationResult::Cancelled { src_file, .. }) = handle.await? {
        println!("❌ Cancelled {}", src_file);
    }
    println!("big.bin on device: {}", device.exists("/sdcard/Download/big.bin"));

    drop(manager);
    watcher.abort();
    Ok(())
}

/// Example 3: every item is attempted even when one fails
async fn example_batch_delete() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n=== Example 3: Batch Delete ===");

    let device = InMemoryDevice::new()
        .with_file("/sdcard/a.txt", "a")
        .with_file("/sdcard/locked.txt", "b")
        .with_file("/sdcard/c.txt", "c")
        .deny_delete("/sdcard/locked.txt");
    let (reporter, mut errors) = ChannelReporter::new();
    let manager = DeviceFileManager::new(
        Arc::new(device),
        EngineConfig::default(),
        Arc::new(reporter),
    );
    manager.ls("/sdcard").await?;

    let summary = manager
        .rm(vec!["a.txt".into(), "locked.txt".into(), "c.txt".into()])
        .await;
    println!("removed: {:?}", summary.removed);
    println!("failed: {:?}", summary.failed);
    while let Ok(report) = errors.try_recv() {
        println!("⚠️  {}", report.message);
    }

    Ok(())
}
