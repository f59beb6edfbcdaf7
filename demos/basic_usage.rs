// demos/basic_usage.rs
// Run with: cargo run --example basic_usage

use bytes::Bytes;
use rusty_adb_files::memory::InMemoryDevice;
use rusty_adb_files::view::{SortState, format_size};
use rusty_adb_files::{
    CancellationToken, DeviceSessionManager, EngineConfig, FileTransferOperationResult,
    TracingReporter, TransferSource,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    // 1. Attach a device (an in-memory one here)
    let device = InMemoryDevice::new()
        .with_dir("/sdcard/DCIM")
        .with_file("/sdcard/notes.txt", "remember the milk")
        .with_symlink("/sdcard/latest", "notes.txt");
    let mut session_manager = DeviceSessionManager::attach(Arc::new(device.clone()));

    println!("✅ Device attached");

    // 2. Create a file manager
    let manager = session_manager
        .create_file_manager(EngineConfig::default(), Arc::new(TracingReporter))
        .await?;

    // 3. List a remote directory
    println!("\n📂 Listing /sdcard...");
    let snapshot = manager.ls("/sdcard").await?.ok_or("listing failed")?;
    for item in manager.sorted_items(SortState::default()) {
        println!(
            "  - {} ({:?}, {})",
            item.key,
            item.entry.entry_type,
            format_size(item.entry.size)
        );
    }
    println!("Found {} entries in {}", snapshot.items.len(), snapshot.path);

    // 4. Upload a file into the current directory
    println!("\n⬆️  Uploading file...");
    let source = TransferSource::from_bytes("hello.txt", Bytes::from_static(b"hello device"), 0);
    match manager.put(source)?.await? {
        Some(FileTransferOperationResult::Completed(progress)) => {
            println!(
                "✅ Upload completed: {} bytes transferred",
                progress.file_size
            );
        }
        Some(FileTransferOperationResult::Cancelled {
            src_file,
            dest_file,
        }) => {
            println!("❌ Upload cancelled: {} -> {}", src_file, dest_file);
        }
        None => println!("❌ Upload failed"),
    }

    // 5. Download it back
    println!("\n⬇️  Downloading file...");
    let local_path = std::env::temp_dir().join("rusty_adb_files_hello.txt");
    let download_result = manager
        .get(
            "hello.txt",
            local_path.to_string_lossy().into_owned(),
            CancellationToken::new(),
        )
        .await?;
    if let FileTransferOperationResult::Completed(progress) = download_result {
        println!(
            "✅ Download completed: {} bytes transferred",
            progress.file_size
        );
    }

    // 6. Cleanup
    println!("\n🧹 Cleaning up...");
    manager.close();
    drop(manager);
    if let Err(e) = session_manager.close().await {
        println!("⚠️  Device link kept open: {}", e);
    }
    println!("Device stats: {:?}", device.stats());

    println!("✅ All done!");

    Ok(())
}
