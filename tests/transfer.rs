use bytes::Bytes;
use rusty_adb_files::memory::InMemoryDevice;
use rusty_adb_files::{
    CancellationToken, ChannelReporter, DeviceFileManager, EngineConfig, EngineError,
    ErrorReport, FileTransferOperationResult, S_IFREG, TransferSource,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn manager(
    device: &InMemoryDevice,
    config: EngineConfig,
) -> (DeviceFileManager, UnboundedReceiver<ErrorReport>) {
    let (reporter, errors) = ChannelReporter::new();
    let manager = DeviceFileManager::new(Arc::new(device.clone()), config, Arc::new(reporter));
    (manager, errors)
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

fn drain(errors: &mut UnboundedReceiver<ErrorReport>) -> Vec<ErrorReport> {
    let mut reports = Vec::new();
    while let Ok(report) = errors.try_recv() {
        reports.push(report);
    }
    reports
}

#[tokio::test]
async fn test_upload_writes_bounded_chunks_and_refreshes() {
    let device = InMemoryDevice::new().with_dir("/sdcard");
    let (manager, mut errors) = manager(&device, EngineConfig::new(1000));
    manager.ls("/sdcard").await.unwrap().unwrap();
    let mut listing = manager.subscribe_listing();

    let source = TransferSource::from_bytes("data.bin", payload(10_000), 1_650_000_000);
    let result = manager.put(source).unwrap().await.unwrap();

    let Some(FileTransferOperationResult::Completed(progress)) = result else {
        panic!("upload should complete, got {result:?}");
    };
    assert_eq!(progress.dest_file, "/sdcard/data.bin");
    assert_eq!(progress.file_size, 10_000);
    assert_eq!(progress.transferred_bytes, 10_000);
    assert_eq!(progress.bytes_per_second, 10_000);
    assert_eq!(progress.percentage_progress, 100.0);

    let writes = device.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].mode, S_IFREG | 0o666);
    assert_eq!(writes[0].mtime, 1_650_000_000);
    assert_eq!(writes[0].chunk_sizes, vec![1000; 10]);
    assert!(writes[0].completed);
    assert_eq!(device.file("/sdcard/data.bin"), Some(payload(10_000)));

    let stats = device.stats();
    assert_eq!((stats.writers_opened, stats.writers_closed), (1, 1));
    assert!(manager.transfer_session().is_none());

    let refreshed = listing
        .wait_for(|snapshot| !snapshot.loading && snapshot.item("data.bin").is_some())
        .await
        .unwrap()
        .clone();
    assert_eq!(refreshed.item("data.bin").unwrap().entry.size, 10_000);
    assert!(drain(&mut errors).is_empty());
}

#[tokio::test]
async fn test_upload_of_partial_tail_frame() {
    let device = InMemoryDevice::new();
    let (manager, _errors) = manager(&device, EngineConfig::new(4096));

    let source = TransferSource::from_bytes("tail.bin", payload(10_000), 0);
    manager.put_to(source, "/tail.bin").unwrap().await.unwrap().unwrap();

    assert_eq!(device.writes()[0].chunk_sizes, [4096, 4096, 1808]);
}

#[tokio::test(start_paused = true)]
async fn test_speed_is_sampled_on_timer_and_at_completion() {
    // each 1000 byte frame takes 275ms to write
    let device = InMemoryDevice::new().with_write_delay(Duration::from_millis(275));
    let (manager, _errors) = manager(&device, EngineConfig::new(1000));

    let samples = Arc::new(Mutex::new(Vec::new()));
    let mut sessions = manager.subscribe_transfers();
    let recorder = {
        let samples = samples.clone();
        tokio::spawn(async move {
            while sessions.changed().await.is_ok() {
                if let Some(session) = sessions.borrow_and_update().clone() {
                    samples.lock().unwrap().push((session.transferred_bytes, session.speed));
                }
            }
        })
    };

    let source = TransferSource::from_bytes("slow.bin", payload(10_000), 0);
    let result = manager.put_to(source, "/slow.bin").unwrap().await.unwrap();
    let Some(FileTransferOperationResult::Completed(progress)) = result else {
        panic!("upload should complete, got {result:?}");
    };

    let samples = samples.lock().unwrap().clone();
    assert!(samples.contains(&(4000, 4000)), "{samples:?}");
    assert!(samples.contains(&(8000, 4000)), "{samples:?}");
    assert_eq!(progress.bytes_per_second, 2000);
    assert!(samples.windows(2).all(|pair| pair[0].0 <= pair[1].0));

    drop(manager);
    recorder.abort();
}

#[tokio::test(start_paused = true)]
async fn test_second_upload_is_refused_while_busy() {
    let device = InMemoryDevice::new().with_write_delay(Duration::from_millis(50));
    let (manager, _errors) = manager(&device, EngineConfig::new(1000));

    let first = manager
        .put_to(TransferSource::from_bytes("one", payload(5000), 0), "/one")
        .unwrap();

    let refused = manager.put_to(TransferSource::from_bytes("two", payload(10), 0), "/two");
    assert!(matches!(refused, Err(EngineError::TransferInProgress(_))));

    first.await.unwrap().unwrap();
    assert!(manager.transfer_session().is_none());
    let again = manager
        .put_to(TransferSource::from_bytes("two", payload(10), 0), "/two")
        .unwrap();
    assert!(again.await.unwrap().is_some());
    assert!(device.exists("/two"));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_upload_leaves_no_file() {
    let device = InMemoryDevice::new().with_write_delay(Duration::from_millis(100));
    let (manager, mut errors) = manager(&device, EngineConfig::new(1000));

    let handle = manager
        .put_to(TransferSource::from_bytes("big.bin", payload(10_000), 0), "/big.bin")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    manager.cancel_transfer();

    let result = handle.await.unwrap();
    assert_eq!(
        result,
        Some(FileTransferOperationResult::Cancelled {
            src_file: "big.bin".to_string(),
            dest_file: "/big.bin".to_string(),
        })
    );
    let writes = device.writes();
    assert!(!writes[0].completed);
    assert!(writes[0].chunk_sizes.len() < 10);
    assert!(!device.exists("/big.bin"));

    let stats = device.stats();
    assert_eq!(stats.writers_opened, stats.writers_closed);
    assert!(manager.transfer_session().is_none());
    assert!(drain(&mut errors).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_upload_holds_slot_until_it_unwinds() {
    let device = InMemoryDevice::new().with_write_delay(Duration::from_millis(500));
    let (manager, mut errors) = manager(&device, EngineConfig::new(1000));

    let first = manager
        .put_to(TransferSource::from_bytes("one", payload(10_000), 0), "/one")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.cancel_transfer();

    // the first frame is still being written
    let refused = manager.put_to(TransferSource::from_bytes("two", payload(10), 0), "/two");
    assert!(matches!(refused, Err(EngineError::TransferInProgress(_))));
    assert_eq!(manager.transfer_session().unwrap().source, "one");

    assert!(matches!(
        first.await.unwrap(),
        Some(FileTransferOperationResult::Cancelled { .. })
    ));
    assert!(manager.transfer_session().is_none());

    let second = manager
        .put_to(TransferSource::from_bytes("two", payload(10), 0), "/two")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let live = manager.transfer_session().unwrap();
    assert_eq!(live.source, "two");

    let Some(FileTransferOperationResult::Completed(progress)) = second.await.unwrap() else {
        panic!("second upload should complete");
    };
    assert_eq!(progress.transferred_bytes, 10);
    assert!(device.exists("/two"));
    assert!(!device.exists("/one"));

    let stats = device.stats();
    assert_eq!(stats.sessions_opened, stats.sessions_disposed);
    assert_eq!((stats.writers_opened, stats.writers_closed), (2, 2));
    assert!(drain(&mut errors).is_empty());
}

#[tokio::test]
async fn test_failed_write_is_reported_and_released() {
    let device = InMemoryDevice::new().fail_write_after(3);
    let (manager, mut errors) = manager(&device, EngineConfig::new(1000));

    let result = manager
        .put_to(TransferSource::from_bytes("x.bin", payload(10_000), 0), "/x.bin")
        .unwrap()
        .await
        .unwrap();

    assert!(result.is_none());
    let writes = device.writes();
    assert_eq!(writes[0].chunk_sizes.len(), 3);
    assert!(!writes[0].completed);
    assert!(!device.exists("/x.bin"));

    let reports = drain(&mut errors);
    assert!(
        reports.iter().any(|r| r.message.contains("interrupted")),
        "{reports:?}"
    );
    assert!(manager.transfer_session().is_none());
}

#[tokio::test]
async fn test_download_round_trip() {
    let device = InMemoryDevice::new().with_file("/sdcard/photo.jpg", payload(200_000));
    let (manager, _errors) = manager(&device, EngineConfig::default());
    manager.ls("/sdcard").await.unwrap().unwrap();

    let local = std::env::temp_dir()
        .join(format!("rusty_adb_files_{}", std::process::id()))
        .join("nested/photo.jpg");
    let result = manager
        .get(
            "photo.jpg",
            local.to_string_lossy().into_owned(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let FileTransferOperationResult::Completed(progress) = result else {
        panic!("download should complete, got {result:?}");
    };
    assert_eq!(progress.src_file, "/sdcard/photo.jpg");
    assert_eq!(progress.file_size, 200_000);
    assert_eq!(&tokio::fs::read(&local).await.unwrap()[..], &payload(200_000)[..]);
    let stats = device.stats();
    assert_eq!(stats.sessions_opened, stats.sessions_disposed);

    let _ = tokio::fs::remove_file(&local).await;
}

#[tokio::test]
async fn test_download_cancelled_before_first_chunk() {
    let device = InMemoryDevice::new().with_file("/a.bin", payload(10));
    let (manager, _errors) = manager(&device, EngineConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let local = std::env::temp_dir().join(format!("rusty_adb_files_cancel_{}.bin", std::process::id()));
    let result = manager
        .get("/a.bin", local.to_string_lossy().into_owned(), token)
        .await
        .unwrap();

    assert!(matches!(result, FileTransferOperationResult::Cancelled { .. }));
    assert_eq!(device.stats().sessions_disposed, 1);
    let _ = tokio::fs::remove_file(&local).await;
}

#[tokio::test]
async fn test_download_of_missing_file_fails() {
    let device = InMemoryDevice::new();
    let (manager, _errors) = manager(&device, EngineConfig::default());

    let local = std::env::temp_dir().join("rusty_adb_files_missing.bin");
    let err = manager
        .get("/nope", local.to_string_lossy().into_owned(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("/nope"));
    assert_eq!(device.stats().sessions_disposed, 1);
}

#[tokio::test]
async fn test_batch_delete_continues_past_failures() {
    let device = InMemoryDevice::new()
        .with_file("/sdcard/a.txt", "a")
        .with_file("/sdcard/locked.txt", "b")
        .with_file("/sdcard/it's.txt", "c")
        .deny_delete("/sdcard/locked.txt");
    let (manager, mut errors) = manager(&device, EngineConfig::default());
    manager.ls("/sdcard").await.unwrap().unwrap();

    let summary = manager
        .rm(vec!["a.txt".into(), "locked.txt".into(), "it's.txt".into()])
        .await;

    assert_eq!(summary.removed, ["/sdcard/a.txt", "/sdcard/it's.txt"]);
    assert_eq!(summary.failed, ["/sdcard/locked.txt"]);
    assert!(!device.exists("/sdcard/a.txt"));
    assert!(device.exists("/sdcard/locked.txt"));
    assert!(!device.exists("/sdcard/it's.txt"));
    assert_eq!(
        device.shell_history(),
        [
            "rm -rf '/sdcard/a.txt'",
            "rm -rf '/sdcard/locked.txt'",
            r"rm -rf '/sdcard/it'\''s.txt'",
        ]
    );

    let reports = drain(&mut errors);
    assert_eq!(
        reports,
        [ErrorReport::message("rm: /sdcard/locked.txt: Permission denied")]
    );

    let mut listing = manager.subscribe_listing();
    let snapshot = listing
        .wait_for(|snapshot| !snapshot.loading && snapshot.items.len() == 1)
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.items[0].key, "locked.txt");
}

#[tokio::test]
async fn test_batch_delete_on_dead_link_reports_each_item() {
    let device = InMemoryDevice::new()
        .with_file("/a", "a")
        .with_file("/b", "b");
    let (manager, mut errors) = manager(&device, EngineConfig::default());
    device.disconnect();

    let summary = manager.rm(vec!["a".into(), "b".into()]).await;

    assert!(summary.removed.is_empty());
    assert_eq!(summary.failed, ["/a", "/b"]);
    let delete_reports = drain(&mut errors)
        .into_iter()
        .filter(|report| report.message.starts_with("Failed to delete"))
        .count();
    assert_eq!(delete_reports, 2);
}
