mod common;

use abc_uploader::events::QueueEventPayload;
use abc_uploader::site::ErrorCode;
use abc_uploader::upload_queue::{calculate_content_hash, ItemsStatus, QueueSettings, QueueStatus};
use common::*;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;
use tokio::time::{sleep, Instant};

fn status(succeeded: usize, in_progress: usize, failed: usize, retry_later: usize) -> ItemsStatus {
    ItemsStatus {
        succeeded,
        in_progress,
        failed,
        retry_later,
    }
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_requests_track_one_item() {
    let dir = tempdir().unwrap();
    let file = write_old_file(dir.path(), "m31_001.fits");
    let site = MockSite::new();
    site.script("m31_001.fits", vec![succeed_after(100)]);
    let queue = start_queue(&site, test_settings());
    let mut events = queue.subscribe();

    queue.request_upload(&file, "m31_001.fits").unwrap();
    queue.request_upload(&file, "m31_001.fits").unwrap();
    sleep(Duration::from_millis(10)).await;
    queue.request_upload(&file, "m31_001.fits").unwrap();
    sleep(Duration::from_millis(200)).await;

    let items = queue.items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].file_path, file);
    assert_eq!(site.calls_for("m31_001.fits").len(), 1);

    let mut added = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event.payload, QueueEventPayload::ItemAdded { .. }) {
            added += 1;
        }
    }
    assert_eq!(added, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_capped() {
    let dir = tempdir().unwrap();
    let site = MockSite::new();
    let queue = start_queue(&site, test_settings());

    for n in 1..=4 {
        let name = format!("light_{}.fits", n);
        site.script(&name, vec![succeed_after(10)]);
        let file = write_old_file(dir.path(), &name);
        queue.request_upload(file, name).unwrap();
    }

    sleep(Duration::from_millis(5)).await;
    assert_eq!(queue.status().await.unwrap(), QueueStatus::Uploading);
    assert_eq!(queue.items_status().await.unwrap(), status(0, 4, 0, 0));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(site.max_in_flight(), 2);
    assert_eq!(site.total_calls(), 4);
    assert_eq!(queue.items_status().await.unwrap(), status(4, 0, 0, 0));
    assert_eq!(queue.status().await.unwrap(), QueueStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_retry_interval_doubles_up_to_cap() {
    let dir = tempdir().unwrap();
    let file = write_old_file(dir.path(), "flat.fits");
    let site = MockSite::new();
    site.script("flat.fits", vec![fail_after(0, ErrorCode::Network)]);
    let queue = start_queue(&site, test_settings());

    queue.request_upload(file, "flat.fits").unwrap();
    sleep(Duration::from_secs(35)).await;

    let calls = site.calls_for("flat.fits");
    assert!(calls.len() >= 6, "only {} attempts", calls.len());

    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).take(5).collect();
    let expected = [2, 4, 8, 10, 10].map(Duration::from_secs);
    for (gap, expected) in gaps.iter().zip(expected) {
        let diff = if *gap > expected {
            *gap - expected
        } else {
            expected - *gap
        };
        assert!(diff <= Duration::from_millis(1), "gap {:?}, expected {:?}", gap, expected);
    }

    assert_eq!(queue.items_status().await.unwrap(), status(0, 0, 0, 1));
    assert_eq!(queue.status().await.unwrap(), QueueStatus::Warning);
}

#[tokio::test(start_paused = true)]
async fn test_retry_interval_resets_after_success() {
    let dir = tempdir().unwrap();
    let first = write_old_file(dir.path(), "a.fits");
    let second = write_old_file(dir.path(), "b.fits");
    let site = MockSite::new();
    site.script(
        "a.fits",
        vec![
            fail_after(0, ErrorCode::Network),
            fail_after(0, ErrorCode::Network),
            succeed_after(0),
        ],
    );
    site.script(
        "b.fits",
        vec![fail_after(0, ErrorCode::Ssl), succeed_after(0)],
    );
    let queue = start_queue(&site, test_settings());

    // a: 0s fail, 2s fail, 6s success.
    queue.request_upload(first, "a.fits").unwrap();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(site.calls_for("a.fits").len(), 3);
    assert_eq!(queue.items_status().await.unwrap(), status(1, 0, 0, 0));

    queue.request_upload(second, "b.fits").unwrap();
    sleep(Duration::from_secs(10)).await;

    let calls = site.calls_for("b.fits");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1] - calls[0], Duration::from_secs(2));
    assert_eq!(queue.items_status().await.unwrap(), status(2, 0, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_policy_failures_are_not_retried() {
    let dir = tempdir().unwrap();
    let quota = write_old_file(dir.path(), "quota.fits");
    let flaky = write_old_file(dir.path(), "flaky.fits");
    let site = MockSite::new();
    site.script("quota.fits", vec![fail_after(0, ErrorCode::QuotaExceeded)]);
    site.script(
        "flaky.fits",
        vec![fail_after(0, ErrorCode::Network), succeed_after(0)],
    );
    let queue = start_queue(&site, test_settings());

    queue.request_upload(quota, "quota.fits").unwrap();
    queue.request_upload(flaky, "flaky.fits").unwrap();

    sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.items_status().await.unwrap(), status(0, 0, 1, 1));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(site.calls_for("quota.fits").len(), 1);
    assert_eq!(site.calls_for("flaky.fits").len(), 2);
    assert_eq!(queue.items_status().await.unwrap(), status(1, 0, 1, 0));

    let items = queue.items().await.unwrap();
    assert_eq!(items[0].last_error, Some(ErrorCode::QuotaExceeded));
    assert!(!items[0].is_recoverable());
    assert_eq!(queue.status().await.unwrap(), QueueStatus::Warning);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_outcomes_over_time() {
    let dir = tempdir().unwrap();
    let site = MockSite::new();
    site.script("file1", vec![succeed_after(1)]);
    site.script("file2", vec![fail_after(5, ErrorCode::Network)]);
    site.script("file3", vec![fail_after(20, ErrorCode::QuotaExceeded)]);
    site.script("file4", vec![fail_after(30, ErrorCode::Network)]);
    let queue = start_queue(&site, test_settings());

    let start = Instant::now();
    for name in ["file1", "file2", "file3", "file4"] {
        let file = write_old_file(dir.path(), name);
        queue.request_upload(file, name).unwrap();
    }

    tokio::time::sleep_until(start + Duration::from_millis(15)).await;
    assert_eq!(queue.items_status().await.unwrap(), status(1, 2, 0, 1));

    tokio::time::sleep_until(start + Duration::from_millis(30)).await;
    assert_eq!(queue.items_status().await.unwrap(), status(1, 1, 1, 1));

    tokio::time::sleep_until(start + Duration::from_millis(50)).await;
    assert_eq!(queue.items_status().await.unwrap(), status(1, 0, 1, 2));
    assert_eq!(
        queue.last_upload_error().await.unwrap().map(|e| e.code),
        Some(ErrorCode::Network)
    );
}

#[tokio::test(start_paused = true)]
async fn test_fresh_files_wait_for_safe_delay() {
    let dir = tempdir().unwrap();
    let fresh = write_file_aged(dir.path(), "fresh.fits", b"still writing", Duration::ZERO);
    let settled = write_old_file(dir.path(), "settled.fits");
    let site = MockSite::new();
    let queue = start_queue(&site, test_settings());

    queue.request_upload(&fresh, "fresh.fits").unwrap();
    queue.request_upload(&settled, "settled.fits").unwrap();

    // The wall clock barely moves while tokio time is paused, so `fresh` stays fresh.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(site.calls_for("settled.fits").len(), 1);
    assert!(site.calls_for("fresh.fits").is_empty());
    assert_eq!(queue.items_status().await.unwrap(), status(1, 1, 0, 0));

    set_mtime(&fresh, SystemTime::now() - Duration::from_secs(60));
    sleep(Duration::from_secs(11)).await;
    assert_eq!(site.calls_for("fresh.fits").len(), 1);
    assert_eq!(queue.items_status().await.unwrap(), status(2, 0, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_zero_safe_delay_uploads_fresh_files() {
    let dir = tempdir().unwrap();
    let fresh = write_file_aged(dir.path(), "fresh.fits", b"new", Duration::ZERO);
    let site = MockSite::new();
    let settings = QueueSettings {
        safe_upload_delay: Duration::ZERO,
        ..test_settings()
    };
    let queue = start_queue(&site, settings);

    queue.request_upload(&fresh, "fresh.fits").unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(site.calls_for("fresh.fits").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rerequest_uploads_again_only_when_modified() {
    let dir = tempdir().unwrap();
    let file = write_file_aged(
        dir.path(),
        "dark.fits",
        b"first exposure",
        Duration::from_secs(7200),
    );
    let site = MockSite::new();
    let queue = start_queue(&site, test_settings());

    queue.request_upload(&file, "dark.fits").unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(site.calls_for("dark.fits").len(), 1);

    queue.request_upload(&file, "dark.fits").unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(site.calls_for("dark.fits").len(), 1);

    std::fs::write(&file, b"second exposure").unwrap();
    set_mtime(&file, SystemTime::now() - Duration::from_secs(3600));
    queue.request_upload(&file, "dark.fits").unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(site.calls_for("dark.fits").len(), 2);
    let items = queue.items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].progress, 100);
    assert_eq!(
        items[0].file_hash.as_deref(),
        Some(calculate_content_hash(b"second exposure").as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_login_halts_until_authenticate() {
    let dir = tempdir().unwrap();
    let file = write_old_file(dir.path(), "bias.fits");
    let site = MockSite::new();
    site.set_auth_fails(true);
    let queue = start_queue(&site, test_settings());

    queue.request_upload(&file, "bias.fits").unwrap();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(site.total_calls(), 0);
    assert_eq!(site.auth_attempts(), 1);
    assert_eq!(queue.status().await.unwrap(), QueueStatus::Warning);
    assert_eq!(
        queue.last_upload_error().await.unwrap().map(|e| e.code),
        Some(ErrorCode::Authentication)
    );
    assert_eq!(queue.items_status().await.unwrap(), status(0, 1, 0, 0));

    site.set_auth_fails(false);
    queue.authenticate().unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(site.auth_attempts(), 2);
    assert_eq!(site.calls_for("bias.fits").len(), 1);
    assert_eq!(queue.items_status().await.unwrap(), status(1, 0, 0, 0));
    assert_eq!(queue.status().await.unwrap(), QueueStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_item_lifecycle() {
    let dir = tempdir().unwrap();
    let file = write_old_file(dir.path(), "m42.fits");
    let site = MockSite::new();
    site.script("m42.fits", vec![succeed_after(10)]);
    let queue = start_queue(&site, test_settings());
    let mut events = queue.subscribe();

    queue.request_upload(&file, "session/m42.fits").unwrap();
    sleep(Duration::from_millis(50)).await;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert!(received
        .windows(2)
        .all(|pair| pair[0].sequence < pair[1].sequence));

    let payloads: Vec<QueueEventPayload> = received.into_iter().map(|e| e.payload).collect();
    let progress = |progress| QueueEventPayload::ItemProgress {
        index: 0,
        file_path: file.clone(),
        file_name: "session/m42.fits".to_string(),
        progress,
    };
    assert_eq!(
        payloads,
        vec![
            QueueEventPayload::ItemAdded {
                index: 0,
                file_path: file.clone(),
                file_name: "session/m42.fits".to_string(),
            },
            QueueEventPayload::StatusChanged {
                status: QueueStatus::Uploading
            },
            progress(50),
            progress(100),
            QueueEventPayload::StatusChanged {
                status: QueueStatus::Idle
            },
        ]
    );

    // The logical name and content hash travel with the file.
    let parts = site.parts_for("m42.fits");
    let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["file_hash", "original_path"]);
    assert_eq!(parts[1].value, "session/m42.fits");
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_file_fails_without_retry() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("gone.fits");
    let site = MockSite::new();
    let queue = start_queue(&site, test_settings());

    queue.request_upload(&missing, "gone.fits").unwrap();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(site.total_calls(), 0);
    assert_eq!(queue.items_status().await.unwrap(), status(0, 0, 1, 0));
    let items = queue.items().await.unwrap();
    assert_eq!(items[0].last_error, Some(ErrorCode::LocalFile));
}
