//! Crash recovery and retry behavior of the upload worker.

mod common;

use common::{payload, Harness};
use offload_server::store::MetaStore;
use offload_server::types::ArchiveStatus;
use std::sync::atomic::Ordering;

/// Kill mid-upload after two committed parts: the archive requeues, and the
/// next pass commits only the remaining parts.
#[tokio::test]
async fn test_resume_skips_committed_parts() {
    // One part uploader so commit order is deterministic.
    let h = Harness::build(8, false, |c| {
        c.upload_parts_concurrency = 1;
        c.cache_delete_after_upload = true;
    })
    .await;

    let bytes = payload(40, 5); // 5 parts at chunk 8
    let input = h.spool("data.bin", &bytes);
    let ids = h
        .service
        .create_archives_from_files(common::TEST_USER, None, vec![input])
        .await
        .unwrap();
    let id = &ids[0];

    // Provider dies after two successful uploads.
    h.webhook.allow_uploads(2);
    assert!(h.service.process_next_upload().await.unwrap());

    let archive = h.archive(id).await;
    assert_eq!(archive.status, ArchiveStatus::Queued, "transient failure requeues");
    assert_eq!(archive.retry_count, 1);
    assert_eq!(archive.uploaded_parts, 2);
    let committed: Vec<u32> = archive.deduped_parts().iter().map(|p| p.index).collect();
    assert_eq!(committed, vec![0, 1]);

    // Staging must survive the failed pass for the retry to resume from.
    assert!(archive.staging_dir.as_ref().unwrap().exists());

    // Next pass commits parts 2..4 only.
    h.webhook.allow_all();
    h.webhook.uploads_ok.store(0, Ordering::SeqCst);
    assert!(h.service.process_next_upload().await.unwrap());

    let archive = h.archive(id).await;
    assert_eq!(archive.status, ArchiveStatus::Ready);
    assert_eq!(archive.total_parts, 5);
    assert_eq!(h.webhook.uploads_ok.load(Ordering::SeqCst), 3);

    assert_eq!(h.download_whole(id).await, bytes);
}

/// Retry budget exhaustion flips the archive to a terminal error.
#[tokio::test]
async fn test_retry_budget_exhaustion_is_terminal() {
    let h = Harness::build(8, false, |c| {
        c.upload_retry_max = 2;
        c.upload_parts_concurrency = 1;
    })
    .await;

    let input = h.spool("doomed.bin", &payload(16, 1));
    let ids = h
        .service
        .create_archives_from_files(common::TEST_USER, None, vec![input])
        .await
        .unwrap();
    let id = &ids[0];

    h.webhook.allow_uploads(0);
    h.drain_queue().await;

    let archive = h.archive(id).await;
    assert_eq!(archive.status, ArchiveStatus::Error);
    assert!(archive.error.is_some());
    assert_eq!(archive.retry_count, 2);
}

/// Startup recovery returns every processing archive to the queue and zeroes
/// counters for part-less ones.
#[tokio::test]
async fn test_startup_recovery_resets_processing() {
    let h = Harness::new(8).await;

    let input = h.spool("stuck.bin", &payload(16, 2));
    let ids = h
        .service
        .create_archives_from_files(common::TEST_USER, None, vec![input])
        .await
        .unwrap();

    // Lease it, simulating a worker that died mid-flight.
    let leased = h.store.lease_next_queued().await.unwrap().unwrap();
    assert_eq!(leased.id, ids[0]);
    assert_eq!(leased.status, ArchiveStatus::Processing);

    let reset = h.store.reset_all_processing().await.unwrap();
    assert_eq!(reset, 1);
    let archive = h.archive(&ids[0]).await;
    assert_eq!(archive.status, ArchiveStatus::Queued);
    assert_eq!(archive.uploaded_parts, 0);

    // And the requeued archive uploads cleanly afterwards.
    h.drain_queue().await;
    h.assert_status(&ids[0], ArchiveStatus::Ready).await;
}

/// The stale reaper only touches processing archives older than the cutoff.
#[tokio::test]
async fn test_stale_processing_reset_respects_cutoff() {
    let h = Harness::new(8).await;

    let input = h.spool("slow.bin", &payload(16, 3));
    let ids = h
        .service
        .create_archives_from_files(common::TEST_USER, None, vec![input])
        .await
        .unwrap();
    h.store.lease_next_queued().await.unwrap().unwrap();

    // A generous cutoff leaves the fresh lease alone.
    assert_eq!(h.store.reset_stale_processing(30).await.unwrap(), 0);
    h.assert_status(&ids[0], ArchiveStatus::Processing).await;

    // A zero-minute cutoff makes everything stale.
    assert_eq!(h.store.reset_stale_processing(0).await.unwrap(), 1);
    h.assert_status(&ids[0], ArchiveStatus::Queued).await;
}

/// A missing staging payload is a terminal error, not a retry loop.
#[tokio::test]
async fn test_missing_staging_is_terminal() {
    let h = Harness::new(8).await;

    let input = h.spool("gone.bin", &payload(16, 4));
    let ids = h
        .service
        .create_archives_from_files(common::TEST_USER, None, vec![input])
        .await
        .unwrap();

    let archive = h.archive(&ids[0]).await;
    std::fs::remove_dir_all(archive.staging_dir.as_ref().unwrap()).unwrap();

    h.drain_queue().await;
    let archive = h.archive(&ids[0]).await;
    assert_eq!(archive.status, ArchiveStatus::Error);
    assert_eq!(archive.error.as_deref(), Some("missing_file"));
}
