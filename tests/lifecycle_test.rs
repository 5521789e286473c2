//! Lifecycle operations: trash, restore, move, rename, priority, ownership.

mod common;

use common::{payload, Harness, TEST_USER};
use offload_server::archive::ArchiveError;
use offload_server::store::MetaStore;
use offload_server::types::ArchiveStatus;

/// Trash then restore-from-trash is a no-op on parts, size, and quota.
#[tokio::test]
async fn test_trash_restore_is_noop_on_storage() {
    let h = Harness::new(8).await;
    let bytes = payload(24, 41);
    let ids = h.upload(vec![h.spool("keep.bin", &bytes)]).await;
    let id = &ids[0];

    let before = h.archive(id).await;
    let used_before = h.used_bytes(TEST_USER).await;

    h.service.trash(TEST_USER, id).await.unwrap();
    let trashed = h.archive(id).await;
    assert!(trashed.is_trashed());
    assert_eq!(trashed.parts.len(), before.parts.len());

    h.service.restore_from_trash(TEST_USER, id).await.unwrap();
    let after = h.archive(id).await;
    assert!(after.trashed_at.is_none());
    assert_eq!(after.original_size, before.original_size);
    assert_eq!(after.parts.len(), before.parts.len());
    assert_eq!(h.used_bytes(TEST_USER).await, used_before);

    assert_eq!(h.download_whole(id).await, bytes);
}

/// The trash view shows only trashed archives; the normal view excludes them.
#[tokio::test]
async fn test_list_views() {
    let h = Harness::new(8).await;
    let ids = h
        .upload(vec![
            h.spool("a.bin", &payload(2048, 42)),
            h.spool("b.bin", &payload(4096, 43)),
        ])
        .await;
    // both larger than one chunk but under the bundle threshold: one bundle
    assert_eq!(ids.len(), 1);
    let extra = h.upload(vec![h.spool("c.bin", &payload(16, 44))]).await;

    h.service.trash(TEST_USER, &extra[0]).await.unwrap();

    let normal = h.service.list(TEST_USER, false).await.unwrap();
    assert_eq!(normal.len(), 1);
    assert_eq!(normal[0].id, ids[0]);

    let trash = h.service.list(TEST_USER, true).await.unwrap();
    assert_eq!(trash.len(), 1);
    assert_eq!(trash[0].id, extra[0]);
}

#[tokio::test]
async fn test_ownership_is_enforced() {
    let h = Harness::new(8).await;
    h.add_user("u-other", 0).await;
    let ids = h.upload(vec![h.spool("mine.bin", &payload(16, 45))]).await;

    let err = h.service.trash("u-other", &ids[0]).await.unwrap_err();
    assert!(matches!(err, ArchiveError::Forbidden));

    let err = h
        .service
        .stream_whole("u-other", &ids[0])
        .await
        .err()
        .expect("foreign download must fail");
    assert_eq!(err.to_string(), "forbidden");
}

#[tokio::test]
async fn test_move_and_rename() {
    let h = Harness::new(8).await;
    let ids = h.upload(vec![h.spool("old-name.bin", &payload(16, 46))]).await;
    let id = &ids[0];

    let folder = h
        .store
        .ensure_folder(TEST_USER, None, "documents")
        .await
        .unwrap();
    h.service
        .move_to_folder(TEST_USER, id, Some(folder.id.clone()))
        .await
        .unwrap();
    assert_eq!(h.archive(id).await.folder_id.as_deref(), Some(folder.id.as_str()));

    h.service
        .rename(TEST_USER, id, "new-name.bin")
        .await
        .unwrap();
    let archive = h.archive(id).await;
    assert_eq!(archive.download_name, "new-name.bin");

    // downloads carry the new name
    let stream = h.service.stream_whole(TEST_USER, id).await.unwrap();
    assert_eq!(stream.head.filename, "new-name.bin");
}

#[tokio::test]
async fn test_rename_bundle_entry() {
    let h = Harness::new(64).await;
    let ids = h
        .upload(vec![h.spool("a.txt", b"A"), h.spool("b.txt", b"BB")])
        .await;
    let id = &ids[0];

    h.service
        .rename_entry(TEST_USER, id, 1, "renamed.txt")
        .await
        .unwrap();
    assert_eq!(h.archive(id).await.files[1].original_name, "renamed.txt");

    // the zip entry name is keyed by the internal name, so extraction still
    // works and serves the new display name
    let entry = h
        .service
        .stream_bundle_entry(TEST_USER, id, 1)
        .await
        .unwrap();
    assert_eq!(entry.head.filename, "renamed.txt");
    assert_eq!(Harness::collect(entry.body).await, b"BB");

    let err = h
        .service
        .rename_entry(TEST_USER, id, 9, "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::BadIndex));
}

/// Priority steers lease order; the override bit survives.
#[tokio::test]
async fn test_priority_orders_queue() {
    let h = Harness::new(8).await;

    let first = h
        .service
        .create_archives_from_files(TEST_USER, None, vec![h.spool("first.bin", &payload(8, 47))])
        .await
        .unwrap();
    let second = h
        .service
        .create_archives_from_files(TEST_USER, None, vec![h.spool("second.bin", &payload(8, 48))])
        .await
        .unwrap();

    h.service
        .set_priority(TEST_USER, &second[0], 4, true)
        .await
        .unwrap();
    let archive = h.archive(&second[0]).await;
    assert_eq!(archive.priority, 4);
    assert!(archive.priority_override);

    // the high-priority archive leases ahead of the older one
    let leased = h.store.lease_next_queued().await.unwrap().unwrap();
    assert_eq!(leased.id, second[0]);
    let leased = h.store.lease_next_queued().await.unwrap().unwrap();
    assert_eq!(leased.id, first[0]);
}

/// Downloading an archive that is still uploading is refused with not_ready.
#[tokio::test]
async fn test_download_before_ready_is_refused() {
    let h = Harness::new(8).await;
    let ids = h
        .service
        .create_archives_from_files(TEST_USER, None, vec![h.spool("q.bin", &payload(16, 49))])
        .await
        .unwrap();

    h.assert_status(&ids[0], ArchiveStatus::Queued).await;
    let err = h
        .service
        .stream_whole(TEST_USER, &ids[0])
        .await
        .err()
        .expect("queued archive must not stream");
    assert_eq!(err.to_string(), "not_ready");
}
