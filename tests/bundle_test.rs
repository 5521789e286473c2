//! Bundle archives: grouping, entry extraction, bundle-specific refusals.

mod common;

use common::{payload, Harness, TEST_USER};
use offload_server::archive::restore::RestoreError;
use offload_server::types::ArchiveStatus;

/// Files [("a.txt", "A"), ("b.txt", "BB")] form one bundle; entry restore by
/// index returns the member bytes with its original filename.
#[tokio::test]
async fn test_bundle_entry_restore() {
    let h = Harness::new(8).await;
    let ids = h
        .upload(vec![h.spool("a.txt", b"A"), h.spool("b.txt", b"BB")])
        .await;
    assert_eq!(ids.len(), 1, "small files pack into one bundle");
    let id = &ids[0];

    let archive = h.archive(id).await;
    assert!(archive.is_bundle);
    assert_eq!(archive.files.len(), 2);
    assert_eq!(archive.status, ArchiveStatus::Ready);

    let entry = h
        .service
        .stream_bundle_entry(TEST_USER, id, 1)
        .await
        .unwrap();
    assert_eq!(entry.head.filename, "b.txt");
    assert_eq!(Harness::collect(entry.body).await, b"BB");

    let entry = h
        .service
        .stream_bundle_entry(TEST_USER, id, 0)
        .await
        .unwrap();
    assert_eq!(entry.head.filename, "a.txt");
    assert_eq!(Harness::collect(entry.body).await, b"A");

    // out-of-bounds index is a 404
    let err = h
        .service
        .stream_bundle_entry(TEST_USER, id, 2)
        .await
        .err()
        .expect("index 2 must not resolve");
    assert!(matches!(err, RestoreError::FileNotFound));
}

/// The whole-bundle download is a zip whose entries carry the index prefix.
#[tokio::test]
async fn test_bundle_whole_download_is_zip() {
    let h = Harness::new(64).await;
    let ids = h
        .upload(vec![
            h.spool("one.txt", b"first file"),
            h.spool("two.txt", b"second file"),
        ])
        .await;

    let stream = h.service.stream_whole(TEST_USER, &ids[0]).await.unwrap();
    assert_eq!(stream.head.content_type, "application/zip");
    // bundles stream without a known length
    assert!(stream.head.content_length.is_none());

    let zip_bytes = Harness::collect(stream.body).await;
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(zip_bytes)).unwrap();
    assert_eq!(zip.len(), 2);
    assert!(zip.by_name("0_one.txt").is_ok());
    assert!(zip.by_name("1_two.txt").is_ok());
}

#[tokio::test]
async fn test_range_on_bundle_is_refused() {
    let h = Harness::new(8).await;
    let ids = h
        .upload(vec![h.spool("a.txt", b"A"), h.spool("b.txt", b"BB")])
        .await;

    let err = h.download_range(&ids[0], "bytes=0-0").await.unwrap_err();
    assert!(matches!(err, RestoreError::RangeNotSupported));
}

/// Large files become their own archives; the rest pack together.
#[tokio::test]
async fn test_bundle_grouping_thresholds() {
    let h = Harness::build(1024, false, |c| {
        c.bundle_single_file_bytes = 1000;
        c.bundle_max_bytes = 2000;
    })
    .await;

    let ids = h
        .upload(vec![
            h.spool("big.bin", &payload(1500, 1)),   // own archive
            h.spool("small1.bin", &payload(800, 2)), // bundle A
            h.spool("small2.bin", &payload(800, 3)), // bundle A (1600 <= 2000)
            h.spool("small3.bin", &payload(800, 4)), // bundle B (would exceed)
        ])
        .await;
    assert_eq!(ids.len(), 3);

    let mut bundles = 0;
    let mut singles = 0;
    for id in &ids {
        let archive = h.archive(id).await;
        assert_eq!(archive.status, ArchiveStatus::Ready);
        if archive.is_bundle {
            bundles += 1;
        } else {
            singles += 1;
        }
    }
    assert_eq!(singles, 2); // the big file + the lone leftover
    assert_eq!(bundles, 1);
}

/// Relative upload paths land the archive in auto-created sub-folders, and
/// files bound for different folders never share a bundle.
#[tokio::test]
async fn test_relative_paths_create_folders() {
    let h = Harness::new(64).await;
    let ids = h
        .upload(vec![
            h.spool("photos/2026/a.jpg", b"aaaa"),
            h.spool("photos/2026/b.jpg", b"bbbb"),
            h.spool("root.txt", b"rrrr"),
        ])
        .await;
    assert_eq!(ids.len(), 2);

    let with_folder = futures::future::join_all(ids.iter().map(|id| h.archive(id)))
        .await
        .into_iter()
        .filter(|a| a.folder_id.is_some())
        .count();
    assert_eq!(with_folder, 1);
}

/// Bundle zip overhead is settled against quota so reserve == refund.
#[tokio::test]
async fn test_bundle_quota_matches_original_size() {
    let h = Harness::new(64).await;
    let ids = h
        .upload(vec![h.spool("a.txt", b"AAAA"), h.spool("b.txt", b"BB")])
        .await;
    let archive = h.archive(&ids[0]).await;

    // original_size is the zip payload size (member bytes + container)
    assert!(archive.original_size > 6);
    assert_eq!(h.used_bytes(TEST_USER).await, archive.original_size);
}
