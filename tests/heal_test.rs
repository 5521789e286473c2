//! Stale-URL self-repair on the restore path.

mod common;

use common::{payload, Harness, TEST_USER};

/// A part whose primary URL expired is transparently repaired: the provider
/// mints a fresh URL, the part record is updated, and the restore succeeds.
#[tokio::test]
async fn test_stale_url_is_healed() {
    let h = Harness::new(8).await;
    let bytes = payload(40, 11); // 5 parts
    let ids = h.upload(vec![h.spool("data.bin", &bytes)]).await;
    let id = &ids[0];

    let before = h.archive(id).await;
    let part2 = before
        .deduped_parts()
        .into_iter()
        .find(|p| p.index == 2)
        .unwrap();
    h.webhook.expire_url(&part2.url);

    assert_eq!(h.download_whole(id).await, bytes);

    // the repaired URL is persisted on the part
    let after = h.archive(id).await;
    let healed = after
        .deduped_parts()
        .into_iter()
        .find(|p| p.index == 2)
        .unwrap();
    assert_ne!(healed.url, part2.url);
}

/// Two consecutive 404s (the refreshed URL is also dead) escalate to the
/// caller instead of looping.
#[tokio::test]
async fn test_double_stale_escalates() {
    let h = Harness::new(8).await;
    let bytes = payload(24, 12);
    let ids = h.upload(vec![h.spool("data.bin", &bytes)]).await;
    let id = &ids[0];

    let part = h.archive(id).await.deduped_parts()[1].clone();
    h.webhook.break_refresh(true);
    h.webhook.expire_url(&part.url);

    let stream = h.service.stream_whole(TEST_USER, id).await.unwrap();
    let err = Harness::try_collect(stream.body).await.unwrap_err();
    assert!(err.to_string().starts_with("restore_failed"));
}

/// The on-demand refresh endpoint persists and returns the fresh URL.
#[tokio::test]
async fn test_refresh_part_url() {
    let h = Harness::new(8).await;
    let ids = h.upload(vec![h.spool("data.bin", &payload(16, 13))]).await;
    let id = &ids[0];

    let old = h.archive(id).await.deduped_parts()[0].clone();
    let fresh = h.service.refresh_part_url(TEST_USER, id, 0).await.unwrap();
    assert_ne!(fresh, old.url);
    assert_eq!(h.archive(id).await.deduped_parts()[0].url, fresh);
}

/// Relay serves the raw ciphertext (not the plaintext).
#[tokio::test]
async fn test_relay_part_is_ciphertext() {
    let h = Harness::new(8).await;
    let bytes = payload(16, 14);
    let ids = h.upload(vec![h.spool("data.bin", &bytes)]).await;
    let id = &ids[0];

    let part = h.archive(id).await.deduped_parts()[0].clone();
    let relayed = h.service.relay_part(TEST_USER, id, 0).await.unwrap();
    assert_eq!(relayed.len() as u64, part.size);
    assert_ne!(&relayed[..], &bytes[..8], "relay must not decrypt");
    assert_eq!(offload_server::crypto::sha256_hex(&relayed), part.hash);
}

/// Corrupted remote bytes fail the read with the part's hash-mismatch code.
#[tokio::test]
async fn test_hash_mismatch_fails_restore() {
    use offload_server::store::MetaStore;

    let h = Harness::new(8).await;
    let ids = h.upload(vec![h.spool("data.bin", &payload(16, 15))]).await;
    let id = &ids[0];

    // Tamper with the recorded hash of part 1 so the fetched bytes no longer
    // match.
    let mut archive = h.archive(id).await;
    for part in archive.parts.iter_mut().filter(|p| p.index == 1) {
        part.hash = "0".repeat(64);
    }
    h.store.remove_archive(id).await.unwrap();
    h.store.insert_archive(archive).await.unwrap();

    let stream = h.service.stream_whole(TEST_USER, id).await.unwrap();
    let err = Harness::try_collect(stream.body).await.unwrap_err();
    assert!(err.to_string().contains("part_hash_mismatch:1"), "{err}");
}
