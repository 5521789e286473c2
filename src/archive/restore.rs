//! Restore engine: whole-archive streaming, bundle entry extraction,
//! byte-range serving, and URL self-repair.
//!
//! Every part download is wrapped in a repair path: a 401/403/404 means the
//! attachment URL went stale, so the provider is asked for a fresh one, the
//! new URL is persisted on the part, and the download retried once. If the
//! primary stays broken, a verified mirror copy serves the read — without
//! marking the primary healthy.

use super::staging::ScratchDir;
use super::ArchiveService;
use crate::crypto::CryptoError;
use crate::provider::{BlobProvider, ProviderError, ProviderRegistry};
use crate::store::StoreError;
use crate::types::{Archive, ArchiveStatus, Part, PlacementSide, CURRENT_ENCRYPTION_VERSION};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::io::Read;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Chunk size for response bodies assembled from scratch files.
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("not_found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("not_ready")]
    NotReady,

    #[error("file_not_found")]
    FileNotFound,

    #[error("range_not_supported")]
    RangeNotSupported,

    /// Syntactically valid range that lies outside the payload; carries the
    /// size for the `Content-Range: bytes */size` rejection.
    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("restore_failed: {0}")]
    Failed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for RestoreError {
    fn from(err: CryptoError) -> Self {
        RestoreError::Failed(err.to_string())
    }
}

impl From<ProviderError> for RestoreError {
    fn from(err: ProviderError) -> Self {
        RestoreError::Failed(err.to_string())
    }
}

/// Response metadata for a restore stream.
#[derive(Debug, Clone)]
pub struct RestoreHead {
    pub content_type: String,
    /// Filename for the content-disposition header.
    pub filename: String,
    /// Known full length — set for single-file ready archives.
    pub content_length: Option<u64>,
    /// Stable validator — set for single-file ready archives.
    pub etag: Option<String>,
    pub accept_ranges: bool,
}

/// A whole-archive or bundle-entry response body.
pub struct RestoreStream {
    pub head: RestoreHead,
    pub body: BoxStream<'static, Result<Bytes, RestoreError>>,
}

/// A satisfiable byte-range response (206).
pub struct RangeStream {
    pub head: RestoreHead,
    pub start: u64,
    pub end: u64,
    pub total: u64,
    pub body: BoxStream<'static, Result<Bytes, RestoreError>>,
}

/// Parsed Range header against a known payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable range — serve the whole payload.
    Whole,
    /// Closed byte range, both ends inclusive.
    Range { start: u64, end: u64 },
    /// Syntactically valid but outside the payload: 416.
    Unsatisfiable,
}

/// Parse a `bytes=start-end` header (suffix form `-N` = last N bytes).
/// Malformed headers fall back to `Whole`, per HTTP semantics; valid but
/// out-of-range requests are `Unsatisfiable`.
pub fn parse_range(header: &str, size: u64) -> RangeRequest {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeRequest::Whole;
    };
    // Multi-range requests are not served.
    if spec.contains(',') {
        return RangeRequest::Whole;
    }
    let Some((start_s, end_s)) = spec.split_once('-') else {
        return RangeRequest::Whole;
    };
    let start_s = start_s.trim();
    let end_s = end_s.trim();

    if start_s.is_empty() {
        // Suffix form: last N bytes.
        let Ok(n) = end_s.parse::<u64>() else {
            return RangeRequest::Whole;
        };
        if n == 0 || size == 0 {
            return RangeRequest::Unsatisfiable;
        }
        let n = n.min(size);
        return RangeRequest::Range {
            start: size - n,
            end: size - 1,
        };
    }

    let Ok(start) = start_s.parse::<u64>() else {
        return RangeRequest::Whole;
    };
    if start >= size {
        return RangeRequest::Unsatisfiable;
    }

    if end_s.is_empty() {
        return RangeRequest::Range {
            start,
            end: size - 1,
        };
    }
    let Ok(end) = end_s.parse::<u64>() else {
        return RangeRequest::Whole;
    };
    if end < start {
        return RangeRequest::Whole;
    }
    RangeRequest::Range {
        start,
        end: end.min(size - 1),
    }
}

/// Wrap an mpsc receiver as a stream.
fn receiver_stream(
    rx: tokio::sync::mpsc::Receiver<Result<Bytes, RestoreError>>,
) -> BoxStream<'static, Result<Bytes, RestoreError>> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

impl ArchiveService {
    /// Fetch an archive for a read, enforcing visibility and ownership.
    async fn fetch_readable(&self, user_id: &str, id: &str) -> Result<Archive, RestoreError> {
        let archive = self
            .store
            .get_archive(id)
            .await?
            .filter(|a| a.is_visible())
            .ok_or(RestoreError::NotFound)?;
        if archive.owner_id != user_id {
            return Err(RestoreError::Forbidden);
        }
        Ok(archive)
    }

    fn head_for(&self, archive: &Archive) -> RestoreHead {
        let content_type = if archive.is_bundle {
            "application/zip".to_string()
        } else {
            mime_guess::from_path(&archive.download_name)
                .first_or_octet_stream()
                .to_string()
        };
        let sized = !archive.is_bundle
            && archive.status == ArchiveStatus::Ready
            && archive.encryption_version == CURRENT_ENCRYPTION_VERSION;
        RestoreHead {
            content_type,
            filename: archive.download_name.clone(),
            content_length: sized.then_some(archive.original_size),
            etag: sized.then(|| archive.etag()),
            accept_ranges: true,
        }
    }

    // === Whole-archive stream ===

    pub async fn stream_whole(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<RestoreStream, RestoreError> {
        let archive = self.fetch_readable(user_id, id).await?;
        if archive.status != ArchiveStatus::Ready {
            return Err(RestoreError::NotReady);
        }

        let head = self.head_for(&archive);
        let registry = self.providers().await?;
        let parts = archive.deduped_parts();
        let service = self.clone();

        if !archive.is_bundle && !archive.files.is_empty() {
            let _ = self.store.inc_download_count(&archive.id, 0).await;
        }
        if let Some(m) = &self.metrics {
            m.restores_total.inc();
        }

        let (tx, rx) = tokio::sync::mpsc::channel(2);
        tokio::spawn(async move {
            if archive.encryption_version == 1 {
                service.send_legacy_whole(&registry, &archive, &parts, &tx).await;
                return;
            }
            for part in &parts {
                match service.fetch_and_decrypt(&registry, &archive, part).await {
                    Ok(plain) => {
                        // A closed receiver means the client went away; stop
                        // fetching further parts.
                        if tx.send(Ok(Bytes::from(plain))).await.is_err() {
                            debug!("client aborted restore of archive {}", archive.id);
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(
                            "restore of archive {} failed at part {}: {err}",
                            archive.id, part.index
                        );
                        if let Some(m) = &service.metrics {
                            m.restore_failures_total.inc();
                        }
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        });

        Ok(RestoreStream {
            head,
            body: receiver_stream(rx),
        })
    }

    /// v1 legacy: the ciphertext is one GCM message, so it must be gathered
    /// and decrypted in full before anything can be sent.
    async fn send_legacy_whole(
        &self,
        registry: &ProviderRegistry,
        archive: &Archive,
        parts: &[Part],
        tx: &tokio::sync::mpsc::Sender<Result<Bytes, RestoreError>>,
    ) {
        let result = async {
            let mut ciphertext = Vec::with_capacity(archive.encrypted_size as usize);
            for part in parts {
                let chunk = self.fetch_ciphertext(registry, archive, part).await?;
                ciphertext.extend_from_slice(&chunk);
            }
            let iv = archive.iv.as_deref().unwrap_or_default();
            let tag = archive.auth_tag.as_deref().unwrap_or_default();
            self.key
                .decrypt_legacy_whole(&ciphertext, iv, tag)
                .map_err(RestoreError::from)
        }
        .await;

        match result {
            Ok(plain) => {
                for chunk in plain.chunks(STREAM_CHUNK_BYTES) {
                    if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                warn!("legacy restore of archive {} failed: {err}", archive.id);
                let _ = tx.send(Err(err)).await;
            }
        }
    }

    // === Bundle entry stream ===

    /// Extract one file from a bundle by its stable index. The decrypted zip
    /// payload lands in request-scoped scratch, the matching entry is
    /// streamed out, and the scratch dir dies with the request.
    pub async fn stream_bundle_entry(
        &self,
        user_id: &str,
        id: &str,
        file_index: usize,
    ) -> Result<RestoreStream, RestoreError> {
        let archive = self.fetch_readable(user_id, id).await?;
        if archive.status != ArchiveStatus::Ready {
            return Err(RestoreError::NotReady);
        }
        if !archive.is_bundle {
            return Err(RestoreError::FileNotFound);
        }
        let entry = archive
            .files
            .get(file_index)
            .ok_or(RestoreError::FileNotFound)?
            .clone();
        let entry_name = entry.entry_name(file_index);

        let registry = self.providers().await?;
        let parts = archive.deduped_parts();

        // Decrypt the zip payload into scratch before touching response
        // state, so a missing entry can still 404 cleanly.
        let scratch = ScratchDir::create(
            &self.config.scratch_root(),
            &format!("{}-{}", archive.id, Uuid::new_v4()),
        )?;
        let zip_path = scratch.file("payload.zip");
        {
            let mut out = tokio::fs::File::create(&zip_path).await?;
            if archive.encryption_version == 1 {
                let mut ciphertext = Vec::new();
                for part in &parts {
                    ciphertext
                        .extend_from_slice(&self.fetch_ciphertext(&registry, &archive, part).await?);
                }
                let plain = self.key.decrypt_legacy_whole(
                    &ciphertext,
                    archive.iv.as_deref().unwrap_or_default(),
                    archive.auth_tag.as_deref().unwrap_or_default(),
                )?;
                tokio::io::AsyncWriteExt::write_all(&mut out, &plain).await?;
            } else {
                for part in &parts {
                    let plain = self.fetch_and_decrypt(&registry, &archive, part).await?;
                    tokio::io::AsyncWriteExt::write_all(&mut out, &plain).await?;
                }
            }
            tokio::io::AsyncWriteExt::flush(&mut out).await?;
        }

        let _ = self.store.inc_download_count(&archive.id, file_index).await;
        if let Some(m) = &self.metrics {
            m.restores_total.inc();
        }

        let content_type = mime_guess::from_path(&entry.original_name)
            .first_or_octet_stream()
            .to_string();
        let head = RestoreHead {
            content_type,
            filename: entry.original_name.clone(),
            content_length: None,
            etag: None,
            accept_ranges: false,
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, RestoreError>>(2);
        let archive_id = archive.id.clone();
        tokio::task::spawn_blocking(move || {
            // scratch moves in here; dropped (and removed) when extraction
            // ends, whether by completion or client abort.
            let _scratch = scratch;
            let result = (|| -> Result<(), RestoreError> {
                let file = std::fs::File::open(&zip_path)?;
                let mut zip = zip::ZipArchive::new(file)
                    .map_err(|e| RestoreError::Failed(format!("bundle payload unreadable: {e}")))?;
                let mut entry = match zip.by_name(&entry_name) {
                    Ok(entry) => entry,
                    Err(zip::result::ZipError::FileNotFound) => {
                        return Err(RestoreError::FileNotFound)
                    }
                    Err(e) => return Err(RestoreError::Failed(e.to_string())),
                };
                let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
                loop {
                    let n = entry.read(&mut buf)?;
                    if n == 0 {
                        return Ok(());
                    }
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        debug!("client aborted bundle entry restore of archive {archive_id}");
                        return Ok(());
                    }
                }
            })();
            if let Err(err) = result {
                let _ = tx.blocking_send(Err(err));
            }
        });

        Ok(RestoreStream {
            head,
            body: receiver_stream(rx),
        })
    }

    // === Byte-range stream ===

    /// Serve `bytes=start-end` of a single-file archive. Only version-2
    /// archives can be decrypted incrementally; bundles and v1 are refused.
    pub async fn stream_range(
        &self,
        user_id: &str,
        id: &str,
        range_header: &str,
    ) -> Result<RangeStream, RestoreError> {
        let archive = self.fetch_readable(user_id, id).await?;
        if archive.status != ArchiveStatus::Ready {
            return Err(RestoreError::NotReady);
        }
        if archive.is_bundle || archive.encryption_version != CURRENT_ENCRYPTION_VERSION {
            return Err(RestoreError::RangeNotSupported);
        }

        let size = archive.original_size;
        let (start, end) = match parse_range(range_header, size) {
            RangeRequest::Range { start, end } => (start, end),
            RangeRequest::Unsatisfiable => {
                return Err(RestoreError::RangeNotSatisfiable { size })
            }
            RangeRequest::Whole => {
                if size == 0 {
                    return Err(RestoreError::RangeNotSatisfiable { size });
                }
                (0, size - 1)
            }
        };

        let head = self.head_for(&archive);
        let registry = self.providers().await?;
        let parts = archive.deduped_parts();
        let service = self.clone();
        if let Some(m) = &self.metrics {
            m.restores_total.inc();
        }

        let (tx, rx) = tokio::sync::mpsc::channel(2);
        tokio::spawn(async move {
            let mut offset: u64 = 0;
            for part in &parts {
                let plain_len = part.plain_len();
                let part_start = offset;
                let part_end = offset + plain_len.saturating_sub(1);
                offset += plain_len;

                // Skip parts entirely outside the requested window.
                if part_end < start || part_start > end {
                    continue;
                }

                let plain = match service.fetch_and_decrypt(&registry, &archive, part).await {
                    Ok(plain) => plain,
                    Err(err) => {
                        warn!(
                            "range restore of archive {} failed at part {}: {err}",
                            archive.id, part.index
                        );
                        if let Some(m) = &service.metrics {
                            m.restore_failures_total.inc();
                        }
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };

                // Slice to the intersection of the part and the range.
                let lo = start.saturating_sub(part_start) as usize;
                let hi = ((end - part_start) as usize + 1).min(plain.len());
                if tx
                    .send(Ok(Bytes::copy_from_slice(&plain[lo..hi])))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        Ok(RangeStream {
            head,
            start,
            end,
            total: size,
            body: receiver_stream(rx),
        })
    }

    // === Part-level operations ===

    /// Parts metadata for the HTTP layer (deduplicated, index order).
    pub async fn parts_metadata(&self, user_id: &str, id: &str) -> Result<Vec<Part>, RestoreError> {
        let archive = self.fetch_readable(user_id, id).await?;
        Ok(archive.deduped_parts())
    }

    /// Refresh one part's primary URL on demand; persists and returns it.
    pub async fn refresh_part_url(
        &self,
        user_id: &str,
        id: &str,
        index: u32,
    ) -> Result<String, RestoreError> {
        let archive = self.fetch_readable(user_id, id).await?;
        let part = archive
            .deduped_parts()
            .into_iter()
            .find(|p| p.index == index)
            .ok_or(RestoreError::FileNotFound)?;

        let registry = self.providers().await?;
        let placement = part.primary_placement();
        let provider = registry
            .for_placement(&placement)
            .ok_or_else(|| RestoreError::Failed(ProviderError::NoProvider.to_string()))?;
        let url = provider.refresh_url(&placement).await?;
        self.store
            .update_part_url(id, index, PlacementSide::Primary, &url)
            .await?;
        Ok(url)
    }

    /// Relay one part's ciphertext verbatim (integrity-checked).
    pub async fn relay_part(
        &self,
        user_id: &str,
        id: &str,
        index: u32,
    ) -> Result<Bytes, RestoreError> {
        let archive = self.fetch_readable(user_id, id).await?;
        let part = archive
            .deduped_parts()
            .into_iter()
            .find(|p| p.index == index)
            .ok_or(RestoreError::FileNotFound)?;
        let registry = self.providers().await?;
        self.fetch_ciphertext(&registry, &archive, &part).await
    }

    // === Download plumbing with URL self-repair ===

    /// Fetch and decrypt one part.
    pub(crate) async fn fetch_and_decrypt(
        &self,
        registry: &ProviderRegistry,
        archive: &Archive,
        part: &Part,
    ) -> Result<Vec<u8>, RestoreError> {
        let ciphertext = self.fetch_ciphertext(registry, archive, part).await?;
        self.key
            .decrypt_part(part.index, &ciphertext, &part.iv, &part.auth_tag, &part.hash)
            .map_err(|e| {
                warn!(
                    "integrity failure on archive {} part {}: {e}",
                    archive.id, part.index
                );
                e.into()
            })
    }

    /// Fetch one part's ciphertext, hash-verified. Stale primary URLs are
    /// refreshed and retried once; if the primary stays broken, a verified
    /// mirror copy (itself self-repairing) serves the read. The primary
    /// record is left for the mirror synchronizer to heal.
    pub(crate) async fn fetch_ciphertext(
        &self,
        registry: &ProviderRegistry,
        archive: &Archive,
        part: &Part,
    ) -> Result<Bytes, RestoreError> {
        let verify = |bytes: Bytes| -> Result<Bytes, RestoreError> {
            if crate::crypto::sha256_hex(&bytes) != part.hash {
                return Err(CryptoError::PartHashMismatch(part.index).into());
            }
            Ok(bytes)
        };

        let primary = self
            .fetch_placement(registry, &archive.id, part, PlacementSide::Primary)
            .await;

        let err = match primary.and_then(verify) {
            Ok(bytes) => return Ok(bytes),
            Err(err) => err,
        };

        if part.mirror_placement().is_some() {
            warn!(
                "archive {} part {}: primary unreadable ({err}), trying mirror",
                archive.id, part.index
            );
            return self
                .fetch_placement(registry, &archive.id, part, PlacementSide::Mirror)
                .await
                .and_then(verify);
        }
        Err(err)
    }

    /// Download one placement of a part, with single-shot URL repair.
    async fn fetch_placement(
        &self,
        registry: &ProviderRegistry,
        archive_id: &str,
        part: &Part,
        side: PlacementSide,
    ) -> Result<Bytes, RestoreError> {
        let placement = match side {
            PlacementSide::Primary => part.primary_placement(),
            PlacementSide::Mirror => {
                part.mirror_placement().ok_or(RestoreError::FileNotFound)?
            }
        };

        match registry.download_placement(&placement, &placement.url).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_stale_url() => {
                debug!(
                    "archive {archive_id} part {} {side:?} URL stale, refreshing",
                    part.index
                );
                let provider = registry
                    .for_placement(&placement)
                    .ok_or_else(|| RestoreError::Failed(ProviderError::NoProvider.to_string()))?;
                let fresh = provider.refresh_url(&placement).await?;
                self.store
                    .update_part_url(archive_id, part.index, side, &fresh)
                    .await?;
                Ok(registry.download_placement(&placement, &fresh).await?)
            }
            Err(err) => Err(err.into()),
        }
    }
}
