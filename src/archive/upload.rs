//! Upload worker: lease a queued archive, stage its payload, chunk, encrypt,
//! push parts to the providers, commit, finalize.
//!
//! The producer reads the staging payload sequentially and feeds a bounded
//! queue; a fixed pool of part uploaders drains it. Every committed part is a
//! single atomic append on the archive document, so a crash mid-upload leaves
//! a resumable record — the next pass skips indices that already committed.

use super::staging::{build_bundle_zip, DiskPressure};
use super::{effective_chunk_size, ArchiveError, ArchiveService};
use crate::crypto::{CryptoError, EncryptedPart};
use crate::provider::{BlobProvider, ProviderError, ProviderRegistry, UploadedBlob};
use crate::store::StoreError;
use crate::types::{Archive, ArchiveStatus, FileEntry, Part, ProviderKind, CURRENT_ENCRYPTION_VERSION};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors raised by the upload pipeline.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Staging payload is gone (lost cache dir, manual cleanup).
    #[error("missing_file")]
    MissingStaging,

    #[error("quota_exceeded")]
    QuotaExceeded,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Transient failures send the archive back to the queue; the rest are
    /// terminal for this archive.
    pub fn is_transient(&self) -> bool {
        match self {
            UploadError::Provider(p) => p.is_transient(),
            // A flaky document store should not poison archives.
            UploadError::Store(_) => true,
            _ => false,
        }
    }
}

/// One encrypted chunk waiting for an upload slot.
struct PendingPart {
    index: u32,
    plain_size: u64,
    enc: EncryptedPart,
}

impl ArchiveService {
    /// One worker unit: disk gate, lease, process, classify failure.
    /// Returns true when an archive was leased (work happened).
    pub async fn process_next_upload(&self) -> Result<bool, StoreError> {
        let pressure = self.disk_pressure_now();
        if pressure == DiskPressure::Hard {
            warn!("disk pressure hard: not leasing upload work");
            return Ok(false);
        }

        let Some(archive) = self.store.lease_next_queued().await? else {
            return Ok(false);
        };

        self.process_leased(archive).await;

        if pressure == DiskPressure::Soft {
            // Let pressure relax before the next lease.
            tokio::time::sleep(Duration::from_millis(self.config.worker_poll_ms)).await;
        }
        Ok(true)
    }

    /// Run the pipeline for a leased archive and record the outcome on the
    /// archive row.
    pub async fn process_leased(&self, archive: Archive) {
        let id = archive.id.clone();
        match self.run_upload(&archive).await {
            Ok(total_parts) => {
                info!(
                    "archive {id} ready ({total_parts} parts, {} bytes plain)",
                    archive.original_size
                );
                if let Some(m) = &self.metrics {
                    m.archives_uploaded_total.inc();
                }
            }
            Err(err) => {
                if let Some(m) = &self.metrics {
                    m.upload_failures_total.inc();
                }
                let transient = err.is_transient();
                if transient && archive.retry_count < self.config.upload_retry_max {
                    warn!(
                        "archive {id} upload failed (attempt {}), requeueing: {err}",
                        archive.retry_count + 1
                    );
                    if let Err(e) = self.store.requeue_for_retry(&id, &err.to_string()).await {
                        warn!("failed to requeue archive {id}: {e}");
                    }
                } else {
                    warn!("archive {id} upload failed terminally: {err}");
                    if let Err(e) = self.store.mark_error(&id, &err.to_string()).await {
                        warn!("failed to mark archive {id} errored: {e}");
                    }
                }
            }
        }
    }

    /// The full upload pipeline for one archive. Returns the part count.
    #[instrument(skip(self, archive), fields(archive = %archive.id))]
    async fn run_upload(&self, archive: &Archive) -> Result<u32, UploadError> {
        let registry = self.providers().await?;
        if !registry.has_any() {
            return Err(ProviderError::NoProvider.into());
        }

        let payload = self.ensure_staging_payload(archive).await?;

        // Chunk geometry is fixed once the first part commits; only a
        // part-less archive may renegotiate it against provider limits.
        let chunk_size = if archive.parts.is_empty() {
            let effective = effective_chunk_size(archive.chunk_size_bytes, &registry);
            if effective != archive.chunk_size_bytes {
                self.store.set_chunk_size(&archive.id, effective).await?;
            }
            effective
        } else {
            archive.chunk_size_bytes
        };

        let total_parts = self
            .run_part_pipeline(archive, &payload, chunk_size, registry)
            .await?;

        // Invariant: ready only after every produced chunk is committed.
        let latest = self
            .store
            .get_archive(&archive.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(archive.id.clone()))?;
        let parts = latest.deduped_parts();
        if parts.len() as u32 != total_parts {
            return Err(UploadError::Store(StoreError::Other(format!(
                "archive {}: {} of {} parts committed",
                archive.id,
                parts.len(),
                total_parts
            ))));
        }
        let encrypted_size: u64 = parts.iter().map(|p| p.size).sum();

        self.store
            .finalize_upload(&archive.id, encrypted_size, total_parts)
            .await?;

        if self.config.cache_delete_after_upload {
            if let Some(dir) = &latest.staging_dir {
                let _ = tokio::fs::remove_dir_all(dir).await;
            }
            let _ = tokio::fs::remove_dir_all(self.work_dir_for(&archive.id)).await;
        }

        Ok(total_parts)
    }

    /// Locate (or assemble) the plaintext payload to chunk: the staging file
    /// itself for single-file archives, a zip in the work dir for bundles.
    /// An existing zip is reused on restart.
    async fn ensure_staging_payload(&self, archive: &Archive) -> Result<PathBuf, UploadError> {
        let staging_dir = archive
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.staging_dir_for(&archive.id));

        if !archive.is_bundle {
            let entry = archive.files.first().ok_or(UploadError::MissingStaging)?;
            let path = staging_dir.join(&entry.path);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(UploadError::MissingStaging);
            }
            return Ok(path);
        }

        let zip_path = self.work_dir_for(&archive.id).join("bundle.zip");
        let zip_size = if tokio::fs::try_exists(&zip_path).await.unwrap_or(false) {
            debug!("reusing staged bundle zip for archive {}", archive.id);
            tokio::fs::metadata(&zip_path).await?.len()
        } else {
            if !tokio::fs::try_exists(&staging_dir).await.unwrap_or(false) {
                return Err(UploadError::MissingStaging);
            }
            let files = archive.files.clone();
            let staging = staging_dir.clone();
            let target = zip_path.clone();
            tokio::task::spawn_blocking(move || build_bundle_zip(&staging, &files, &target))
                .await
                .map_err(|e| UploadError::Io(std::io::Error::other(e)))??
        };

        // The zip payload carries container overhead on top of the member
        // bytes charged at creation; settle the difference so the eventual
        // refund matches what was reserved.
        if zip_size != archive.original_size {
            if zip_size > archive.original_size {
                self.store
                    .reserve_quota(&archive.owner_id, zip_size - archive.original_size)
                    .await
                    .map_err(|e| match e {
                        StoreError::QuotaExceeded => UploadError::QuotaExceeded,
                        other => UploadError::Store(other),
                    })?;
            } else {
                self.store
                    .release_quota(&archive.owner_id, archive.original_size - zip_size)
                    .await?;
            }
            self.store.set_original_size(&archive.id, zip_size).await?;
        }

        Ok(zip_path)
    }

    /// Producer/consumer part pipeline. Returns the number of chunks the
    /// payload divides into (committed skips included).
    async fn run_part_pipeline(
        &self,
        archive: &Archive,
        payload: &Path,
        chunk_size: u64,
        registry: Arc<ProviderRegistry>,
    ) -> Result<u32, UploadError> {
        let committed = archive.committed_indices();
        let concurrency = self
            .config
            .upload_parts_concurrency
            .min(registry.upload_slots())
            .max(1);
        let capacity = std::cmp::max(10, concurrency * 3);

        let (tx, rx) = tokio::sync::mpsc::channel::<PendingPart>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let failure: Arc<Mutex<Option<UploadError>>> = Arc::new(Mutex::new(None));

        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            let rx = rx.clone();
            let failure = failure.clone();
            let registry = registry.clone();
            let service = self.clone();
            let archive_id = archive.id.clone();
            workers.spawn(async move {
                loop {
                    let pending = { rx.lock().await.recv().await };
                    let Some(pending) = pending else { break };
                    // After a failure the pool keeps draining so the producer
                    // never blocks on a full queue.
                    if failure.lock().is_some() {
                        continue;
                    }
                    let index = pending.index;
                    match service
                        .upload_one_part(&registry, &archive_id, pending)
                        .await
                    {
                        Ok(part) => {
                            if let Some(m) = &service.metrics {
                                m.parts_uploaded_total.inc();
                                m.part_upload_bytes_total.inc_by(part.size);
                            }
                            if let Err(e) = service.store.append_part(&archive_id, part).await {
                                warn!("archive {archive_id}: part {index} commit failed: {e}");
                                failure.lock().get_or_insert(UploadError::Store(e));
                            }
                        }
                        Err(e) => {
                            warn!("archive {archive_id}: part {index} upload failed: {e}");
                            failure.lock().get_or_insert(e);
                        }
                    }
                }
            });
        }

        // Producer: sequential read of the payload, encrypting per chunk.
        // Channel capacity is the backpressure bound.
        let produce = async {
            let mut file = tokio::fs::File::open(payload)
                .await
                .map_err(|_| UploadError::MissingStaging)?;
            let mut buf = vec![0u8; chunk_size as usize];
            let mut index: u32 = 0;

            loop {
                if failure.lock().is_some() {
                    break;
                }

                let mut filled = 0;
                while filled < buf.len() {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    break;
                }

                if committed.contains(&index) {
                    debug!("archive {}: skipping committed part {index}", archive.id);
                } else {
                    let enc = self.key.encrypt_part(index, &buf[..filled])?;
                    let pending = PendingPart {
                        index,
                        plain_size: filled as u64,
                        enc,
                    };
                    if tx.send(pending).await.is_err() {
                        break;
                    }
                }

                index += 1;
                if filled < buf.len() {
                    break; // EOF inside this chunk
                }
            }
            Ok::<u32, UploadError>(index)
        };

        let produced = produce.await;
        drop(tx);
        while workers.join_next().await.is_some() {}

        if let Some(err) = failure.lock().take() {
            return Err(err);
        }
        produced
    }

    /// Upload one encrypted chunk, replicated across both families when both
    /// are configured. Either side may land first; whichever succeeded
    /// becomes the primary and the failed side stays pending for the mirror
    /// synchronizer.
    async fn upload_one_part(
        &self,
        registry: &ProviderRegistry,
        archive_id: &str,
        pending: PendingPart,
    ) -> Result<Part, UploadError> {
        let index = pending.index;
        let primary = registry.primary_for_index(index)?;
        let mirror = registry.mirror_for(primary.kind(), index);

        let filename = format!("{}_{:05}.bin", &archive_id[..8.min(archive_id.len())], index);
        let note = format!("{archive_id}:{index}");
        let data = Bytes::from(pending.enc.ciphertext);
        let size = data.len() as u64;

        let primary_label = format!("{archive_id} part {index} ({})", primary.kind());
        let primary_fut = self.retry.run(&primary_label, |_| {
            let data = data.clone();
            let provider = primary.clone();
            let filename = filename.clone();
            let note = note.clone();
            async move { provider.upload(data, &filename, &note).await }
        });

        let (primary_kind, primary_result, mirror_side) = match mirror {
            Some(mirror_provider) => {
                let mirror_label = format!("{archive_id} part {index} ({})", mirror_provider.kind());
                let mirror_fut = self.retry.run(&mirror_label, |_| {
                    let data = data.clone();
                    let provider = mirror_provider.clone();
                    let filename = filename.clone();
                    let note = note.clone();
                    async move { provider.upload(data, &filename, &note).await }
                });
                let (p, m) = tokio::join!(primary_fut, mirror_fut);
                (
                    primary.kind(),
                    p,
                    Some((mirror_provider.kind(), m)),
                )
            }
            None => (primary.kind(), primary_fut.await, None),
        };

        let mut part = Part {
            index,
            size,
            plain_size: Some(pending.plain_size),
            hash: pending.enc.hash,
            iv: pending.enc.iv,
            auth_tag: pending.enc.auth_tag,
            provider: primary_kind,
            url: String::new(),
            message_id: String::new(),
            webhook_id: None,
            file_id: None,
            mirror_provider: None,
            mirror_url: String::new(),
            mirror_message_id: String::new(),
            mirror_webhook_id: None,
            mirror_file_id: None,
            mirror_pending: false,
            mirror_error: None,
        };

        match (primary_result, mirror_side) {
            (Ok(p), mirror_side) => {
                apply_primary(&mut part, primary_kind, p);
                match mirror_side {
                    Some((mirror_kind, Ok(m))) => apply_mirror(&mut part, mirror_kind, m),
                    Some((mirror_kind, Err(e))) => {
                        part.mirror_provider = Some(mirror_kind);
                        part.mirror_pending = true;
                        part.mirror_error = Some(e.to_string());
                    }
                    None => {}
                }
                Ok(part)
            }
            // Designated primary lost, replica won: promote the replica and
            // leave the failed family pending for the synchronizer.
            (Err(primary_err), Some((mirror_kind, Ok(m)))) => {
                apply_primary(&mut part, mirror_kind, m);
                part.mirror_provider = Some(primary_kind);
                part.mirror_pending = true;
                part.mirror_error = Some(primary_err.to_string());
                Ok(part)
            }
            (Err(primary_err), _) => Err(primary_err.into()),
        }
    }

    // === Streaming create ===

    /// Create an archive from an inbound stream. The document exists in
    /// `processing` from the moment the stream starts; the upload pipeline
    /// runs as soon as the payload is spooled, and finalization flips the
    /// archive to `ready` once the pools drain.
    ///
    /// An abort before any part commits removes the document and its staging
    /// bytes; after parts committed, the archive stays `processing` for the
    /// stale reaper to retry.
    pub async fn create_archive_streaming<R>(
        &self,
        user_id: &str,
        folder_id: Option<String>,
        filename: &str,
        reader: &mut R,
    ) -> Result<String, ArchiveError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.disk_pressure_now() == DiskPressure::Hard {
            return Err(ArchiveError::DiskFull);
        }

        let registry = self.providers().await.map_err(ArchiveError::Store)?;
        let chunk_size = effective_chunk_size(self.config.chunk_size_bytes, &registry);

        let id = Uuid::new_v4().to_string();
        let staging_dir = self.staging_dir_for(&id);
        tokio::fs::create_dir_all(&staging_dir).await?;

        let now = Utc::now();
        let archive = Archive {
            id: id.clone(),
            owner_id: user_id.to_string(),
            folder_id,
            name: format!("{id}.bin"),
            display_name: filename.to_string(),
            download_name: filename.to_string(),
            is_bundle: false,
            files: vec![FileEntry {
                path: PathBuf::from("f0"),
                name: filename.to_string(),
                original_name: filename.to_string(),
                size: 0,
                deleted_at: None,
                kind: None,
                download_count: 0,
                preview_count: 0,
                thumbnail: None,
            }],
            status: ArchiveStatus::Processing,
            trashed_at: None,
            deleted_at: None,
            delete_requested_at: None,
            deleting: false,
            retry_count: 0,
            error: None,
            original_size: 0,
            encrypted_size: 0,
            uploaded_bytes: 0,
            uploaded_parts: 0,
            total_parts: 0,
            delete_total_parts: 0,
            deleted_parts: 0,
            encryption_version: CURRENT_ENCRYPTION_VERSION,
            iv: None,
            auth_tag: None,
            chunk_size_bytes: chunk_size,
            staging_dir: Some(staging_dir.clone()),
            parts: Vec::new(),
            priority: 0,
            priority_override: false,
            created_at: now,
            updated_at: now,
        };
        self.store
            .insert_archive(archive)
            .await
            .map_err(ArchiveError::Store)?;

        // Spool the stream. No parts exist yet, so any failure here cleans
        // up completely.
        let spool = async {
            let mut out = tokio::fs::File::create(staging_dir.join("f0")).await?;
            let copied = tokio::io::copy(reader, &mut out).await?;
            tokio::io::AsyncWriteExt::flush(&mut out).await?;
            Ok::<u64, std::io::Error>(copied)
        };
        let size = match spool.await {
            Ok(size) => size,
            Err(e) => {
                let _ = self.store.remove_archive(&id).await;
                let _ = tokio::fs::remove_dir_all(&staging_dir).await;
                return Err(ArchiveError::Io(e));
            }
        };

        // Quota is charged on stream completion for this path.
        if let Err(e) = self.store.reserve_quota(user_id, size).await {
            let _ = self.store.remove_archive(&id).await;
            let _ = tokio::fs::remove_dir_all(&staging_dir).await;
            return Err(ArchiveError::from_store(e));
        }
        self.store
            .set_original_size(&id, size)
            .await
            .map_err(ArchiveError::Store)?;

        // Run the pipeline in the background; the caller gets the id now and
        // watches status on the archive row.
        let service = self.clone();
        let archive = self
            .store
            .get_archive(&id)
            .await
            .map_err(ArchiveError::Store)?
            .ok_or(ArchiveError::NotFound)?;
        tokio::spawn(async move {
            service.process_leased(archive).await;
        });

        Ok(id)
    }

    pub(crate) fn disk_pressure_now(&self) -> DiskPressure {
        let root = self.config.staging_root();
        let probe = if root.exists() {
            root
        } else {
            self.config.data_dir.clone()
        };
        super::staging::disk_pressure(
            &probe,
            self.config.disk_soft_limit_gb,
            self.config.disk_hard_limit_gb,
        )
    }
}

fn apply_primary(part: &mut Part, kind: ProviderKind, blob: UploadedBlob) {
    part.provider = kind;
    part.url = blob.url;
    part.message_id = blob.message_id;
    part.webhook_id = blob.webhook_id;
    part.file_id = blob.file_id;
}

fn apply_mirror(part: &mut Part, kind: ProviderKind, blob: UploadedBlob) {
    part.mirror_provider = Some(kind);
    part.mirror_url = blob.url;
    part.mirror_message_id = blob.message_id;
    part.mirror_webhook_id = blob.webhook_id;
    part.mirror_file_id = blob.file_id;
    part.mirror_pending = false;
    part.mirror_error = None;
}
