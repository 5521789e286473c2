//! Archive engine: creation, upload pipeline, restore, deletion, mirroring.

pub mod mirror;
pub mod reaper;
pub mod restore;
pub mod scheduler;
pub mod staging;
pub mod upload;

use crate::config::Config;
use crate::crypto::MasterKey;
use crate::metrics::Metrics;
use crate::provider::{ProviderRegistry, RetryPolicy};
use crate::store::{MetaStore, StoreError};
use crate::types::{
    Archive, ArchiveStatus, FileEntry, CURRENT_ENCRYPTION_VERSION,
};
use chrono::Utc;
use staging::DiskPressure;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

/// Service-level errors for create and lifecycle operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("quota_exceeded")]
    QuotaExceeded,

    #[error("disk_full")]
    DiskFull,

    #[error("not_found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("not_ready")]
    NotReady,

    #[error("missing_file")]
    MissingFile,

    #[error("bad_index")]
    BadIndex,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::QuotaExceeded => ArchiveError::QuotaExceeded,
            StoreError::NotFound(_) => ArchiveError::NotFound,
            other => ArchiveError::Store(other),
        }
    }
}

/// One uploaded file handed to the batch create path: already spooled to
/// disk by the HTTP layer.
#[derive(Debug)]
pub struct NewFileInput {
    pub original_name: String,
    pub spooled_path: PathBuf,
    pub size: u64,
    /// Optional relative directory ("photos/2026") — sub-folders are
    /// auto-created under the target folder.
    pub relative_dir: Option<String>,
}

/// The archive engine. Cheap to clone — all heavy state is shared.
#[derive(Clone)]
pub struct ArchiveService {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn MetaStore>,
    pub(crate) key: MasterKey,
    pub(crate) metrics: Option<Arc<Metrics>>,
    pub(crate) retry: RetryPolicy,
    /// Fixed provider set instead of store-driven construction. Used by
    /// embedders and tests that bring their own adapters.
    provider_override: Option<Arc<ProviderRegistry>>,
}

impl ArchiveService {
    pub fn new(
        config: Config,
        store: Arc<dyn MetaStore>,
        key: MasterKey,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let retry = RetryPolicy::new(
            config.upload_retry_base_ms,
            config.upload_retry_max_ms,
            config.upload_retry_max,
        );
        Self {
            config,
            store,
            key,
            metrics,
            retry,
            provider_override: None,
        }
    }

    /// Pin the provider set (skips store-driven construction).
    pub fn with_provider_registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.provider_override = Some(registry);
        self
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The provider set for one pass. Rebuilt from the handle documents each
    /// time so handle changes take effect on the next query.
    pub(crate) async fn providers(&self) -> Result<Arc<ProviderRegistry>, StoreError> {
        if let Some(registry) = &self.provider_override {
            return Ok(registry.clone());
        }
        Ok(Arc::new(
            ProviderRegistry::from_store(&self.config, self.store.as_ref()).await?,
        ))
    }

    pub(crate) fn staging_dir_for(&self, archive_id: &str) -> PathBuf {
        self.config.staging_root().join(archive_id)
    }

    pub(crate) fn work_dir_for(&self, archive_id: &str) -> PathBuf {
        self.config.data_dir.join("work").join(archive_id)
    }

    // === Create: batch upload ===

    /// Group uploaded files into archives and queue them for upload.
    /// Returns the created archive ids.
    #[instrument(skip(self, inputs), fields(user = %user_id, files = inputs.len()))]
    pub async fn create_archives_from_files(
        &self,
        user_id: &str,
        folder_id: Option<String>,
        inputs: Vec<NewFileInput>,
    ) -> Result<Vec<String>, ArchiveError> {
        if inputs.is_empty() {
            return Err(ArchiveError::MissingFile);
        }
        if self.disk_pressure_now() == DiskPressure::Hard {
            return Err(ArchiveError::DiskFull);
        }

        let registry = self.providers().await.map_err(ArchiveError::from_store)?;
        let chunk_size = effective_chunk_size(self.config.chunk_size_bytes, &registry);

        // Resolve target folders first: files bound for different sub-folders
        // never share a bundle.
        let mut targets: Vec<Option<String>> = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let target = match &input.relative_dir {
                Some(rel) if !rel.is_empty() => {
                    let mut parent = folder_id.clone();
                    for component in rel.split('/').filter(|c| !c.is_empty() && *c != ".") {
                        let folder = self
                            .store
                            .ensure_folder(user_id, parent.clone(), component)
                            .await
                            .map_err(ArchiveError::from_store)?;
                        parent = Some(folder.id);
                    }
                    parent
                }
                _ => folder_id.clone(),
            };
            targets.push(target);
        }

        let groups = group_into_bundles(
            &inputs,
            &targets,
            self.config.bundle_single_file_bytes,
            self.config.bundle_max_bytes,
        );

        let mut archive_ids = Vec::with_capacity(groups.len());
        for group in groups {
            let id = self
                .create_one_archive(user_id, &inputs, &targets, &group, chunk_size)
                .await?;
            archive_ids.push(id);
        }

        info!(
            "queued {} archive(s) for user {}",
            archive_ids.len(),
            user_id
        );
        Ok(archive_ids)
    }

    /// Materialize one archive document plus its staging tree from a group
    /// of input indices.
    async fn create_one_archive(
        &self,
        user_id: &str,
        inputs: &[NewFileInput],
        targets: &[Option<String>],
        group: &[usize],
        chunk_size: u64,
    ) -> Result<String, ArchiveError> {
        let id = Uuid::new_v4().to_string();
        let staging_dir = self.staging_dir_for(&id);
        tokio::fs::create_dir_all(&staging_dir).await?;

        let mut files = Vec::with_capacity(group.len());
        let mut total: u64 = 0;
        for (slot, &input_idx) in group.iter().enumerate() {
            let input = &inputs[input_idx];
            let staged_name = format!("f{slot}");
            let dest = staging_dir.join(&staged_name);
            // Same filesystem in the normal layout; fall back to copy across
            // mounts.
            if tokio::fs::rename(&input.spooled_path, &dest).await.is_err() {
                tokio::fs::copy(&input.spooled_path, &dest).await?;
                let _ = tokio::fs::remove_file(&input.spooled_path).await;
            }
            total += input.size;
            files.push(FileEntry {
                path: PathBuf::from(staged_name),
                name: input.original_name.clone(),
                original_name: input.original_name.clone(),
                size: input.size,
                deleted_at: None,
                kind: None,
                download_count: 0,
                preview_count: 0,
                thumbnail: None,
            });
        }

        let is_bundle = files.len() > 1;
        let first_name = files[0].original_name.clone();
        let short = &id[..8];
        let download_name = if is_bundle {
            format!("bundle-{short}.zip")
        } else {
            first_name.clone()
        };
        let display_name = if is_bundle {
            format!("{} (+{} files)", first_name, files.len() - 1)
        } else {
            first_name
        };

        let now = Utc::now();
        let archive = Archive {
            id: id.clone(),
            owner_id: user_id.to_string(),
            folder_id: targets[group[0]].clone(),
            name: format!("{id}.bin"),
            display_name,
            download_name,
            is_bundle,
            files,
            status: ArchiveStatus::Queued,
            trashed_at: None,
            deleted_at: None,
            delete_requested_at: None,
            deleting: false,
            retry_count: 0,
            error: None,
            original_size: total,
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

        // Quota is charged up front on the batch path; the reaper refunds it.
        self.store
            .reserve_quota(user_id, total)
            .await
            .map_err(ArchiveError::from_store)?;
        if let Err(e) = self.store.insert_archive(archive).await {
            let _ = self.store.release_quota(user_id, total).await;
            let _ = tokio::fs::remove_dir_all(&staging_dir).await;
            return Err(ArchiveError::from_store(e));
        }

        Ok(id)
    }

    // === Lifecycle operations ===

    /// Fetch an archive, enforcing ownership. Reaped archives are invisible.
    pub async fn get_owned(&self, user_id: &str, id: &str) -> Result<Archive, ArchiveError> {
        let archive = self
            .store
            .get_archive(id)
            .await
            .map_err(ArchiveError::from_store)?
            .filter(|a| a.is_visible())
            .ok_or(ArchiveError::NotFound)?;
        if archive.owner_id != user_id {
            return Err(ArchiveError::Forbidden);
        }
        Ok(archive)
    }

    pub async fn list(&self, user_id: &str, trash: bool) -> Result<Vec<Archive>, ArchiveError> {
        self.store
            .list_archives(user_id, trash)
            .await
            .map_err(ArchiveError::from_store)
    }

    pub async fn trash(&self, user_id: &str, id: &str) -> Result<(), ArchiveError> {
        self.get_owned(user_id, id).await?;
        self.store
            .trash_archive(id)
            .await
            .map_err(ArchiveError::from_store)
    }

    pub async fn restore_from_trash(&self, user_id: &str, id: &str) -> Result<(), ArchiveError> {
        self.get_owned(user_id, id).await?;
        self.store
            .restore_from_trash(id)
            .await
            .map_err(ArchiveError::from_store)
    }

    /// Request hard deletion. The reaper picks it up on a later tick.
    pub async fn purge(&self, user_id: &str, id: &str) -> Result<(), ArchiveError> {
        self.get_owned(user_id, id).await?;
        self.store
            .request_purge(id)
            .await
            .map_err(ArchiveError::from_store)
    }

    pub async fn move_to_folder(
        &self,
        user_id: &str,
        id: &str,
        folder_id: Option<String>,
    ) -> Result<(), ArchiveError> {
        self.get_owned(user_id, id).await?;
        self.store
            .move_archive(id, folder_id)
            .await
            .map_err(ArchiveError::from_store)
    }

    pub async fn rename(&self, user_id: &str, id: &str, name: &str) -> Result<(), ArchiveError> {
        self.get_owned(user_id, id).await?;
        self.store
            .rename_archive(id, name)
            .await
            .map_err(ArchiveError::from_store)
    }

    /// Rename one bundle entry by its stable file index.
    pub async fn rename_entry(
        &self,
        user_id: &str,
        id: &str,
        file_index: usize,
        name: &str,
    ) -> Result<(), ArchiveError> {
        let archive = self.get_owned(user_id, id).await?;
        if file_index >= archive.files.len() {
            return Err(ArchiveError::BadIndex);
        }
        self.store
            .rename_file_entry(id, file_index, name)
            .await
            .map_err(ArchiveError::from_store)
    }

    pub async fn set_priority(
        &self,
        user_id: &str,
        id: &str,
        priority: u8,
        pin_override: bool,
    ) -> Result<(), ArchiveError> {
        self.get_owned(user_id, id).await?;
        self.store
            .set_priority(id, priority, pin_override)
            .await
            .map_err(ArchiveError::from_store)
    }
}

/// Effective chunk size: the configured size clamped by the strictest
/// configured provider attachment ceiling.
pub(crate) fn effective_chunk_size(configured: u64, registry: &ProviderRegistry) -> u64 {
    if registry.has_any() {
        configured.min(registry.min_part_limit()).max(1)
    } else {
        configured.max(1)
    }
}

/// Bundle grouping: any single file at or above `single_threshold` becomes
/// its own archive; the rest pack greedily per target folder with a
/// per-bundle byte ceiling. Returns groups of indices into `inputs`.
pub(crate) fn group_into_bundles(
    inputs: &[NewFileInput],
    targets: &[Option<String>],
    single_threshold: u64,
    bundle_max: u64,
) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    // (target folder key, current group, current size)
    let mut open: Vec<(Option<String>, Vec<usize>, u64)> = Vec::new();

    for (idx, input) in inputs.iter().enumerate() {
        if input.size >= single_threshold {
            groups.push(vec![idx]);
            continue;
        }

        let target = &targets[idx];
        match open.iter_mut().find(|(t, _, size)| {
            t == target && size.saturating_add(input.size) <= bundle_max
        }) {
            Some((_, group, size)) => {
                group.push(idx);
                *size += input.size;
            }
            None => open.push((target.clone(), vec![idx], input.size)),
        }
    }

    groups.extend(open.into_iter().map(|(_, group, _)| group));
    groups
}
