//! Document store trait definitions.
//!
//! The metadata database is a collaborator, not part of this crate's core:
//! anything that offers atomic single-document updates and indexed queries
//! can sit behind `MetaStore`. Every method that mutates is a single-document
//! atomic operation — the find-and-modify claims (`lease_next_queued`,
//! `claim_next_deletion`, `claim_mirror_part`) are the cross-process
//! serialization points; in-process flags are only soft duplicates of them.

use crate::types::{
    Archive, Folder, Part, PlacementSide, ProviderHandle, ProviderKind, User,
};
use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    #[error("quota_exceeded")]
    QuotaExceeded,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Other(String),
}

/// Mirror placement fields persisted after a successful mirror upload.
#[derive(Debug, Clone)]
pub struct MirrorPlacementUpdate {
    pub provider: ProviderKind,
    pub url: String,
    pub message_id: String,
    pub webhook_id: Option<String>,
    pub file_id: Option<String>,
}

/// Abstract document store over the `archives`, `users`, `folders`,
/// `webhooks` and `settings` collections.
#[async_trait]
pub trait MetaStore: Send + Sync {
    // === Archive documents ===

    async fn insert_archive(&self, archive: Archive) -> Result<(), StoreError>;

    async fn get_archive(&self, id: &str) -> Result<Option<Archive>, StoreError>;

    /// Archives visible to a user (never includes reaped ones). `trash`
    /// selects the trash view instead of the normal listing.
    async fn list_archives(&self, owner_id: &str, trash: bool) -> Result<Vec<Archive>, StoreError>;

    async fn count_queued(&self) -> Result<u64, StoreError>;

    /// Atomically lease the best queued archive: highest priority first,
    /// oldest `created_at` breaking ties. Sets `processing` and clears the
    /// error field. Returns the leased document.
    async fn lease_next_queued(&self) -> Result<Option<Archive>, StoreError>;

    /// Return a failed archive to the queue with an incremented retry count.
    async fn requeue_for_retry(&self, id: &str, error: &str) -> Result<(), StoreError>;

    /// Terminal upload failure.
    async fn mark_error(&self, id: &str, error: &str) -> Result<(), StoreError>;

    /// Reset `processing` archives whose `updated_at` is older than
    /// `older_than_minutes` back to `queued`; zero the progress counters when
    /// no parts were committed. Returns how many were reset.
    async fn reset_stale_processing(&self, older_than_minutes: i64) -> Result<usize, StoreError>;

    /// Startup recovery: unconditionally reset every `processing` archive.
    async fn reset_all_processing(&self) -> Result<usize, StoreError>;

    /// Append a part record and bump the progress counters. Counters are
    /// recomputed from the deduplicated part set, so a duplicate index
    /// (retry race) cannot inflate them.
    async fn append_part(&self, id: &str, part: Part) -> Result<(), StoreError>;

    /// Persist a refreshed download URL on one side of a part.
    async fn update_part_url(
        &self,
        id: &str,
        index: u32,
        side: PlacementSide,
        url: &str,
    ) -> Result<(), StoreError>;

    /// Flip the archive to `ready` with its final totals; clears legacy
    /// archive-level crypto fields and stamps encryption version 2.
    async fn finalize_upload(
        &self,
        id: &str,
        encrypted_size: u64,
        total_parts: u32,
    ) -> Result<(), StoreError>;

    /// Correct the plaintext payload size once the staged payload is known
    /// (bundle zips are assembled by the worker, after creation).
    async fn set_original_size(&self, id: &str, size: u64) -> Result<(), StoreError>;

    /// Persist the effective chunk size before the first part is produced.
    async fn set_chunk_size(&self, id: &str, size: u64) -> Result<(), StoreError>;

    /// Remove an archive document outright. Only used for aborted creations
    /// that never committed a part; reaped archives are tombstoned instead.
    async fn remove_archive(&self, id: &str) -> Result<(), StoreError>;

    // === Mirror maintenance ===

    /// One ready archive that still has parts without a mirror assignment.
    async fn next_mirror_prepare_candidate(&self) -> Result<Option<Archive>, StoreError>;

    /// One ready archive with at least one `mirror_pending` part whose
    /// assigned provider family is in `available`.
    async fn next_mirror_sync_candidate(
        &self,
        available: &[ProviderKind],
    ) -> Result<Option<Archive>, StoreError>;

    /// Prepare phase: record the mirror assignment for one part.
    async fn assign_part_mirror_provider(
        &self,
        id: &str,
        index: u32,
        provider: ProviderKind,
    ) -> Result<(), StoreError>;

    /// Claim one pending mirror part, guarded by the current assignment, so
    /// parallel workers never copy the same part twice. Returns false if the
    /// part was already claimed or reassigned.
    async fn claim_mirror_part(
        &self,
        id: &str,
        index: u32,
        provider: ProviderKind,
    ) -> Result<bool, StoreError>;

    /// Persist a completed mirror placement on a part.
    async fn set_part_mirror_placement(
        &self,
        id: &str,
        index: u32,
        placement: MirrorPlacementUpdate,
    ) -> Result<(), StoreError>;

    /// Re-flag a part for mirror retry (or record a permanent error).
    async fn set_part_mirror_pending(
        &self,
        id: &str,
        index: u32,
        pending: bool,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    // === Lifecycle ===

    async fn trash_archive(&self, id: &str) -> Result<(), StoreError>;

    async fn restore_from_trash(&self, id: &str) -> Result<(), StoreError>;

    /// User-initiated hard delete request; the reaper executes it.
    async fn request_purge(&self, id: &str) -> Result<(), StoreError>;

    async fn move_archive(&self, id: &str, folder_id: Option<String>) -> Result<(), StoreError>;

    async fn rename_archive(&self, id: &str, download_name: &str) -> Result<(), StoreError>;

    /// Bump the download counter on one file entry.
    async fn inc_download_count(&self, id: &str, file_index: usize) -> Result<(), StoreError>;

    /// Rename one entry of a bundle by its stable file index.
    async fn rename_file_entry(
        &self,
        id: &str,
        file_index: usize,
        new_name: &str,
    ) -> Result<(), StoreError>;

    async fn set_priority(
        &self,
        id: &str,
        priority: u8,
        pin_override: bool,
    ) -> Result<(), StoreError>;

    // === Deletion reaper ===

    /// Atomically claim one archive due for hard deletion: purge-requested,
    /// or trashed longer than `retention_days`. Oldest request first, oldest
    /// trash timestamp breaking ties. Sets the `deleting` flag.
    async fn claim_next_deletion(&self, retention_days: i64) -> Result<Option<Archive>, StoreError>;

    /// Fix the deletion denominator before remote deletes start.
    async fn begin_deletion(&self, id: &str, total_parts: u32) -> Result<(), StoreError>;

    async fn inc_deleted_parts(&self, id: &str) -> Result<(), StoreError>;

    /// Tombstone: set `deleted_at`, strip the part vector, clear `deleting`.
    async fn complete_deletion(&self, id: &str) -> Result<(), StoreError>;

    // === Users ===

    async fn insert_user(&self, user: User) -> Result<(), StoreError>;

    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Atomically add `bytes` to `used_bytes`, rejecting with
    /// `QuotaExceeded` when a non-zero quota would be exceeded.
    async fn reserve_quota(&self, user_id: &str, bytes: u64) -> Result<(), StoreError>;

    /// Refund quota on deletion (saturating).
    async fn release_quota(&self, user_id: &str, bytes: u64) -> Result<(), StoreError>;

    // === Folders ===

    async fn insert_folder(&self, folder: Folder) -> Result<(), StoreError>;

    /// Get-or-create a folder by (owner, parent, name).
    async fn ensure_folder(
        &self,
        owner_id: &str,
        parent_id: Option<String>,
        name: &str,
    ) -> Result<Folder, StoreError>;

    // === Provider handles ===

    async fn list_webhooks(&self) -> Result<Vec<ProviderHandle>, StoreError>;

    async fn upsert_webhook(&self, handle: ProviderHandle) -> Result<(), StoreError>;

    // === Settings ===

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}
