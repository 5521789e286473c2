//! Core types for Offload Server: archives, parts, users, provider handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Tool version identifier — uses crate name and version from Cargo.toml
pub const OFFLOAD_TOOL: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Encryption format produced by the upload worker. Version 1 (one IV/tag for
/// the whole ciphertext) is read-only legacy.
pub const CURRENT_ENCRYPTION_VERSION: u32 = 2;

/// Days an archive may sit in trash before the reaper hard-deletes it.
pub const TRASH_RETENTION_DAYS: i64 = 30;

/// Stable error codes surfaced at the API boundary.
/// These are wire contract — renaming one breaks clients.
pub mod error_codes {
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const DISK_FULL: &str = "disk_full";
    pub const NOT_READY: &str = "not_ready";
    pub const NOT_FOUND: &str = "not_found";
    pub const FILE_NOT_FOUND: &str = "file_not_found";
    pub const FORBIDDEN: &str = "forbidden";
    pub const RANGE_NOT_SUPPORTED: &str = "range_not_supported";
    pub const RESTORE_FAILED: &str = "restore_failed";
    pub const BAD_INDEX: &str = "bad_index";
    pub const MISSING_FILE: &str = "missing_file";
    pub const NO_PROVIDER: &str = "no_storage_provider_configured";
}

/// Archive lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Queued,
    Processing,
    Ready,
    Error,
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArchiveStatus::Queued => "queued",
            ArchiveStatus::Processing => "processing",
            ArchiveStatus::Ready => "ready",
            ArchiveStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// The two remote backend families parts can be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Bulk blob service addressed through per-channel webhooks.
    Webhook,
    /// Messaging service addressed through a bot token + chat id.
    Bot,
}

impl ProviderKind {
    /// The other family — mirrors always go cross-family.
    pub fn other(&self) -> ProviderKind {
        match self {
            ProviderKind::Webhook => ProviderKind::Bot,
            ProviderKind::Bot => ProviderKind::Webhook,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::Webhook => "webhook",
            ProviderKind::Bot => "bot",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which copy of a part a placement refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementSide {
    Primary,
    Mirror,
}

/// One remote copy of a part: everything needed to download, re-fetch a fresh
/// URL, or delete it, independent of which side of the part record it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlacement {
    pub provider: ProviderKind,
    pub url: String,
    pub message_id: String,
    /// Webhook-family: which registered handle posted this part.
    pub webhook_id: Option<String>,
    /// Bot-family: server-side file id for the get-file endpoint.
    pub file_id: Option<String>,
}

/// One ciphertext fragment of an archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    /// 0-based, dense, unique per archive.
    pub index: u32,

    /// Ciphertext bytes.
    pub size: u64,

    /// Plaintext bytes this part contributed. Older records may lack this;
    /// readers treat a missing value as equal to `size` (safe for v2 — the
    /// GCM tag is stored separately, so ciphertext and plaintext lengths match).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plain_size: Option<u64>,

    /// Hex SHA-256 of the ciphertext.
    pub hash: String,

    /// Base64 12-byte GCM IV.
    pub iv: String,

    /// Base64 16-byte GCM auth tag.
    pub auth_tag: String,

    // -- primary placement --
    pub provider: ProviderKind,
    pub url: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    // -- mirror placement (optional second copy on the other family) --
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_provider: Option<ProviderKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mirror_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mirror_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_webhook_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_file_id: Option<String>,
    #[serde(default)]
    pub mirror_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_error: Option<String>,
}

impl Part {
    /// Plaintext length, tolerating legacy records without `plain_size`.
    pub fn plain_len(&self) -> u64 {
        self.plain_size.unwrap_or(self.size)
    }

    pub fn primary_placement(&self) -> PartPlacement {
        PartPlacement {
            provider: self.provider,
            url: self.url.clone(),
            message_id: self.message_id.clone(),
            webhook_id: self.webhook_id.clone(),
            file_id: self.file_id.clone(),
        }
    }

    /// The mirror copy, if one has actually been placed (assignment alone is
    /// not enough — a pending mirror has no URL yet).
    pub fn mirror_placement(&self) -> Option<PartPlacement> {
        let provider = self.mirror_provider?;
        if self.mirror_url.is_empty() || self.mirror_message_id.is_empty() {
            return None;
        }
        Some(PartPlacement {
            provider,
            url: self.mirror_url.clone(),
            message_id: self.mirror_message_id.clone(),
            webhook_id: self.mirror_webhook_id.clone(),
            file_id: self.mirror_file_id.clone(),
        })
    }
}

/// One user-visible file inside an archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path to the plaintext staging bytes, relative to the staging dir.
    pub path: PathBuf,

    /// Internal name — also the zip entry suffix for bundles.
    pub name: String,

    /// Original display name as uploaded.
    pub original_name: String,

    pub size: u64,

    /// Soft-delete timestamp. A soft-deleted entry keeps its index — bundle
    /// indices address the original list, not the filtered one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    /// Detected kind label ("image", "video", ...), if sniffed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub download_count: u64,
    #[serde(default)]
    pub preview_count: u64,

    /// Opaque thumbnail metadata written by the thumbnailer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<serde_json::Value>,
}

impl FileEntry {
    /// Canonical zip entry name for this file at the given bundle index.
    pub fn entry_name(&self, index: usize) -> String {
        format!("{}_{}", index, safe_name(&self.name))
    }
}

/// Sanitize a filename for use inside a zip entry name: path separators and
/// control characters collapse to '_'.
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '/' || c == '\\' || c == '\0' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// The unit of storage: a single file or a zip bundle, split into encrypted
/// parts scattered across remote providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub id: String,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,

    // -- naming --
    pub name: String,
    pub display_name: String,
    pub download_name: String,
    pub is_bundle: bool,
    pub files: Vec<FileEntry>,

    // -- lifecycle --
    pub status: ArchiveStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trashed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleting: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // -- progress --
    pub original_size: u64,
    #[serde(default)]
    pub encrypted_size: u64,
    #[serde(default)]
    pub uploaded_bytes: u64,
    #[serde(default)]
    pub uploaded_parts: u32,
    #[serde(default)]
    pub total_parts: u32,
    #[serde(default)]
    pub delete_total_parts: u32,
    #[serde(default)]
    pub deleted_parts: u32,

    // -- crypto --
    pub encryption_version: u32,
    /// v1 legacy only: archive-level IV (base64). Cleared on v2 finalize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    /// v1 legacy only: archive-level auth tag (base64).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_tag: Option<String>,

    // -- chunking / workspace --
    pub chunk_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,

    pub parts: Vec<Part>,

    // -- priority --
    /// 0..4, higher leases first.
    #[serde(default)]
    pub priority: u8,
    /// Pins `priority` so folder-level priority changes don't overwrite it.
    #[serde(default)]
    pub priority_override: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Archive {
    /// Parts deduplicated by index (newest record wins) and sorted by index.
    /// Readers must go through this — concurrent appenders can race a retry
    /// into a duplicate index, and the last committed record is authoritative.
    pub fn deduped_parts(&self) -> Vec<Part> {
        let mut by_index: HashMap<u32, &Part> = HashMap::new();
        for part in &self.parts {
            by_index.insert(part.index, part);
        }
        let mut parts: Vec<Part> = by_index.into_values().cloned().collect();
        parts.sort_by_key(|p| p.index);
        parts
    }

    /// Indices already committed, for recovery skips.
    pub fn committed_indices(&self) -> std::collections::HashSet<u32> {
        self.parts.iter().map(|p| p.index).collect()
    }

    /// Stable ETag over identity and part layout. Changes whenever the
    /// restorable bytes could change.
    pub fn etag(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.encryption_version.to_le_bytes());
        hasher.update(b"|");
        hasher.update(self.original_size.to_le_bytes());
        hasher.update(b"|");
        hasher.update([self.is_bundle as u8]);
        for part in self.deduped_parts() {
            hasher.update(b"|");
            hasher.update(format!("{}:{}:{}", part.index, part.hash, part.plain_len()));
        }
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    /// Whether user-facing queries may return this archive.
    pub fn is_visible(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Trash view: soft-deleted but not yet reaped.
    pub fn is_trashed(&self) -> bool {
        self.trashed_at.is_some() && self.deleted_at.is_none()
    }
}

/// Number of parts a plaintext of `total` bytes yields at `chunk_size`.
/// Zero-byte payloads produce zero parts.
pub fn chunk_count(total: u64, chunk_size: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    total.div_ceil(chunk_size) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    /// bcrypt hash; verification happens at the fronting auth layer.
    pub password_hash: String,
    pub role: UserRole,
    /// 0 = unlimited.
    pub quota_bytes: u64,
    pub used_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// A registered webhook endpoint parts can be posted to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHandle {
    pub id: String,
    pub url: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
