//! Deletion reaper: retires trashed or purge-requested archives by deleting
//! their remote parts and refunding quota.
//!
//! Remote deletes are best-effort and idempotent from our side — a part whose
//! message is already gone counts as deleted. The claim is an atomic
//! find-and-modify, so multiple processes never reap the same archive.

use super::ArchiveService;
use crate::store::StoreError;
use crate::types::{PlacementSide, TRASH_RETENTION_DAYS};
use tracing::{debug, info, warn};

impl ArchiveService {
    /// One reaper iteration: claim and retire at most one archive.
    /// Returns true when an archive was processed.
    pub async fn reap_next(&self) -> Result<bool, StoreError> {
        let Some(archive) = self
            .store
            .claim_next_deletion(TRASH_RETENTION_DAYS)
            .await?
        else {
            return Ok(false);
        };

        let parts = archive.deduped_parts();
        let total = parts.len() as u32;
        info!(
            "reaping archive {} ({} parts, {} bytes)",
            archive.id, total, archive.original_size
        );
        self.store.begin_deletion(&archive.id, total).await?;

        let registry = self.providers().await?;
        for (done, part) in parts.iter().enumerate() {
            for side in [PlacementSide::Primary, PlacementSide::Mirror] {
                let placement = match side {
                    PlacementSide::Primary => part.primary_placement(),
                    PlacementSide::Mirror => match part.mirror_placement() {
                        Some(p) => p,
                        None => continue,
                    },
                };
                match registry.for_placement(&placement) {
                    Some(provider) => {
                        // Single-part failures are swallowed: the message may
                        // already be gone, and a stuck part must not stall
                        // the reaper.
                        if let Err(e) = provider.delete(&placement).await {
                            debug!(
                                "archive {} part {} {side:?} delete failed (ignored): {e}",
                                archive.id, part.index
                            );
                        }
                    }
                    None => warn!(
                        "archive {} part {} {side:?}: no provider for stored placement",
                        archive.id, part.index
                    ),
                }
            }

            self.store.inc_deleted_parts(&archive.id).await?;
            if let Some(m) = &self.metrics {
                m.parts_deleted_total.inc();
            }
            if (done + 1) % 10 == 0 {
                info!(
                    "archive {}: deleted {}/{} parts",
                    archive.id,
                    done + 1,
                    total
                );
            }
        }

        self.store.complete_deletion(&archive.id).await?;
        self.store
            .release_quota(&archive.owner_id, archive.original_size)
            .await?;

        // The staging tree may still exist if the upload never finished or
        // cache deletion was off.
        if let Some(dir) = &archive.staging_dir {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
        let _ = tokio::fs::remove_dir_all(self.work_dir_for(&archive.id)).await;

        if let Some(m) = &self.metrics {
            m.archives_reaped_total.inc();
        }
        info!("archive {} reaped", archive.id);
        Ok(true)
    }
}
