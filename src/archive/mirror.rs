//! Mirror synchronizer: every part of a ready archive should hold two
//! copies, one per provider family.
//!
//! Runs only when no uploads are queued. Prepare assigns the missing
//! cross-family target; sync claims one pending part at a time (guarded
//! find-and-modify, so parallel workers never copy the same part), pulls the
//! ciphertext from the primary, and places the second copy.

use super::ArchiveService;
use crate::provider::{BlobProvider, ProviderRegistry};
use crate::store::{MirrorPlacementUpdate, StoreError};
use crate::types::{Archive, Part, ProviderKind};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

impl ArchiveService {
    /// One mirror-maintenance batch: a prepare pass and a sync pass.
    /// Returns true when any work happened.
    pub async fn mirror_maintenance(&self) -> Result<bool, StoreError> {
        let registry = self.providers().await?;
        if !registry.has_any() {
            return Ok(false);
        }

        let prepared = self.mirror_prepare(&registry).await?;
        let synced = self.mirror_sync(registry).await?;
        Ok(prepared || synced)
    }

    /// Assign a mirror family to parts that have none. Parts whose opposite
    /// family is not configured are left alone.
    async fn mirror_prepare(&self, registry: &ProviderRegistry) -> Result<bool, StoreError> {
        let Some(archive) = self.store.next_mirror_prepare_candidate().await? else {
            return Ok(false);
        };

        let mut assigned = 0usize;
        for part in archive.deduped_parts() {
            if part.mirror_provider.is_some() {
                continue;
            }
            let target = part.provider.other();
            if !registry.kind_available(target) {
                continue;
            }
            self.store
                .assign_part_mirror_provider(&archive.id, part.index, target)
                .await?;
            assigned += 1;
        }

        if assigned > 0 {
            debug!(
                "archive {}: assigned mirror targets for {assigned} part(s)",
                archive.id
            );
        }
        Ok(assigned > 0)
    }

    /// Copy pending parts of one archive to their assigned mirror family.
    async fn mirror_sync(&self, registry: Arc<ProviderRegistry>) -> Result<bool, StoreError> {
        let available = registry.available_kinds();
        let Some(archive) = self
            .store
            .next_mirror_sync_candidate(&available)
            .await?
        else {
            return Ok(false);
        };

        let pending: Vec<(u32, ProviderKind)> = archive
            .deduped_parts()
            .into_iter()
            .filter(|p| p.mirror_pending)
            .filter_map(|p| p.mirror_provider.map(|m| (p.index, m)))
            .filter(|(_, m)| available.contains(m))
            .collect();
        if pending.is_empty() {
            return Ok(false);
        }

        info!(
            "mirror sync: archive {} has {} pending part(s)",
            archive.id,
            pending.len()
        );

        let archive = Arc::new(archive);
        let concurrency = self.config.upload_parts_concurrency.max(1);
        let mut tasks = JoinSet::new();
        let mut queue = pending.into_iter();
        let mut copied = false;

        loop {
            while tasks.len() < concurrency {
                let Some((index, target)) = queue.next() else { break };
                let service = self.clone();
                let registry = registry.clone();
                let archive = archive.clone();
                tasks.spawn(async move {
                    service
                        .mirror_one_part(&registry, &archive, index, target)
                        .await
                });
            }
            match tasks.join_next().await {
                Some(result) => copied |= result.unwrap_or(false),
                None => break,
            }
        }

        Ok(copied)
    }

    /// Claim, copy, persist one part's mirror. Returns true on success.
    async fn mirror_one_part(
        &self,
        registry: &ProviderRegistry,
        archive: &Archive,
        index: u32,
        target: ProviderKind,
    ) -> bool {
        // The claim drops `mirror_pending` under guard; losing it means
        // another worker owns this part.
        match self
            .store
            .claim_mirror_part(&archive.id, index, target)
            .await
        {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!("archive {} part {index}: mirror claim failed: {e}", archive.id);
                return false;
            }
        }

        let part = archive.deduped_parts().into_iter().find(|p| p.index == index);
        let result = match part {
            Some(part) => self.copy_part_to_mirror(registry, archive, &part, target).await,
            None => Err("part record vanished".to_string()),
        };

        match result {
            Ok(placement) => {
                if let Err(e) = self
                    .store
                    .set_part_mirror_placement(&archive.id, index, placement)
                    .await
                {
                    warn!(
                        "archive {} part {index}: mirror placement persist failed: {e}",
                        archive.id
                    );
                    let _ = self
                        .store
                        .set_part_mirror_pending(&archive.id, index, true, Some(e.to_string()))
                        .await;
                    return false;
                }
                if let Some(m) = &self.metrics {
                    m.mirror_synced_total.inc();
                }
                debug!("archive {} part {index}: mirrored to {target}", archive.id);
                true
            }
            Err(err) => {
                // Back to pending with the error visible, for the next batch
                // (or an operator) to pick up.
                warn!("archive {} part {index}: mirror copy failed: {err}", archive.id);
                if let Some(m) = &self.metrics {
                    m.mirror_failures_total.inc();
                }
                let _ = self
                    .store
                    .set_part_mirror_pending(&archive.id, index, true, Some(err))
                    .await;
                false
            }
        }
    }

    /// Pull the ciphertext from the primary (self-repairing) and push it to
    /// the mirror family.
    async fn copy_part_to_mirror(
        &self,
        registry: &ProviderRegistry,
        archive: &Archive,
        part: &Part,
        target: ProviderKind,
    ) -> Result<MirrorPlacementUpdate, String> {
        let ciphertext = self
            .fetch_ciphertext(registry, archive, part)
            .await
            .map_err(|e| format!("primary download failed: {e}"))?;

        let provider = registry
            .for_kind(target, part.index)
            .ok_or_else(|| format!("mirror family {target} not configured"))?;

        let filename = format!(
            "{}_{:05}.bin",
            &archive.id[..8.min(archive.id.len())],
            part.index
        );
        let note = format!("{}:{}", archive.id, part.index);
        let data = ciphertext;

        let label = format!("{} part {} mirror ({target})", archive.id, part.index);
        let blob = self
            .retry
            .run(&label, |_| {
                let provider = provider.clone();
                let data = data.clone();
                let filename = filename.clone();
                let note = note.clone();
                async move { provider.upload(data, &filename, &note).await }
            })
            .await
            .map_err(|e| e.to_string())?;

        Ok(MirrorPlacementUpdate {
            provider: target,
            url: blob.url,
            message_id: blob.message_id,
            webhook_id: blob.webhook_id,
            file_id: blob.file_id,
        })
    }
}
