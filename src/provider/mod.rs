//! External blob providers: the two chat-backend families parts are posted to.
//!
//! Both families sit behind one contract: upload a ciphertext buffer as an
//! attachment, refresh a stale download URL, delete a posted message. The
//! registry owns the configured adapters and the selection rule for new parts.

mod bot;
mod retry;
mod webhook;

pub use bot::BotProvider;
pub use retry::RetryPolicy;
pub use webhook::WebhookProvider;

use crate::config::Config;
use crate::store::MetaStore;
use crate::types::{PartPlacement, ProviderKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Safety margin subtracted from a provider's attachment ceiling when
/// computing the effective chunk size.
pub const ATTACHMENT_MARGIN_BYTES: u64 = 4096;

/// Errors from provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        /// Server-supplied wait hint (429 Retry-After header or JSON field).
        retry_after: Option<Duration>,
    },

    /// Connection-level failure: reset, timeout, DNS, hangup.
    #[error("network error: {0}")]
    Network(String),

    #[error("no_storage_provider_configured")]
    NoProvider,

    #[error("provider response missing {0}")]
    BadResponse(String),
}

impl ProviderError {
    /// Errors worth retrying with backoff: network drops, 429, 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_) => true,
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Stale or expired download URL — repairable via `refresh_url`.
    pub fn is_stale_url(&self) -> bool {
        matches!(
            self,
            ProviderError::Http {
                status: 401 | 403 | 404,
                ..
            }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        ProviderError::Network(err.to_string())
    }
}

/// Result of posting a blob to a provider.
#[derive(Debug, Clone)]
pub struct UploadedBlob {
    /// Direct download URL for the attachment.
    pub url: String,
    /// Server-side message id — needed for delete and webhook re-fetch.
    pub message_id: String,
    /// Webhook-family: the handle that posted it.
    pub webhook_id: Option<String>,
    /// Bot-family: file id for the get-file endpoint.
    pub file_id: Option<String>,
}

/// One remote blob sink.
#[async_trait]
pub trait BlobProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Webhook-family adapters answer with their registered handle id.
    fn handle_id(&self) -> Option<&str> {
        None
    }

    /// Largest ciphertext this provider accepts per attachment, margin
    /// already subtracted.
    fn max_part_bytes(&self) -> u64;

    /// Post `data` as an attachment; returns the download URL and the ids
    /// needed to refresh or delete it later.
    async fn upload(
        &self,
        data: Bytes,
        filename: &str,
        note: &str,
    ) -> Result<UploadedBlob, ProviderError>;

    /// Fetch an attachment by its download URL.
    async fn download(&self, url: &str) -> Result<Bytes, ProviderError>;

    /// Fetch a fresh download URL for a blob known to exist remotely.
    async fn refresh_url(&self, placement: &PartPlacement) -> Result<String, ProviderError>;

    /// Best-effort removal of the posted message.
    async fn delete(&self, placement: &PartPlacement) -> Result<(), ProviderError>;
}

/// Plain GET of an attachment URL, with the status mapping both adapters
/// share.
pub(crate) async fn http_get(
    client: &reqwest::Client,
    url: &str,
) -> Result<Bytes, ProviderError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(ProviderError::from_reqwest)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body: truncate_body(&body),
            retry_after: None,
        });
    }

    response.bytes().await.map_err(ProviderError::from_reqwest)
}

/// The configured provider set plus the shared download client.
///
/// Rebuilt from the store on each worker pass — handles are read-mostly and
/// changes are picked up on the next query.
pub struct ProviderRegistry {
    webhooks: Vec<Arc<dyn BlobProvider>>,
    bot: Option<Arc<dyn BlobProvider>>,
    http: reqwest::Client,
}

impl ProviderRegistry {
    pub async fn from_store(
        config: &Config,
        store: &dyn MetaStore,
    ) -> Result<Self, crate::store::StoreError> {
        let http = reqwest::Client::new();

        let webhooks = store
            .list_webhooks()
            .await?
            .into_iter()
            .filter(|h| h.enabled)
            .map(|h| {
                Arc::new(WebhookProvider::new(h.id, h.url, http.clone())) as Arc<dyn BlobProvider>
            })
            .collect();

        let bot = config.bot.as_ref().map(|b| {
            Arc::new(BotProvider::new(b.clone(), http.clone())) as Arc<dyn BlobProvider>
        });

        Ok(Self {
            webhooks,
            bot,
            http,
        })
    }

    /// Registry with explicit adapters — test harnesses build these directly.
    pub fn with_providers(
        webhooks: Vec<Arc<dyn BlobProvider>>,
        bot: Option<Arc<dyn BlobProvider>>,
    ) -> Self {
        Self {
            webhooks,
            bot,
            http: reqwest::Client::new(),
        }
    }

    pub fn has_any(&self) -> bool {
        !self.webhooks.is_empty() || self.bot.is_some()
    }

    pub fn available_kinds(&self) -> Vec<ProviderKind> {
        let mut kinds = Vec::new();
        if !self.webhooks.is_empty() {
            kinds.push(ProviderKind::Webhook);
        }
        if self.bot.is_some() {
            kinds.push(ProviderKind::Bot);
        }
        kinds
    }

    /// Selection rule for new parts: the enabled webhook handle at
    /// `index mod n`, falling back to the bot when no webhooks exist.
    pub fn primary_for_index(&self, index: u32) -> Result<Arc<dyn BlobProvider>, ProviderError> {
        if !self.webhooks.is_empty() {
            let n = self.webhooks.len();
            return Ok(self.webhooks[index as usize % n].clone());
        }
        self.bot.clone().ok_or(ProviderError::NoProvider)
    }

    /// The other family, for replicated placement of the same part.
    pub fn mirror_for(&self, primary: ProviderKind, index: u32) -> Option<Arc<dyn BlobProvider>> {
        self.for_kind(primary.other(), index)
    }

    /// Adapter responsible for an existing placement — used by refresh,
    /// download, and delete, which must target the family (and webhook
    /// handle) that posted the part.
    pub fn for_placement(&self, placement: &PartPlacement) -> Option<Arc<dyn BlobProvider>> {
        match placement.provider {
            ProviderKind::Webhook => {
                if let Some(id) = &placement.webhook_id {
                    if let Some(w) = self
                        .webhooks
                        .iter()
                        .find(|w| w.handle_id() == Some(id.as_str()))
                    {
                        return Some(w.clone());
                    }
                }
                // Handle gone from config: fall back to the first one rather
                // than failing outright — the attachment URL still works.
                self.webhooks.first().cloned()
            }
            ProviderKind::Bot => self.bot.clone(),
        }
    }

    /// Adapter for a family, webhook handles round-robined by part index.
    pub fn for_kind(&self, kind: ProviderKind, index: u32) -> Option<Arc<dyn BlobProvider>> {
        match kind {
            ProviderKind::Webhook if !self.webhooks.is_empty() => {
                let n = self.webhooks.len();
                Some(self.webhooks[index as usize % n].clone())
            }
            ProviderKind::Bot => self.bot.clone(),
            _ => None,
        }
    }

    pub fn kind_available(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::Webhook => !self.webhooks.is_empty(),
            ProviderKind::Bot => self.bot.is_some(),
        }
    }

    /// Upload slots for the part pool: one per webhook handle, or a single
    /// slot when only the bot is configured.
    pub fn upload_slots(&self) -> usize {
        if self.webhooks.is_empty() {
            1
        } else {
            self.webhooks.len()
        }
    }

    /// Smallest per-attachment ceiling across configured providers. The
    /// effective chunk size must not exceed this, or mirrored placement on
    /// the stricter family becomes impossible.
    pub fn min_part_limit(&self) -> u64 {
        let mut limit = u64::MAX;
        if let Some(w) = self.webhooks.first() {
            limit = limit.min(w.max_part_bytes());
        }
        if let Some(b) = &self.bot {
            limit = limit.min(b.max_part_bytes());
        }
        limit
    }

    /// Download one copy of a part through the adapter that owns it; plain
    /// GET as a last resort when the owning adapter is no longer configured
    /// (attachment URLs stay fetchable either way).
    pub async fn download_placement(
        &self,
        placement: &PartPlacement,
        url: &str,
    ) -> Result<Bytes, ProviderError> {
        match self.for_placement(placement) {
            Some(provider) => provider.download(url).await,
            None => http_get(&self.http, url).await,
        }
    }
}

/// Cap error bodies so logs stay readable.
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}
