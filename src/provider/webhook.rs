//! Webhook-family adapter: posts parts as attachments through a channel
//! webhook on the bulk blob service.
//!
//! Upload is a single multipart POST (`?wait=true` so the response carries
//! the created message). URL refresh fetches the message by id and takes the
//! first attachment's URL — attachment URLs on this family expire, the
//! message id does not.

use super::{
    truncate_body, BlobProvider, ProviderError, UploadedBlob, ATTACHMENT_MARGIN_BYTES,
};
use crate::types::{PartPlacement, ProviderKind};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Per-attachment ceiling on the webhook family.
pub const WEBHOOK_MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    id: String,
    #[serde(default)]
    attachments: Vec<WebhookAttachment>,
}

#[derive(Debug, Deserialize)]
struct WebhookAttachment {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

pub struct WebhookProvider {
    handle_id: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookProvider {
    pub fn new(handle_id: String, url: String, client: reqwest::Client) -> Self {
        Self {
            handle_id,
            url: url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn message_url(&self, message_id: &str) -> String {
        format!("{}/messages/{}", self.url, message_id)
    }
}

/// Turn a non-success response into a ProviderError, extracting the
/// retry-after hint on 429 (header first, JSON `retry_after` seconds second).
pub(super) async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after_header = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64);

    let body = response.text().await.unwrap_or_default();

    let retry_after = if status == 429 {
        retry_after_header.or_else(|| {
            serde_json::from_str::<RateLimitBody>(&body)
                .ok()
                .and_then(|b| b.retry_after)
                .map(Duration::from_secs_f64)
        })
    } else {
        None
    };

    ProviderError::Http {
        status,
        body: truncate_body(&body),
        retry_after,
    }
}

#[async_trait]
impl BlobProvider for WebhookProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Webhook
    }

    fn handle_id(&self) -> Option<&str> {
        Some(&self.handle_id)
    }

    fn max_part_bytes(&self) -> u64 {
        WEBHOOK_MAX_ATTACHMENT_BYTES - ATTACHMENT_MARGIN_BYTES
    }

    async fn download(&self, url: &str) -> Result<Bytes, ProviderError> {
        super::http_get(&self.client, url).await
    }

    async fn upload(
        &self,
        data: Bytes,
        filename: &str,
        note: &str,
    ) -> Result<UploadedBlob, ProviderError> {
        let size = data.len();
        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("content", note.to_string())
            .part("file", part);

        let response = self
            .client
            .post(format!("{}?wait=true", self.url))
            .multipart(form)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let message: WebhookMessage = response
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        let attachment = message
            .attachments
            .first()
            .ok_or_else(|| ProviderError::BadResponse("attachment url".to_string()))?;

        debug!(
            "webhook {} posted {} ({} bytes) as message {}",
            self.handle_id, filename, size, message.id
        );

        Ok(UploadedBlob {
            url: attachment.url.clone(),
            message_id: message.id,
            webhook_id: Some(self.handle_id.clone()),
            file_id: None,
        })
    }

    async fn refresh_url(&self, placement: &PartPlacement) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(self.message_url(&placement.message_id))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let message: WebhookMessage = response
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        message
            .attachments
            .first()
            .map(|a| a.url.clone())
            .ok_or_else(|| ProviderError::BadResponse("attachment url".to_string()))
    }

    async fn delete(&self, placement: &PartPlacement) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.message_url(&placement.message_id))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        // Already gone counts as deleted.
        if response.status().is_success() || response.status().as_u16() == 404 {
            return Ok(());
        }
        Err(error_from_response(response).await)
    }
}
