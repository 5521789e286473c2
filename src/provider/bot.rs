//! Bot-family adapter: posts parts as documents through a messaging-service
//! bot API.
//!
//! Upload is a send-document call against the bot endpoint; the response
//! carries both the message id (for delete) and a file id. Download URLs on
//! this family are minted on demand: refresh calls get-file with the stored
//! file id and rebuilds the URL from the returned path.

use super::{truncate_body, BlobProvider, ProviderError, UploadedBlob, ATTACHMENT_MARGIN_BYTES};
use crate::config::BotConfig;
use crate::types::{PartPlacement, ProviderKind};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Per-document ceiling on the bot family.
pub const BOT_MAX_DOCUMENT_BYTES: u64 = 50 * 1024 * 1024;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
    document: Option<DocumentInfo>,
}

#[derive(Debug, Deserialize)]
struct DocumentInfo {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

pub struct BotProvider {
    token: String,
    chat_id: String,
    api_base: String,
    client: reqwest::Client,
}

impl BotProvider {
    pub fn new(config: BotConfig, client: reqwest::Client) -> Self {
        Self {
            token: config.token,
            chat_id: config.chat_id,
            api_base: config
                .api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.token, file_path)
    }

    /// Unwrap the `{ok, result}` envelope, mapping API-level failure onto
    /// the HTTP status for transient/stale classification.
    async fn parse_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(super::webhook::error_from_response(response).await);
        }
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        if !envelope.ok {
            return Err(ProviderError::Http {
                status,
                body: truncate_body(&envelope.description.unwrap_or_default()),
                retry_after: None,
            });
        }
        envelope
            .result
            .ok_or_else(|| ProviderError::BadResponse("result".to_string()))
    }

    /// Resolve a file id to a fresh download URL.
    async fn get_file_url(&self, file_id: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.method_url("getFile"))
            .json(&json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let info: FileInfo = Self::parse_envelope(response).await?;
        let path = info
            .file_path
            .ok_or_else(|| ProviderError::BadResponse("file_path".to_string()))?;
        Ok(self.file_url(&path))
    }
}

#[async_trait]
impl BlobProvider for BotProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bot
    }

    fn max_part_bytes(&self) -> u64 {
        BOT_MAX_DOCUMENT_BYTES - ATTACHMENT_MARGIN_BYTES
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
            .text("chat_id", self.chat_id.clone())
            .text("caption", note.to_string())
            .part("document", part);

        let response = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let sent: SentMessage = Self::parse_envelope(response).await?;
        let file_id = sent
            .document
            .map(|d| d.file_id)
            .ok_or_else(|| ProviderError::BadResponse("document file_id".to_string()))?;

        let url = self.get_file_url(&file_id).await?;

        debug!(
            "bot posted {} ({} bytes) as message {}",
            filename, size, sent.message_id
        );

        Ok(UploadedBlob {
            url,
            message_id: sent.message_id.to_string(),
            webhook_id: None,
            file_id: Some(file_id),
        })
    }

    async fn refresh_url(&self, placement: &PartPlacement) -> Result<String, ProviderError> {
        let file_id = placement
            .file_id
            .as_deref()
            .ok_or_else(|| ProviderError::BadResponse("file_id".to_string()))?;
        self.get_file_url(file_id).await
    }

    async fn delete(&self, placement: &PartPlacement) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(self.method_url("deleteMessage"))
            .json(&json!({
                "chat_id": self.chat_id,
                "message_id": placement.message_id.parse::<i64>().unwrap_or_default(),
            }))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        match Self::parse_envelope::<bool>(response).await {
            Ok(_) => Ok(()),
            // "message to delete not found" arrives as a 400 — already gone.
            Err(ProviderError::Http { status: 400, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
