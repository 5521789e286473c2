//! Shared test infrastructure for integration tests.
//!
//! Provides an in-process service wired to the in-memory store and mock
//! providers implementing `BlobProvider`, plus helpers to drive the upload
//! worker and collect restore streams.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use offload_server::archive::restore::RestoreError;
use offload_server::archive::{ArchiveService, NewFileInput};
use offload_server::config::Config;
use offload_server::crypto::MasterKey;
use offload_server::provider::{BlobProvider, ProviderError, ProviderRegistry, UploadedBlob};
use offload_server::store::{MemoryStore, MetaStore};
use offload_server::types::{Archive, ArchiveStatus, PartPlacement, ProviderKind, User, UserRole};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// One stored mock blob.
struct MockBlob {
    bytes: Bytes,
    /// URLs ever minted for this message.
    urls: Vec<String>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    messages: HashMap<String, MockBlob>,
    /// url -> (message_id, expired)
    urls: HashMap<String, (String, bool)>,
    /// None = unlimited; Some(n) = allow n more successful uploads.
    remaining_successes: Option<u32>,
    refresh_broken: bool,
}

/// In-memory provider double. Upload/download/refresh/delete behave like a
/// real backend with expirable attachment URLs.
pub struct MockProvider {
    kind: ProviderKind,
    handle: Option<String>,
    state: Mutex<MockState>,
    pub uploads_ok: AtomicU32,
    pub deletes: AtomicU32,
}

impl MockProvider {
    pub fn webhook(handle: &str) -> Arc<Self> {
        Arc::new(Self {
            kind: ProviderKind::Webhook,
            handle: Some(handle.to_string()),
            state: Mutex::new(MockState::default()),
            uploads_ok: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
        })
    }

    pub fn bot() -> Arc<Self> {
        Arc::new(Self {
            kind: ProviderKind::Bot,
            handle: None,
            state: Mutex::new(MockState::default()),
            uploads_ok: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
        })
    }

    /// Allow only the next `n` uploads to succeed; later ones fail with a
    /// transient 503 until `allow_all` is called.
    pub fn allow_uploads(&self, n: u32) {
        self.state.lock().remaining_successes = Some(n);
    }

    pub fn allow_all(&self) {
        self.state.lock().remaining_successes = None;
    }

    /// Expire one minted URL so downloads against it return 404.
    pub fn expire_url(&self, url: &str) {
        if let Some(entry) = self.state.lock().urls.get_mut(url) {
            entry.1 = true;
        }
    }

    /// Make refreshed URLs come out already expired (double-404 case).
    pub fn break_refresh(&self, broken: bool) {
        self.state.lock().refresh_broken = broken;
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    fn mint_url(state: &mut MockState, kind: ProviderKind, message_id: &str) -> String {
        let version = state
            .messages
            .get(message_id)
            .map(|m| m.urls.len())
            .unwrap_or(0);
        let url = format!("mock://{kind}/{message_id}/v{version}");
        let expired = state.refresh_broken && version > 0;
        state
            .urls
            .insert(url.clone(), (message_id.to_string(), expired));
        if let Some(blob) = state.messages.get_mut(message_id) {
            blob.urls.push(url.clone());
        }
        url
    }
}

fn http_err(status: u16) -> ProviderError {
    ProviderError::Http {
        status,
        body: String::new(),
        retry_after: None,
    }
}

#[async_trait]
impl BlobProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn handle_id(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    fn max_part_bytes(&self) -> u64 {
        8 * 1024 * 1024
    }

    async fn upload(
        &self,
        data: Bytes,
        _filename: &str,
        _note: &str,
    ) -> Result<UploadedBlob, ProviderError> {
        let mut state = self.state.lock();
        match &mut state.remaining_successes {
            Some(0) => return Err(http_err(503)),
            Some(n) => *n -= 1,
            None => {}
        }

        state.next_id += 1;
        let message_id = format!("m{}", state.next_id);
        state.messages.insert(
            message_id.clone(),
            MockBlob {
                bytes: data,
                urls: Vec::new(),
            },
        );
        let url = Self::mint_url(&mut state, self.kind, &message_id);
        drop(state);

        self.uploads_ok.fetch_add(1, Ordering::SeqCst);
        Ok(UploadedBlob {
            url,
            message_id: message_id.clone(),
            webhook_id: self.handle.clone(),
            file_id: matches!(self.kind, ProviderKind::Bot).then(|| format!("file-{message_id}")),
        })
    }

    async fn download(&self, url: &str) -> Result<Bytes, ProviderError> {
        let state = self.state.lock();
        match state.urls.get(url) {
            Some((message_id, false)) => state
                .messages
                .get(message_id)
                .map(|m| m.bytes.clone())
                .ok_or_else(|| http_err(404)),
            Some((_, true)) | None => Err(http_err(404)),
        }
    }

    async fn refresh_url(&self, placement: &PartPlacement) -> Result<String, ProviderError> {
        let mut state = self.state.lock();
        if !state.messages.contains_key(&placement.message_id) {
            return Err(http_err(404));
        }
        Ok(Self::mint_url(&mut state, self.kind, &placement.message_id))
    }

    async fn delete(&self, placement: &PartPlacement) -> Result<(), ProviderError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(blob) = state.messages.remove(&placement.message_id) {
            for url in blob.urls {
                state.urls.remove(&url);
            }
        }
        // Already gone still counts as deleted.
        Ok(())
    }
}

/// In-process test rig: memory store + mock providers + service.
pub struct Harness {
    pub tmp: TempDir,
    pub store: Arc<MemoryStore>,
    pub service: ArchiveService,
    pub webhook: Arc<MockProvider>,
    pub bot: Option<Arc<MockProvider>>,
}

pub const TEST_USER: &str = "u-test";

impl Harness {
    /// Webhook-only rig with the given chunk size.
    pub async fn new(chunk_size: u64) -> Self {
        Self::build(chunk_size, false, |_| {}).await
    }

    /// Webhook + bot rig (mirrored placement active).
    pub async fn with_bot(chunk_size: u64) -> Self {
        Self::build(chunk_size, true, |_| {}).await
    }

    pub async fn build(
        chunk_size: u64,
        with_bot: bool,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let mut config = Config {
            data_dir: tmp.path().to_path_buf(),
            chunk_size_bytes: chunk_size,
            upload_parts_concurrency: 2,
            upload_retry_base_ms: 1,
            upload_retry_max_ms: 5,
            upload_retry_max: 3,
            disk_soft_limit_gb: 0,
            disk_hard_limit_gb: 0,
            worker_poll_ms: 10,
            bundle_single_file_bytes: 1024 * 1024,
            bundle_max_bytes: 4 * 1024 * 1024,
            ..Default::default()
        };
        tweak(&mut config);

        let store = Arc::new(MemoryStore::new());
        let webhook = MockProvider::webhook("w0");
        let bot = with_bot.then(MockProvider::bot);

        let registry = ProviderRegistry::with_providers(
            vec![webhook.clone() as Arc<dyn BlobProvider>],
            bot.clone().map(|b| b as Arc<dyn BlobProvider>),
        );

        let service = ArchiveService::new(
            config,
            store.clone(),
            MasterKey::derive("test-master-secret"),
            None,
        )
        .with_provider_registry(Arc::new(registry));

        let harness = Self {
            tmp,
            store,
            service,
            webhook,
            bot,
        };
        harness.add_user(TEST_USER, 0).await;
        harness
    }

    pub async fn add_user(&self, id: &str, quota_bytes: u64) {
        let user = User {
            id: id.to_string(),
            username: id.to_string(),
            password_hash: String::new(),
            role: UserRole::User,
            quota_bytes,
            used_bytes: 0,
            created_at: Utc::now(),
        };
        self.store.insert_user(user).await.expect("insert user");
    }

    /// Write an upload input file into a spool area. A name with directory
    /// components ("photos/a.jpg") carries them as the relative dir.
    pub fn spool(&self, name: &str, bytes: &[u8]) -> NewFileInput {
        let dir = self.tmp.path().join("inbox");
        std::fs::create_dir_all(&dir).expect("spool dir");
        let path = dir.join(format!(
            "{}-{}",
            name.replace('/', "_"),
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, bytes).expect("spool write");
        let (relative_dir, original_name) = match name.rsplit_once('/') {
            Some((dir, file)) => (Some(dir.to_string()), file.to_string()),
            None => (None, name.to_string()),
        };
        NewFileInput {
            original_name,
            spooled_path: path,
            size: bytes.len() as u64,
            relative_dir,
        }
    }

    /// Create archives from the inputs and drive the worker until the queue
    /// drains. Returns the archive ids.
    pub async fn upload(&self, inputs: Vec<NewFileInput>) -> Vec<String> {
        let ids = self
            .service
            .create_archives_from_files(TEST_USER, None, inputs)
            .await
            .expect("create archives");
        self.drain_queue().await;
        ids
    }

    /// Run upload worker passes until nothing is queued.
    pub async fn drain_queue(&self) {
        loop {
            match self.service.process_next_upload().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => panic!("worker pass failed: {e}"),
            }
        }
    }

    pub async fn archive(&self, id: &str) -> Archive {
        self.store
            .get_archive(id)
            .await
            .expect("get archive")
            .expect("archive exists")
    }

    pub async fn assert_status(&self, id: &str, status: ArchiveStatus) {
        assert_eq!(self.archive(id).await.status, status);
    }

    pub async fn used_bytes(&self, user: &str) -> u64 {
        self.store
            .get_user(user)
            .await
            .expect("get user")
            .expect("user exists")
            .used_bytes
    }

    /// Collect a restore body stream to bytes, panicking on mid-stream error.
    pub async fn collect(
        mut body: futures::stream::BoxStream<'static, Result<Bytes, RestoreError>>,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.expect("stream chunk"));
        }
        out
    }

    /// Collect a restore body, returning the first mid-stream error.
    pub async fn try_collect(
        mut body: futures::stream::BoxStream<'static, Result<Bytes, RestoreError>>,
    ) -> Result<Vec<u8>, RestoreError> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    pub async fn download_whole(&self, id: &str) -> Vec<u8> {
        let stream = self
            .service
            .stream_whole(TEST_USER, id)
            .await
            .expect("stream_whole");
        Self::collect(stream.body).await
    }

    pub async fn download_range(&self, id: &str, header: &str) -> Result<Vec<u8>, RestoreError> {
        let ranged = self.service.stream_range(TEST_USER, id, header).await?;
        Ok(Self::collect(ranged.body).await)
    }
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut state = seed as u32 ^ 0x9e37_79b9;
    for _ in 0..len {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        out.push((state >> 24) as u8);
    }
    out
}
