//! Store seam, raw-report archive, and retrying HTTP transport.
//!
//! The engine treats persistence as an external collaborator: everything it
//! needs is the `SalesStore` trait. The in-memory implementation backs tests
//! and single-process runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcsr_core::{
    InsertOutcome, NaturalKey, RunOutcome, SaleRecord, SourceCheckpoint, StaffMember,
    UpsertOutcome,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mcsr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store write failed: {0}")]
    Write(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence contract consumed by the ingestion pipeline and pollers.
#[async_trait]
pub trait SalesStore: Send + Sync {
    /// Insert unless the key already exists. Never merges; the strict-mode
    /// write used by auditable manual uploads.
    async fn insert_if_new(
        &self,
        record: &SaleRecord,
        key: &NaturalKey,
    ) -> Result<InsertOutcome, StoreError>;

    /// Insert, or fill the existing record's null fields in place. The
    /// polling-mode write: later snapshots carry richer columns.
    async fn upsert(
        &self,
        record: &SaleRecord,
        key: &NaturalKey,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn staff_directory(&self) -> Result<Vec<StaffMember>, StoreError>;

    /// Update the checkpoint for one source/file. A failed outcome must not
    /// advance the processed mod-time.
    async fn record_checkpoint(
        &self,
        source_id: &str,
        file_id: &str,
        mod_time: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Result<(), StoreError>;

    async fn last_checkpoint(
        &self,
        source_id: &str,
        file_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<NaturalKey, SaleRecord>,
    checkpoints: HashMap<(String, String), SourceCheckpoint>,
    staff: Vec<StaffMember>,
}

/// In-memory `SalesStore` for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_staff(staff: Vec<StaffMember>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                staff,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn get(&self, key: &NaturalKey) -> Option<SaleRecord> {
        self.state.lock().await.records.get(key).cloned()
    }

    pub async fn checkpoint(&self, source_id: &str, file_id: &str) -> Option<SourceCheckpoint> {
        self.state
            .lock()
            .await
            .checkpoints
            .get(&(source_id.to_string(), file_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl SalesStore for MemoryStore {
    async fn insert_if_new(
        &self,
        record: &SaleRecord,
        key: &NaturalKey,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(key) {
            return Ok(InsertOutcome::Skipped);
        }
        state.records.insert(key.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn upsert(
        &self,
        record: &SaleRecord,
        key: &NaturalKey,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(key) {
            Some(existing) => {
                existing.fill_missing_from(record);
                Ok(UpsertOutcome::Merged)
            }
            None => {
                state.records.insert(key.clone(), record.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn staff_directory(&self) -> Result<Vec<StaffMember>, StoreError> {
        Ok(self.state.lock().await.staff.clone())
    }

    async fn record_checkpoint(
        &self,
        source_id: &str,
        file_id: &str,
        mod_time: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = (source_id.to_string(), file_id.to_string());
        // The entry is born on the first successful run; a failed first run
        // leaves no checkpoint behind.
        if !state.checkpoints.contains_key(&key) && outcome != RunOutcome::Succeeded {
            return Ok(());
        }
        let entry = state.checkpoints.entry(key).or_insert(SourceCheckpoint {
            last_processed_mod_time: None,
            last_run_at: Utc::now(),
            last_run_outcome: outcome,
        });
        entry.last_run_at = Utc::now();
        entry.last_run_outcome = outcome;
        if outcome == RunOutcome::Succeeded {
            entry.last_processed_mod_time = Some(mod_time);
        }
        Ok(())
    }

    async fn last_checkpoint(
        &self,
        source_id: &str,
        file_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .checkpoints
            .get(&(source_id.to_string(), file_id.to_string()))
            .and_then(|cp| cp.last_processed_mod_time))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointEntry {
    source_id: String,
    file_id: String,
    checkpoint: SourceCheckpoint,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileState {
    records: HashMap<NaturalKey, SaleRecord>,
    checkpoints: Vec<CheckpointEntry>,
    staff: Vec<StaffMember>,
}

impl FileState {
    fn checkpoint_mut(&mut self, source_id: &str, file_id: &str) -> Option<&mut SourceCheckpoint> {
        self.checkpoints
            .iter_mut()
            .find(|e| e.source_id == source_id && e.file_id == file_id)
            .map(|e| &mut e.checkpoint)
    }

    fn checkpoint(&self, source_id: &str, file_id: &str) -> Option<&SourceCheckpoint> {
        self.checkpoints
            .iter()
            .find(|e| e.source_id == source_id && e.file_id == file_id)
            .map(|e| &e.checkpoint)
    }
}

/// Single-file JSON `SalesStore`. Loads the whole state at open and rewrites
/// it atomically after each mutation. Suited to one process at a time; the
/// checkpoint and dedup semantics match `MemoryStore`.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing store file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => FileState::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading store file {}", path.display()))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn get(&self, key: &NaturalKey) -> Option<SaleRecord> {
        self.state.lock().await.records.get(key).cloned()
    }

    async fn persist(&self, state: &FileState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|err| StoreError::Write(err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|err| StoreError::Write(err.to_string()))?;
            }
        }
        let temp_path = self.path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|err| StoreError::Write(err.to_string()))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|err| StoreError::Write(err.to_string()))
    }
}

#[async_trait]
impl SalesStore for JsonFileStore {
    async fn insert_if_new(
        &self,
        record: &SaleRecord,
        key: &NaturalKey,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(key) {
            return Ok(InsertOutcome::Skipped);
        }
        state.records.insert(key.clone(), record.clone());
        self.persist(&state).await?;
        Ok(InsertOutcome::Inserted)
    }

    async fn upsert(
        &self,
        record: &SaleRecord,
        key: &NaturalKey,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let outcome = match state.records.get_mut(key) {
            Some(existing) => {
                existing.fill_missing_from(record);
                UpsertOutcome::Merged
            }
            None => {
                state.records.insert(key.clone(), record.clone());
                UpsertOutcome::Inserted
            }
        };
        self.persist(&state).await?;
        Ok(outcome)
    }

    async fn staff_directory(&self) -> Result<Vec<StaffMember>, StoreError> {
        Ok(self.state.lock().await.staff.clone())
    }

    async fn record_checkpoint(
        &self,
        source_id: &str,
        file_id: &str,
        mod_time: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        // Same birth rule as the in-memory store: no entry until the first
        // successful run.
        if state.checkpoint(source_id, file_id).is_none() {
            if outcome != RunOutcome::Succeeded {
                return Ok(());
            }
            state.checkpoints.push(CheckpointEntry {
                source_id: source_id.to_string(),
                file_id: file_id.to_string(),
                checkpoint: SourceCheckpoint {
                    last_processed_mod_time: Some(mod_time),
                    last_run_at: Utc::now(),
                    last_run_outcome: outcome,
                },
            });
            return self.persist(&state).await;
        }
        if let Some(entry) = state.checkpoint_mut(source_id, file_id) {
            entry.last_run_at = Utc::now();
            entry.last_run_outcome = outcome;
            if outcome == RunOutcome::Succeeded {
                entry.last_processed_mod_time = Some(mod_time);
            }
        }
        self.persist(&state).await
    }

    async fn last_checkpoint(
        &self,
        source_id: &str,
        file_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .checkpoint(source_id, file_id)
            .and_then(|cp| cp.last_processed_mod_time))
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedReport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub already_archived: bool,
}

/// Immutable archive of raw report blobs, hash-addressed under the source
/// id so any ingest run can be replayed and audited.
#[derive(Debug, Clone)]
pub struct ReportArchive {
    root: PathBuf,
}

impl ReportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn relative_path(
        source_id: &str,
        received_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = received_at.format("%Y%m%d_%H%M%S");
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source_id).join(format!("{stamp}_{content_hash}.{ext}"))
    }

    /// Write a blob under its content hash with an atomic temp-file rename.
    /// A blob already present (same hash, same stamp) is left untouched.
    pub async fn archive(
        &self,
        source_id: &str,
        received_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedReport> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(source_id, received_at, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .context("archive path always has a parent")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            debug!(path = %relative_path.display(), "report already archived");
            return Ok(ArchivedReport {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                already_archived: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedReport {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                already_archived: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedReport {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    already_archived: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming temp archive file to {}", absolute_path.display())
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Auth-shaped statuses signal a credential problem rather than a
    /// transient connection fault.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            FetchError::HttpStatus { status, .. } if *status == 401 || *status == 403
        )
    }
}

/// Retrying HTTP transport for the drive poller's credential, listing, and
/// download calls.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(&self, url: &str, bearer: Option<&str>) -> Result<Vec<u8>, FetchError> {
        let response = self
            .execute_with_retry(|| {
                let mut req = self.client.get(url);
                if let Some(token) = bearer {
                    req = req.bearer_auth(token);
                }
                req
            })
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        let response = self
            .execute_with_retry(|| {
                let mut req = self.client.get(url);
                if let Some(token) = bearer {
                    req = req.bearer_auth(token);
                }
                req
            })
            .await?;
        Ok(response.json().await?)
    }

    pub async fn get_json_with_query<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        let response = self
            .execute_with_retry(|| {
                let mut req = self.client.get(url).query(query);
                if let Some(token) = bearer {
                    req = req.bearer_auth(token);
                }
                req
            })
            .await?;
        Ok(response.json().await?)
    }

    pub async fn post_form<T: DeserializeOwned>(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let response = self
            .execute_with_retry(|| self.client.post(url).form(form))
            .await?;
        Ok(response.json().await?)
    }

    async fn execute_with_retry<F>(&self, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let url = response.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_transport_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Transport(err));
                }
            }
        }

        Err(FetchError::Transport(
            last_transport_error.expect("retry loop captures a transport error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use mcsr_core::{MarketingFlags, SourceKind, StaffRef};
    use tempfile::tempdir;

    fn record(reference: &str, net: f64) -> SaleRecord {
        SaleRecord {
            id: Uuid::new_v4(),
            source_channel: SourceKind::Online,
            order_date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            actual_order_date: None,
            order_reference: Some(reference.to_string()),
            sales_channel_label: None,
            payment_gateway: None,
            net_amount: net,
            total_amount: None,
            shipping_amount: None,
            staff: None,
            customer_email: None,
            marketing: MarketingFlags::default(),
            ingested_at: Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn insert_if_new_skips_exact_duplicates() {
        let store = MemoryStore::new();
        let rec = record("R1", 100.0);
        let key = rec.natural_key();

        assert_eq!(
            store.insert_if_new(&rec, &key).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_new(&rec, &key).await.unwrap(),
            InsertOutcome::Skipped
        );
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn upsert_fills_nulls_without_duplicating() {
        let store = MemoryStore::new();
        let sparse = record("R1", 100.0);
        let key = sparse.natural_key();
        store.upsert(&sparse, &key).await.unwrap();

        let mut richer = record("R1", 100.0);
        richer.staff = Some(StaffRef::from_column("Dana"));
        richer.total_amount = Some(110.0);
        assert_eq!(
            store.upsert(&richer, &key).await.unwrap(),
            UpsertOutcome::Merged
        );

        assert_eq!(store.record_count().await, 1);
        let stored = store.get(&key).await.unwrap();
        assert_eq!(stored.staff.unwrap().display_name, "Dana");
        assert_eq!(stored.total_amount, Some(110.0));
    }

    #[tokio::test]
    async fn failed_runs_never_advance_the_checkpoint_mod_time() {
        let store = MemoryStore::new();
        let t1 = Utc.with_ymd_and_hms(2026, 2, 1, 6, 0, 0).single().unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 2, 1, 7, 0, 0).single().unwrap();

        store
            .record_checkpoint("drive", "file-1", t1, RunOutcome::Succeeded)
            .await
            .unwrap();
        store
            .record_checkpoint("drive", "file-1", t2, RunOutcome::Failed)
            .await
            .unwrap();

        assert_eq!(store.last_checkpoint("drive", "file-1").await.unwrap(), Some(t1));
        let cp = store.checkpoint("drive", "file-1").await.unwrap();
        assert_eq!(cp.last_run_outcome, RunOutcome::Failed);
    }

    #[tokio::test]
    async fn first_failed_run_creates_no_checkpoint() {
        let store = MemoryStore::new();
        let t = Utc.with_ymd_and_hms(2026, 2, 1, 6, 0, 0).single().unwrap();

        store
            .record_checkpoint("drive", "file-9", t, RunOutcome::Failed)
            .await
            .unwrap();
        assert!(store.checkpoint("drive", "file-9").await.is_none());
        assert_eq!(store.last_checkpoint("drive", "file-9").await.unwrap(), None);

        store
            .record_checkpoint("drive", "file-9", t, RunOutcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(
            store.last_checkpoint("drive", "file-9").await.unwrap(),
            Some(t)
        );
    }

    #[tokio::test]
    async fn file_store_applies_the_same_checkpoint_birth_rule() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::open(dir.path().join("sales.json"))
            .await
            .unwrap();
        let t = Utc.with_ymd_and_hms(2026, 2, 1, 6, 0, 0).single().unwrap();

        store
            .record_checkpoint("drive", "f1", t, RunOutcome::Failed)
            .await
            .unwrap();
        assert_eq!(store.last_checkpoint("drive", "f1").await.unwrap(), None);

        store
            .record_checkpoint("drive", "f1", t, RunOutcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(store.last_checkpoint("drive", "f1").await.unwrap(), Some(t));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sales.json");

        let rec = record("R1", 100.0);
        let key = rec.natural_key();
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.insert_if_new(&rec, &key).await.unwrap();
            store
                .record_checkpoint(
                    "drive",
                    "file-1",
                    Utc.with_ymd_and_hms(2026, 2, 1, 6, 0, 0).single().unwrap(),
                    RunOutcome::Succeeded,
                )
                .await
                .unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.record_count().await, 1);
        assert_eq!(
            reopened.insert_if_new(&rec, &key).await.unwrap(),
            InsertOutcome::Skipped
        );
        assert!(reopened
            .last_checkpoint("drive", "file-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn archive_is_idempotent_by_content_hash() {
        let dir = tempdir().expect("tempdir");
        let archive = ReportArchive::new(dir.path());
        let received_at = Utc.with_ymd_and_hms(2026, 2, 1, 6, 0, 0).single().unwrap();

        let first = archive
            .archive("mailbox", received_at, "csv", b"Name,Net sales\n")
            .await
            .unwrap();
        let second = archive
            .archive("mailbox", received_at, "csv", b"Name,Net sales\n")
            .await
            .unwrap();

        assert!(!first.already_archived);
        assert!(second.already_archived);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn auth_statuses_classify_as_credential_failures() {
        let err = FetchError::HttpStatus {
            status: 401,
            url: "https://drive.example/token".into(),
        };
        assert!(err.is_auth_failure());
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
