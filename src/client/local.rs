//! On-disk queue emulator used when no API token is configured.
//!
//! Queues live under `<root>/request_queues/<queueId>/`, one JSON record
//! per request plus an optional `__metadata__.json`.  The in-memory map is
//! the source of truth; disk is a write-through copy that is loaded back on
//! the first open of a queue.  Everything single-process: the emulator
//! never reports multiple clients.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{invalid_argument, ApiError};
use crate::request::{unique_key_to_request_id, Request};

use super::{
    BatchOperationResults, ListHeadResult, QueueInfo, QueueOperationInfo, RequestListPage,
    RequestQueueClient,
};

/// File name of the per-queue metadata record.
pub(crate) const METADATA_FILE: &str = "__metadata__.json";

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRequest {
    id: String,
    /// Head sort key: now-millis for normal adds, negative now-millis for
    /// forefront adds, absent once the request is handled.
    order_no: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lock_expires_at: Option<DateTime<Utc>>,
    request: Request,
}

impl StoredRequest {
    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at.is_some_and(|expires| expires > now)
    }

    fn is_handled(&self) -> bool {
        self.request.handled_at.is_some()
    }

    /// The embedded request with its id and unique key filled in.
    fn to_request(&self) -> Request {
        let mut request = self.request.clone();
        request.id = Some(self.id.clone());
        request
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueMetadata {
    id: String,
    #[serde(default)]
    name: Option<String>,
    created_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    item_count: usize,
}

/// Strictly increasing head sort key.  Wall-clock microseconds, bumped past
/// the previous value so that two adds in the same tick keep their order.
fn signed_order_no(forefront: bool) -> i64 {
    static LAST_ORDER_NO: AtomicI64 = AtomicI64::new(0);
    let mut candidate = Utc::now().timestamp_micros();
    let mut last = LAST_ORDER_NO.load(Ordering::Relaxed);
    loop {
        if candidate <= last {
            candidate = last + 1;
        }
        match LAST_ORDER_NO.compare_exchange(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(actual) => last = actual,
        }
    }
    if forefront {
        -candidate
    } else {
        candidate
    }
}

// ---------------------------------------------------------------------------
// Queue store
// ---------------------------------------------------------------------------

struct StoreState {
    name: Option<String>,
    records: HashMap<String, StoredRequest>,
    created_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

/// One emulated queue: in-memory records with optional write-through
/// persistence.
pub(crate) struct QueueStore {
    id: String,
    dir: PathBuf,
    persist: bool,
    write_metadata: bool,
    state: Mutex<StoreState>,
}

impl QueueStore {
    fn new(id: &str, name: Option<&str>, dir: PathBuf, persist: bool, write_metadata: bool) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            dir,
            persist,
            write_metadata,
            state: Mutex::new(StoreState {
                name: name.map(str::to_string),
                records: HashMap::new(),
                created_at: now,
                accessed_at: now,
                modified_at: now,
            }),
        }
    }

    fn info(&self) -> QueueInfo {
        let state = self.state.lock();
        QueueInfo {
            id: self.id.clone(),
            name: state.name.clone(),
            created_at: Some(state.created_at),
            accessed_at: Some(state.accessed_at),
            modified_at: Some(state.modified_at),
            total_request_count: state.records.len() as u64,
            handled_request_count: state
                .records
                .values()
                .filter(|record| record.is_handled())
                .count() as u64,
            had_multiple_clients: false,
        }
    }

    /// Serialize a record and persist it, if persistence is on.
    async fn persist_record(&self, record_json: Option<(String, String)>) -> Result<()> {
        let Some((id, contents)) = record_json else {
            return Ok(());
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create queue dir: {}", self.dir.display()))?;
        let path = self.dir.join(format!("{id}.json"));
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("failed to write request record: {}", path.display()))?;
        Ok(())
    }

    async fn remove_record_file(&self, id: &str) -> Result<()> {
        if !self.persist {
            return Ok(());
        }
        let path = self.dir.join(format!("{id}.json"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to delete request record: {}", path.display()))),
        }
    }

    async fn persist_metadata(&self) -> Result<()> {
        if !self.persist || !self.write_metadata {
            return Ok(());
        }
        let metadata = {
            let state = self.state.lock();
            QueueMetadata {
                id: self.id.clone(),
                name: state.name.clone(),
                created_at: state.created_at,
                accessed_at: state.accessed_at,
                modified_at: state.modified_at,
                item_count: state.records.len(),
            }
        };
        tokio::fs::create_dir_all(&self.dir).await?;
        let contents = serde_json::to_string_pretty(&metadata)?;
        tokio::fs::write(self.dir.join(METADATA_FILE), contents)
            .await
            .context("failed to write queue metadata")?;
        Ok(())
    }

    /// Load records (and metadata, if present) from the queue directory.
    async fn load_from_disk(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read queue dir: {}", self.dir.display())))
            }
        };

        let mut records = Vec::new();
        let mut metadata: Option<QueueMetadata> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            if path.file_name().and_then(|n| n.to_str()) == Some(METADATA_FILE) {
                metadata = serde_json::from_str(&contents).ok();
                continue;
            }
            match serde_json::from_str::<StoredRequest>(&contents) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable request record");
                }
            }
        }

        let mut state = self.state.lock();
        for record in records {
            state.records.insert(record.id.clone(), record);
        }
        if let Some(metadata) = metadata {
            state.name = metadata.name;
            state.created_at = metadata.created_at;
            state.accessed_at = metadata.accessed_at;
            state.modified_at = metadata.modified_at;
        }
        debug!(queue_id = %self.id, records = state.records.len(), "loaded queue from disk");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Emulator
// ---------------------------------------------------------------------------

/// Manages every locally emulated queue under one storage root.
pub struct LocalQueueEmulator {
    root: PathBuf,
    persist: bool,
    write_metadata: bool,
    stores: Mutex<HashMap<String, Arc<QueueStore>>>,
}

impl LocalQueueEmulator {
    pub fn new(config: &Config) -> Self {
        Self {
            root: PathBuf::from(&config.local_storage_dir),
            persist: config.persist_storage,
            write_metadata: config.write_metadata,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Directory that holds one queue's records.
    pub fn queue_dir(&self, queue_id: &str) -> PathBuf {
        self.root.join("request_queues").join(queue_id)
    }

    /// Fetch a queue by id, or `None` if it does not exist in memory or on
    /// disk.
    pub async fn get_queue(&self, queue_id: &str) -> Result<Option<QueueInfo>> {
        if let Some(store) = self.stores.lock().get(queue_id) {
            return Ok(Some(store.info()));
        }
        if self.persist {
            let dir = self.queue_dir(queue_id);
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                let store = self.open_store(queue_id, None).await?;
                return Ok(Some(store.info()));
            }
        }
        Ok(None)
    }

    /// Fetch a queue by name, creating it if necessary.  Local queue ids
    /// equal their names.
    pub async fn get_or_create_queue(&self, name: &str) -> Result<QueueInfo> {
        let store = self.open_store(name, Some(name)).await?;
        store.persist_metadata().await?;
        Ok(store.info())
    }

    /// Like [`get_or_create_queue`], but keyed by id with no name; used for
    /// the configured default queue.
    pub async fn get_or_create_default(&self, queue_id: &str) -> Result<QueueInfo> {
        let store = self.open_store(queue_id, None).await?;
        store.persist_metadata().await?;
        Ok(store.info())
    }

    /// Build the [`RequestQueueClient`] for one queue.
    pub async fn queue_client(
        self: &Arc<Self>,
        queue_id: &str,
    ) -> Result<LocalQueueClient> {
        let store = self.open_store(queue_id, None).await?;
        Ok(LocalQueueClient {
            emulator: Arc::clone(self),
            store,
        })
    }

    async fn open_store(&self, queue_id: &str, name: Option<&str>) -> Result<Arc<QueueStore>> {
        if let Some(store) = self.stores.lock().get(queue_id) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(QueueStore::new(
            queue_id,
            name,
            self.queue_dir(queue_id),
            self.persist,
            self.write_metadata,
        ));
        if self.persist {
            store.load_from_disk().await?;
        }
        let mut stores = self.stores.lock();
        // Another caller may have opened the store while we were loading.
        if let Some(existing) = stores.get(queue_id) {
            return Ok(Arc::clone(existing));
        }
        stores.insert(queue_id.to_string(), Arc::clone(&store));
        Ok(store)
    }

    fn rename_store(&self, queue_id: &str, new_name: &str) -> Result<()> {
        let stores = self.stores.lock();
        let taken = stores.values().any(|store| {
            store.id != queue_id && store.state.lock().name.as_deref() == Some(new_name)
        });
        if taken {
            return Err(ApiError {
                status_code: 400,
                kind: "duplicate-name".to_string(),
                message: format!("a request queue named \"{new_name}\" already exists"),
                attempt: 1,
            }
            .into());
        }
        if let Some(store) = stores.get(queue_id) {
            let mut state = store.state.lock();
            state.name = Some(new_name.to_string());
            state.modified_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_store(&self, queue_id: &str) -> Result<()> {
        self.stores.lock().remove(queue_id);
        if self.persist {
            let dir = self.queue_dir(queue_id);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("failed to delete queue dir: {}", dir.display())))
                }
            }
        }
        debug!(%queue_id, "local queue deleted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-queue client
// ---------------------------------------------------------------------------

/// [`RequestQueueClient`] implementation over one emulated queue.
pub struct LocalQueueClient {
    emulator: Arc<LocalQueueEmulator>,
    store: Arc<QueueStore>,
}

impl LocalQueueClient {
    /// Select the unhandled, unlocked records in head order.
    fn head_records(&self, limit: usize, lock_secs: Option<u64>) -> ListHeadResult {
        let now = Utc::now();
        let mut state = self.store.state.lock();
        state.accessed_at = now;
        let modified_at = state.modified_at;

        let mut head_ids: Vec<(i64, String)> = state
            .records
            .values()
            .filter(|record| record.order_no.is_some() && !record.is_locked(now))
            .map(|record| (record.order_no.unwrap_or_default(), record.id.clone()))
            .collect();
        head_ids.sort();

        let mut items = Vec::new();
        for (_, id) in head_ids.into_iter().take(limit) {
            let Some(record) = state.records.get_mut(&id) else {
                continue;
            };
            if let Some(lock_secs) = lock_secs {
                record.lock_expires_at = Some(now + ChronoDuration::seconds(lock_secs as i64));
            }
            items.push(record.to_request());
        }

        ListHeadResult {
            items,
            queue_modified_at: modified_at,
            had_multiple_clients: false,
        }
    }
}

#[async_trait::async_trait]
impl RequestQueueClient for LocalQueueClient {
    async fn get(&self) -> Result<Option<QueueInfo>> {
        Ok(Some(self.store.info()))
    }

    async fn update(&self, name: &str) -> Result<QueueInfo> {
        self.emulator.rename_store(&self.store.id, name)?;
        self.store.persist_metadata().await?;
        Ok(self.store.info())
    }

    async fn delete(&self) -> Result<()> {
        self.emulator.delete_store(&self.store.id).await
    }

    async fn list_head(&self, limit: usize) -> Result<ListHeadResult> {
        Ok(self.head_records(limit, None))
    }

    async fn list_and_lock_head(&self, lock_secs: u64, limit: usize) -> Result<ListHeadResult> {
        Ok(self.head_records(limit, Some(lock_secs)))
    }

    async fn add_request(&self, request: &Request, forefront: bool) -> Result<QueueOperationInfo> {
        let unique_key = request
            .unique_key
            .as_deref()
            .ok_or_else(|| invalid_argument("request.uniqueKey is required"))?;
        let id = unique_key_to_request_id(unique_key);

        let (info, record_json) = {
            let mut state = self.store.state.lock();
            if let Some(existing) = state.records.get(&id) {
                trace!(request_id = %id, "add hit an existing request");
                (
                    QueueOperationInfo {
                        request_id: id.clone(),
                        was_already_present: true,
                        was_already_handled: existing.is_handled(),
                        unique_key: Some(unique_key.to_string()),
                    },
                    None,
                )
            } else {
                let mut stored = request.clone();
                stored.id = Some(id.clone());
                let record = StoredRequest {
                    id: id.clone(),
                    order_no: if stored.handled_at.is_some() {
                        None
                    } else {
                        Some(signed_order_no(forefront))
                    },
                    lock_expires_at: None,
                    request: stored,
                };
                let json = if self.store.persist {
                    Some((id.clone(), serde_json::to_string_pretty(&record)?))
                } else {
                    None
                };
                state.records.insert(id.clone(), record);
                state.modified_at = Utc::now();
                (
                    QueueOperationInfo {
                        request_id: id.clone(),
                        was_already_present: false,
                        was_already_handled: false,
                        unique_key: Some(unique_key.to_string()),
                    },
                    json,
                )
            }
        };

        self.store.persist_record(record_json).await?;
        self.store.persist_metadata().await?;
        Ok(info)
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<Request>> {
        let mut state = self.store.state.lock();
        state.accessed_at = Utc::now();
        Ok(state.records.get(request_id).map(StoredRequest::to_request))
    }

    async fn update_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo> {
        let request_id = request
            .id
            .as_deref()
            .ok_or_else(|| invalid_argument("request.id is required"))?;

        let (info, record_json) = {
            let mut state = self.store.state.lock();
            let Some(record) = state.records.get_mut(request_id) else {
                return Err(ApiError {
                    status_code: 404,
                    kind: "record-not-found".to_string(),
                    message: format!("request \"{request_id}\" does not exist"),
                    attempt: 1,
                }
                .into());
            };

            let was_already_handled = record.is_handled();
            record.request = request.clone();
            record.order_no = if request.handled_at.is_some() {
                None
            } else {
                Some(signed_order_no(forefront))
            };
            let json = if self.store.persist {
                Some((record.id.clone(), serde_json::to_string_pretty(&record)?))
            } else {
                None
            };
            state.modified_at = Utc::now();
            (
                QueueOperationInfo {
                    request_id: request_id.to_string(),
                    was_already_present: true,
                    was_already_handled,
                    unique_key: request.unique_key.clone(),
                },
                json,
            )
        };

        self.store.persist_record(record_json).await?;
        self.store.persist_metadata().await?;
        Ok(info)
    }

    async fn delete_request(&self, request_id: &str) -> Result<()> {
        let removed = {
            let mut state = self.store.state.lock();
            let removed = state.records.remove(request_id).is_some();
            if removed {
                state.modified_at = Utc::now();
            }
            removed
        };
        if removed {
            self.store.remove_record_file(request_id).await?;
            self.store.persist_metadata().await?;
        }
        Ok(())
    }

    async fn prolong_request_lock(
        &self,
        request_id: &str,
        lock_secs: u64,
        forefront: bool,
    ) -> Result<()> {
        let mut state = self.store.state.lock();
        let Some(record) = state.records.get_mut(request_id) else {
            return Err(ApiError {
                status_code: 404,
                kind: "record-not-found".to_string(),
                message: format!("request \"{request_id}\" does not exist"),
                attempt: 1,
            }
            .into());
        };
        record.lock_expires_at = Some(Utc::now() + ChronoDuration::seconds(lock_secs as i64));
        if forefront {
            record.order_no = Some(signed_order_no(true));
        }
        Ok(())
    }

    async fn delete_request_lock(&self, request_id: &str, forefront: bool) -> Result<()> {
        let mut state = self.store.state.lock();
        if let Some(record) = state.records.get_mut(request_id) {
            record.lock_expires_at = None;
            if forefront && !record.is_handled() {
                record.order_no = Some(signed_order_no(true));
            }
        }
        Ok(())
    }

    async fn batch_add_requests(
        &self,
        requests: &[Request],
        forefront: bool,
    ) -> Result<BatchOperationResults> {
        let mut results = BatchOperationResults::default();
        for request in requests {
            if request.unique_key.is_none() {
                results.unprocessed_requests.push(request.clone());
                continue;
            }
            let info = self.add_request(request, forefront).await?;
            results.processed_requests.push(info);
        }
        Ok(results)
    }

    async fn batch_delete_requests(&self, request_ids: &[String]) -> Result<BatchOperationResults> {
        let mut results = BatchOperationResults::default();
        for request_id in request_ids {
            let existing = {
                let state = self.store.state.lock();
                state
                    .records
                    .get(request_id)
                    .map(|record| (record.is_handled(), record.request.unique_key.clone()))
            };
            let Some((was_handled, unique_key)) = existing else {
                continue;
            };
            self.delete_request(request_id).await?;
            results.processed_requests.push(QueueOperationInfo {
                request_id: request_id.clone(),
                was_already_present: true,
                was_already_handled: was_handled,
                unique_key,
            });
        }
        Ok(results)
    }

    async fn list_requests(
        &self,
        limit: usize,
        exclusive_start_id: Option<&str>,
    ) -> Result<RequestListPage> {
        let state = self.store.state.lock();
        let mut ids: Vec<&String> = state.records.keys().collect();
        ids.sort();
        let items: Vec<Request> = ids
            .into_iter()
            .filter(|id| exclusive_start_id.is_none_or(|start| id.as_str() > start))
            .take(limit)
            .filter_map(|id| state.records.get(id).map(StoredRequest::to_request))
            .collect();
        Ok(RequestListPage {
            count: items.len(),
            limit,
            exclusive_start_id: exclusive_start_id.map(str::to_string),
            items,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn test_config(dir: &Path, persist: bool, write_metadata: bool) -> Config {
        Config {
            local_storage_dir: dir.display().to_string(),
            persist_storage: persist,
            write_metadata,
            ..Config::default()
        }
    }

    async fn client_in(dir: &Path) -> (Arc<LocalQueueEmulator>, LocalQueueClient) {
        let emulator = Arc::new(LocalQueueEmulator::new(&test_config(dir, true, true)));
        emulator.get_or_create_default("default").await.unwrap();
        let client = emulator.queue_client("default").await.unwrap();
        (emulator, client)
    }

    fn request_with_key(url: &str) -> Request {
        let mut request = Request::from_url(url);
        request.unique_key = Some(url.to_string());
        request
    }

    // ── Add / get / dedup ───────────────────────────────────────────────

    #[tokio::test]
    async fn add_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (_emulator, client) = client_in(dir.path()).await;

        let info = client
            .add_request(&request_with_key("https://example.com/a"), false)
            .await
            .unwrap();
        assert!(!info.was_already_present);
        assert!(!info.was_already_handled);

        let fetched = client.get_request(&info.request_id).await.unwrap().unwrap();
        assert_eq!(fetched.url, "https://example.com/a");
        assert_eq!(fetched.id.as_deref(), Some(info.request_id.as_str()));
    }

    #[tokio::test]
    async fn adding_same_unique_key_twice_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let (_emulator, client) = client_in(dir.path()).await;

        let request = request_with_key("https://example.com/a");
        let first = client.add_request(&request, false).await.unwrap();
        let second = client.add_request(&request, false).await.unwrap();

        assert_eq!(first.request_id, second.request_id);
        assert!(!first.was_already_present);
        assert!(second.was_already_present);
    }

    #[tokio::test]
    async fn missing_request_is_absent_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_emulator, client) = client_in(dir.path()).await;
        assert!(client.get_request("nope").await.unwrap().is_none());
    }

    // ── Head ordering ───────────────────────────────────────────────────

    #[tokio::test]
    async fn head_is_fifo_with_forefront_first() {
        let dir = tempfile::tempdir().unwrap();
        let (_emulator, client) = client_in(dir.path()).await;

        let a = client
            .add_request(&request_with_key("https://example.com/a"), false)
            .await
            .unwrap();
        let b = client
            .add_request(&request_with_key("https://example.com/b"), false)
            .await
            .unwrap();
        let front = client
            .add_request(&request_with_key("https://example.com/front"), true)
            .await
            .unwrap();

        let head = client.list_head(10).await.unwrap();
        let ids: Vec<_> = head.items.iter().filter_map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![front.request_id, a.request_id, b.request_id]);
        assert!(!head.had_multiple_clients);
    }

    #[tokio::test]
    async fn handled_requests_leave_the_head() {
        let dir = tempfile::tempdir().unwrap();
        let (_emulator, client) = client_in(dir.path()).await;

        let info = client
            .add_request(&request_with_key("https://example.com/a"), false)
            .await
            .unwrap();
        let mut handled = client.get_request(&info.request_id).await.unwrap().unwrap();
        handled.handled_at = Some(Utc::now());
        let update = client.update_request(&handled, false).await.unwrap();
        assert!(!update.was_already_handled);

        assert!(client.list_head(10).await.unwrap().items.is_empty());

        // A second handled update reports the previous handled state.
        let update = client.update_request(&handled, false).await.unwrap();
        assert!(update.was_already_handled);
    }

    #[tokio::test]
    async fn lock_hides_requests_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let (_emulator, client) = client_in(dir.path()).await;

        let info = client
            .add_request(&request_with_key("https://example.com/a"), false)
            .await
            .unwrap();

        let locked = client.list_and_lock_head(60, 10).await.unwrap();
        assert_eq!(locked.items.len(), 1);
        assert!(client.list_head(10).await.unwrap().items.is_empty());

        client
            .delete_request_lock(&info.request_id, false)
            .await
            .unwrap();
        assert_eq!(client.list_head(10).await.unwrap().items.len(), 1);
    }

    // ── Persistence ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn records_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let request_id = {
            let (_emulator, client) = client_in(dir.path()).await;
            client
                .add_request(&request_with_key("https://example.com/a"), false)
                .await
                .unwrap()
                .request_id
        };

        let emulator = Arc::new(LocalQueueEmulator::new(&test_config(dir.path(), true, true)));
        let client = emulator.queue_client("default").await.unwrap();
        let fetched = client.get_request(&request_id).await.unwrap().unwrap();
        assert_eq!(fetched.url, "https://example.com/a");
    }

    #[tokio::test]
    async fn metadata_file_is_maintained() {
        let dir = tempfile::tempdir().unwrap();
        let (emulator, client) = client_in(dir.path()).await;
        client
            .add_request(&request_with_key("https://example.com/a"), false)
            .await
            .unwrap();

        let metadata_path = emulator.queue_dir("default").join(METADATA_FILE);
        let contents = tokio::fs::read_to_string(&metadata_path).await.unwrap();
        let metadata: QueueMetadata = serde_json::from_str(&contents).unwrap();
        assert_eq!(metadata.id, "default");
        assert_eq!(metadata.item_count, 1);
    }

    #[tokio::test]
    async fn in_memory_mode_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let emulator = Arc::new(LocalQueueEmulator::new(&test_config(dir.path(), false, true)));
        let client = emulator.queue_client("default").await.unwrap();
        client
            .add_request(&request_with_key("https://example.com/a"), false)
            .await
            .unwrap();

        assert!(!emulator.queue_dir("default").exists());
    }

    // ── Queue-level operations ──────────────────────────────────────────

    #[tokio::test]
    async fn rename_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let emulator = Arc::new(LocalQueueEmulator::new(&test_config(dir.path(), true, false)));
        emulator.get_or_create_queue("first").await.unwrap();
        emulator.get_or_create_queue("second").await.unwrap();

        let client = emulator.queue_client("second").await.unwrap();
        let err = client.update("first").await.unwrap_err();
        let api = err.downcast_ref::<ApiError>().unwrap();
        assert_eq!(api.kind, "duplicate-name");
    }

    #[tokio::test]
    async fn delete_removes_store_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (emulator, client) = client_in(dir.path()).await;
        client
            .add_request(&request_with_key("https://example.com/a"), false)
            .await
            .unwrap();
        assert!(emulator.queue_dir("default").exists());

        client.delete().await.unwrap();
        assert!(!emulator.queue_dir("default").exists());
        // Idempotent.
        client.delete().await.unwrap();
    }

    // ── Batch and listing ───────────────────────────────────────────────

    #[tokio::test]
    async fn batch_add_reports_unprocessed_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (_emulator, client) = client_in(dir.path()).await;

        let valid = request_with_key("https://example.com/a");
        let invalid = Request::from_url("https://example.com/no-key");
        let results = client
            .batch_add_requests(&[valid, invalid], false)
            .await
            .unwrap();
        assert_eq!(results.processed_requests.len(), 1);
        assert_eq!(results.unprocessed_requests.len(), 1);
    }

    #[tokio::test]
    async fn list_requests_pages_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let (_emulator, client) = client_in(dir.path()).await;
        for n in 0..5 {
            client
                .add_request(&request_with_key(&format!("https://example.com/{n}")), false)
                .await
                .unwrap();
        }

        let first = client.list_requests(3, None).await.unwrap();
        assert_eq!(first.count, 3);
        let last_id = first.items.last().unwrap().id.clone().unwrap();
        let second = client.list_requests(3, Some(&last_id)).await.unwrap();
        assert_eq!(second.count, 2);

        let mut all: Vec<String> = first
            .items
            .iter()
            .chain(second.items.iter())
            .filter_map(|r| r.id.clone())
            .collect();
        let before = all.len();
        all.dedup();
        assert_eq!(all.len(), before);
    }
}
