//! Client-side coordinator for one remote request queue.
//!
//! [`RequestQueue`] owns all per-queue state on this client: the buffered
//! head window, the set of requests currently dispatched to the caller, a
//! short cache of recently handled ids that suppresses re-dispatch while
//! the remote head index catches up, and a bounded request cache that makes
//! repeated adds of the same URL free.  All of it sits behind one mutex
//! that is never held across a suspension point; the network calls go
//! through the [`RequestQueueClient`] the queue was opened with.
//!
//! The remote store is eventually consistent, so emptiness is a protocol,
//! not a lookup: see [`is_finished`](RequestQueue::is_finished) and the
//! head-window maintenance in the `head` module.

mod head;

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::LruCache;
use crate::client::{QueueInfo, QueueOperationInfo, RequestQueueClient};
use crate::error::invalid_argument;
use crate::request::{compute_unique_key, unique_key_to_request_id, Request};
use crate::storage::{BackendKind, StorageManager};
use crate::timers::defer;

pub(crate) use head::{HeadWindow, SharedHeadQuery};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on the request cache.
pub(crate) const MAX_CACHED_REQUESTS: usize = 1_000_000;

/// Upper bound on the recently-handled cache.
pub(crate) const RECENTLY_HANDLED_CACHE_SIZE: usize = 1_000;

/// Minimum number of ids to ask for when refilling the head window.
pub(crate) const QUERY_HEAD_MIN_LENGTH: usize = 100;

/// Head query limit per request currently in progress.
pub(crate) const QUERY_HEAD_BUFFER: usize = 3;

/// How long the remote head index may trail the main request table.
pub(crate) const API_PROCESSED_REQUESTS_DELAY: Duration = Duration::from_secs(10);

/// Consistency retries before an unconfirmed "finished" is given up on.
pub(crate) const MAX_QUERIES_FOR_CONSISTENCY: u32 = 6;

/// Hard cap the service places on one head query.
pub(crate) const REQUEST_QUEUE_HEAD_MAX_LIMIT: usize = 1_000;

/// Delay that lets the remote store's replicas catch up with a write.
pub(crate) const STORAGE_CONSISTENCY_DELAY: Duration = Duration::from_secs(3);

/// Inactivity window after which stuck in-progress state is reset.
pub(crate) const DEFAULT_INTERNAL_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Entry in the request cache, keyed by the id *derived* from the unique
/// key (not by the remote id).
#[derive(Debug, Clone)]
pub(crate) struct CachedRequestInfo {
    pub id: String,
    pub unique_key: String,
    pub is_handled: bool,
    pub was_already_handled: bool,
}

pub(crate) struct QueueState {
    pub head: HeadWindow,
    pub in_progress: HashSet<String>,
    pub recently_handled: LruCache<bool>,
    pub requests_cache: LruCache<CachedRequestInfo>,
    /// Local estimates, only trusted for the single-client termination
    /// shortcut.  Monotonically non-decreasing between resets.
    pub assumed_total_count: u64,
    pub assumed_handled_count: u64,
    pub last_activity: chrono::DateTime<Utc>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            head: HeadWindow::default(),
            in_progress: HashSet::new(),
            recently_handled: LruCache::new(RECENTLY_HANDLED_CACHE_SIZE),
            requests_cache: LruCache::new(MAX_CACHED_REQUESTS),
            assumed_total_count: 0,
            assumed_handled_count: 0,
            last_activity: Utc::now(),
        }
    }

    fn reset(&mut self) {
        self.head.clear();
        self.in_progress.clear();
        self.recently_handled.clear();
        self.requests_cache.clear();
        self.assumed_total_count = 0;
        self.assumed_handled_count = 0;
        self.last_activity = Utc::now();
    }

    fn cache_request(&mut self, cache_key: String, info: &QueueOperationInfo, is_handled: bool) {
        self.requests_cache.put(
            cache_key,
            CachedRequestInfo {
                id: info.request_id.clone(),
                unique_key: info.unique_key.clone().unwrap_or_default(),
                is_handled,
                was_already_handled: info.was_already_handled,
            },
        );
    }
}

pub(crate) struct Registration {
    pub manager: Weak<StorageManager>,
    pub kind: BackendKind,
}

// ---------------------------------------------------------------------------
// RequestQueue
// ---------------------------------------------------------------------------

/// The coordinator for one named queue.
///
/// Multiple instances for distinct queues run independently; within one
/// instance every operation takes `&self` and serializes on the internal
/// state lock, with head refills additionally deduplicated onto a single
/// in-flight query.
pub struct RequestQueue {
    id: String,
    name: Option<String>,
    client: Arc<dyn RequestQueueClient>,
    client_key: String,
    internal_timeout: Duration,
    pub(crate) state: Arc<Mutex<QueueState>>,
    pub(crate) head_query: Arc<Mutex<Option<SharedHeadQuery>>>,
    registration: Mutex<Option<Registration>>,
}

impl RequestQueue {
    /// Create a coordinator over an already-built resource client.
    ///
    /// Most callers go through [`StorageManager::open_request_queue`]
    /// instead, which also picks the backend and registers the instance.
    pub fn new(
        id: impl Into<String>,
        name: Option<String>,
        client: Arc<dyn RequestQueueClient>,
    ) -> Self {
        Self::with_client_key(id, name, client, Uuid::new_v4().simple().to_string())
    }

    pub(crate) fn with_client_key(
        id: impl Into<String>,
        name: Option<String>,
        client: Arc<dyn RequestQueueClient>,
        client_key: String,
    ) -> Self {
        Self {
            id: id.into(),
            name,
            client,
            client_key,
            internal_timeout: DEFAULT_INTERNAL_TIMEOUT,
            state: Arc::new(Mutex::new(QueueState::new())),
            head_query: Arc::new(Mutex::new(None)),
            registration: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Opaque identifier distinguishing this coordinator instance from
    /// other clients of the same remote queue.
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub(crate) fn set_registration(&self, registration: Registration) {
        *self.registration.lock() = Some(registration);
    }

    /// Fetch the queue's remote metadata.
    pub async fn info(&self) -> Result<Option<QueueInfo>> {
        self.client.get().await
    }

    // -- add ----------------------------------------------------------------

    /// Enqueue a request, deduplicating on its unique key.
    ///
    /// When the unique key was seen before (locally cached or already
    /// present remotely) the returned info has `was_already_present` set
    /// and no duplicate is created.
    pub async fn add_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo> {
        if request.url.trim().is_empty() {
            return Err(invalid_argument("request.url must be a non-empty string"));
        }

        let unique_key = request
            .unique_key
            .clone()
            .unwrap_or_else(|| compute_unique_key(&request.url, false));
        let cache_key = unique_key_to_request_id(&unique_key);

        {
            let mut state = self.state.lock();
            state.last_activity = Utc::now();
            if let Some(cached) = state.requests_cache.get(&cache_key) {
                return Ok(QueueOperationInfo {
                    request_id: cached.id.clone(),
                    was_already_present: true,
                    was_already_handled: cached.is_handled,
                    unique_key: Some(cached.unique_key.clone()),
                });
            }
        }

        let mut to_add = request.clone();
        to_add.unique_key = Some(unique_key.clone());
        let mut info = self.client.add_request(&to_add, forefront).await?;
        info.unique_key = Some(unique_key);

        let mut state = self.state.lock();
        state.cache_request(cache_key, &info, info.was_already_handled);
        if !info.was_already_handled
            && !info.was_already_present
            && !state.in_progress.contains(&info.request_id)
            && !state.recently_handled.contains(&info.request_id)
        {
            state.assumed_total_count += 1;
            state.maybe_add_request_to_head(info.request_id.clone(), forefront);
        }
        Ok(info)
    }

    // -- get ----------------------------------------------------------------

    /// Fetch a request by id; `None` when the service does not know it.
    pub async fn get_request(&self, request_id: &str) -> Result<Option<Request>> {
        self.client.get_request(request_id).await
    }

    // -- fetch next ---------------------------------------------------------

    /// Return the next request to process, or `None` when nothing is
    /// available right now.
    ///
    /// A `None` does not mean the queue is finished; a request may be in
    /// flight on another client or the head may still be replicating; use
    /// [`is_finished`](Self::is_finished) for termination.  The returned
    /// request stays tracked as in-progress until it is passed to
    /// [`mark_request_handled`](Self::mark_request_handled) or
    /// [`reclaim_request`](Self::reclaim_request).
    pub async fn fetch_next_request(&self) -> Result<Option<Request>> {
        self.ensure_head_is_non_empty(false).await?;

        let next_id = {
            let mut state = self.state.lock();
            let Some(next_id) = state.head.pop_front() else {
                return Ok(None);
            };
            // An id here and in in-progress or recently-handled means the
            // bookkeeping disagrees with the head window; dropping the
            // entry self-heals on the next head query.
            if state.in_progress.contains(&next_id) || state.recently_handled.contains(&next_id) {
                warn!(
                    queue_id = %self.id,
                    request_id = %next_id,
                    "head window returned a request that is already in progress or recently handled"
                );
                return Ok(None);
            }
            state.in_progress.insert(next_id.clone());
            state.last_activity = Utc::now();
            next_id
        };

        let request = match self.get_request(&next_id).await {
            Ok(request) => request,
            Err(err) => {
                self.state.lock().in_progress.remove(&next_id);
                return Err(err);
            }
        };

        match request {
            None => {
                // The head index got ahead of the main table.  Free the
                // slot once the store has had time to catch up; the id
                // comes back with a later head query.
                debug!(
                    queue_id = %self.id,
                    request_id = %next_id,
                    "request from the head window is not in the main table yet"
                );
                let state = Arc::clone(&self.state);
                defer(STORAGE_CONSISTENCY_DELAY, async move {
                    state.lock().in_progress.remove(&next_id);
                });
                Ok(None)
            }
            Some(request) if request.handled_at.is_some() => {
                debug!(
                    queue_id = %self.id,
                    request_id = %next_id,
                    "request was already handled by another client"
                );
                self.state.lock().recently_handled.put(next_id, true);
                Ok(None)
            }
            Some(request) => Ok(Some(request)),
        }
    }

    // -- mark handled -------------------------------------------------------

    /// Report a request returned by
    /// [`fetch_next_request`](Self::fetch_next_request) as done.
    ///
    /// Returns `None` when the request is not tracked as in-progress, which
    /// happens after a stuck-state reset or when the caller already
    /// reported it.
    pub async fn mark_request_handled(
        &self,
        request: &Request,
    ) -> Result<Option<QueueOperationInfo>> {
        let request_id = validate_id(request)?;
        let unique_key = validate_unique_key(request)?;

        {
            let mut state = self.state.lock();
            state.last_activity = Utc::now();
            if !state.in_progress.contains(&request_id) {
                warn!(
                    queue_id = %self.id,
                    %request_id,
                    "cannot mark a request handled that is not in progress"
                );
                return Ok(None);
            }
        }

        let mut to_update = request.clone();
        if to_update.handled_at.is_none() {
            to_update.handled_at = Some(Utc::now());
        }
        let mut info = self.client.update_request(&to_update, false).await?;
        info.unique_key = Some(unique_key.clone());

        let mut state = self.state.lock();
        state.in_progress.remove(&request_id);
        state.recently_handled.put(request_id, true);
        if !info.was_already_handled {
            state.assumed_handled_count += 1;
        }
        state.cache_request(unique_key_to_request_id(&unique_key), &info, true);
        Ok(Some(info))
    }

    // -- reclaim ------------------------------------------------------------

    /// Give a request back to the queue, optionally to the forefront, so it
    /// gets dispatched again.
    pub async fn reclaim_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<Option<QueueOperationInfo>> {
        let request_id = validate_id(request)?;
        let unique_key = validate_unique_key(request)?;

        {
            let mut state = self.state.lock();
            state.last_activity = Utc::now();
            if !state.in_progress.contains(&request_id) {
                warn!(
                    queue_id = %self.id,
                    %request_id,
                    "cannot reclaim a request that is not in progress"
                );
                return Ok(None);
            }
        }

        let mut info = self.client.update_request(request, forefront).await?;
        info.unique_key = Some(unique_key.clone());

        {
            let mut state = self.state.lock();
            state.cache_request(
                unique_key_to_request_id(&unique_key),
                &info,
                info.was_already_handled,
            );
        }

        // Keep the request out of the head window until the store has
        // processed the update, then make it eligible for dispatch again.
        // The handler re-checks membership: a teardown or a concurrent
        // reset may have released the slot already.
        let state = Arc::clone(&self.state);
        defer(STORAGE_CONSISTENCY_DELAY, async move {
            let mut state = state.lock();
            if state.in_progress.remove(&request_id) {
                state.maybe_add_request_to_head(request_id, forefront);
            }
        });

        Ok(Some(info))
    }

    // -- emptiness ----------------------------------------------------------

    /// Whether the head window is empty after a refill attempt.
    ///
    /// `true` here is a snapshot, not a termination signal; requests in
    /// flight on any client may still produce more work.
    pub async fn is_empty(&self) -> Result<bool> {
        self.ensure_head_is_non_empty(false).await?;
        Ok(self.state.lock().head.is_empty())
    }

    /// Whether every request in the queue has been handled.
    ///
    /// Converges despite replication lag: an empty head only counts once
    /// the store is confirmed consistent or this client can prove it was
    /// the only writer.  Also the recovery path for crashed work: after
    /// five minutes without activity, stuck in-progress state is discarded
    /// and the verdict recomputed from the service.
    pub async fn is_finished(&self) -> Result<bool> {
        let mut was_reset = false;
        {
            let mut state = self.state.lock();
            let idle = (Utc::now() - state.last_activity).to_std().unwrap_or_default();
            if !state.in_progress.is_empty() && idle > self.internal_timeout {
                warn!(
                    queue_id = %self.id,
                    in_progress = state.in_progress.len(),
                    idle_secs = idle.as_secs(),
                    "no activity for too long while requests are in progress; resetting internal state"
                );
                state.reset();
                was_reset = true;
            }
            if !state.head.is_empty() || !state.in_progress.is_empty() {
                return Ok(false);
            }
        }
        if was_reset {
            *self.head_query.lock() = None;
        }

        let consistent = self.ensure_head_is_non_empty(true).await?;
        let state = self.state.lock();
        Ok(consistent && state.head.is_empty() && state.in_progress.is_empty())
    }

    // -- drop ---------------------------------------------------------------

    /// Delete the queue on the service and deregister this instance.
    pub async fn drop_queue(&self) -> Result<()> {
        self.client.delete().await?;
        if let Some(registration) = self.registration.lock().take() {
            if let Some(manager) = registration.manager.upgrade() {
                manager.deregister_queue(registration.kind, &self.id, self.name.as_deref());
            }
        }
        Ok(())
    }
}

fn validate_id(request: &Request) -> Result<String> {
    request
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| invalid_argument("request.id must be a non-empty string"))
}

fn validate_unique_key(request: &Request) -> Result<String> {
    request
        .unique_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .ok_or_else(|| invalid_argument("request.uniqueKey must be a non-empty string"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
