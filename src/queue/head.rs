//! Head-window maintenance.
//!
//! The head window is a locally buffered, ordered prefix of the remote
//! queue.  [`RequestQueue::ensure_head_is_non_empty`] lazily refills it,
//! retrying with a larger limit while the remote head keeps reporting more
//! requests than fit and, when a caller asks for a consistent answer,
//! waiting out the remote store's replication lag before trusting an empty
//! head.  Only one head query runs at a time per queue; concurrent callers
//! await the same in-flight future.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use indexmap::IndexSet;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::RequestQueueClient;
use crate::request::unique_key_to_request_id;

use super::{
    CachedRequestInfo, QueueState, RequestQueue, API_PROCESSED_REQUESTS_DELAY,
    MAX_QUERIES_FOR_CONSISTENCY, QUERY_HEAD_BUFFER, QUERY_HEAD_MIN_LENGTH,
    REQUEST_QUEUE_HEAD_MAX_LIMIT,
};

// ---------------------------------------------------------------------------
// Head window
// ---------------------------------------------------------------------------

/// Ordered set of request ids buffered from the remote head.
///
/// Pops are FIFO in insertion order; a forefront insert becomes the new
/// oldest entry.
#[derive(Debug, Default)]
pub(crate) struct HeadWindow {
    ids: IndexSet<String>,
}

impl HeadWindow {
    /// Remove and return the oldest id.
    pub fn pop_front(&mut self) -> Option<String> {
        self.ids.shift_remove_index(0)
    }

    /// Append at the newest position; ids already present keep their spot.
    pub fn push_back(&mut self, id: String) {
        self.ids.insert(id);
    }

    /// Insert (or move) an id to the oldest position.
    pub fn push_front(&mut self, id: String) {
        self.ids.shift_insert(0, id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

// ---------------------------------------------------------------------------
// Head query plumbing
// ---------------------------------------------------------------------------

/// What one head query observed; drives the retry decisions above it.
#[derive(Debug, Clone)]
pub(crate) struct HeadQueryOutcome {
    pub was_limit_reached: bool,
    pub prev_limit: usize,
    pub queue_modified_at: DateTime<Utc>,
    pub query_started_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
}

/// Cloneable error for the shared in-flight query.
#[derive(Debug, Clone, Error)]
#[error("{0:#}")]
pub(crate) struct HeadQueryError(Arc<anyhow::Error>);

pub(crate) type SharedHeadQuery =
    Shared<BoxFuture<'static, Result<HeadQueryOutcome, HeadQueryError>>>;

impl QueueState {
    /// Place a freshly added or reclaimed request into the head window when
    /// that is cheap to do locally.  With a short queue the next head query
    /// would return it anyway; with a long one we let the query pick it up.
    pub(crate) fn maybe_add_request_to_head(&mut self, request_id: String, forefront: bool) {
        if forefront {
            self.head.push_front(request_id);
        } else if self.assumed_total_count < QUERY_HEAD_MIN_LENGTH as u64 {
            self.head.push_back(request_id);
        }
    }
}

impl RequestQueue {
    /// Refill the head window if it is empty.
    ///
    /// Returns `true` when the head can be trusted: it is either non-empty,
    /// or empty while (if `ensure_consistency` is set) both the remote
    /// store and the local bookkeeping agree it really is drained.  Returns
    /// `false` when consistency could not be confirmed within
    /// [`MAX_QUERIES_FOR_CONSISTENCY`] queries.
    pub(crate) async fn ensure_head_is_non_empty(&self, ensure_consistency: bool) -> Result<bool> {
        let mut limit: Option<usize> = None;
        let mut iteration: u32 = 0;

        loop {
            if !self.state.lock().head.is_empty() {
                return Ok(true);
            }

            let effective_limit = limit.unwrap_or_else(|| {
                let in_progress_count = self.state.lock().in_progress.len();
                (in_progress_count * QUERY_HEAD_BUFFER).max(QUERY_HEAD_MIN_LENGTH)
            });

            let query = self.shared_head_query(effective_limit);
            let outcome = query.await.map_err(anyhow::Error::new)?;

            if outcome.prev_limit >= REQUEST_QUEUE_HEAD_MAX_LIMIT {
                warn!(
                    queue_id = %self.id,
                    limit = outcome.prev_limit,
                    "reached the maximum head query limit"
                );
            }

            let (head_empty, assumed_total, assumed_handled) = {
                let state = self.state.lock();
                (
                    state.head.is_empty(),
                    state.assumed_total_count,
                    state.assumed_handled_count,
                )
            };

            let should_retry_with_higher_limit = head_empty
                && outcome.was_limit_reached
                && outcome.prev_limit < REQUEST_QUEUE_HEAD_MAX_LIMIT;

            // The remote head index trails the main table by up to
            // API_PROCESSED_REQUESTS_DELAY; a query started after that lag
            // window reflects every processed write.
            let database_consistent = (outcome.query_started_at - outcome.queue_modified_at)
                .to_std()
                .map_or(false, |lag| lag >= API_PROCESSED_REQUESTS_DELAY);

            // Single-client shortcut: we are the only writer and everything
            // we added we also handled.
            let locally_consistent =
                !outcome.had_multiple_clients && assumed_total <= assumed_handled;

            let should_retry_for_consistency =
                ensure_consistency && !database_consistent && !locally_consistent;

            if !should_retry_with_higher_limit && !should_retry_for_consistency {
                return Ok(true);
            }

            if !should_retry_with_higher_limit && iteration > MAX_QUERIES_FOR_CONSISTENCY {
                // Permitted false negative after exhausting the retries.
                return Ok(false);
            }

            let next_limit = if should_retry_with_higher_limit {
                (outcome.prev_limit as f64 * 1.5).round() as usize
            } else {
                outcome.prev_limit
            };

            if should_retry_for_consistency {
                let since_modified = (Utc::now() - outcome.queue_modified_at)
                    .to_std()
                    .unwrap_or_default();
                let delay = API_PROCESSED_REQUESTS_DELAY.saturating_sub(since_modified);
                if !delay.is_zero() {
                    debug!(
                        queue_id = %self.id,
                        delay_ms = delay.as_millis() as u64,
                        iteration,
                        "waiting for the remote head index to catch up"
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            limit = Some(next_limit);
            iteration += 1;
        }
    }

    /// Return the in-flight head query, starting one if none is running.
    fn shared_head_query(&self, limit: usize) -> SharedHeadQuery {
        let mut slot = self.head_query.lock();
        if let Some(query) = slot.as_ref() {
            return query.clone();
        }
        let query = Self::query_head(
            Arc::clone(&self.client),
            Arc::clone(&self.state),
            Arc::clone(&self.head_query),
            limit,
        )
        .boxed()
        .shared();
        *slot = Some(query.clone());
        query
    }

    /// Fetch up to `limit` head requests and fold them into the window,
    /// skipping ids this client is already tracking.
    async fn query_head(
        client: Arc<dyn RequestQueueClient>,
        state: Arc<Mutex<QueueState>>,
        slot: Arc<Mutex<Option<SharedHeadQuery>>>,
        limit: usize,
    ) -> Result<HeadQueryOutcome, HeadQueryError> {
        let query_started_at = Utc::now();
        let outcome = match client.list_head(limit).await {
            Ok(list_head) => {
                let mut state = state.lock();
                for item in &list_head.items {
                    let (Some(id), Some(unique_key)) = (&item.id, &item.unique_key) else {
                        continue;
                    };
                    // The head index may trail the main table; never recycle
                    // requests this client is processing or just handled.
                    if id.is_empty()
                        || unique_key.is_empty()
                        || state.in_progress.contains(id)
                        || state.recently_handled.contains(id)
                    {
                        continue;
                    }
                    state.head.push_back(id.clone());
                    state.requests_cache.put(
                        unique_key_to_request_id(unique_key),
                        CachedRequestInfo {
                            id: id.clone(),
                            unique_key: unique_key.clone(),
                            is_handled: false,
                            was_already_handled: false,
                        },
                    );
                }
                Ok(HeadQueryOutcome {
                    was_limit_reached: list_head.items.len() >= limit,
                    prev_limit: limit,
                    queue_modified_at: list_head.queue_modified_at,
                    query_started_at,
                    had_multiple_clients: list_head.had_multiple_clients,
                })
            }
            Err(err) => Err(HeadQueryError(Arc::new(err))),
        };
        slot.lock().take();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_are_fifo() {
        let mut window = HeadWindow::default();
        window.push_back("a".into());
        window.push_back("b".into());
        window.push_back("c".into());

        assert_eq!(window.pop_front().as_deref(), Some("a"));
        assert_eq!(window.pop_front().as_deref(), Some("b"));
        assert_eq!(window.pop_front().as_deref(), Some("c"));
        assert_eq!(window.pop_front(), None);
    }

    #[test]
    fn forefront_insert_becomes_the_new_oldest() {
        let mut window = HeadWindow::default();
        window.push_back("a".into());
        window.push_back("b".into());
        window.push_front("front".into());

        assert_eq!(window.pop_front().as_deref(), Some("front"));
        assert_eq!(window.pop_front().as_deref(), Some("a"));
    }

    #[test]
    fn forefront_moves_an_existing_entry() {
        let mut window = HeadWindow::default();
        window.push_back("a".into());
        window.push_back("b".into());
        window.push_front("b".into());

        assert_eq!(window.len(), 2);
        assert_eq!(window.pop_front().as_deref(), Some("b"));
    }

    #[test]
    fn push_back_keeps_the_position_of_existing_entries() {
        let mut window = HeadWindow::default();
        window.push_back("a".into());
        window.push_back("b".into());
        window.push_back("a".into());

        assert_eq!(window.pop_front().as_deref(), Some("a"));
    }

    #[test]
    fn membership_and_clear() {
        let mut window = HeadWindow::default();
        assert!(window.is_empty());
        window.push_back("a".into());
        assert!(window.contains("a"));
        assert!(!window.contains("b"));
        window.clear();
        assert!(window.is_empty());
    }
}
