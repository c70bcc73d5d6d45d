//! Resource-client abstraction over the remote request queue.
//!
//! Provides the [`RequestQueueClient`] trait that encapsulates every
//! operation the coordinator performs against a queue's backing store.
//! Two implementations honor the same contract: [`http::HttpQueueClient`]
//! speaks to the remote service, [`local::LocalQueueClient`] emulates it
//! on the local filesystem when no API token is configured.  No URL
//! construction or response parsing leaks outside this module.

pub mod http;
pub mod local;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::Request;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Metadata about a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_request_count: u64,
    #[serde(default)]
    pub handled_request_count: u64,
    /// Whether more than one client has touched this queue.
    #[serde(default)]
    pub had_multiple_clients: bool,
}

/// Result of listing the head of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListHeadResult {
    pub items: Vec<Request>,
    /// Last modification of the queue as seen by the service; the only
    /// ordering anchor between clients.
    pub queue_modified_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
}

/// Result of an add / update / delete of a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOperationInfo {
    pub request_id: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
    /// Attached by the coordinator; the service does not echo it.
    #[serde(default)]
    pub unique_key: Option<String>,
}

/// Per-item outcome of a batch add or delete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationResults {
    pub processed_requests: Vec<QueueOperationInfo>,
    pub unprocessed_requests: Vec<Request>,
}

/// One page of a full queue listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestListPage {
    pub items: Vec<Request>,
    pub count: usize,
    pub limit: usize,
    #[serde(default)]
    pub exclusive_start_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Operations the coordinator performs against one queue's backing store.
///
/// Implementations carry the per-coordinator `clientKey` and attach it to
/// every call the remote API accepts it on.  Benign not-found responses are
/// already translated to `None` / no-ops here; everything else propagates.
#[async_trait::async_trait]
pub trait RequestQueueClient: Send + Sync {
    /// Fetch the queue's metadata, or `None` if it no longer exists.
    async fn get(&self) -> Result<Option<QueueInfo>>;

    /// Rename the queue.  Fails if the name is taken.
    async fn update(&self, name: &str) -> Result<QueueInfo>;

    /// Delete the queue.  Idempotent on not-found.
    async fn delete(&self) -> Result<()>;

    /// List up to `limit` requests from the head of the queue.
    async fn list_head(&self, limit: usize) -> Result<ListHeadResult>;

    /// List up to `limit` head requests and lock them for `lock_secs`.
    async fn list_and_lock_head(&self, lock_secs: u64, limit: usize) -> Result<ListHeadResult>;

    /// Add a request; `forefront` enqueues it at the head end.
    async fn add_request(&self, request: &Request, forefront: bool) -> Result<QueueOperationInfo>;

    /// Fetch a request by id, or `None` on (benign) not-found.
    async fn get_request(&self, request_id: &str) -> Result<Option<Request>>;

    /// Overwrite a request (by its id).
    async fn update_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo>;

    /// Delete a request by id.  Idempotent.
    async fn delete_request(&self, request_id: &str) -> Result<()>;

    /// Extend the lock on a request.
    async fn prolong_request_lock(
        &self,
        request_id: &str,
        lock_secs: u64,
        forefront: bool,
    ) -> Result<()>;

    /// Release the lock on a request.
    async fn delete_request_lock(&self, request_id: &str, forefront: bool) -> Result<()>;

    /// Add many requests in one call.
    async fn batch_add_requests(
        &self,
        requests: &[Request],
        forefront: bool,
    ) -> Result<BatchOperationResults>;

    /// Delete many requests in one call.
    async fn batch_delete_requests(&self, request_ids: &[String]) -> Result<BatchOperationResults>;

    /// Page through every request in the queue.
    async fn list_requests(
        &self,
        limit: usize,
        exclusive_start_id: Option<&str>,
    ) -> Result<RequestListPage>;
}
