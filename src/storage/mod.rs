//! Storage-open façade.
//!
//! [`StorageManager`] resolves a queue id or name to a running
//! [`RequestQueue`], choosing the remote HTTP backend when an API token is
//! configured (or cloud is forced) and the local emulator otherwise.  Open
//! instances are cached in a per-manager registry, so repeated opens of the
//! same queue share one coordinator; there is deliberately no process-wide
//! singleton; tests and embedders create as many isolated managers as
//! they need.

pub mod purge;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::client::http::HttpApiClient;
use crate::client::local::LocalQueueEmulator;
use crate::client::RequestQueueClient;
use crate::config::{validate_config, Config};
use crate::queue::{Registration, RequestQueue};

// ---------------------------------------------------------------------------
// Backend kind
// ---------------------------------------------------------------------------

/// Which backing store a queue instance talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cloud,
    Local,
}

// ---------------------------------------------------------------------------
// Open options
// ---------------------------------------------------------------------------

/// Selects the queue to open.  With neither `id` nor `name`, the configured
/// default queue id is used.
#[derive(Debug, Clone, Default)]
pub struct OpenQueueOptions {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Open remote storage even when no token-based default applies.
    pub force_cloud: bool,
}

impl OpenQueueOptions {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the backends and the registry of open queue instances.
pub struct StorageManager {
    config: Config,
    http: Option<Arc<HttpApiClient>>,
    local: Arc<LocalQueueEmulator>,
    queues: Mutex<HashMap<(BackendKind, String), Arc<RequestQueue>>>,
}

impl StorageManager {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        validate_config(&config)?;
        let http = match config.token {
            Some(_) => Some(Arc::new(HttpApiClient::new(&config)?)),
            None => None,
        };
        let local = Arc::new(LocalQueueEmulator::new(&config));
        Ok(Arc::new(Self {
            config,
            http,
            local,
            queues: Mutex::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Purge the default local storages, preserving crawl inputs.  Intended
    /// to run once at process start.
    pub async fn purge_on_start(&self) -> Result<()> {
        purge::purge_local_storage(&self.config).await
    }

    /// Resolve `options` to a coordinator, creating or loading the queue as
    /// needed.  Subsequent opens of the same queue return the same
    /// instance.
    pub async fn open_request_queue(
        self: &Arc<Self>,
        options: OpenQueueOptions,
    ) -> Result<Arc<RequestQueue>> {
        anyhow::ensure!(
            options.id.is_none() || options.name.is_none(),
            "open a request queue by either id or name, not both"
        );

        let use_cloud =
            options.force_cloud || self.config.force_cloud || self.config.token.is_some();
        let kind = if use_cloud {
            BackendKind::Cloud
        } else {
            BackendKind::Local
        };

        // (key, opened-by-name, id-was-explicit)
        let (key, by_name, explicit_id) = match (&options.id, &options.name) {
            (Some(id), None) => (id.clone(), false, true),
            (None, Some(name)) => (name.clone(), true, false),
            _ => (self.config.default_request_queue_id.clone(), false, false),
        };

        if let Some(queue) = self.queues.lock().get(&(kind, key.clone())) {
            return Ok(Arc::clone(queue));
        }

        let info = match kind {
            BackendKind::Cloud => {
                let api = self
                    .http
                    .as_ref()
                    .context("an API token is required for cloud storage")?;
                if by_name {
                    api.get_or_create_queue(&key).await?
                } else {
                    api.get_queue(&key).await?.with_context(|| {
                        format!("request queue with id \"{key}\" does not exist")
                    })?
                }
            }
            BackendKind::Local => {
                if by_name {
                    self.local.get_or_create_queue(&key).await?
                } else if explicit_id {
                    self.local.get_queue(&key).await?.with_context(|| {
                        format!("request queue with id \"{key}\" does not exist")
                    })?
                } else {
                    // The default queue comes into existence on first use.
                    self.local.get_or_create_default(&key).await?
                }
            }
        };

        let client_key = Uuid::new_v4().simple().to_string();
        let client: Arc<dyn RequestQueueClient> = match kind {
            BackendKind::Cloud => {
                let api = self
                    .http
                    .as_ref()
                    .context("an API token is required for cloud storage")?;
                Arc::new(api.queue_client(&info.id, &client_key))
            }
            BackendKind::Local => Arc::new(self.local.queue_client(&info.id).await?),
        };

        let queue = Arc::new(RequestQueue::with_client_key(
            info.id.clone(),
            info.name.clone(),
            client,
            client_key,
        ));
        queue.set_registration(Registration {
            manager: Arc::downgrade(self),
            kind,
        });

        {
            let mut queues = self.queues.lock();
            queues.insert((kind, info.id.clone()), Arc::clone(&queue));
            if let Some(name) = &info.name {
                queues.insert((kind, name.clone()), Arc::clone(&queue));
            }
        }
        debug!(queue_id = %info.id, ?kind, "request queue opened");

        // Prime the head window so the first fetch sees buffered work.
        queue.ensure_head_is_non_empty(false).await?;

        Ok(queue)
    }

    pub(crate) fn deregister_queue(&self, kind: BackendKind, id: &str, name: Option<&str>) {
        let mut queues = self.queues.lock();
        queues.remove(&(kind, id.to_string()));
        if let Some(name) = name {
            queues.remove(&(kind, name.to_string()));
        }
        debug!(queue_id = %id, ?kind, "request queue deregistered");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::request::Request;

    use super::*;

    fn manager_in(dir: &Path) -> Arc<StorageManager> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
        StorageManager::new(Config {
            local_storage_dir: dir.display().to_string(),
            ..Config::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn default_open_returns_the_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        let first = manager
            .open_request_queue(OpenQueueOptions::default())
            .await
            .unwrap();
        let second = manager
            .open_request_queue(OpenQueueOptions::default())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), "default");
    }

    #[tokio::test]
    async fn open_by_name_creates_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        let queue = manager
            .open_request_queue(OpenQueueOptions::by_name("crawl-2026"))
            .await
            .unwrap();
        assert_eq!(queue.name(), Some("crawl-2026"));

        let again = manager
            .open_request_queue(OpenQueueOptions::by_name("crawl-2026"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&queue, &again));
    }

    #[tokio::test]
    async fn open_by_unknown_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        assert!(manager
            .open_request_queue(OpenQueueOptions::by_id("missing"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn distinct_managers_are_isolated() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let manager_a = manager_in(dir_a.path());
        let manager_b = manager_in(dir_b.path());

        let queue_a = manager_a
            .open_request_queue(OpenQueueOptions::default())
            .await
            .unwrap();
        queue_a
            .add_request(&Request::from_url("https://example.com/a"), false)
            .await
            .unwrap();

        let queue_b = manager_b
            .open_request_queue(OpenQueueOptions::default())
            .await
            .unwrap();
        assert!(queue_b.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn drop_queue_deregisters_the_instance() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        let queue = manager
            .open_request_queue(OpenQueueOptions::default())
            .await
            .unwrap();
        queue
            .add_request(&Request::from_url("https://example.com/a"), false)
            .await
            .unwrap();
        queue.drop_queue().await.unwrap();

        let reopened = manager
            .open_request_queue(OpenQueueOptions::default())
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&queue, &reopened));
        assert!(reopened.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn full_lifecycle_through_the_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        let queue = manager
            .open_request_queue(OpenQueueOptions::by_name("lifecycle"))
            .await
            .unwrap();

        queue
            .add_request(&Request::from_url("https://example.com/1"), false)
            .await
            .unwrap();
        queue
            .add_request(&Request::from_url("https://example.com/2"), false)
            .await
            .unwrap();

        let first = queue.fetch_next_request().await.unwrap().unwrap();
        queue.mark_request_handled(&first).await.unwrap().unwrap();
        let second = queue.fetch_next_request().await.unwrap().unwrap();
        queue.mark_request_handled(&second).await.unwrap().unwrap();

        assert!(queue.is_empty().await.unwrap());
        assert!(queue.is_finished().await.unwrap());
    }
}
