//! Client-side request queue coordinator for a distributed URL-crawling
//! platform.
//!
//! A remote service holds the authoritative queue of URLs to crawl; many
//! concurrent clients pull work from it, process URLs, and report results
//! back.  This crate sits between application code and that service.  It
//! keeps a locally prefetched head window of the remote queue, tracks
//! requests that are in progress on this client, deduplicates adds through
//! a bounded request cache, and implements a termination protocol that
//! converges correctly despite replication lag in the backing store.
//!
//! The entry point is [`storage::StorageManager`], which resolves a queue
//! id or name to a [`queue::RequestQueue`] backed either by the remote HTTP
//! API or by the on-disk emulator in [`client::local`].

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod queue;
pub mod request;
pub mod storage;
pub mod timers;

pub use client::{ListHeadResult, QueueInfo, QueueOperationInfo, RequestQueueClient};
pub use config::Config;
pub use error::{ApiError, ClientError};
pub use queue::RequestQueue;
pub use request::{normalize_url, unique_key_to_request_id, Request};
pub use storage::{OpenQueueOptions, StorageManager};
