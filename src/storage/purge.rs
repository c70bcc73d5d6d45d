//! Purge-on-start for the default local storages.
//!
//! A fresh crawl should not resume a previous run's default queue, but it
//! must keep the operator-provided inputs in the default key-value store.
//! Purging renames the target directory aside (`__OLD_<n>__` prefix) and
//! deletes it in a background task so process start never blocks on a
//! large directory tree; preserved inputs are staged through a
//! `__CRAWLQUEUE_TEMPORARY_<n>__` directory that atomically becomes the new
//! store directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::Config;

const TEMPORARY_DIR_PREFIX: &str = "__CRAWLQUEUE_TEMPORARY_";
const OLD_DIR_PREFIX: &str = "__OLD_";

/// Input files that survive a purge of the default key-value store.
const PRESERVED_INPUT_FILES: &[&str] = &["INPUT", "INPUT.json", "INPUT.bin", "INPUT.txt"];

/// Purge the default request queue and the non-input contents of the
/// default key-value store.
pub async fn purge_local_storage(config: &Config) -> Result<()> {
    let root = Path::new(&config.local_storage_dir);

    let queue_dir = root
        .join("request_queues")
        .join(&config.default_request_queue_id);
    move_aside_and_delete(&queue_dir).await?;

    let store_dir = root
        .join("key_value_stores")
        .join(&config.default_key_value_store_id);
    purge_key_value_store(&store_dir).await?;

    Ok(())
}

/// Rename `dir` to an unused `__OLD_<n>__` sibling and delete it in the
/// background.  A no-op when the directory does not exist.
async fn move_aside_and_delete(dir: &Path) -> Result<()> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(());
    }
    let old = unused_sibling(dir, OLD_DIR_PREFIX).await;
    tokio::fs::rename(dir, &old)
        .await
        .with_context(|| format!("failed to move {} aside", dir.display()))?;
    debug!(dir = %dir.display(), "purged directory moved aside");

    tokio::spawn(async move {
        if let Err(err) = tokio::fs::remove_dir_all(&old).await {
            warn!(dir = %old.display(), error = %err, "failed to delete purged directory");
        }
    });
    Ok(())
}

/// Purge a key-value store directory while keeping its `INPUT*` files.
async fn purge_key_value_store(dir: &Path) -> Result<()> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(());
    }

    // Stage the preserved inputs, swap the directories, then delete the old
    // contents without blocking the caller.
    let staging = unused_sibling(dir, TEMPORARY_DIR_PREFIX).await;
    tokio::fs::create_dir_all(&staging)
        .await
        .with_context(|| format!("failed to create staging dir: {}", staging.display()))?;

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read store dir: {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if PRESERVED_INPUT_FILES.contains(&file_name.as_str()) {
            tokio::fs::rename(entry.path(), staging.join(&file_name))
                .await
                .with_context(|| format!("failed to stage preserved input {file_name}"))?;
        }
    }

    let old = unused_sibling(dir, OLD_DIR_PREFIX).await;
    tokio::fs::rename(dir, &old)
        .await
        .with_context(|| format!("failed to move {} aside", dir.display()))?;
    tokio::fs::rename(&staging, dir)
        .await
        .with_context(|| format!("failed to promote staging dir to {}", dir.display()))?;

    tokio::spawn(async move {
        if let Err(err) = tokio::fs::remove_dir_all(&old).await {
            warn!(dir = %old.display(), error = %err, "failed to delete purged directory");
        }
    });
    Ok(())
}

/// First sibling path of `dir` named `<prefix><n>__<name>` that does not
/// exist yet.
async fn unused_sibling(dir: &Path, prefix: &str) -> PathBuf {
    let parent = dir.parent().unwrap_or_else(|| Path::new("."));
    let name = dir
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("storage");
    for n in 0u32.. {
        let candidate = parent.join(format!("{prefix}{n}__{name}"));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
    }
    unreachable!("ran out of sibling names");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> Config {
        Config {
            local_storage_dir: dir.display().to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn purge_is_a_noop_on_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        purge_local_storage(&config_in(dir.path())).await.unwrap();
    }

    #[tokio::test]
    async fn default_queue_dir_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let queue_dir = dir.path().join("request_queues").join("default");
        tokio::fs::create_dir_all(&queue_dir).await.unwrap();
        tokio::fs::write(queue_dir.join("abc.json"), "{}").await.unwrap();

        purge_local_storage(&config_in(dir.path())).await.unwrap();

        assert!(!queue_dir.exists());
    }

    #[tokio::test]
    async fn input_files_survive_a_key_value_store_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = dir.path().join("key_value_stores").join("default");
        tokio::fs::create_dir_all(&store_dir).await.unwrap();
        tokio::fs::write(store_dir.join("INPUT.json"), r#"{"seed": 1}"#)
            .await
            .unwrap();
        tokio::fs::write(store_dir.join("OUTPUT.json"), "{}").await.unwrap();

        purge_local_storage(&config_in(dir.path())).await.unwrap();

        assert!(store_dir.join("INPUT.json").exists());
        assert!(!store_dir.join("OUTPUT.json").exists());
    }

    #[tokio::test]
    async fn repeated_purges_pick_fresh_sibling_names() {
        let dir = tempfile::tempdir().unwrap();
        let queues = dir.path().join("request_queues");
        // A leftover from an earlier purge whose deletion never finished.
        tokio::fs::create_dir_all(queues.join("__OLD_0__default"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(queues.join("default")).await.unwrap();

        purge_local_storage(&config_in(dir.path())).await.unwrap();
        assert!(!queues.join("default").exists());
    }
}
