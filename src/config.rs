use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for locally emulated storage.
    #[serde(default = "default_local_storage_dir")]
    pub local_storage_dir: String,
    /// Persist locally emulated storage to disk.  When false, all state is
    /// kept in memory and lost on process exit.
    #[serde(default = "bool_true")]
    pub persist_storage: bool,
    /// Maintain a `__metadata__.json` file per locally emulated queue.
    #[serde(default)]
    pub write_metadata: bool,
    /// Id of the queue opened when neither an id nor a name is given.
    #[serde(default = "default_request_queue_id")]
    pub default_request_queue_id: String,
    /// Id of the default key-value store; its `INPUT*` files survive a purge.
    #[serde(default = "default_key_value_store_id")]
    pub default_key_value_store_id: String,
    /// Open remote storage even when local storage is configured.
    #[serde(default)]
    pub force_cloud: bool,
    /// Base URL of the remote queue service API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// API token for the remote service.  When absent, storage is local.
    #[serde(default)]
    pub token: Option<String>,
    /// Maximum number of attempts per API call, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff, in milliseconds.
    #[serde(default = "default_min_retry_delay_ms")]
    pub min_retry_delay_ms: u64,
}

fn default_local_storage_dir() -> String {
    "./storage".to_string()
}

fn bool_true() -> bool {
    true
}

fn default_request_queue_id() -> String {
    "default".to_string()
}

fn default_key_value_store_id() -> String {
    "default".to_string()
}

fn default_api_base_url() -> String {
    "https://api.crawlqueue.dev".to_string()
}

fn default_max_retries() -> u32 {
    8
}

fn default_min_retry_delay_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_storage_dir: default_local_storage_dir(),
            persist_storage: true,
            write_metadata: false,
            default_request_queue_id: default_request_queue_id(),
            default_key_value_store_id: default_key_value_store_id(),
            force_cloud: false,
            api_base_url: default_api_base_url(),
            token: None,
            max_retries: default_max_retries(),
            min_retry_delay_ms: default_min_retry_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub(crate) fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.force_cloud || config.token.is_some(),
        "force_cloud requires an API token"
    );
    anyhow::ensure!(config.max_retries >= 1, "max_retries must be at least 1");
    anyhow::ensure!(
        !config.local_storage_dir.trim().is_empty(),
        "local_storage_dir must not be empty"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.local_storage_dir, "./storage");
        assert!(config.persist_storage);
        assert_eq!(config.default_request_queue_id, "default");
        assert_eq!(config.max_retries, 8);
        assert_eq!(config.min_retry_delay_ms, 500);
    }

    #[test]
    fn force_cloud_without_token_is_rejected() {
        let config = Config {
            force_cloud: true,
            token: None,
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn parse_partial_yaml_fills_defaults() {
        let config: Config =
            serde_yaml::from_str("local_storage_dir: /tmp/crawl\nwrite_metadata: true\n").unwrap();
        assert_eq!(config.local_storage_dir, "/tmp/crawl");
        assert!(config.write_metadata);
        assert!(config.persist_storage);
        assert_eq!(config.default_request_queue_id, "default");
    }
}
