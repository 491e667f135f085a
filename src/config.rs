//! Shard configuration module
//!
//! Loads the sharding configuration file (`config/shards.yml` by default)
//! and the environment variables that locate it.

use crate::error::{Result, ShardError};
use config::{Config, ConfigError, File, FileFormat};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use tracing::{debug, info};

/// Default top-level key of the shards file
pub const DEFAULT_SHARDS_ENV: &str = "octopus";

/// Default application environment
pub const DEFAULT_APP_ENV: &str = "production";

/// Connection settings for one shard
///
/// Only `adapter` is interpreted by the router; every other key is passed
/// through to the [`Connector`](crate::shard::Connector) untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Engine kind (`mysql2`, `postgresql`, `sqlite3`, ...)
    pub adapter: String,

    /// Remaining connection settings (host, database, credentials, ...)
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionConfig {
    /// Create a connection config for the given adapter
    pub fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            settings: serde_json::Map::new(),
        }
    }

    /// Add a pass-through setting
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Look up a pass-through setting
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.settings.get(key)
    }
}

/// One entry under an application environment
///
/// A mapping without `adapter` whose values are connection mappings is a
/// group; each nested shard becomes a member of that group.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ShardEntry {
    Shard(ConnectionConfig),
    Group(BTreeMap<String, ConnectionConfig>),
}

/// Parsed contents of the sharding environment section
#[derive(Debug, Clone, Deserialize)]
pub struct ShardsConfig {
    /// Application environments where sharding is active
    #[serde(default = "default_environments")]
    pub environments: Vec<String>,

    /// Route reads to slaves and writes to master
    #[serde(default)]
    pub replicated: bool,

    /// Verify cached connections before handing them out
    #[serde(default)]
    pub verify_connection: bool,

    /// Groups targeted by migrations that select nothing explicitly
    #[serde(default, deserialize_with = "one_or_many")]
    pub default_migration_group: Vec<String>,

    /// Explicit slave list for replicated environments
    #[serde(default)]
    pub slaves: Option<Vec<String>>,

    /// Extra group memberships: group name -> shard names
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,

    /// Application environment -> shard entries
    #[serde(flatten)]
    pub shards: BTreeMap<String, BTreeMap<String, ShardEntry>>,
}

fn default_environments() -> Vec<String> {
    vec![DEFAULT_APP_ENV.to_string()]
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(group)) => vec![group],
        Some(OneOrMany::Many(groups)) => groups,
    })
}

impl ShardsConfig {
    /// Load the shards file described by `settings`
    ///
    /// Returns `Ok(None)` when the file or the sharding environment section
    /// is missing, which puts the router in non-sharded mode.
    pub fn load(settings: &RouterSettings) -> Result<Option<Self>> {
        let path = settings.config_path();
        if !path.exists() {
            debug!(path = %path.display(), "No shards file found");
            return Ok(None);
        }

        info!(path = %path.display(), env = %settings.shards_env, "Loading shards file");

        let raw = Config::builder().add_source(File::from(path)).build()?;
        Self::section(&raw, &settings.shards_env)
    }

    /// Parse a YAML document and extract the `shards_env` section
    pub fn from_yaml_str(content: &str, shards_env: &str) -> Result<Option<Self>> {
        let raw = Config::builder()
            .add_source(File::from_str(content, FileFormat::Yaml))
            .build()?;
        Self::section(&raw, shards_env)
    }

    fn section(raw: &Config, shards_env: &str) -> Result<Option<Self>> {
        match raw.get::<ShardsConfig>(shards_env) {
            Ok(config) => Ok(Some(config)),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(ShardError::Config(format!(
                "invalid '{shards_env}' section: {e}"
            ))),
        }
    }

    /// Whether sharding should hook into `app_env`
    pub fn enabled_for(&self, app_env: &str) -> bool {
        self.environments.iter().any(|e| e == app_env)
    }

    /// Shard entries declared for `app_env`
    pub fn shards_for(&self, app_env: &str) -> Option<&BTreeMap<String, ShardEntry>> {
        self.shards.get(app_env)
    }
}

/// Process-level settings locating the shards file
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Application root; the file lives at `<directory>/config/shards.yml`
    pub directory: PathBuf,

    /// Top-level key inside the shards file
    pub shards_env: String,

    /// Current application environment
    pub app_env: String,
}

impl RouterSettings {
    /// Load settings from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let directory = match env::var("SHARDS_DIRECTORY") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => env::current_dir().map_err(|e| {
                ShardError::Config(format!("cannot resolve working directory: {e}"))
            })?,
        };

        let shards_env = env::var("SHARDS_ENV").unwrap_or_else(|_| DEFAULT_SHARDS_ENV.to_string());
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_APP_ENV.to_string());

        Ok(Self {
            directory,
            shards_env,
            app_env,
        })
    }

    /// Path of the shards file
    pub fn config_path(&self) -> PathBuf {
        self.directory.join("config").join("shards.yml")
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            shards_env: DEFAULT_SHARDS_ENV.to_string(),
            app_env: DEFAULT_APP_ENV.to_string(),
        }
    }
}
