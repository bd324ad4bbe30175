use async_trait::async_trait;
use dashmap::DashMap;
use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment first, then the `.env` file. Values written through
/// `set`/`del` shadow both and are persisted back to the file; the process
/// environment itself is never modified.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    file_values: Arc<DashMap<String, String>>,
    overrides: Arc<DashMap<String, Option<String>>>, // None = deleted
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        let file_values = DashMap::new();
        if env_file.exists() {
            match dotenvy::from_path_iter(&env_file) {
                Ok(iter) => {
                    for (key, value) in iter.flatten() {
                        file_values.insert(key, value);
                    }
                    info!("Loaded .env from {}", env_file.display());
                }
                Err(e) => warn!("could not parse .env at {}: {e}", env_file.display()),
            }
        } else {
            info!("no .env at {}, using the process environment only", env_file.display());
        }

        Box::new(Self {
            env_file,
            file_values: Arc::new(file_values),
            overrides: Arc::new(DashMap::new()),
        })
    }

    fn rewrite_file(&self, key: &str, value: Option<&str>) -> Result<(), String> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;

        for line in content.lines() {
            match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    found = true;
                    if let Some(value) = value {
                        lines.push(format!("{key}={value}"));
                    }
                }
                _ => lines.push(line.to_string()),
            }
        }
        if let (false, Some(value)) = (found, value) {
            lines.push(format!("{key}={value}"));
        }

        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        let deleted: Vec<String> = self
            .overrides
            .iter()
            .filter(|e| e.value().is_none())
            .map(|e| e.key().clone())
            .collect();
        let set: Vec<String> = self
            .overrides
            .iter()
            .filter(|e| e.value().is_some())
            .map(|e| e.key().clone())
            .collect();
        let mut keys: Vec<String> = env::vars()
            .map(|(k, _)| k)
            .chain(self.file_values.iter().map(|e| e.key().clone()))
            .chain(set)
            .filter(|k| !deleted.contains(k))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(key) {
            return value.value().clone();
        }
        env::var(key)
            .ok()
            .or_else(|| self.file_values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.overrides.insert(key.to_string(), Some(value.to_string()));
        self.rewrite_file(key, Some(value))
    }

    async fn del(&self, key: &str) {
        self.overrides.insert(key.to_string(), None);
        if self.env_file.exists() {
            if let Err(e) = self.rewrite_file(key, None) {
                warn!("could not remove {key} from {}: {e}", self.env_file.display());
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: Arc<DashMap<String, String>>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }
    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Every setting read by this crate starts with this prefix.
pub const CONFIG_PREFIX: &str = "CONVOFLOW_";
pub const ACTION_TIMEOUT_KEY: &str = "CONVOFLOW_ACTION_TIMEOUT_MS";
pub const DISPATCH_TIMEOUT_KEY: &str = "CONVOFLOW_DISPATCH_TIMEOUT_MS";
pub const AGENT_TIMEOUT_KEY: &str = "CONVOFLOW_AGENT_TIMEOUT_MS";
pub const LOOKUP_TIMEOUT_KEY: &str = "CONVOFLOW_LOOKUP_TIMEOUT_MS";
pub const SESSION_TTL_KEY: &str = "CONVOFLOW_SESSION_TTL_SECS";

/// Time limits applied to every collaborator call made during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub action_timeout: Duration,
    pub dispatch_timeout: Duration,
    pub agent_timeout: Duration,
    /// Tenant/identity/pointer/graph/session lookups.
    pub lookup_timeout: Duration,
    pub session_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(10),
            dispatch_timeout: Duration::from_secs(5),
            agent_timeout: Duration::from_secs(5),
            lookup_timeout: Duration::from_secs(3),
            session_ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl OrchestratorConfig {
    pub async fn load(config: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            action_timeout: read_duration(config, ACTION_TIMEOUT_KEY, defaults.action_timeout, Duration::from_millis).await,
            dispatch_timeout: read_duration(config, DISPATCH_TIMEOUT_KEY, defaults.dispatch_timeout, Duration::from_millis).await,
            agent_timeout: read_duration(config, AGENT_TIMEOUT_KEY, defaults.agent_timeout, Duration::from_millis).await,
            lookup_timeout: read_duration(config, LOOKUP_TIMEOUT_KEY, defaults.lookup_timeout, Duration::from_millis).await,
            session_ttl: read_duration(config, SESSION_TTL_KEY, defaults.session_ttl, Duration::from_secs).await,
        }
    }
}

async fn read_duration(
    config: &ConfigManager,
    key: &str,
    default: Duration,
    unit: fn(u64) -> Duration,
) -> Duration {
    let Some(raw) = config.get(key).await else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => unit(value),
        _ => {
            warn!(%key, value = %raw, "invalid duration, using default of {} ms", default.as_millis());
            default
        }
    }
}
