use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::memory::compact::CompactionStrategy;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TesseraConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub compaction: CompactionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Number of read-only connections kept alongside the single writer.
    pub read_connections: usize,
    /// Importance added to a block each time a new block references it.
    pub reference_boost: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"local"`, `"http"`, `"hash"`, or `"none"` to disable the semantic signal.
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub cache_dir: String,
    pub cache_size: usize,
    pub timeout_ms: u64,
    pub endpoint: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub text_weight: f64,
    pub semantic_weight: f64,
    pub max_candidates_per_signal: usize,
    pub min_score_threshold: f64,
    pub default_search_limit: usize,
    /// How long the vector branch may lag behind the lexical branch.
    pub vector_grace_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CompactionConfig {
    pub strategy: CompactionStrategy,
    pub threshold_fraction: f64,
    pub chars_per_token: usize,
    pub excerpt_chars: usize,
    /// Per-session token budget. When set, storing a block compacts its
    /// session once usage crosses `threshold_fraction` of this budget.
    pub session_budget_tokens: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            host: "127.0.0.1".into(),
            port: 7411,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_tessera_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            read_connections: 4,
            reference_boost: 0.05,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_tessera_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            dimensions: 384,
            cache_dir,
            cache_size: 1024,
            timeout_ms: 2000,
            endpoint: "http://127.0.0.1:11434/v1/embeddings".into(),
            api_key: None,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            text_weight: 0.7,
            semantic_weight: 0.3,
            max_candidates_per_signal: 50,
            min_score_threshold: 0.0,
            default_search_limit: 10,
            vector_grace_ms: 250,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: CompactionStrategy::Importance,
            threshold_fraction: 0.8,
            chars_per_token: 4,
            excerpt_chars: 80,
            session_budget_tokens: None,
        }
    }
}

/// Returns `~/.tessera/`, falling back to the working directory when no home
/// directory can be resolved.
pub fn default_tessera_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tessera")
}

/// Returns the default config file path: `~/.tessera/config.toml`
pub fn default_config_path() -> PathBuf {
    default_tessera_dir().join("config.toml")
}

impl TesseraConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            TesseraConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TESSERA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("TESSERA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("TESSERA_EMBEDDING_PROVIDER") {
            self.embedding.provider = val;
        }
        if let Ok(val) = std::env::var("TESSERA_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(val);
        }
    }

    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        let s = &self.search;
        if s.text_weight < 0.0 || s.semantic_weight < 0.0 {
            bail!("search weights must be non-negative");
        }
        if ((s.text_weight + s.semantic_weight) - 1.0).abs() > 1e-6 {
            bail!(
                "search.text_weight + search.semantic_weight must equal 1.0 (got {})",
                s.text_weight + s.semantic_weight
            );
        }
        if s.max_candidates_per_signal == 0 || s.default_search_limit == 0 {
            bail!("search limits must be at least 1");
        }
        let c = &self.compaction;
        if !(c.threshold_fraction > 0.0 && c.threshold_fraction <= 1.0) {
            bail!("compaction.threshold_fraction must be in (0, 1]");
        }
        if c.chars_per_token == 0 {
            bail!("compaction.chars_per_token must be at least 1");
        }
        if c.session_budget_tokens == Some(0) {
            bail!("compaction.session_budget_tokens must be at least 1 when set");
        }
        if self.embedding.cache_size == 0 {
            bail!("embedding.cache_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.storage.reference_boost) {
            bail!("storage.reference_boost must be in [0, 1]");
        }
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = TesseraConfig::default();
        assert_eq!(config.server.transport, "stdio");
        assert_eq!(config.search.text_weight, 0.7);
        assert_eq!(config.search.semantic_weight, 0.3);
        assert_eq!(config.compaction.strategy, CompactionStrategy::Importance);
        assert_eq!(config.compaction.threshold_fraction, 0.8);
        assert!(config.storage.db_path.ends_with("memory.db"));
        config.validate().unwrap();
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[search]
text_weight = 0.5
semantic_weight = 0.5

[compaction]
strategy = "lru"
session_budget_tokens = 4000
"#;
        let config: TesseraConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.search.text_weight, 0.5);
        assert_eq!(config.compaction.strategy, CompactionStrategy::Lru);
        assert_eq!(config.compaction.session_budget_tokens, Some(4000));
        // defaults still apply for unset fields
        assert_eq!(config.search.default_search_limit, 10);
        assert_eq!(config.embedding.cache_size, 1024);
        config.validate().unwrap();
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut config = TesseraConfig::default();
        config.search.text_weight = 0.9;
        config.search.semantic_weight = 0.3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_session_budget_is_rejected() {
        let mut config = TesseraConfig::default();
        config.compaction.session_budget_tokens = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = TesseraConfig::load_from(tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.search.max_candidates_per_signal, 50);
    }
}
