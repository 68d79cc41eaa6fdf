//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::domain::graph::{ConfidenceBands, Severity};
use crate::storage::database::default_database_path;

/// Linkweave configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub scoring: ScoringConfig,
    pub enrichment: EnrichmentConfig,
    pub cache: CacheConfig,
    pub propagation: PropagationConfig,
    pub narrative: NarrativeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Database file; `None` uses the platform data directory
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub high_threshold: f64,
    pub medium_threshold: f64,
    pub low_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Upper bound on candidate records fetched per rule invocation
    pub candidate_limit: u32,
    pub batch_workers: usize,
    pub batch_max_records: u32,
    pub batch_lookback_hours: i64,
    /// Zero disables the batch deadline
    pub batch_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: i64,
    pub max_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub enabled: bool,
    pub signal_min_severity: Severity,
    pub signal_window_days: i64,
    /// Unread signals older than this are marked read by `expire`
    pub signal_expiry_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.8,
            medium_threshold: 0.5,
            low_threshold: 0.3,
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 200,
            batch_workers: 4,
            batch_max_records: 100,
            batch_lookback_hours: 24,
            batch_deadline_secs: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_items: 10,
        }
    }
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signal_min_severity: Severity::Warning,
            signal_window_days: 7,
            signal_expiry_days: 7,
        }
    }
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "https://openrouter.ai/api/v1".to_string(),
            model: "anthropic/claude-sonnet-4-20250514".to_string(),
            temperature: 0.4,
            max_tokens: 2048,
            timeout_secs: 90,
        }
    }
}

impl ScoringConfig {
    /// Confidence bands derived from the configured thresholds
    pub fn bands(&self) -> ConfidenceBands {
        ConfidenceBands {
            high: self.high_threshold,
            medium: self.medium_threshold,
            low: self.low_threshold,
        }
    }
}

impl NarrativeConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("LINKWEAVE_NARRATIVE_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok())
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key().map(|opt| {
            opt.map(|key| {
                if key.len() <= 4 {
                    "***".to_string()
                } else {
                    format!("***{}", &key[key.len() - 4..])
                }
            })
        })
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "Narrative API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("LINKWEAVE_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("linkweave")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Database file path, falling back to the config directory
    pub fn database_path(&self) -> PathBuf {
        match &self.database.path {
            Some(path) => path.clone(),
            None => Self::config_dir()
                .map(|dir| dir.join("linkweave.db"))
                .unwrap_or_else(|_| default_database_path()),
        }
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.narrative.enforce_env_only()?;

        let s = &self.scoring;
        for (name, value) in [
            ("scoring.high_threshold", s.high_threshold),
            ("scoring.medium_threshold", s.medium_threshold),
            ("scoring.low_threshold", s.low_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be between 0.0 and 1.0", name));
            }
        }
        if !(s.high_threshold > s.medium_threshold && s.medium_threshold > s.low_threshold) {
            return Err(anyhow!(
                "Scoring thresholds must be strictly decreasing (high > medium > low)"
            ));
        }
        if self.enrichment.batch_workers == 0 {
            return Err(anyhow!("enrichment.batch_workers must be at least 1"));
        }
        if self.enrichment.candidate_limit == 0 {
            return Err(anyhow!("enrichment.candidate_limit must be at least 1"));
        }
        if self.cache.ttl_secs < 0 {
            return Err(anyhow!("cache.ttl_secs must be non-negative"));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "database.path" => Ok(self.database_path().display().to_string()),
            "database.max_connections" => Ok(self.database.max_connections.to_string()),

            "scoring.high_threshold" => Ok(self.scoring.high_threshold.to_string()),
            "scoring.medium_threshold" => Ok(self.scoring.medium_threshold.to_string()),
            "scoring.low_threshold" => Ok(self.scoring.low_threshold.to_string()),

            "enrichment.candidate_limit" => Ok(self.enrichment.candidate_limit.to_string()),
            "enrichment.batch_workers" => Ok(self.enrichment.batch_workers.to_string()),
            "enrichment.batch_max_records" => Ok(self.enrichment.batch_max_records.to_string()),
            "enrichment.batch_lookback_hours" => {
                Ok(self.enrichment.batch_lookback_hours.to_string())
            }
            "enrichment.batch_deadline_secs" => {
                Ok(self.enrichment.batch_deadline_secs.to_string())
            }

            "cache.ttl_secs" => Ok(self.cache.ttl_secs.to_string()),
            "cache.max_items" => Ok(self.cache.max_items.to_string()),

            "propagation.enabled" => Ok(self.propagation.enabled.to_string()),
            "propagation.signal_min_severity" => {
                Ok(self.propagation.signal_min_severity.as_str().to_string())
            }
            "propagation.signal_window_days" => {
                Ok(self.propagation.signal_window_days.to_string())
            }
            "propagation.signal_expiry_days" => {
                Ok(self.propagation.signal_expiry_days.to_string())
            }

            "narrative.endpoint" => Ok(self.narrative.endpoint.clone()),
            "narrative.model" => Ok(self.narrative.model.clone()),
            "narrative.temperature" => Ok(self.narrative.temperature.to_string()),
            "narrative.max_tokens" => Ok(self.narrative.max_tokens.to_string()),
            "narrative.timeout_secs" => Ok(self.narrative.timeout_secs.to_string()),
            "narrative.api_key" => match self.narrative.redacted_api_key()? {
                Some(redacted) => Ok(redacted),
                None => Ok(
                    "(not set - use LINKWEAVE_NARRATIVE_API_KEY or OPENROUTER_API_KEY env var)"
                        .to_string(),
                ),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `linkweave config list` to see available keys.",
                key
            )),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "database.path" => {
                self.database.path = Some(PathBuf::from(value));
            }
            "database.max_connections" => {
                self.database.max_connections = parse_value(key, value)?;
            }

            "scoring.high_threshold" => self.scoring.high_threshold = parse_unit(key, value)?,
            "scoring.medium_threshold" => self.scoring.medium_threshold = parse_unit(key, value)?,
            "scoring.low_threshold" => self.scoring.low_threshold = parse_unit(key, value)?,

            "enrichment.candidate_limit" => {
                self.enrichment.candidate_limit = parse_value(key, value)?;
            }
            "enrichment.batch_workers" => {
                self.enrichment.batch_workers = parse_value(key, value)?;
            }
            "enrichment.batch_max_records" => {
                self.enrichment.batch_max_records = parse_value(key, value)?;
            }
            "enrichment.batch_lookback_hours" => {
                self.enrichment.batch_lookback_hours = parse_value(key, value)?;
            }
            "enrichment.batch_deadline_secs" => {
                self.enrichment.batch_deadline_secs = parse_value(key, value)?;
            }

            "cache.ttl_secs" => self.cache.ttl_secs = parse_value(key, value)?,
            "cache.max_items" => self.cache.max_items = parse_value(key, value)?,

            "propagation.enabled" => self.propagation.enabled = parse_value(key, value)?,
            "propagation.signal_min_severity" => {
                self.propagation.signal_min_severity = Severity::parse(value).ok_or_else(|| {
                    anyhow!(
                        "Invalid severity: {}. Valid options: info, warning, critical",
                        value
                    )
                })?;
            }
            "propagation.signal_window_days" => {
                self.propagation.signal_window_days = parse_value(key, value)?;
            }
            "propagation.signal_expiry_days" => {
                self.propagation.signal_expiry_days = parse_value(key, value)?;
            }

            "narrative.endpoint" => self.narrative.endpoint = value.to_string(),
            "narrative.model" => self.narrative.model = value.to_string(),
            "narrative.temperature" => {
                let temp: f32 = parse_value(key, value)?;
                if !(0.0..=2.0).contains(&temp) {
                    return Err(anyhow!("Temperature must be between 0.0 and 2.0"));
                }
                self.narrative.temperature = temp;
            }
            "narrative.max_tokens" => self.narrative.max_tokens = parse_value(key, value)?,
            "narrative.timeout_secs" => self.narrative.timeout_secs = parse_value(key, value)?,

            "narrative.api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration. \
                     Set the LINKWEAVE_NARRATIVE_API_KEY or OPENROUTER_API_KEY environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `linkweave config list` to see available keys.",
                    key
                ));
            }
        }
        self.validate()
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        const KEYS: &[&str] = &[
            "database.path",
            "database.max_connections",
            "scoring.high_threshold",
            "scoring.medium_threshold",
            "scoring.low_threshold",
            "enrichment.candidate_limit",
            "enrichment.batch_workers",
            "enrichment.batch_max_records",
            "enrichment.batch_lookback_hours",
            "enrichment.batch_deadline_secs",
            "cache.ttl_secs",
            "cache.max_items",
            "propagation.enabled",
            "propagation.signal_min_severity",
            "propagation.signal_window_days",
            "propagation.signal_expiry_days",
            "narrative.endpoint",
            "narrative.model",
            "narrative.temperature",
            "narrative.max_tokens",
            "narrative.timeout_secs",
            "narrative.api_key",
        ];

        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

fn parse_unit(key: &str, value: &str) -> anyhow::Result<f64> {
    let parsed: f64 = parse_value(key, value)?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(anyhow!("{} must be between 0.0 and 1.0", key));
    }
    Ok(parsed)
}
