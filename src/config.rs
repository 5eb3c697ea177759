//! Harness configuration.
//!
//! A JSON file where every field is optional. Gateway credentials are not
//! part of it; they come from the `OPENROUTER_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::{CatalogSettings, TierThresholds};
use crate::dispatch::{BackoffConfig, DispatchSettings};
use crate::gateway::SendOptions;
use crate::pipeline::PipelineSettings;
use crate::roles::RoleSettings;

/// Env var naming the config file used when none is given explicitly.
pub const CONFIG_ENV: &str = "PAGESMITH_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config json in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Directory for the catalog cache and trust ledger unless overridden.
    pub state_dir: PathBuf,
    pub catalog_cache: Option<PathBuf>,
    pub trust_ledger: Option<PathBuf>,
    /// Offline quality scores. Without one every backend gets `default_quality`.
    pub quality_table: Option<PathBuf>,
    pub task_class: String,
    pub default_quality: f64,
    pub tier_high: f64,
    pub tier_mid: f64,
    pub catalog_max_age_ms: u64,

    pub min_context_tokens: u32,
    pub bulk_fallback: Vec<String>,
    pub failure_margin: u32,

    pub concurrency_limit: usize,
    pub max_attempts_per_task: u32,
    pub attempt_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: bool,
    pub max_output_tokens: Option<u32>,
    pub temperature: f32,

    pub max_escalations: u32,
    pub pipeline_timeout_ms: u64,
    pub min_body_chars: usize,
    pub sanitize_styles: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let roles = RoleSettings::default();
        let backoff = BackoffConfig::default();
        let send = SendOptions::default();
        Self {
            state_dir: PathBuf::from(".pagesmith"),
            catalog_cache: None,
            trust_ledger: None,
            quality_table: None,
            task_class: "site".to_string(),
            default_quality: 0.3,
            tier_high: 0.75,
            tier_mid: 0.5,
            catalog_max_age_ms: 6 * 60 * 60 * 1000,
            min_context_tokens: roles.min_context_tokens,
            bulk_fallback: roles.bulk_fallback,
            failure_margin: crate::trust::DEFAULT_FAILURE_MARGIN,
            concurrency_limit: 4,
            max_attempts_per_task: 3,
            attempt_timeout_ms: 90_000,
            backoff_base_ms: backoff.base.as_millis() as u64,
            backoff_max_ms: backoff.max.as_millis() as u64,
            backoff_jitter: backoff.jitter,
            max_output_tokens: send.max_output_tokens,
            temperature: send.temperature,
            max_escalations: 1,
            pipeline_timeout_ms: 10 * 60 * 1000,
            min_body_chars: 120,
            sanitize_styles: true,
        }
    }
}

impl HarnessConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HarnessConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Explicit path, else `PAGESMITH_CONFIG`, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load(PathBuf::from(path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.concurrency_limit == 0 {
            return invalid("concurrency_limit must be at least 1");
        }
        if self.max_attempts_per_task == 0 {
            return invalid("max_attempts_per_task must be at least 1");
        }
        if self.failure_margin == 0 {
            return invalid("failure_margin must be at least 1");
        }
        if self.attempt_timeout_ms == 0 || self.pipeline_timeout_ms == 0 {
            return invalid("timeouts must be positive");
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return invalid("backoff_base_ms exceeds backoff_max_ms");
        }
        let unit = 0.0..=1.0;
        if !unit.contains(&self.default_quality)
            || !unit.contains(&self.tier_high)
            || !unit.contains(&self.tier_mid)
        {
            return invalid("quality scores and tier thresholds must lie in [0, 1]");
        }
        if self.tier_mid > self.tier_high {
            return invalid("tier_mid exceeds tier_high");
        }
        if self.bulk_fallback.is_empty() {
            return invalid("bulk_fallback must name at least one backend");
        }
        Ok(())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_cache
            .clone()
            .unwrap_or_else(|| self.state_dir.join("catalog.json"))
    }

    pub fn trust_path(&self) -> PathBuf {
        self.trust_ledger
            .clone()
            .unwrap_or_else(|| self.state_dir.join("trust.json"))
    }

    pub fn catalog_max_age(&self) -> Duration {
        Duration::from_millis(self.catalog_max_age_ms)
    }

    pub fn catalog_settings(&self) -> CatalogSettings {
        CatalogSettings {
            cache_path: Some(self.catalog_path()),
            task_class: self.task_class.clone(),
            default_quality: self.default_quality,
            thresholds: TierThresholds {
                high: self.tier_high,
                mid: self.tier_mid,
            },
        }
    }

    pub fn role_settings(&self) -> RoleSettings {
        RoleSettings {
            min_context_tokens: self.min_context_tokens,
            bulk_fallback: self.bulk_fallback.clone(),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        let attempt_timeout = Duration::from_millis(self.attempt_timeout_ms);
        DispatchSettings {
            attempt_timeout,
            backoff: BackoffConfig {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                jitter: self.backoff_jitter,
            },
            send: SendOptions {
                timeout: attempt_timeout,
                max_output_tokens: self.max_output_tokens,
                temperature: self.temperature,
            },
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            catalog_max_age: self.catalog_max_age(),
            concurrency_limit: self.concurrency_limit,
            max_attempts_per_task: self.max_attempts_per_task,
            max_escalations: self.max_escalations,
            pipeline_timeout: Duration::from_millis(self.pipeline_timeout_ms),
            min_body_chars: self.min_body_chars,
            sanitize_styles: self.sanitize_styles,
        }
    }
}
