//! Configuration file support for ragchat
//!
//! Loads config from ~/.ragchat/config.toml. Precedence (highest first):
//! CLI flag > environment variable (handled by clap's `env = "..."`) >
//! config file > hard default.

use serde::Deserialize;
use std::path::PathBuf;

/// On-disk configuration for ragchat.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub embedding_api_key: Option<String>,
    pub database_url: Option<String>,
    pub qdrant_url: Option<String>,
    pub project: Option<String>,

    pub candidate_k: Option<usize>,
    pub final_k: Option<usize>,
    pub score_floor: Option<f32>,
    pub dedup_epsilon: Option<f32>,
    pub cache_hit_threshold: Option<f32>,
    pub dislike_invalidate: Option<u32>,
    pub message_threshold: Option<usize>,
    pub token_threshold: Option<usize>,
    pub max_iterations: Option<usize>,
    pub request_deadline_secs: Option<u64>,
    pub tool_timeout_secs: Option<u64>,
}

impl Config {
    /// Load config from `~/.ragchat/config.toml`. Missing or unparseable
    /// files degrade to defaults with a warning — this runs before logging
    /// init, so `eprintln!` is the only channel available.
    pub fn load() -> Self {
        let path = config_path();

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn get_or_env(&self, field: Option<&String>, env_var: &str) -> Option<String> {
        field.cloned().or_else(|| std::env::var(env_var).ok())
    }
}

/// Runtime thresholds the pipeline is tuned with, resolved once at startup
/// from CLI/env/config/default and threaded through as a shared value.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub candidate_k: usize,
    pub final_k: usize,
    pub score_floor: f32,
    pub dedup_epsilon: f32,
    pub cache_hit_threshold: f32,
    pub dislike_invalidate: u32,
    pub message_threshold: usize,
    pub token_threshold: usize,
    pub max_iterations: usize,
    pub request_deadline_secs: u64,
    pub tool_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            candidate_k: ragchat_core::DEFAULT_CANDIDATE_K,
            final_k: ragchat_core::DEFAULT_FINAL_K,
            score_floor: ragchat_core::DEFAULT_SCORE_FLOOR,
            dedup_epsilon: ragchat_core::DEFAULT_DEDUP_EPSILON,
            cache_hit_threshold: ragchat_core::DEFAULT_CACHE_HIT_THRESHOLD,
            dislike_invalidate: ragchat_core::DEFAULT_DISLIKE_INVALIDATE,
            message_threshold: ragchat_core::DEFAULT_MESSAGE_THRESHOLD,
            token_threshold: ragchat_core::DEFAULT_TOKEN_THRESHOLD,
            max_iterations: ragchat_core::DEFAULT_MAX_ITERATIONS,
            request_deadline_secs: ragchat_core::DEFAULT_REQUEST_DEADLINE_SECS,
            tool_timeout_secs: ragchat_core::DEFAULT_TOOL_TIMEOUT_SECS,
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            candidate_k: config.candidate_k.unwrap_or(defaults.candidate_k),
            final_k: config.final_k.unwrap_or(defaults.final_k),
            score_floor: config.score_floor.unwrap_or(defaults.score_floor),
            dedup_epsilon: config.dedup_epsilon.unwrap_or(defaults.dedup_epsilon),
            cache_hit_threshold: config.cache_hit_threshold.unwrap_or(defaults.cache_hit_threshold),
            dislike_invalidate: config.dislike_invalidate.unwrap_or(defaults.dislike_invalidate),
            message_threshold: config.message_threshold.unwrap_or(defaults.message_threshold),
            token_threshold: config.token_threshold.unwrap_or(defaults.token_threshold),
            max_iterations: config.max_iterations.unwrap_or(defaults.max_iterations),
            request_deadline_secs: config.request_deadline_secs.unwrap_or(defaults.request_deadline_secs),
            tool_timeout_secs: config.tool_timeout_secs.unwrap_or(defaults.tool_timeout_secs),
        }
    }
}

/// Get the config file path.
pub fn config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".ragchat")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_config_path() {
        let path = config_path();
        assert!(path.to_string_lossy().contains(".ragchat"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_pipeline_config_defaults() {
        let pc = PipelineConfig::from_config(&Config::default());
        assert_eq!(pc.final_k, 5);
        assert_eq!(pc.max_iterations, 5);
    }
}
