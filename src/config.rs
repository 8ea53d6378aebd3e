//! TOML configuration.
//!
//! The whole run is driven by one [`Config`] value built at startup by
//! [`load_config`] and handed to every component. Secrets (the completion
//! API key) are resolved here, once, so nothing downstream touches the
//! process environment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_extract_bytes")]
    pub max_extract_bytes: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_extract_bytes: default_max_extract_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.pdf".to_string()]
}
fn default_max_extract_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts after the first failed call. Zero disables retry.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Resolved from `api_key_env` by [`load_config`]; never read from the file.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            max_text_chars: default_max_text_chars(),
            system_prompt: None,
            api_key: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_text_chars() -> usize {
    100_000
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model name with the provider default applied.
    pub fn model_name(&self) -> &str {
        match (&self.model, self.provider.as_str()) {
            (Some(model), _) => model,
            (None, "openai") => "gpt-4o-mini",
            (None, _) => "",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Minimum spacing between two completion calls.
    #[serde(default)]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 0,
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    1
}

const MAX_RETRIES_LIMIT: u32 = 8;

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.completion.api_key = std::env::var(&config.completion.api_key_env)
        .ok()
        .filter(|key| !key.trim().is_empty());

    Ok(config)
}

/// Parse and validate a config document without resolving secrets.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.extract.max_extract_bytes == 0 {
        bail!("extract.max_extract_bytes must be > 0");
    }

    match config.completion.provider.as_str() {
        "disabled" | "openai" => {}
        "ollama" => {
            if config.completion.model.is_none() {
                bail!("completion.model must be specified when provider is 'ollama'");
            }
        }
        other => bail!(
            "Unknown completion provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.completion.max_retries > MAX_RETRIES_LIMIT {
        bail!("completion.max_retries must be <= {}", MAX_RETRIES_LIMIT);
    }

    if !(0.0..=2.0).contains(&config.completion.temperature) {
        bail!("completion.temperature must be in [0.0, 2.0]");
    }

    if config.completion.max_text_chars == 0 {
        bail!("completion.max_text_chars must be > 0");
    }

    if config.rate_limit.max_concurrent == 0 {
        bail!("rate_limit.max_concurrent must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config("[db]\npath = \"data/docparse.sqlite\"\n").unwrap();
        assert_eq!(config.extract.include_globs, vec!["**/*.pdf"]);
        assert_eq!(config.completion.provider, "openai");
        assert_eq!(config.completion.model_name(), "gpt-4o-mini");
        assert_eq!(config.completion.max_retries, 0);
        assert_eq!(config.rate_limit.max_concurrent, 1);
        assert!(config.completion.api_key.is_none());
    }

    #[test]
    fn ollama_requires_model() {
        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[completion]\nprovider = \"ollama\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("completion.model"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[completion]\nprovider = \"carrier-pigeon\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown completion provider"));
    }

    #[test]
    fn unbounded_retries_rejected() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[completion]\nmax_retries = 50\n")
            .unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        assert!(
            parse_config("[db]\npath = \"x.sqlite\"\n[rate_limit]\nmax_concurrent = 0\n").is_err()
        );
    }

    #[test]
    fn missing_db_section_rejected() {
        assert!(parse_config("[extract]\nfollow_symlinks = true\n").is_err());
    }
}
