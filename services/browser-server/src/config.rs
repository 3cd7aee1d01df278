//! Boot-time configuration: everything `PacketEngineBuilder` and `Cache`
//! need to assemble a running pipeline, loaded once and never hot-reloaded
//! (spec.md §6's "Configuration-driven resources... no admin interface for
//! live editing").
//!
//! Grounded on `original_source/backend-server/app/core/config.py`: a
//! single TOML document plus environment-variable overrides for the two
//! settings an operator commonly flips per-deployment (bind address, log
//! level) without touching the file. The TOML shape itself mirrors the
//! teacher's config loading in spirit (`serde`-deserialized structs), since
//! `requiem` has no HTTP front door of its own to imitate here.

use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub supported_versions: Vec<u32>,
    #[serde(default)]
    pub bump_on_restart: bool,
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,
    #[serde(default)]
    pub default_channel_scheme: u32,
    #[serde(default)]
    pub default_channel_value: String,
    #[serde(default)]
    pub remote_overrides: Vec<RemoteOverride>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteOverride {
    pub prefix: Vec<String>,
    pub peer_base_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_cache_prefix() -> String {
    "browser".to_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}

impl Settings {
    /// Loads `path` as TOML, then applies `BIND_ADDR`/`LOG_LEVEL` env
    /// overrides on top, matching the teacher's `main.rs` precedence
    /// (environment wins over file).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut settings: Settings = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if let Ok(bind_addr) = std::env::var("BIND_ADDR") {
            settings.bind_addr = bind_addr;
        }
        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            settings.log_level = log_level;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document_with_defaults() {
        let settings: Settings = toml::from_str("supported_versions = [14]").unwrap();
        assert_eq!(settings.bind_addr, "0.0.0.0:8080");
        assert_eq!(settings.supported_versions, vec![14]);
        assert!(!settings.bump_on_restart);
        assert!(settings.remote_overrides.is_empty());
    }

    #[test]
    fn parses_remote_overrides() {
        let doc = r#"
            supported_versions = [14, 15]
            bump_on_restart = true

            [[remote_overrides]]
            prefix = ["program", "transcripts"]
            peer_base_url = "https://upstream.example/api/data"
        "#;
        let settings: Settings = toml::from_str(doc).unwrap();
        assert_eq!(settings.remote_overrides.len(), 1);
        assert_eq!(settings.remote_overrides[0].prefix, vec!["program", "transcripts"]);
    }
}
