use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::images::{OutputFormat, SizeProfiles};

/// Default total size budget of the image cache (50 MiB).
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Extract(#[from] Box<rocket::figment::Error>),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Disk,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub address: String,
    pub timeout: u64,
    pub user_agent: String,
    #[serde(default)]
    pub upstream_proxy: Option<String>,
    #[serde(default)]
    pub cache_backend: CacheBackend,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_cache_version")]
    pub cache_version: String,
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    #[serde(default = "default_eviction_fraction")]
    pub eviction_fraction: f64,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub size_profiles: SizeProfiles,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_cache_version() -> String {
    "image-cache-v1".to_string()
}

fn default_cache_max_bytes() -> u64 {
    DEFAULT_CACHE_MAX_BYTES
}

fn default_eviction_fraction() -> f64 {
    0.3
}

fn default_quality() -> u8 {
    85
}

impl AppConfig {
    /// Extract and validate the app config from a figment.
    pub fn from_figment(figment: &rocket::figment::Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quality == 0 || self.quality > 100 {
            return Err(ConfigError::InvalidValue {
                field: "quality",
                message: format!("expected 1-100, got {}", self.quality),
            });
        }

        if !(self.eviction_fraction > 0.0 && self.eviction_fraction <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "eviction_fraction",
                message: format!("expected a value in (0, 1], got {}", self.eviction_fraction),
            });
        }

        if self.cache_version.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cache_version",
                message: "must not be empty".to_string(),
            });
        }

        if let Some(profile) = self.size_profiles.first_zero() {
            return Err(ConfigError::InvalidValue {
                field: "size_profiles",
                message: format!("profile '{}' must be a positive pixel count", profile),
            });
        }

        Ok(())
    }
}
