//! Configuration file support for projectlens.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `PROJECTLENS_`, nested keys joined
//!    with `__`, e.g. `PROJECTLENS_SYNC__STAGE2_INTERVAL_MS`)
//! 3. Config file (~/.config/projectlens/config.toml or ./projectlens.toml)
//! 4. Built-in defaults
//!
//! `PROJECTLENS_DATABASE_URL` is accepted as a shorthand for `database.url`.
//! The database URL defaults to `sqlite://~/.local/state/projectlens/projectlens.db`
//! on Linux (using the XDG state directory) if not explicitly configured.
//!
//! Example config file:
//! ```toml
//! [database]
//! url = "sqlite://~/.local/state/projectlens/projectlens.db"  # optional, this is the default
//!
//! [http]
//! request_timeout_secs = 30
//!
//! [sync]
//! stage1_max_concurrent = 5
//! stage2_interval_ms = 300000
//! stage3_throttle_ms = 2000
//! max_retries = 3
//! ```

use std::path::PathBuf;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use projectlens::sync::SyncConfig;
use serde::Deserialize;

const APP_NAME: &str = "projectlens";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// HTTP client settings for the Backlog API.
    pub http: HttpConfig,
    /// Sync core tunables.
    pub sync: SyncConfig,
}

/// Database configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL.
    /// Supports sqlite:// and postgres:// schemes.
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Transport timeout for a single HTTP call.
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults
    /// 2. XDG config file (~/.config/projectlens/config.toml)
    /// 3. Local config file (./projectlens.toml)
    /// 4. Environment variables with PROJECTLENS_ prefix
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Some(proj_dirs) = ProjectDirs::from("", "", APP_NAME) {
            let xdg_config = proj_dirs.config_dir().join("config.toml");
            if xdg_config.exists() {
                tracing::debug!("Loading config from {:?}", xdg_config);
                builder = builder.add_source(
                    File::from(xdg_config)
                        .format(FileFormat::Toml)
                        .required(false),
                );
            }
        }

        let local_config = PathBuf::from("projectlens.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./projectlens.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // e.g., PROJECTLENS_SYNC__MAX_RETRIES -> sync.max_retries
        builder = builder.add_source(
            Environment::with_prefix("PROJECTLENS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Ok(url) = std::env::var("PROJECTLENS_DATABASE_URL") {
            builder = match builder.set_override("database.url", url) {
                Ok(builder) => builder,
                Err(e) => {
                    tracing::warn!("Ignoring PROJECTLENS_DATABASE_URL: {}", e);
                    return Config::default();
                }
            };
        }

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Config::default()
            }
        }
    }

    /// Get the database URL, falling back to the default state directory path.
    ///
    /// The `mode=rwc` parameter enables read-write access and creates the file
    /// if it doesn't exist.
    pub fn database_url(&self) -> Option<String> {
        self.database.url.clone().or_else(|| {
            Self::default_state_dir().map(|state_dir| {
                let db_path = state_dir.join("projectlens.db");
                format!("sqlite://{}?mode=rwc", db_path.display())
            })
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.request_timeout_secs.max(1))
    }

    /// Get the default state directory path.
    ///
    /// On Linux, this is `$XDG_STATE_HOME/projectlens` or `~/.local/state/projectlens`.
    /// On macOS/Windows, falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", APP_NAME).map(|dirs| {
            // state_dir() returns None on macOS/Windows, fall back to data_dir
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.database.url.is_none());
        assert_eq!(config.http.request_timeout_secs, 30);
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder_with_toml_string() {
        let toml_content = r#"
            [database]
            url = "sqlite:///tmp/test.db"

            [http]
            request_timeout_secs = 5

            [sync]
            stage1_max_concurrent = 8
            stage3_throttle_ms = 500
            predictive_scaling = false
        "#;

        let settings = ConfigBuilder::builder()
            .add_source(config::File::from_str(toml_content, FileFormat::Toml))
            .build()
            .unwrap();

        let config: Config = settings.try_deserialize().unwrap();
        assert_eq!(
            config.database.url,
            Some("sqlite:///tmp/test.db".to_string())
        );
        assert_eq!(config.http.request_timeout_secs, 5);
        assert_eq!(config.sync.stage1_max_concurrent, 8);
        assert_eq!(config.sync.stage3_throttle_ms, 500);
        assert!(!config.sync.predictive_scaling);
    }

    #[test]
    fn test_config_builder_partial_override() {
        let toml_content = r#"
            [sync]
            max_retries = 5
        "#;

        let settings = ConfigBuilder::builder()
            .add_source(config::File::from_str(toml_content, FileFormat::Toml))
            .build()
            .unwrap();

        let config: Config = settings.try_deserialize().unwrap();
        assert_eq!(config.sync.max_retries, 5);
        // Other values should be defaults
        assert_eq!(
            config.sync.stage2_interval_ms,
            SyncConfig::default().stage2_interval_ms
        );
        assert_eq!(config.http.request_timeout_secs, 30);
    }

    #[test]
    fn test_config_builder_with_defaults() {
        let settings = ConfigBuilder::builder().build().unwrap();
        let config: Config = settings.try_deserialize().unwrap_or_default();
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_database_url_prefers_configured() {
        let config = Config {
            database: DatabaseConfig {
                url: Some("postgres:///projectlens".to_string()),
            },
            ..Config::default()
        };
        assert_eq!(
            config.database_url().as_deref(),
            Some("postgres:///projectlens")
        );
    }

    #[test]
    fn test_database_url_default_is_sqlite_in_state_dir() {
        let config = Config::default();
        if let Some(url) = config.database_url() {
            assert!(url.starts_with("sqlite://"));
            assert!(url.ends_with("projectlens.db?mode=rwc"));
        }
    }
}
