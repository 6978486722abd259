//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `TRAFFIC_SCANNER_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `TRAFFIC_SCANNER_` override YAML values
//! 3. **DATABASE_URL** - Special case: switches storage to SQLite at that URL if set
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `TRAFFIC_SCANNER_SCANNER__PERIOD=5m` sets the `scanner.period` field.
//!
//! ## Configuration Structure
//!
//! - **Scanner**: `scanner.period`, `scanner.retention_days`, `scanner.crash_cooldown` - scan loop cadence
//! - **Client**: `client.endpoint`, `client.session_timeout`, `client.request_delay` - routing service session
//! - **Storage**: `storage.type` (`sqlite` or `file`) with its backend settings
//! - **Users**: `default_timezone` - UTC offset in hours for users that never set one
//! - **Telemetry**: `telemetry.otel_export`, `telemetry.log_format`
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Scan every five minutes
//! TRAFFIC_SCANNER_SCANNER__PERIOD=5m
//!
//! # Use the file-backed store
//! TRAFFIC_SCANNER_STORAGE__TYPE=file
//! TRAFFIC_SCANNER_STORAGE__DIR=/var/lib/traffic-scanner
//!
//! # Or point at a SQLite database
//! DATABASE_URL="sqlite:///var/lib/traffic-scanner/traffic.db"
//! ```

use chrono::Weekday;
use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;
use crate::types::{Coords, RouteId, UserId};

/// CLI args - config file location plus the command to run
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TRAFFIC_SCANNER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without doing anything else.
    #[arg(long)]
    pub validate: bool,

    /// What to do; defaults to `serve`
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the scan loop until interrupted
    Serve,
    /// Track a new route and take its first sample immediately
    AddRoute {
        #[arg(long)]
        user: UserId,
        /// Start point as `lat,lon`
        #[arg(long, allow_hyphen_values = true)]
        start: Coords,
        /// End point as `lat,lon`
        #[arg(long, allow_hyphen_values = true)]
        end: Coords,
        #[arg(long)]
        title: String,
    },
    /// Stop tracking a route and delete its samples
    RemoveRoute {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        route: RouteId,
    },
    /// Change a route's title
    RenameRoute {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        route: RouteId,
        #[arg(long)]
        title: String,
    },
    /// List routes of one user, or of everyone
    ListRoutes {
        #[arg(long)]
        user: Option<UserId>,
    },
    /// Set a user's UTC offset in hours
    SetTimezone {
        #[arg(long)]
        user: UserId,
        #[arg(long, allow_negative_numbers = true)]
        hours: i32,
    },
    /// Print the daily travel-time profile of a route
    Report {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        route: RouteId,
        /// Restrict to one weekday (`mon`..`sun`) in the owner's local time
        #[arg(long)]
        day: Option<Weekday>,
    },
}

/// Main application configuration.
///
/// All fields have sensible defaults defined in the `Default` implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// UTC offset (hours) applied to users without a timezone of their own
    pub default_timezone: i32,
    /// Scan loop settings
    pub scanner: ScannerConfig,
    /// Routing service session settings
    pub client: ClientConfig,
    /// Storage backend
    pub storage: StorageConfig,
    /// Logging and trace export
    pub telemetry: TelemetryConfig,
    /// Set from `DATABASE_URL`; folded into `storage` by [`Config::load`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timezone: 3,
            scanner: ScannerConfig::default(),
            client: ClientConfig::default(),
            storage: StorageConfig::default(),
            telemetry: TelemetryConfig::default(),
            database_url: None,
        }
    }
}

/// Scan loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScannerConfig {
    /// Target time between the starts of two scan cycles
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Samples older than this many days are deleted
    pub retention_days: u32,
    /// How long to wait before restarting a crashed scan loop
    #[serde(with = "humantime_serde")]
    pub crash_cooldown: Duration,
    /// Restart the scan loop after a crash instead of exiting
    pub restart_on_crash: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10 * 60),
            retention_days: 14,
            crash_cooldown: Duration::from_secs(60 * 60),
            restart_on_crash: true,
        }
    }
}

/// Routing service client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Base URL of the maps service; must end with `/`
    pub endpoint: String,
    /// Session credentials older than this are refreshed before the next request
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// Pause before every outbound request
    #[serde(with = "humantime_serde")]
    pub request_delay: Duration,
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    /// `lang` query parameter of route requests
    pub lang: String,
    /// `locale` query parameter of route requests
    pub locale: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://yandex.ru/maps/".to_string(),
            session_timeout: Duration::from_secs(24 * 60 * 60),
            request_delay: Duration::from_millis(100),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_6) AppleWebKit/605.1.15 (KHTML, like Gecko) \
                         Version/13.1.2 Safari/605.1.15"
                .to_string(),
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            accept_language: "en-us".to_string(),
            lang: "ru".to_string(),
            locale: "ru_RU".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn endpoint_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.endpoint)
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Transactional relational store
    Sqlite {
        /// Connection string, e.g. `sqlite://traffic.db`
        url: String,
        #[serde(default)]
        pool: SqlitePoolSettings,
    },
    /// Append-only JSON-lines files in a directory
    File { dir: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            url: "sqlite://traffic.db".to_string(),
            pool: SqlitePoolSettings::default(),
        }
    }
}

/// SQLite connection settings.
///
/// The pool always holds a single connection, so a storage scope waits for the one in flight.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SqlitePoolSettings {
    /// Maximum time to wait for the connection while another scope of this process holds it
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// How long SQLite waits for another process's write lock before failing
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for SqlitePoolSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(15 * 60),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Export traces over OTLP, configured by the standard `OTEL_*` variables
    pub otel_export: bool,
    pub log_format: LogFormat,
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        // if DATABASE_URL is set, use it (preserving pool settings)
        if let Some(url) = config.database_url.take() {
            let pool = match &config.storage {
                StorageConfig::Sqlite { pool, .. } => pool.clone(),
                StorageConfig::File { .. } => SqlitePoolSettings::default(),
            };
            config.storage = StorageConfig::Sqlite { url, pool };
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.scanner.period.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: scanner.period must be greater than zero".to_string(),
            });
        }

        if self.scanner.retention_days == 0 {
            return Err(Error::Internal {
                operation: "Config validation: scanner.retention_days must be at least 1".to_string(),
            });
        }

        if !(-12..=14).contains(&self.default_timezone) {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: default_timezone ({}) must be between -12 and 14",
                    self.default_timezone
                ),
            });
        }

        let endpoint = self.client.endpoint_url().map_err(|e| Error::Internal {
            operation: format!("Config validation: client.endpoint ({}) is not a URL: {e}", self.client.endpoint),
        })?;
        if !endpoint.path().ends_with('/') {
            return Err(Error::Internal {
                operation: format!("Config validation: client.endpoint ({endpoint}) must end with '/'"),
            });
        }

        if let StorageConfig::Sqlite { url, .. } = &self.storage
            && !url.starts_with("sqlite:")
        {
            return Err(Error::Internal {
                operation: format!("Config validation: storage url ({url}) must be a sqlite: URL"),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("TRAFFIC_SCANNER_").split("__").ignore(&["config"]))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }
}
