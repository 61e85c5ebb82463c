//! Server configuration, layered as built-in defaults < JSON config file <
//! environment variables and CLI flags.

use clap::Parser;
use lib_markers::core::admission::{
    AdmissionConfig, AdmissionConfigError, BanPolicy, DEFAULT_BAN_MS, DEFAULT_GRACE_MS,
    DEFAULT_LIMIT, DEFAULT_WINDOW_MS,
};
use lib_markers::core::encoder::DEFAULT_BATCH_ROWS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "server_markers.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Death marker collection and export server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "MARKERS_PORT", help = "Port to listen on.")]
    pub port: Option<u16>,

    #[clap(long, env = "MARKERS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "MARKERS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "MARKERS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "MARKERS_DATABASE", help = "Storage backend: dummy or postgres.")]
    pub database: Option<String>,

    #[clap(long, env = "MARKERS_DATABASE_URL", help = "PostgreSQL connection string.")]
    pub database_url: Option<String>,

    #[clap(long, env = "MARKERS_DATABASE_POOL_SIZE", help = "Maximum pooled database connections.")]
    pub database_pool_size: Option<usize>,

    #[clap(long, env = "MARKERS_STATIC_DIR", help = "Directory of static files served at the root.")]
    pub static_dir: Option<PathBuf>,

    #[clap(long, env = "MARKERS_EXCLUDE_PATH", help = "File listing excluded level ids, one per line.")]
    pub exclude_path: Option<PathBuf>,

    #[clap(long, env = "MARKERS_EXCLUDED_LEVELS", value_delimiter = ',', help = "Comma separated excluded level ids.")]
    pub excluded_levels: Option<Vec<i32>>,

    #[clap(long, env = "MARKERS_TRUST_PROXY", help = "Take the client address from the last X-Forwarded-For hop.")]
    pub trust_proxy: Option<bool>,

    #[clap(long, env = "MARKERS_RATE_WINDOW_MS", help = "Rate limit window in milliseconds.")]
    pub rate_limit_window_ms: Option<u64>,

    #[clap(long, env = "MARKERS_RATE_LIMIT", help = "Requests allowed per window.")]
    pub rate_limit_max: Option<u32>,

    #[clap(long, env = "MARKERS_RATE_GRACE_MS", help = "Start-up period in milliseconds during which nothing is limited.")]
    pub rate_limit_grace_ms: Option<u64>,

    #[clap(long, env = "MARKERS_BANS", help = "Escalate repeat offenders to timed bans.")]
    pub bans: Option<bool>,

    #[clap(long, env = "MARKERS_BAN_DURATION_MS", help = "Ban duration in milliseconds.")]
    pub ban_duration_ms: Option<u64>,

    #[clap(long, env = "MARKERS_SKIP_FAILED_REQUESTS", help = "Do not count requests that fail.")]
    pub skip_failed_requests: Option<bool>,

    #[clap(long, env = "MARKERS_BATCH_ROWS", help = "Rows per emitted export chunk.")]
    pub batch_rows: Option<usize>,

    #[clap(long, env = "MARKERS_TLS", help = "Serve HTTPS.")]
    pub tls: Option<bool>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    /// Built-in defaults.
    pub fn defaults() -> Config {
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            database: Some("dummy".to_string()),
            database_pool_size: Some(16),
            static_dir: Some(PathBuf::from("./front")),
            trust_proxy: Some(false),
            rate_limit_window_ms: Some(DEFAULT_WINDOW_MS),
            rate_limit_max: Some(DEFAULT_LIMIT),
            rate_limit_grace_ms: Some(DEFAULT_GRACE_MS),
            bans: Some(true),
            ban_duration_ms: Some(DEFAULT_BAN_MS),
            skip_failed_requests: Some(false),
            batch_rows: Some(DEFAULT_BATCH_ROWS),
            tls: Some(false),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            database: other.database.or(self.database),
            database_url: other.database_url.or(self.database_url),
            database_pool_size: other.database_pool_size.or(self.database_pool_size),
            static_dir: other.static_dir.or(self.static_dir),
            exclude_path: other.exclude_path.or(self.exclude_path),
            excluded_levels: other.excluded_levels.or(self.excluded_levels),
            trust_proxy: other.trust_proxy.or(self.trust_proxy),
            rate_limit_window_ms: other.rate_limit_window_ms.or(self.rate_limit_window_ms),
            rate_limit_max: other.rate_limit_max.or(self.rate_limit_max),
            rate_limit_grace_ms: other.rate_limit_grace_ms.or(self.rate_limit_grace_ms),
            bans: other.bans.or(self.bans),
            ban_duration_ms: other.ban_duration_ms.or(self.ban_duration_ms),
            skip_failed_requests: other.skip_failed_requests.or(self.skip_failed_requests),
            batch_rows: other.batch_rows.or(self.batch_rows),
            tls: other.tls.or(self.tls),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }
}

/// Configuration failures. Any of these aborts start-up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse {}: {source}", path.display())]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Admission(#[from] AdmissionConfigError),
}

/// Which backend to serve from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// The fixed single-row store.
    Dummy,
    /// PostgreSQL.
    Postgres {
        /// Connection string.
        url: String,
        /// Maximum pooled connections.
        pool_size: usize,
    },
}

/// Certificate and key for HTTPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// The resolved, validated configuration the server runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub store: StoreKind,
    pub static_dir: PathBuf,
    pub excluded_levels: Vec<i32>,
    pub trust_proxy: bool,
    pub admission: AdmissionConfig,
    pub batch_rows: usize,
    pub tls: Option<TlsPaths>,
}

/// Parses CLI flags and environment, then resolves the full configuration.
pub fn load_config() -> Result<Settings, ConfigError> {
    resolve(Config::parse())
}

/// Layers `cli` over the config file over the defaults and validates the
/// result.
pub fn resolve(cli: Config) -> Result<Settings, ConfigError> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if config_file_path.exists() {
        current_config = current_config.merge(read_config_file(&config_file_path)?);
    }
    current_config = current_config.merge(cli);

    into_settings(current_config)
}

fn read_config_file(path: &Path) -> Result<Config, ConfigError> {
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&config_str).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn into_settings(config: Config) -> Result<Settings, ConfigError> {
    let store = match config.database.as_deref().unwrap_or("dummy") {
        "dummy" => StoreKind::Dummy,
        "postgres" => StoreKind::Postgres {
            url: config
                .database_url
                .clone()
                .ok_or_else(|| ConfigError::Invalid("databaseUrl is required for the postgres store".to_string()))?,
            pool_size: config.database_pool_size.unwrap_or(16).max(1),
        },
        other => return Err(ConfigError::Invalid(format!("unknown database backend `{other}`"))),
    };

    let mut excluded_levels = config.excluded_levels.clone().unwrap_or_default();
    if let Some(path) = &config.exclude_path {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        excluded_levels.extend(parse_exclude_list(&text));
    }
    excluded_levels.sort_unstable();
    excluded_levels.dedup();

    let window_ms = config.rate_limit_window_ms.unwrap_or(DEFAULT_WINDOW_MS);
    let admission = AdmissionConfig {
        window_ms,
        limit: config.rate_limit_max.unwrap_or(DEFAULT_LIMIT),
        grace_ms: config.rate_limit_grace_ms.unwrap_or(DEFAULT_GRACE_MS),
        ban: config.bans.unwrap_or(true).then(|| BanPolicy {
            duration_ms: config.ban_duration_ms.unwrap_or(DEFAULT_BAN_MS),
            ..BanPolicy::for_window(window_ms)
        }),
        skip_failed_requests: config.skip_failed_requests.unwrap_or(false),
    };
    admission.validate()?;

    let tls = if config.tls.unwrap_or(false) {
        Some(tls_paths(config.tls_cert_path.clone(), config.tls_key_path.clone())?)
    } else {
        None
    };

    Ok(Settings {
        port: config.port.unwrap_or(8080),
        log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
        log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
        store,
        static_dir: config.static_dir.unwrap_or_else(|| PathBuf::from("./front")),
        excluded_levels,
        trust_proxy: config.trust_proxy.unwrap_or(false),
        admission,
        batch_rows: config.batch_rows.unwrap_or(DEFAULT_BATCH_ROWS).max(1),
        tls,
    })
}

/// Falls back to the LetsEncrypt files under the home directory.
fn tls_paths(cert_path: Option<PathBuf>, key_path: Option<PathBuf>) -> Result<TlsPaths, ConfigError> {
    if let (Some(cert_path), Some(key_path)) = (&cert_path, &key_path) {
        return Ok(TlsPaths {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        });
    }
    let letsencrypt_dir = dirs::home_dir()
        .ok_or_else(|| ConfigError::Invalid("HOME directory not found for default TLS paths".to_string()))?
        .join(".letsencrypt");
    Ok(TlsPaths {
        cert_path: cert_path.unwrap_or_else(|| letsencrypt_dir.join("fullchain.pem")),
        key_path: key_path.unwrap_or_else(|| letsencrypt_dir.join("privkey.pem")),
    })
}

/// Level ids from an exclude file: one per line, anything else ignored.
pub fn parse_exclude_list(text: &str) -> Vec<i32> {
    text.lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .collect()
}
