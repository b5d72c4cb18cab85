use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dgs_networking::{DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};

/// Base URL game servers call back into to report status.
pub const DEFAULT_API_SERVER_URL: &str = "http://aks-gaming-apiserver";

#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub min_port: u16,
    pub max_port: u16,
    pub workers: WorkerCounts,
    pub callbacks: CallbackConfig,
    pub log_level: String,
    pub seed_manifest: Option<PathBuf>,
    pub shutdown_timeout: Duration,
}

/// Worker pool size per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCounts {
    pub game_servers: usize,
    pub collections: usize,
    pub autoscaler: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            game_servers: 1,
            collections: 1,
            autoscaler: 1,
        }
    }
}

/// Where game servers report player counts and health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackConfig {
    pub api_server_url: String,
    pub access_code: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            api_server_url: DEFAULT_API_SERVER_URL.to_string(),
            access_code: String::new(),
        }
    }
}

impl CallbackConfig {
    pub fn set_active_players_url(&self) -> String {
        format!(
            "{}/setactiveplayers?code={}",
            self.api_server_url.trim_end_matches('/'),
            self.access_code
        )
    }

    pub fn set_server_status_url(&self) -> String {
        format!(
            "{}/setserverstatus?code={}",
            self.api_server_url.trim_end_matches('/'),
            self.access_code
        )
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let namespace = get("DGS_NAMESPACE").unwrap_or_else(|| "default".to_string());

        let min_port = parse_or(&get, "DGS_MIN_PORT", DEFAULT_MIN_PORT)?;
        let max_port = parse_or(&get, "DGS_MAX_PORT", DEFAULT_MAX_PORT)?;
        if min_port == 0 || min_port > max_port {
            bail!("invalid port range {min_port}-{max_port}");
        }

        let workers = WorkerCounts {
            game_servers: parse_or(&get, "DGS_GAMESERVER_WORKERS", 1)?,
            collections: parse_or(&get, "DGS_COLLECTION_WORKERS", 1)?,
            autoscaler: parse_or(&get, "DGS_AUTOSCALER_WORKERS", 1)?,
        };

        let callbacks = CallbackConfig {
            api_server_url: get("DGS_API_SERVER_URL")
                .unwrap_or_else(|| DEFAULT_API_SERVER_URL.to_string()),
            access_code: get("DGS_ACCESS_CODE").unwrap_or_default(),
        };

        let log_level = get("DGS_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let seed_manifest = get("DGS_SEED_MANIFEST").map(PathBuf::from);
        let shutdown_timeout =
            Duration::from_secs(parse_or(&get, "DGS_SHUTDOWN_TIMEOUT_SECS", 10)?);

        Ok(Self {
            namespace,
            min_port,
            max_port,
            workers,
            callbacks,
            log_level,
            seed_manifest,
            shutdown_timeout,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        None => Ok(default),
    }
}
