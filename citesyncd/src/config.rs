use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::sync::engine::EngineConfig;
use crate::sync::store::default_db_path;

const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_CEILING: u64 = 3;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub db_path: PathBuf,
    pub request_timeout: Duration,
    pub engine: EngineConfig,
    /// Initial connectivity reported to the engine.
    pub start_online: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("CITESYNC_API_URL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_token = lookup("CITESYNC_API_TOKEN")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let db_path = match lookup("CITESYNC_DB_PATH") {
            Some(value) if value.starts_with('~') => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            Some(value) => PathBuf::from(value),
            None => default_db_path().context("failed to resolve default database path")?,
        };
        let request_timeout = Duration::from_millis(read_u64(
            &lookup,
            "CITESYNC_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        ));
        let retry_base = Duration::from_millis(read_u64(
            &lookup,
            "CITESYNC_RETRY_BASE_MS",
            DEFAULT_RETRY_BASE_MS,
        ));
        let max_attempts = read_u32(&lookup, "CITESYNC_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS);
        let retry_ceiling = read_u32(&lookup, "CITESYNC_RETRY_CEILING", DEFAULT_RETRY_CEILING);
        let start_online = read_bool(&lookup, "CITESYNC_ONLINE", true);

        Ok(Self {
            api_url,
            api_token,
            db_path,
            request_timeout,
            engine: EngineConfig {
                max_attempts,
                retry_base,
                retry_ceiling,
            },
            start_online,
        })
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_u32<F>(lookup: &F, name: &str, default: u64) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    u32::try_from(read_u64(lookup, name, default)).unwrap_or(u32::MAX)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
