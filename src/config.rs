//! Runtime configuration for the sync server.
//!
//! Values come from the process environment, after an optional `.env` file is
//! loaded with dotenvy. Every setting has a default so a bare `cargo run`
//! starts a server on port 11111 with data under `./farm_data`.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Result, SyncError};

pub const DEFAULT_ADDR: &str = "0.0.0.0:11111";
pub const DEFAULT_DATA_DIR: &str = "farm_data";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct Config {
    /// Sled directory holding every collection.
    pub data_dir: PathBuf,
    /// REST listen address.
    pub addr: SocketAddr,
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_json: bool,
    /// When set, logs also go to a daily-rolling file in this directory.
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Load `.env` (if present) and read `FARM_SYNC_*` variables.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let addr_raw = lookup("FARM_SYNC_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = addr_raw
            .parse::<SocketAddr>()
            .map_err(|e| SyncError::Config(format!("FARM_SYNC_ADDR '{}': {}", addr_raw, e)))?;

        let log_json = match lookup("FARM_SYNC_LOG_JSON") {
            None => false,
            Some(v) => parse_flag(&v).ok_or_else(|| {
                SyncError::Config(format!("FARM_SYNC_LOG_JSON '{}' is not a boolean", v))
            })?,
        };

        Ok(Self {
            data_dir: lookup("FARM_SYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            addr,
            log_level: lookup("FARM_SYNC_LOG").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_json,
            log_dir: lookup("FARM_SYNC_LOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = Config::from_lookup(lookup_from(&[])).expect("defaults");
        assert_eq!(config.addr, DEFAULT_ADDR.parse::<SocketAddr>().unwrap());
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_overrides_are_read() {
        let config = Config::from_lookup(lookup_from(&[
            ("FARM_SYNC_ADDR", "127.0.0.1:8080"),
            ("FARM_SYNC_DATA_DIR", "/tmp/farm"),
            ("FARM_SYNC_LOG", "farm_sync=debug"),
            ("FARM_SYNC_LOG_JSON", "yes"),
            ("FARM_SYNC_LOG_DIR", "/var/log/farm"),
        ]))
        .expect("config");
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/farm"));
        assert_eq!(config.log_level, "farm_sync=debug");
        assert!(config.log_json);
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/farm")));
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        let err = Config::from_lookup(lookup_from(&[("FARM_SYNC_ADDR", "not-an-addr")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        let err = Config::from_lookup(lookup_from(&[("FARM_SYNC_LOG_JSON", "maybe")])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
