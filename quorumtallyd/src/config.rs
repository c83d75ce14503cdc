use quorumtally::{EngineConfig, OrchestratorConfig};
use std::env::var;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("quorumtallyd: {name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub orchestrator: OrchestratorConfig,

    /// SQLite database file, created on first start
    pub db_path: PathBuf,

    pub address: String,
    pub port: u16,
    pub log_level: Level,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::from_lookup(|name| var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineConfig::default();

        let base_url = match lookup("QUORUMTALLY_ENGINE_URL") {
            Some(val) => val,
            None => defaults.base_url,
        };

        let timeout = match lookup("QUORUMTALLY_ENGINE_TIMEOUT_SECS") {
            Some(val) => Duration::from_secs(parse(
                "QUORUMTALLY_ENGINE_TIMEOUT_SECS",
                "a number of seconds",
                val,
            )?),
            None => defaults.timeout,
        };

        let connect_timeout = match lookup("QUORUMTALLY_ENGINE_CONNECT_TIMEOUT_SECS") {
            Some(val) => Duration::from_secs(parse(
                "QUORUMTALLY_ENGINE_CONNECT_TIMEOUT_SECS",
                "a number of seconds",
                val,
            )?),
            None => defaults.connect_timeout,
        };

        let max_response_bytes = match lookup("QUORUMTALLY_ENGINE_MAX_RESPONSE_BYTES") {
            Some(val) => parse(
                "QUORUMTALLY_ENGINE_MAX_RESPONSE_BYTES",
                "a byte count",
                val,
            )?,
            None => defaults.max_response_bytes,
        };

        let db_path = match lookup("QUORUMTALLY_DB_PATH") {
            Some(val) if val.trim().is_empty() => {
                return Err(ConfigError::Invalid {
                    name: "QUORUMTALLY_DB_PATH",
                    expected: "a file path",
                    value: val,
                })
            }
            Some(val) => PathBuf::from(val),
            None => PathBuf::from("./quorumtally.db"),
        };

        let address = match lookup("QUORUMTALLY_ADDRESS") {
            Some(val) => val,
            None => "127.0.0.1".to_owned(),
        };

        let port = match lookup("QUORUMTALLY_PORT") {
            Some(val) => parse("QUORUMTALLY_PORT", "a port number", val)?,
            None => 8000,
        };

        let log_level = match lookup("QUORUMTALLY_LOG") {
            Some(val) => parse(
                "QUORUMTALLY_LOG",
                "one of trace, debug, info, warn, error",
                val,
            )?,
            None => Level::INFO,
        };

        // The orchestrator's bound covers connecting and the request itself
        let orchestrator = OrchestratorConfig {
            engine_timeout: timeout + connect_timeout,
        };

        Ok(Config {
            engine: EngineConfig {
                base_url,
                timeout,
                connect_timeout,
                max_response_bytes,
            },
            orchestrator,
            db_path,
            address,
            port,
            log_level,
        })
    }
}

fn parse<T: FromStr>(
    name: &'static str,
    expected: &'static str,
    value: String,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        expected,
        value,
    })
}
