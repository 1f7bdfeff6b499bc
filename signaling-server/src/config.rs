use std::env;
use std::net::SocketAddr;

use log::LevelFilter;

const DEFAULT_ADDRESS: &str = "127.0.0.1:9000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address {0:?}")]
    Address(String),
    #[error("invalid log level {0:?}")]
    LogLevel(String),
}

/// Runtime settings of the signaling server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub log_level: LevelFilter,
}

impl ServerConfig {
    /// The listen address comes from the first command line argument, then
    /// `CALLPEER_ADDR`, then falls back to `127.0.0.1:9000`.
    /// The log level is read from `CALLPEER_LOG` and defaults to `info`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(
            env::args().nth(1),
            env::var("CALLPEER_ADDR").ok(),
            env::var("CALLPEER_LOG").ok(),
        )
    }

    fn resolve(
        arg: Option<String>,
        addr_var: Option<String>,
        log_var: Option<String>,
    ) -> Result<Self, ConfigError> {
        let address = arg
            .or(addr_var)
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        let address = address
            .parse()
            .map_err(|_| ConfigError::Address(address))?;
        let log_level = match log_var {
            Some(level) => level.parse().map_err(|_| ConfigError::LogLevel(level))?,
            None => LevelFilter::Info,
        };
        Ok(ServerConfig { address, log_level })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::resolve(None, None, None).unwrap();
        assert_eq!(config.address, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.log_level, LevelFilter::Info);
    }

    #[test]
    fn test_argument_wins_over_environment() {
        let config = ServerConfig::resolve(
            Some("0.0.0.0:7000".into()),
            Some("127.0.0.1:7001".into()),
            Some("debug".into()),
        )
        .unwrap();
        assert_eq!(config.address.port(), 7000);
        assert_eq!(config.log_level, LevelFilter::Debug);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        assert!(matches!(
            ServerConfig::resolve(Some("not an address".into()), None, None),
            Err(ConfigError::Address(_))
        ));
        assert!(matches!(
            ServerConfig::resolve(None, None, Some("loud".into())),
            Err(ConfigError::LogLevel(_))
        ));
    }
}
