//! config
//!
//! Process configuration.
//!
//! # Precedence
//!
//! Values are resolved in this order (later overrides earlier):
//! 1. Default values
//! 2. TOML file named by `--config` or `$ZETCD_CONFIG`
//! 3. Command-line flags
//!
//! # Modes
//!
//! The resolved [`Config`] names exactly one [`Mode`]:
//!
//! | endpoint | zkbridge | oracle | mode |
//! |---|---|---|---|
//! | yes | no | no | backend |
//! | no | yes | no | bridge |
//! | yes | yes | yes | oracle |
//!
//! Every other combination is a [`ConfigError`], reported before any
//! listener is opened.
//!
//! # Example
//!
//! ```
//! use zetcd::config::{Config, FileConfig, Mode};
//!
//! let raw = FileConfig {
//!     zkaddr: Some("127.0.0.1:2181".into()),
//!     zkbridge: vec!["10.0.0.1:2181".into()],
//!     ..Default::default()
//! };
//! let config = Config::resolve(raw).unwrap();
//! assert!(matches!(config.mode, Mode::Bridge { .. }));
//! ```

pub mod schema;

pub use schema::{FileConfig, SessionConfig, TlsConfig};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::backend::{SessionLimits, TlsFiles};
use crate::personality::OracleSide;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "ZETCD_CONFIG";

/// Default per-request timeout towards a backend.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("expected --zkaddr")]
    MissingListen,

    #[error("expected --endpoint or --zkbridge")]
    NoBackend,

    #[error("expected --endpoint or --zkbridge but not both")]
    ConflictingBackends,

    #[error("expected --endpoint and --zkbridge with --oracle")]
    OracleIncomplete,

    #[error("oracle expected etcd or zk, got '{0}'")]
    UnknownOracle(String),

    #[error("TLS needs --certfile, --keyfile and --cafile together")]
    PartialTls,

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Which personality to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Serve from the flat backend.
    Backend {
        endpoint: String,
        tls: Option<TlsFiles>,
    },
    /// Forward to an upstream ensemble.
    Bridge { addrs: Vec<String> },
    /// Run both, answering from `side`.
    Oracle {
        side: OracleSide,
        endpoint: String,
        tls: Option<TlsFiles>,
        addrs: Vec<String>,
    },
}

/// Validated, immutable process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address to serve clients on.
    pub listen: String,
    pub mode: Mode,
    pub limits: SessionLimits,
    pub request_timeout: Duration,
}

impl Config {
    /// Read a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or holds
    /// invalid values.
    pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: FileConfig = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve raw settings into a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first rule the settings break; see the module docs.
    pub fn resolve(raw: FileConfig) -> Result<Config, ConfigError> {
        raw.validate()?;

        let listen = raw
            .zkaddr
            .filter(|addr| !addr.trim().is_empty())
            .ok_or(ConfigError::MissingListen)?;
        let endpoint = raw.endpoint.filter(|e| !e.trim().is_empty());
        let addrs: Vec<String> = raw
            .zkbridge
            .iter()
            .flat_map(|entry| entry.split(','))
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
        let tls = resolve_tls(raw.tls)?;

        let mode = match (raw.oracle, endpoint, addrs.is_empty()) {
            (Some(oracle), Some(endpoint), false) => Mode::Oracle {
                side: OracleSide::parse(&oracle).ok_or(ConfigError::UnknownOracle(oracle))?,
                endpoint,
                tls,
                addrs,
            },
            (Some(_), _, _) => return Err(ConfigError::OracleIncomplete),
            (None, Some(_), false) => return Err(ConfigError::ConflictingBackends),
            (None, Some(endpoint), true) => Mode::Backend { endpoint, tls },
            (None, None, false) => Mode::Bridge { addrs },
            (None, None, true) => return Err(ConfigError::NoBackend),
        };

        let defaults = SessionLimits::default();
        let session = raw.session.unwrap_or_default();
        let limits = SessionLimits {
            min_timeout_ms: session.min_timeout_ms.unwrap_or(defaults.min_timeout_ms),
            max_timeout_ms: session.max_timeout_ms.unwrap_or(defaults.max_timeout_ms),
        };
        if limits.min_timeout_ms > limits.max_timeout_ms {
            return Err(ConfigError::InvalidValue(format!(
                "session timeout bounds {}..{} are inverted",
                limits.min_timeout_ms, limits.max_timeout_ms
            )));
        }

        Ok(Config {
            listen,
            mode,
            limits,
            request_timeout: raw
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        })
    }

    /// Short mode name for logs.
    pub fn mode_name(&self) -> &'static str {
        match &self.mode {
            Mode::Backend { .. } => "backend",
            Mode::Bridge { .. } => "bridge",
            Mode::Oracle { .. } => "oracle",
        }
    }
}

fn resolve_tls(tls: Option<TlsConfig>) -> Result<Option<TlsFiles>, ConfigError> {
    let Some(tls) = tls.filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    match (tls.certfile, tls.keyfile, tls.cafile) {
        (Some(cert), Some(key), Some(ca)) => Ok(Some(TlsFiles { cert, key, ca })),
        _ => Err(ConfigError::PartialTls),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> FileConfig {
        FileConfig {
            zkaddr: Some("127.0.0.1:2181".into()),
            ..Default::default()
        }
    }

    mod modes {
        use super::*;

        #[test]
        fn backend_only() {
            let config = Config::resolve(FileConfig {
                endpoint: Some("127.0.0.1:2379".into()),
                ..raw()
            })
            .unwrap();
            assert_eq!(
                config.mode,
                Mode::Backend {
                    endpoint: "127.0.0.1:2379".into(),
                    tls: None
                }
            );
            assert_eq!(config.mode_name(), "backend");
        }

        #[test]
        fn bridge_only_splits_commas() {
            let config = Config::resolve(FileConfig {
                zkbridge: vec!["a:1, b:2".into(), "c:3".into()],
                ..raw()
            })
            .unwrap();
            assert_eq!(
                config.mode,
                Mode::Bridge {
                    addrs: vec!["a:1".into(), "b:2".into(), "c:3".into()]
                }
            );
        }

        #[test]
        fn oracle_with_both() {
            let config = Config::resolve(FileConfig {
                endpoint: Some("mem://".into()),
                zkbridge: vec!["a:1".into()],
                oracle: Some("etcd".into()),
                ..raw()
            })
            .unwrap();
            assert!(matches!(
                config.mode,
                Mode::Oracle {
                    side: OracleSide::Etcd,
                    ..
                }
            ));
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn missing_listen() {
            let err = Config::resolve(FileConfig {
                endpoint: Some("mem://".into()),
                ..Default::default()
            })
            .unwrap_err();
            assert!(matches!(err, ConfigError::MissingListen));
        }

        #[test]
        fn both_backends_without_oracle() {
            let err = Config::resolve(FileConfig {
                endpoint: Some("mem://".into()),
                zkbridge: vec!["a:1".into()],
                ..raw()
            })
            .unwrap_err();
            assert!(matches!(err, ConfigError::ConflictingBackends));
        }

        #[test]
        fn oracle_needs_both() {
            let err = Config::resolve(FileConfig {
                endpoint: Some("mem://".into()),
                oracle: Some("zk".into()),
                ..raw()
            })
            .unwrap_err();
            assert!(matches!(err, ConfigError::OracleIncomplete));
        }

        #[test]
        fn unknown_oracle() {
            let err = Config::resolve(FileConfig {
                endpoint: Some("mem://".into()),
                zkbridge: vec!["a:1".into()],
                oracle: Some("consul".into()),
                ..raw()
            })
            .unwrap_err();
            assert!(matches!(err, ConfigError::UnknownOracle(name) if name == "consul"));
        }

        #[test]
        fn neither_backend() {
            assert!(matches!(
                Config::resolve(raw()).unwrap_err(),
                ConfigError::NoBackend
            ));
        }

        #[test]
        fn partial_tls() {
            let err = Config::resolve(FileConfig {
                endpoint: Some("etcd:2379".into()),
                tls: Some(TlsConfig {
                    certfile: Some("c.pem".into()),
                    ..Default::default()
                }),
                ..raw()
            })
            .unwrap_err();
            assert!(matches!(err, ConfigError::PartialTls));
        }
    }

    mod files {
        use super::*;
        use std::io::Write;

        #[test]
        fn load_and_override() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "zkaddr = \"0.0.0.0:2181\"\nendpoint = \"mem://\"").unwrap();

            let from_file = Config::load_file(file.path()).unwrap();
            let flags = FileConfig {
                zkaddr: Some("127.0.0.1:3000".into()),
                ..Default::default()
            };
            let config = Config::resolve(from_file.merge(flags)).unwrap();
            assert_eq!(config.listen, "127.0.0.1:3000");
            assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        }

        #[test]
        fn parse_error_names_file() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "zkaddr = ").unwrap();
            let err = Config::load_file(file.path()).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { .. }));
        }

        #[test]
        fn missing_file() {
            let err = Config::load_file(Path::new("/nonexistent/zetcd.toml")).unwrap_err();
            assert!(matches!(err, ConfigError::ReadError { .. }));
        }
    }
}
