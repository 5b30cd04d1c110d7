//! config::schema
//!
//! Raw configuration as written in a TOML file or given as flags.
//!
//! # Example
//!
//! ```toml
//! zkaddr = "0.0.0.0:2181"
//! endpoint = "127.0.0.1:2379"
//! request_timeout_ms = 5000
//!
//! [tls]
//! certfile = "/etc/zetcd/client.pem"
//! keyfile = "/etc/zetcd/client-key.pem"
//! cafile = "/etc/zetcd/ca.pem"
//!
//! [session]
//! min_timeout_ms = 4000
//! max_timeout_ms = 40000
//! ```
//!
//! Every field is optional here; which combinations are valid is decided
//! when the raw values are resolved into a [`Config`](super::Config).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Unresolved settings from one source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Address to serve clients on
    pub zkaddr: Option<String>,

    /// Flat backend endpoint
    pub endpoint: Option<String>,

    /// Upstream ensemble addresses
    pub zkbridge: Vec<String>,

    /// Which side the oracle trusts ("zk" or "etcd")
    pub oracle: Option<String>,

    /// Per-request timeout towards either backend
    pub request_timeout_ms: Option<u64>,

    /// TLS material for the backend endpoint
    pub tls: Option<TlsConfig>,

    /// Session timeout bounds
    pub session: Option<SessionConfig>,
}

/// TLS file paths. All three or none.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
}

impl TlsConfig {
    pub fn is_empty(&self) -> bool {
        self.certfile.is_none() && self.keyfile.is_none() && self.cafile.is_none()
    }

    fn merge(self, over: TlsConfig) -> TlsConfig {
        TlsConfig {
            certfile: over.certfile.or(self.certfile),
            keyfile: over.keyfile.or(self.keyfile),
            cafile: over.cafile.or(self.cafile),
        }
    }
}

/// Bounds on negotiated session timeouts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub min_timeout_ms: Option<i32>,
    pub max_timeout_ms: Option<i32>,
}

impl SessionConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for non-positive or inverted bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("min_timeout_ms", self.min_timeout_ms),
            ("max_timeout_ms", self.max_timeout_ms),
        ] {
            if matches!(value, Some(v) if v <= 0) {
                return Err(ConfigError::InvalidValue(format!(
                    "session.{} must be positive",
                    name
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_timeout_ms, self.max_timeout_ms) {
            if min > max {
                return Err(ConfigError::InvalidValue(format!(
                    "session.min_timeout_ms ({}) exceeds session.max_timeout_ms ({})",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

impl FileConfig {
    /// Overlay `over` on `self`; values present in `over` win.
    pub fn merge(self, over: FileConfig) -> FileConfig {
        let tls = match (self.tls, over.tls) {
            (Some(base), Some(over)) => Some(base.merge(over)),
            (base, over) => over.or(base),
        };
        FileConfig {
            zkaddr: over.zkaddr.or(self.zkaddr),
            endpoint: over.endpoint.or(self.endpoint),
            zkbridge: if over.zkbridge.is_empty() {
                self.zkbridge
            } else {
                over.zkbridge
            },
            oracle: over.oracle.or(self.oracle),
            request_timeout_ms: over.request_timeout_ms.or(self.request_timeout_ms),
            tls,
            session: over.session.or(self.session),
        }
    }

    /// Check values that are wrong regardless of mode.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(session) = &self.session {
            session.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let text = r#"
            zkaddr = "0.0.0.0:2181"
            zkbridge = ["a:2181", "b:2181"]
            oracle = "zk"
            endpoint = "mem://"

            [tls]
            certfile = "c.pem"
            keyfile = "k.pem"
            cafile = "ca.pem"

            [session]
            max_timeout_ms = 20000
        "#;
        let config: FileConfig = toml::from_str(text).unwrap();
        assert_eq!(config.zkbridge.len(), 2);
        assert_eq!(config.tls.unwrap().cafile, Some(PathBuf::from("ca.pem")));
        assert_eq!(config.session.unwrap().max_timeout_ms, Some(20_000));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<FileConfig>("listen = \"x\"").is_err());
    }

    #[test]
    fn merge_prefers_overlay() {
        let base = FileConfig {
            zkaddr: Some("file:1".into()),
            endpoint: Some("file:2".into()),
            tls: Some(TlsConfig {
                certfile: Some("file.pem".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let over = FileConfig {
            zkaddr: Some("flag:1".into()),
            tls: Some(TlsConfig {
                keyfile: Some("flag.pem".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = base.merge(over);
        assert_eq!(merged.zkaddr.as_deref(), Some("flag:1"));
        assert_eq!(merged.endpoint.as_deref(), Some("file:2"));
        let tls = merged.tls.unwrap();
        assert_eq!(tls.certfile, Some(PathBuf::from("file.pem")));
        assert_eq!(tls.keyfile, Some(PathBuf::from("flag.pem")));
    }

    #[test]
    fn inverted_session_bounds_are_invalid() {
        let session = SessionConfig {
            min_timeout_ms: Some(10),
            max_timeout_ms: Some(5),
        };
        assert!(matches!(session.validate(), Err(ConfigError::InvalidValue(_))));
    }
}
