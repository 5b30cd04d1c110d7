//! cli::args
//!
//! Command-line argument definitions using clap derive.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{FileConfig, TlsConfig, CONFIG_ENV};

/// zetcd - serve ZooKeeper clients from etcd, an upstream ensemble, or both
#[derive(Parser, Debug)]
#[command(name = "zetcd")]
#[command(version, about, long_about = None)]
pub struct ServeArgs {
    /// Address for serving ZooKeeper clients
    #[arg(long)]
    pub zkaddr: Option<String>,

    /// etcd3 client address (host:port, http(s)://host:port, or mem://)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// etcd3 client certificate file
    #[arg(long)]
    pub certfile: Option<PathBuf>,

    /// etcd3 client key file
    #[arg(long)]
    pub keyfile: Option<PathBuf>,

    /// etcd3 CA file
    #[arg(long)]
    pub cafile: Option<PathBuf>,

    /// Upstream ZooKeeper server addresses (comma-separated)
    #[arg(long)]
    pub zkbridge: Option<String>,

    /// Cross-check both backends, answering from "zk" or "etcd"
    #[arg(long)]
    pub oracle: Option<String>,

    /// Per-request timeout towards the backends, in milliseconds
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// TOML configuration file; flags override its values
    #[arg(long, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    /// Log filter (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl ServeArgs {
    /// The flags as a config overlay.
    pub fn overlay(&self) -> FileConfig {
        let tls = TlsConfig {
            certfile: self.certfile.clone(),
            keyfile: self.keyfile.clone(),
            cafile: self.cafile.clone(),
        };
        FileConfig {
            zkaddr: self.zkaddr.clone(),
            endpoint: self.endpoint.clone(),
            zkbridge: self.zkbridge.iter().cloned().collect(),
            oracle: self.oracle.clone(),
            request_timeout_ms: self.request_timeout_ms,
            tls: (!tls.is_empty()).then_some(tls),
            session: None,
        }
    }
}

/// zkctl - ZooKeeper CLI tool
#[derive(Parser, Debug)]
#[command(name = "zkctl")]
#[command(version, about, long_about = None)]
pub struct CtlArgs {
    /// Address of the ZooKeeper server (comma-separate for a cluster)
    #[arg(long, global = true, default_value = "127.0.0.1:2181")]
    pub zkaddr: String,

    /// Timeout for connecting to the server and for each call
    #[arg(long, global = true, default_value = "1s", value_parser = parse_duration)]
    pub timeout: Duration,

    #[command(subcommand)]
    pub command: CtlCommand,
}

/// zkctl commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CtlCommand {
    /// Watch for changes on a key's children
    Watch {
        #[arg(default_value = "/")]
        key: String,
    },
    /// List child keys
    Ls {
        #[arg(default_value = "/")]
        key: String,
    },
    /// Delete a key
    Rm { key: String },
    /// Get a key's value
    Get { key: String },
    /// Set a key's value
    Set { key: String, value: String },
    /// Put a new key
    Put { key: String, value: String },
    /// Put an ephemeral key
    Eput { key: String, value: String },
    /// Put a sequenced key
    Sput { key: String, value: String },
    /// Generate shell completion scripts
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Shells for completion generation.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

/// Parse durations like `1s`, `500ms` or `2m`; a bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    let seconds = match unit {
        "" | "s" => value,
        "ms" => value / 1_000.0,
        "m" => value * 60.0,
        "h" => value * 3_600.0,
        _ => return Err(format!("unknown duration unit '{}' in '{}'", unit, s)),
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("invalid duration '{}'", s));
    }
    Ok(Duration::from_secs_f64(seconds))
}
