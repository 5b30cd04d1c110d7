//! cli::serve
//!
//! The `zetcd` server entry point.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use super::args::ServeArgs;
use crate::config::{Config, FileConfig};
use crate::personality::from_config;
use crate::{server, telemetry};

/// Run the server binary.
pub fn run() -> Result<()> {
    let args = ServeArgs::parse();
    telemetry::init(&args.log_level);

    let config = resolve(&args)?;
    tracing::debug!(?config, "configuration resolved");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(serve(config))
}

/// Merge the config file (if any) under the flags and validate the result.
pub fn resolve(args: &ServeArgs) -> Result<Config> {
    let file = match &args.config {
        Some(path) => Config::load_file(path)?,
        None => FileConfig::default(),
    };
    Ok(Config::resolve(file.merge(args.overlay()))?)
}

/// Bind, build the personality and serve until interrupted.
pub async fn serve(config: Config) -> Result<()> {
    tracing::info!(listen = %config.listen, mode = config.mode_name(), "starting");
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;
    let personality = from_config(&config).await?;

    let ctx = personality.ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            ctx.cancel();
        }
    });

    server::serve(listener, personality)
        .await
        .context("server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use std::io::Write;

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "zkaddr = \"127.0.0.1:1\"\nendpoint = \"mem://\"").unwrap();

        let args = ServeArgs::parse_from([
            "zetcd",
            "--config",
            file.path().to_str().unwrap(),
            "--zkaddr",
            "127.0.0.1:2",
        ]);
        let config = resolve(&args).unwrap();
        assert_eq!(config.listen, "127.0.0.1:2");
        assert!(matches!(config.mode, Mode::Backend { ref endpoint, .. } if endpoint == "mem://"));
    }

    #[test]
    fn invalid_combination_is_reported() {
        let args = ServeArgs::parse_from([
            "zetcd",
            "--zkaddr",
            "127.0.0.1:2",
            "--endpoint",
            "mem://",
            "--zkbridge",
            "127.0.0.1:3",
        ]);
        let err = resolve(&args).unwrap_err();
        assert!(err.to_string().contains("but not both"));
    }
}
