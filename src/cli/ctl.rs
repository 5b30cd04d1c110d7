//! cli::ctl
//!
//! The `zkctl` client: small commands against a running server.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{generate, shells};

use super::args::{CtlArgs, CtlCommand, Shell};
use crate::bridge::ZkClient;
use crate::proto::{Acl, ConnectRequest, CreateMode, Request, Response};
use crate::telemetry;

/// Session timeout requested by every command.
const SESSION_TIMEOUT_MS: i32 = 10_000;

/// Run the client binary.
pub fn run() -> Result<()> {
    let args = CtlArgs::parse();
    telemetry::init("warn");

    let mut stdout = std::io::stdout();
    if let CtlCommand::Completion { shell } = args.command {
        completion(shell, &mut stdout);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(execute(&args, &mut stdout))
}

/// Write the completion script for `shell` to `out`.
pub fn completion(shell: Shell, out: &mut dyn Write) {
    let mut cmd = CtlArgs::command();
    let name = cmd.get_name().to_string();

    match shell {
        Shell::Bash => generate(shells::Bash, &mut cmd, &name, out),
        Shell::Zsh => generate(shells::Zsh, &mut cmd, &name, out),
        Shell::Fish => generate(shells::Fish, &mut cmd, &name, out),
        Shell::PowerShell => generate(shells::PowerShell, &mut cmd, &name, out),
    }
}

/// Run one command, writing its output to `out`.
pub async fn execute(args: &CtlArgs, out: &mut (dyn Write + Send)) -> Result<()> {
    if let CtlCommand::Completion { shell } = args.command {
        completion(shell, out);
        return Ok(());
    }

    let addrs: Vec<String> = args
        .zkaddr
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect();
    let client = ZkClient::connect(
        &addrs,
        &ConnectRequest::new_session(SESSION_TIMEOUT_MS),
        args.timeout,
    )
    .await
    .with_context(|| format!("failed to connect to {}", args.zkaddr))?;
    let client = Arc::new(client);

    let result = run_command(&client, &args.command, out).await;
    client.close().await;
    result
}

async fn run_command(
    client: &Arc<ZkClient>,
    command: &CtlCommand,
    out: &mut (dyn Write + Send),
) -> Result<()> {
    match command {
        CtlCommand::Watch { key } => watch(client, key, out).await,
        CtlCommand::Ls { key } => ls(client, key, out).await,
        CtlCommand::Rm { key } => {
            call(
                client,
                Request::Delete {
                    path: key.clone(),
                    version: -1,
                },
            )
            .await?;
            Ok(())
        }
        CtlCommand::Get { key } => get(client, key, out).await,
        CtlCommand::Set { key, value } => {
            call(
                client,
                Request::SetData {
                    path: key.clone(),
                    data: value.as_bytes().to_vec(),
                    version: -1,
                },
            )
            .await?;
            Ok(())
        }
        CtlCommand::Put { key, value } => put(client, key, value, CreateMode::Persistent, out).await,
        CtlCommand::Eput { key, value } => put(client, key, value, CreateMode::Ephemeral, out).await,
        CtlCommand::Sput { key, value } => {
            put(client, key, value, CreateMode::PersistentSequential, out).await
        }
        CtlCommand::Completion { .. } => Ok(()),
    }
}

async fn call(client: &ZkClient, request: Request) -> Result<Response> {
    let op = request.op_code();
    let path = request.path().unwrap_or_default().to_string();
    let reply = client
        .call(request)
        .await
        .with_context(|| format!("{} {} failed", op, path))?;
    Ok(reply.response)
}

async fn ls(client: &ZkClient, key: &str, out: &mut (dyn Write + Send)) -> Result<()> {
    writeln!(out, "ls dir {}", key)?;
    let (mut children, stat) = match call(
        client,
        Request::GetChildren2 {
            path: key.to_string(),
            watch: false,
        },
    )
    .await?
    {
        Response::GetChildren2 { children, stat } => (children, stat),
        other => bail!("unexpected response {:?}", other),
    };
    children.sort();
    writeln!(out, "Children:")?;
    for child in &children {
        writeln!(out, "{} ({})", child_path(key, child), child)?;
    }
    writeln!(out, "Stat: {:?}", stat)?;
    Ok(())
}

async fn get(client: &ZkClient, key: &str, out: &mut (dyn Write + Send)) -> Result<()> {
    match call(
        client,
        Request::GetData {
            path: key.to_string(),
            watch: false,
        },
    )
    .await?
    {
        Response::GetData { data, stat } => {
            writeln!(out, "{}", String::from_utf8_lossy(&data))?;
            writeln!(out, "Stat:\n{:?}", stat)?;
            Ok(())
        }
        other => bail!("unexpected response {:?}", other),
    }
}

async fn put(
    client: &ZkClient,
    key: &str,
    value: &str,
    mode: CreateMode,
    out: &mut (dyn Write + Send),
) -> Result<()> {
    match call(
        client,
        Request::Create {
            path: key.to_string(),
            data: value.as_bytes().to_vec(),
            acl: Acl::world_all(),
            mode,
        },
    )
    .await?
    {
        Response::Create { path } => {
            writeln!(out, "{}", path)?;
            Ok(())
        }
        other => bail!("unexpected response {:?}", other),
    }
}

/// List `key` with a child watch and print the first event.
async fn watch(client: &Arc<ZkClient>, key: &str, out: &mut (dyn Write + Send)) -> Result<()> {
    let mut events = client
        .take_events()
        .ok_or_else(|| anyhow!("watch events already taken"))?;
    let keepalive = client.spawn_keepalive(Duration::from_millis(
        (SESSION_TIMEOUT_MS / 3).max(1) as u64,
    ));

    writeln!(out, "watch dir {}", key)?;
    let listed = call(
        client,
        Request::GetChildren2 {
            path: key.to_string(),
            watch: true,
        },
    )
    .await;
    let result = match listed {
        Ok(Response::GetChildren2 { children, stat }) => {
            writeln!(out, "{:?} {:?}", children, stat)?;
            out.flush()?;
            match events.recv().await {
                Some(event) => {
                    writeln!(out, "{:?}", event)?;
                    Ok(())
                }
                None => Err(anyhow!("connection closed before any event")),
            }
        }
        Ok(other) => Err(anyhow!("unexpected response {:?}", other)),
        Err(err) => Err(err),
    };
    keepalive.abort();
    result
}

fn child_path(dir: &str, child: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{}/{}", dir, child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_paths() {
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/a", "b"), "/a/b");
        assert_eq!(child_path("/a/", "b"), "/a/b");
    }

    #[test]
    fn completion_scripts_name_the_binary() {
        let mut out = Vec::new();
        completion(Shell::Bash, &mut out);
        let script = String::from_utf8(out).unwrap();
        assert!(script.contains("zkctl"));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let args = CtlArgs::parse_from(["zkctl", "--zkaddr", "127.0.0.1:1", "--timeout", "200ms", "ls"]);
        let mut out = Vec::new();
        let err = execute(&args, &mut out).await.unwrap_err();
        assert!(err.to_string().contains("failed to connect"));
    }
}
