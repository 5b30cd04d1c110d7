//! Integration tests for the `zetcd` and `zkctl` binaries.

use std::net::TcpListener as StdListener;
use std::sync::mpsc;
use std::sync::Arc;

use assert_cmd::Command;
use predicates::prelude::*;

use zetcd::backend::{MemStore, SessionLimits};
use zetcd::personality::from_store;

fn zetcd() -> Command {
    let mut cmd = Command::cargo_bin("zetcd").unwrap();
    cmd.env_remove("ZETCD_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn zkctl(addr: &str) -> Command {
    let mut cmd = Command::cargo_bin("zkctl").unwrap();
    cmd.env_remove("RUST_LOG")
        .args(["--zkaddr", addr, "--timeout", "5s"]);
    cmd
}

/// Run a memory-backed server on its own runtime for the rest of the test
/// process and return its address.
fn background_server() -> String {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let personality = from_store(Arc::new(MemStore::new()), SessionLimits::default())
                .await
                .unwrap();
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap().to_string()).unwrap();
            zetcd::server::serve(listener, personality).await.unwrap();
        });
    });
    rx.recv().unwrap()
}

// =============================================================================
// zetcd configuration errors
// =============================================================================

mod serve_flags {
    use super::*;

    #[test]
    fn requires_listen_address() {
        zetcd()
            .args(["--endpoint", "mem://"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected --zkaddr"));
    }

    #[test]
    fn requires_a_backend() {
        zetcd()
            .args(["--zkaddr", "127.0.0.1:0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected --endpoint or --zkbridge"));
    }

    #[test]
    fn endpoint_and_bridge_need_an_oracle() {
        // Hold the port: a config error must come before any bind attempt.
        let held = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = held.local_addr().unwrap().to_string();

        zetcd()
            .args(["--zkaddr", &addr, "--endpoint", "mem://", "--zkbridge", "127.0.0.1:1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("but not both"))
            .stderr(predicate::str::contains("failed to listen").not());
    }

    #[test]
    fn rejects_unknown_oracle() {
        zetcd()
            .args([
                "--zkaddr",
                "127.0.0.1:0",
                "--endpoint",
                "mem://",
                "--zkbridge",
                "127.0.0.1:1",
                "--oracle",
                "consul",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("oracle expected etcd or zk"));
    }

    #[test]
    fn missing_config_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");

        zetcd()
            .args(["--config", missing.to_str().unwrap()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("failed to read config file"));
    }

    #[test]
    fn config_file_from_environment() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("zetcd.toml");
        std::fs::write(&file, "endpoint = \"mem://\"\nbogus = 1\n").unwrap();

        zetcd()
            .env("ZETCD_CONFIG", &file)
            .assert()
            .failure()
            .stderr(predicate::str::contains("failed to parse config file"));
    }
}

// =============================================================================
// zkctl against a live server
// =============================================================================

mod ctl {
    use super::*;

    #[test]
    fn put_get_ls_rm() {
        let addr = background_server();

        zkctl(&addr)
            .args(["put", "/greeting", "hello"])
            .assert()
            .success()
            .stdout("/greeting\n");

        zkctl(&addr)
            .args(["get", "/greeting"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("hello\nStat:\n"));

        zkctl(&addr)
            .args(["set", "/greeting", "bye"])
            .assert()
            .success();

        zkctl(&addr)
            .arg("ls")
            .assert()
            .success()
            .stdout(predicate::str::contains("ls dir /"))
            .stdout(predicate::str::contains("/greeting (greeting)"));

        zkctl(&addr).args(["rm", "/greeting"]).assert().success();

        zkctl(&addr)
            .args(["get", "/greeting"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("node does not exist"));
    }

    #[test]
    fn sequential_put_prints_assigned_name() {
        let addr = background_server();

        zkctl(&addr).args(["put", "/jobs", ""]).assert().success();
        zkctl(&addr)
            .args(["sput", "/jobs/job-", "x"])
            .assert()
            .success()
            .stdout("/jobs/job-0000000000\n");
    }

    #[test]
    fn unreachable_server_fails() {
        Command::cargo_bin("zkctl")
            .unwrap()
            .args(["--zkaddr", "127.0.0.1:1", "--timeout", "200ms", "ls"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("failed to connect"));
    }

    #[test]
    fn completion_needs_no_server() {
        Command::cargo_bin("zkctl")
            .unwrap()
            .args(["completion", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("zkctl"));
    }
}
