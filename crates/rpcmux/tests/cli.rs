#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/rpcmux-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            panic!("server socket never appeared");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

struct Server {
    child: Child,
    dir: PathBuf,
    socket: PathBuf,
}

impl Server {
    fn start(tag: &str, os: &str) -> Self {
        let dir = unique_temp_dir(tag);
        let socket = dir.join("rpc.sock");
        let child = Command::new(env!("CARGO_BIN_EXE_rpcmux"))
            .args(["--log-level", "error", "serve"])
            .arg(&socket)
            .args(["--os", os])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve should start");
        wait_for_socket(&socket, Duration::from_secs(3));
        Self { child, dir, socket }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn rpcmux(args: &[&str], socket: &Path) -> std::process::Output {
    let (subcommand, rest) = args.split_first().expect("subcommand");
    Command::new(env!("CARGO_BIN_EXE_rpcmux"))
        .args(["--log-level", "error", "--format", "json", subcommand])
        .arg(socket)
        .args(rest)
        .output()
        .expect("rpcmux should run")
}

#[test]
fn call_get_backend_os_against_server() {
    let server = Server::start("os", "windows");

    let output = rpcmux(&["call", "CommonServerPath", "getBackendOS"], &server.socket);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("call should emit json");
    assert_eq!(payload["result"], "Windows");
    assert_eq!(payload["channel"], "RPCService");
}

#[test]
fn call_echo_round_trips_arguments() {
    let server = Server::start("echo", "linux");

    let output = rpcmux(
        &["call", "CommonServerPath", "echo", "--args", "[{\"n\":[1,2]}]"],
        &server.socket,
    );
    assert!(output.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["result"], serde_json::json!({"n": [1, 2]}));
}

#[test]
fn unknown_method_exits_with_usage() {
    let server = Server::start("missing", "linux");

    let output = rpcmux(&["call", "CommonServerPath", "nope"], &server.socket);
    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("CommonServerPath#nope"));
}

#[test]
fn info_reports_ping_and_backend() {
    let server = Server::start("info", "macintosh");

    let output = rpcmux(&["info"], &server.socket);
    assert!(output.status.success());
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(payload["connected"], true);
    assert_eq!(payload["transport"], "unix-domain-socket");
    assert_eq!(payload["backend_os"], "Macintosh");
    assert!(payload["ping_latency_ms"].is_number());
}

#[test]
fn info_timeout_returns_124() {
    let missing = unique_temp_dir("timeout").join("missing.sock");

    let output = Command::new(env!("CARGO_BIN_EXE_rpcmux"))
        .arg("info")
        .arg(&missing)
        .args(["--timeout", "1s"])
        .output()
        .expect("info should run");

    assert_eq!(output.status.code(), Some(124));
    let _ = std::fs::remove_dir_all(missing.parent().unwrap());
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_rpcmux"))
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("rpcmux {}", env!("CARGO_PKG_VERSION"))
    );
}
