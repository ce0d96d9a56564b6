//! Integration tests for `limbic serve` over stdio.
//! Verifies that closing stdin (EOF) and sending signals cause clean exit,
//! and that captured turns survive the shutdown.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn limbic_binary() -> std::path::PathBuf {
    assert_cmd::cargo::cargo_bin!("limbic").into()
}

fn spawn_serve(data_dir: &TempDir) -> Child {
    Command::new(limbic_binary())
        .args(["serve", "--identity", "test-serve"])
        .env("LIMBIC_DATA_DIR", data_dir.path())
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn limbic serve")
}

/// Wait for the store to be created, indicating the server has opened it.
fn wait_for_store(data_dir: &TempDir) {
    let db = data_dir.path().join("memory.db");
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if db.exists() {
            std::thread::sleep(Duration::from_millis(100));
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Send a JSON-RPC message as newline-delimited JSON.
fn send_jsonrpc(stdin: &mut impl Write, msg: &serde_json::Value) {
    let line = serde_json::to_string(msg).unwrap();
    writeln!(stdin, "{line}").unwrap();
    stdin.flush().unwrap();
}

/// Read lines until the response carrying `id` arrives.
fn read_response(stdout: &mut BufReader<ChildStdout>, id: u64) -> serde_json::Value {
    let mut line = String::new();
    loop {
        line.clear();
        let n = stdout.read_line(&mut line).expect("read stdout");
        assert!(n > 0, "server closed stdout before answering request {id}");
        let Ok(msg) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        if msg["id"] == id {
            return msg;
        }
    }
}

/// Send the MCP initialize handshake so the server enters its main loop.
fn mcp_handshake(child: &mut Child) -> BufReader<ChildStdout> {
    let mut stdout = BufReader::new(child.stdout.take().expect("stdout pipe"));
    let stdin = child.stdin.as_mut().expect("stdin pipe");

    let init_req = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "test", "version": "0.1.0" }
        }
    });
    send_jsonrpc(stdin, &init_req);
    let response = read_response(&mut stdout, 1);
    assert!(response["result"]["capabilities"]["tools"].is_object());

    let initialized = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "notifications/initialized"
    });
    send_jsonrpc(stdin, &initialized);
    std::thread::sleep(Duration::from_millis(100));
    stdout
}

fn call_tool(
    child: &mut Child,
    stdout: &mut BufReader<ChildStdout>,
    id: u64,
    name: &str,
    arguments: serde_json::Value,
) -> serde_json::Value {
    let stdin = child.stdin.as_mut().expect("stdin pipe");
    let req = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    });
    send_jsonrpc(stdin, &req);
    let response = read_response(stdout, id);
    let text = response["result"]["content"][0]["text"]
        .as_str()
        .unwrap_or_else(|| panic!("tool {name} returned no text: {response}"));
    serde_json::from_str(text).expect("tool result is JSON")
}

/// Closing stdin before MCP init should still exit cleanly (code 0).
#[test]
fn serve_exits_on_early_stdin_eof() {
    let dir = TempDir::new().unwrap();
    let mut child = spawn_serve(&dir);
    wait_for_store(&dir);

    drop(child.stdin.take());

    let start = Instant::now();
    let output = child.wait_with_output().expect("wait");
    let elapsed = start.elapsed();

    assert!(
        output.status.success(),
        "early stdin EOF should exit 0, got {}",
        output.status
    );
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

/// After full MCP handshake, closing stdin should trigger clean shutdown.
#[test]
fn serve_exits_on_stdin_eof() {
    let dir = TempDir::new().unwrap();
    let mut child = spawn_serve(&dir);
    wait_for_store(&dir);
    let _stdout = mcp_handshake(&mut child);

    drop(child.stdin.take());

    let start = Instant::now();
    let status = child.wait().expect("wait");
    let elapsed = start.elapsed();

    assert!(status.success(), "limbic serve should exit 0 on stdin EOF, got {status}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

#[cfg(unix)]
#[test]
fn serve_exits_on_sigterm() {
    let dir = TempDir::new().unwrap();
    let mut child = spawn_serve(&dir);
    wait_for_store(&dir);
    let _stdout = mcp_handshake(&mut child);

    let killed = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .expect("run kill");
    assert!(killed.success());

    let start = Instant::now();
    let status = child.wait().expect("wait");
    let elapsed = start.elapsed();

    assert!(status.success(), "SIGTERM should shut down cleanly, got {status}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

#[test]
fn captured_turn_survives_shutdown_with_empty_wal() {
    let dir = TempDir::new().unwrap();
    let mut child = spawn_serve(&dir);
    wait_for_store(&dir);
    let mut stdout = mcp_handshake(&mut child);

    let outcome = call_tool(
        &mut child,
        &mut stdout,
        2,
        "memory_capture",
        serde_json::json!({
            "conversation_id": "conv-serve",
            "messages": [
                { "role": "user", "content": "Can you explain how quantum computing differs from classical computing?" },
                { "role": "assistant", "content": [
                    { "type": "text", "text": "Quantum computing uses qubits that hold superpositions, so some problems need far fewer steps than on classical hardware." }
                ] }
            ]
        }),
    );
    assert_eq!(outcome["status"], "stored");

    let recall = call_tool(
        &mut child,
        &mut stdout,
        3,
        "memory_recall",
        serde_json::json!({ "query": "quantum computing", "conversation_id": "conv-other" }),
    );
    assert!(recall["context"].as_str().unwrap().contains("quantum"));

    drop(child.stdin.take());
    assert!(child.wait().expect("wait").success());

    let wal = dir.path().join("memory.db-wal");
    if wal.exists() {
        let size = std::fs::metadata(&wal).unwrap().len();
        assert_eq!(size, 0, "WAL should be empty after TRUNCATE checkpoint, was {size} bytes");
    }

    #[allow(deprecated)]
    let output = assert_cmd::Command::cargo_bin("limbic")
        .unwrap()
        .env("LIMBIC_DATA_DIR", dir.path())
        .arg("health")
        .output()
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(health["turn_count"], 1);
}
