//! End-to-end runs of the `ptyx` binary with redirected standard streams
//!
//! With stdout on a pipe there is no console, so `ptyx run` copies streams
//! between the pipes and the child's pty.

#![cfg(unix)]

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

async fn ptyx(args: &[&str], input: &[u8]) -> Output {
    let dir = tempfile::tempdir().unwrap();
    let mut child = Command::new(env!("CARGO_BIN_EXE_ptyx"))
        .args(args)
        .current_dir(dir.path())
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(input).await.unwrap();
    drop(stdin);

    timeout(Duration::from_secs(10), child.wait_with_output())
        .await
        .expect("ptyx should exit")
        .unwrap()
}

#[tokio::test]
async fn test_run_without_console_relays_output() {
    let output = ptyx(&["run", "/bin/sh", "-c", "echo hi"], b"").await;

    assert!(
        String::from_utf8_lossy(&output.stdout).contains("hi"),
        "stdout: {:?}",
        String::from_utf8_lossy(&output.stdout)
    );
    assert_eq!(output.status.code(), Some(0));
}

#[tokio::test]
async fn test_run_without_console_forwards_unterminated_input() {
    let output = ptyx(&["run", "cat"], b"ping").await;

    assert!(String::from_utf8_lossy(&output.stdout).contains("ping"));
    assert_eq!(output.status.code(), Some(0));
}

#[tokio::test]
async fn test_run_reports_child_exit_code() {
    let output = ptyx(&["run", "/bin/sh", "-c", "exit 3"], b"").await;
    assert_eq!(output.status.code(), Some(3));
}

#[tokio::test]
async fn test_exec_discards_output() {
    let output = ptyx(&["exec", "/bin/sh", "-c", "echo hidden"], b"").await;

    assert!(output.stdout.is_empty());
    assert_eq!(output.status.code(), Some(0));
}
