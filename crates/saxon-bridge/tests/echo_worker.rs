//! End-to-end transforms against the bundled `echo-worker` binary.

#![cfg(unix)]

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use saxon_bridge::{
    BridgeConfig, BridgeError, Channel, ChannelError, Client, HandshakeError, SpawnError,
    WorkerProcess, WorkerSource, WorkerSpawner, WorkerState,
};
use tokio::process::{Child, Command};

const ECHO_WORKER: &str = env!("CARGO_BIN_EXE_echo-worker");

/// Launches the echo worker in a given `ECHO_WORKER_MODE`.
struct ModeSpawner(&'static str);

impl WorkerSpawner for ModeSpawner {
    fn spawn(&self, executable: &Path, debug: bool) -> Result<Child, SpawnError> {
        Command::new(executable)
            .arg(debug.to_string())
            .env("ECHO_WORKER_MODE", self.0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                path: executable.to_path_buf(),
                source,
            })
    }
}

fn client(mode: &'static str) -> Client {
    Client::from_config(
        BridgeConfig::new(WorkerSource::path(ECHO_WORKER)).with_spawner(Arc::new(ModeSpawner(mode))),
    )
}

#[tokio::test]
async fn echoes_document() {
    let output = Client::with_executable(ECHO_WORKER)
        .transform(b"<a/>", b"<xsl:stylesheet/>")
        .await
        .unwrap();
    assert_eq!(output, b"<a/>");
}

#[tokio::test]
async fn debug_worker_still_transforms() {
    let output = Client::with_debug(WorkerSource::path(ECHO_WORKER))
        .transform(b"<doc>debug</doc>", b"<x/>")
        .await
        .unwrap();
    assert_eq!(output, b"<doc>debug</doc>");
}

#[tokio::test]
async fn embedded_worker_is_staged_and_removed() {
    let bytes = std::fs::read(ECHO_WORKER).unwrap();
    let config = BridgeConfig::new(WorkerSource::path(ECHO_WORKER)).with_embedded(bytes);

    let mut worker = WorkerProcess::new(&config);
    let payload = worker.start(&config.worker, false).await.unwrap();
    let staged = worker.staged_path().unwrap().to_path_buf();
    assert!(staged.exists());
    assert_ne!(staged, Path::new(ECHO_WORKER));
    payload.decode().unwrap();

    worker.stop().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(!staged.exists(), "{} left behind", staged.display());

    let output = Client::from_config(config)
        .transform(b"<staged/>", b"<x/>")
        .await
        .unwrap();
    assert_eq!(output, b"<staged/>");
}

#[tokio::test]
async fn empty_result() {
    let output = client("empty").transform(b"<a/>", b"<x/>").await.unwrap();
    assert!(output.is_empty());
}

#[tokio::test]
async fn large_inputs_arrive_intact() {
    let document = vec![b'd'; 2 * 1024 * 1024];
    let descriptor = vec![b's'; 512 * 1024];

    let output = client("inputs")
        .transform(&document, &descriptor)
        .await
        .unwrap();
    assert_eq!(
        String::from_utf8(output).unwrap(),
        format!("{}:{}", descriptor.len(), document.len())
    );
}

#[tokio::test]
async fn unbound_descriptor_port_fails_dial() {
    let err = client("unbound-descriptor")
        .transform(b"<a/>", b"<x/>")
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            BridgeError::Channel(ChannelError::Dial {
                channel: Channel::Descriptor,
                ..
            })
        ),
        "{err:?}"
    );
}

#[tokio::test]
async fn worker_exiting_mid_handshake() {
    let err = client("exit-early")
        .transform(b"<a/>", b"<x/>")
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            BridgeError::Handshake(HandshakeError::Incomplete { received: 12 })
        ),
        "{err:?}"
    );
}
