//! Reference worker for the bridge protocol.
//!
//! Binds document, descriptor and result listeners on loopback, prints the
//! 24-byte port handshake on stdout, accepts the three connections, reads both
//! inputs to EOF and writes the document back on the result channel.
//!
//! `ECHO_WORKER_MODE` switches to failure behaviours:
//! - `echo` (default): result = document
//! - `empty`: close the result channel without writing
//! - `inputs`: result = `<descriptor len>:<document len>`
//! - `exit-early`: print half a handshake, exit 3
//! - `unbound-descriptor`: announce a descriptor port nobody listens on

use std::io::Write;

use anyhow::{Context, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const MODE_ENV: &str = "ECHO_WORKER_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Echo,
    Empty,
    Inputs,
    ExitEarly,
    UnboundDescriptor,
}

impl Mode {
    fn from_env() -> anyhow::Result<Self> {
        let value = std::env::var(MODE_ENV).unwrap_or_default();
        Ok(match value.as_str() {
            "" | "echo" => Self::Echo,
            "empty" => Self::Empty,
            "inputs" => Self::Inputs,
            "exit-early" => Self::ExitEarly,
            "unbound-descriptor" => Self::UnboundDescriptor,
            other => bail!("unknown {MODE_ENV}: {other}"),
        })
    }
}

fn main() -> anyhow::Result<()> {
    let debug = match std::env::args().nth(1).as_deref() {
        Some("true") => true,
        Some("false") | None => false,
        Some(other) => bail!("expected true|false, got {other:?}"),
    };

    init_tracing(debug);

    let mode = Mode::from_env()?;
    tracing::debug!(?mode, "Echo worker starting");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run(mode))
}

/// stdout carries the handshake only; all diagnostics go to stderr.
fn init_tracing(debug: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = if debug { "debug" } else { "info" };
        EnvFilter::new(format!("echo_worker={level}"))
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));
    let _ = subscriber.try_init();
}

async fn run(mode: Mode) -> anyhow::Result<()> {
    let document = bind().await?;
    let descriptor = bind().await?;
    let result = bind().await?;

    let descriptor_port = match mode {
        Mode::UnboundDescriptor => {
            let unbound = bind().await?;
            port(&unbound)?
        }
        _ => port(&descriptor)?,
    };
    let handshake = format!(
        "{:08x}{:08x}{:08x}",
        port(&document)?,
        descriptor_port,
        port(&result)?
    );

    let mut stdout = std::io::stdout().lock();
    if mode == Mode::ExitEarly {
        stdout.write_all(&handshake.as_bytes()[..12])?;
        stdout.flush()?;
        tracing::info!("Exiting before completing handshake");
        std::process::exit(3);
    }
    stdout.write_all(handshake.as_bytes())?;
    stdout.flush()?;
    drop(stdout);

    tracing::debug!(%handshake, "Waiting for client connections");
    let (mut document_stream, _) = document.accept().await.context("document accept")?;
    let (mut descriptor_stream, _) = descriptor.accept().await.context("descriptor accept")?;
    let (mut result_stream, _) = result.accept().await.context("result accept")?;
    tracing::debug!("Client connected");

    // Read both concurrently; the client may still be writing one while the
    // other is complete.
    let (document_bytes, descriptor_bytes) =
        tokio::try_join!(read_all(&mut document_stream), read_all(&mut descriptor_stream))?;
    tracing::info!(
        document_bytes = document_bytes.len(),
        descriptor_bytes = descriptor_bytes.len(),
        "Inputs received"
    );

    let output = match mode {
        Mode::Echo => document_bytes,
        Mode::Empty => Vec::new(),
        Mode::Inputs => format!("{}:{}", descriptor_bytes.len(), document_bytes.len()).into_bytes(),
        Mode::ExitEarly | Mode::UnboundDescriptor => unreachable!("handled before accept"),
    };
    result_stream.write_all(&output).await.context("result write")?;
    result_stream.shutdown().await.context("result close")?;
    tracing::debug!(bytes = output.len(), "Done");
    Ok(())
}

async fn bind() -> anyhow::Result<TcpListener> {
    TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind loopback listener")
}

fn port(listener: &TcpListener) -> anyhow::Result<u16> {
    Ok(listener.local_addr()?.port())
}

async fn read_all(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}
