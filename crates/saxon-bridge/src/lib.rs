//! saxon-bridge: drives an out-of-process document transformer over loopback sockets.
//!
//! A worker executable binds three ephemeral TCP ports and announces them in a
//! 24-byte hex handshake on stdout. The bridge streams a descriptor (e.g. an
//! XSLT stylesheet) and a document into the worker, then reads the result
//! until the worker closes the connection. Every transform gets its own worker.

mod client;
mod config;
mod deadline;
mod error;

pub mod bridge;
pub mod staging;
pub mod supervisor;

pub use client::{Client, TransformId, transform};

pub use bridge::channels::{Channel, ChannelError};
pub use bridge::handshake::{ChannelPorts, HandshakeError, HandshakePayload};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, Phase};
pub use staging::{RetryPolicy, StagingError, TeardownError, WorkerSource};
pub use supervisor::{SimpleSpawner, SpawnError, WorkerProcess, WorkerSpawner, WorkerState};
pub use tokio_util::sync::CancellationToken;
