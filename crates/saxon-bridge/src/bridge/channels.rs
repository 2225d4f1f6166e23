//! Loopback TCP channels between the bridge and a worker.
//!
//! One transform uses three single-use connections:
//! - **descriptor**: bridge writes the transform descriptor, then closes
//! - **document**: bridge writes the source document, then closes
//! - **result**: worker writes the result, then closes
//!
//! There is no framing on any channel. The worker starts producing output once
//! both input channels are closed, and closing the result channel is the only
//! completion signal.
//!
//! The types enforce the order: [`ChannelSet::send_inputs`] consumes the set
//! and only hands back the [`ResultChannel`] once both inputs are closed.

use std::fmt;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::handshake::ChannelPorts;

/// Read buffer size for the result channel.
pub const RESULT_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Document,
    Descriptor,
    Result,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Descriptor => "descriptor",
            Self::Result => "result",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{channel} port {port} is not a valid TCP port")]
    PortOutOfRange { channel: Channel, port: u32 },

    #[error("failed to connect to {channel} channel on port {port}: {source}")]
    Dial {
        channel: Channel,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {channel}: {source}")]
    Write {
        channel: Channel,
        #[source]
        source: io::Error,
    },

    #[error("failed to close {channel} channel: {source}")]
    Close {
        channel: Channel,
        #[source]
        source: io::Error,
    },
}

/// How the result stream ended.
///
/// Both variants complete the transform; they are only told apart in logs.
#[derive(Debug)]
pub enum ResultEnd {
    /// Worker closed the connection.
    Closed,
    /// Transport error (reset, aborted, ...).
    Error(io::Error),
}

/// The three connections of one transform.
#[derive(Debug)]
pub struct ChannelSet {
    document: TcpStream,
    descriptor: TcpStream,
    result: TcpStream,
}

impl ChannelSet {
    /// Connect to all three ports, in document, descriptor, result order.
    pub async fn dial(ports: &ChannelPorts) -> Result<Self, ChannelError> {
        let document = connect(ports, Channel::Document).await?;
        let descriptor = connect(ports, Channel::Descriptor).await?;
        let result = connect(ports, Channel::Result).await?;
        Ok(Self {
            document,
            descriptor,
            result,
        })
    }

    /// Write both inputs in full, then half-close descriptor and document.
    pub async fn send_inputs(
        self,
        descriptor: &[u8],
        document: &[u8],
    ) -> Result<ResultChannel, ChannelError> {
        let Self {
            document: mut document_stream,
            descriptor: mut descriptor_stream,
            result,
        } = self;

        write_all(&mut descriptor_stream, Channel::Descriptor, descriptor).await?;
        write_all(&mut document_stream, Channel::Document, document).await?;

        close(descriptor_stream, Channel::Descriptor).await?;
        close(document_stream, Channel::Document).await?;

        Ok(ResultChannel { stream: result })
    }
}

/// Read side of a transform, available once both inputs are closed.
#[derive(Debug)]
pub struct ResultChannel {
    stream: TcpStream,
}

impl ResultChannel {
    /// Accumulate result bytes until the stream ends.
    ///
    /// Never fails: a read error is end-of-result, same as a clean close.
    pub async fn drain(mut self) -> (Vec<u8>, ResultEnd) {
        let mut output = Vec::new();
        loop {
            let mut buf = [0u8; RESULT_CHUNK];
            match self.stream.read(&mut buf).await {
                Ok(0) => return (output, ResultEnd::Closed),
                Ok(n) => {
                    output.extend_from_slice(&buf[..n]);
                    tracing::trace!(read = n, total = output.len(), "Read result bytes");
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return (output, ResultEnd::Error(e)),
            }
        }
    }
}

async fn connect(ports: &ChannelPorts, channel: Channel) -> Result<TcpStream, ChannelError> {
    let addr = ports.addr(channel)?;
    tracing::trace!(%channel, %addr, "Connecting");
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ChannelError::Dial {
            channel,
            port: addr.port(),
            source,
        })?;
    tracing::trace!(%channel, "Connected");
    Ok(stream)
}

async fn write_all(
    stream: &mut TcpStream,
    channel: Channel,
    bytes: &[u8],
) -> Result<(), ChannelError> {
    // write_all reports a short write as WriteZero.
    stream
        .write_all(bytes)
        .await
        .map_err(|source| ChannelError::Write { channel, source })?;
    stream
        .flush()
        .await
        .map_err(|source| ChannelError::Write { channel, source })?;
    tracing::trace!(%channel, bytes = bytes.len(), "Wrote channel input");
    Ok(())
}

async fn close(mut stream: TcpStream, channel: Channel) -> Result<(), ChannelError> {
    stream
        .shutdown()
        .await
        .map_err(|source| ChannelError::Close { channel, source })?;
    drop(stream);
    tracing::trace!(%channel, "Closed channel");
    Ok(())
}
