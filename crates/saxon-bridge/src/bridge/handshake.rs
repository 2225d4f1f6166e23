//! Port handshake emitted by the worker on stdout.
//!
//! Wire format: exactly 24 ASCII hex characters, no delimiter, no newline.
//! Three 8-character fields, each a big-endian u32, in this order:
//!
//! ```text
//! 00001f90 00001f91 00001f92
//! document descriptor result
//! ```

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::io::{AsyncRead, AsyncReadExt};

use super::channels::{Channel, ChannelError};

/// Total handshake length in bytes.
pub const HANDSHAKE_LEN: usize = 24;

const FIELD_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("worker closed stdout after {received} of 24 handshake bytes")]
    Incomplete { received: usize },

    #[error("failed to read handshake from worker stdout: {0}")]
    Read(#[source] io::Error),

    #[error("handshake must be exactly 24 bytes, got {0}")]
    Length(usize),

    #[error("malformed {channel} port in handshake: {field:?}")]
    Malformed { channel: Channel, field: String },
}

/// Raw 24-byte handshake, length-checked but not yet decoded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HandshakePayload([u8; HANDSHAKE_LEN]);

impl HandshakePayload {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        let raw: [u8; HANDSHAKE_LEN] = bytes
            .try_into()
            .map_err(|_| HandshakeError::Length(bytes.len()))?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the three port fields.
    ///
    /// Any non-hex byte fails the whole payload; there is no partial result.
    pub fn decode(&self) -> Result<ChannelPorts, HandshakeError> {
        Ok(ChannelPorts {
            document: decode_field(&self.0[0..FIELD_LEN], Channel::Document)?,
            descriptor: decode_field(&self.0[FIELD_LEN..2 * FIELD_LEN], Channel::Descriptor)?,
            result: decode_field(&self.0[2 * FIELD_LEN..], Channel::Result)?,
        })
    }
}

impl fmt::Debug for HandshakePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandshakePayload")
            .field(&String::from_utf8_lossy(&self.0))
            .finish()
    }
}

impl fmt::Display for HandshakePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Decoded port numbers, one per channel.
///
/// Values are kept as u32 exactly as announced; values above 65535 are only
/// rejected when the channel is dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPorts {
    pub document: u32,
    pub descriptor: u32,
    pub result: u32,
}

impl ChannelPorts {
    pub fn port(&self, channel: Channel) -> u32 {
        match channel {
            Channel::Document => self.document,
            Channel::Descriptor => self.descriptor,
            Channel::Result => self.result,
        }
    }

    /// Loopback address for a channel.
    pub fn addr(&self, channel: Channel) -> Result<SocketAddr, ChannelError> {
        let port = self.port(channel);
        let port = u16::try_from(port).map_err(|_| ChannelError::PortOutOfRange { channel, port })?;
        Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
    }
}

fn decode_field(field: &[u8], channel: Channel) -> Result<u32, HandshakeError> {
    let mut raw = [0u8; 4];
    hex::decode_to_slice(field, &mut raw).map_err(|_| HandshakeError::Malformed {
        channel,
        field: String::from_utf8_lossy(field).into_owned(),
    })?;
    Ok(u32::from_be_bytes(raw))
}

/// Read exactly [`HANDSHAKE_LEN`] bytes, concatenating short reads.
///
/// Bytes after the handshake are left unread in `reader`.
pub async fn read_handshake<R>(reader: &mut R) -> Result<HandshakePayload, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    let mut received = 0;
    while received < HANDSHAKE_LEN {
        match reader.read(&mut buf[received..]).await {
            Ok(0) => return Err(HandshakeError::Incomplete { received }),
            Ok(n) => {
                received += n;
                tracing::trace!(received, "Read handshake bytes");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HandshakeError::Read(e)),
        }
    }
    Ok(HandshakePayload(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn payload(s: &str) -> HandshakePayload {
        HandshakePayload::from_bytes(s.as_bytes()).unwrap()
    }

    #[test]
    fn decodes_ports_in_fixed_order() {
        let ports = payload("00001f9000001f910000ffff").decode().unwrap();
        assert_eq!(
            ports,
            ChannelPorts {
                document: 8080,
                descriptor: 8081,
                result: 65535,
            }
        );
    }

    #[test]
    fn accepts_uppercase_hex() {
        let ports = payload("0000ABCD0000abcd0000AbCd").decode().unwrap();
        assert_eq!(ports.document, 0xabcd);
        assert_eq!(ports.descriptor, 0xabcd);
        assert_eq!(ports.result, 0xabcd);
    }

    #[test]
    fn out_of_range_values_decode_big_endian() {
        let ports = payload("ffffffff0000000000010000").decode().unwrap();
        assert_eq!(ports.document, u32::MAX);
        assert_eq!(ports.descriptor, 0);
        assert_eq!(ports.result, 65536);

        let err = ports.addr(Channel::Result).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::PortOutOfRange {
                channel: Channel::Result,
                port: 65536
            }
        ));
    }

    #[test]
    fn addr_is_loopback() {
        let ports = payload("00001f9000001f9100001f92").decode().unwrap();
        let addr = ports.addr(Channel::Descriptor).unwrap();
        assert_eq!(addr, "127.0.0.1:8081".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn non_hex_field_names_the_channel() {
        let cases = [
            ("0000xyz000001f9100001f92", Channel::Document),
            ("00001f90+0001f9100001f92", Channel::Descriptor),
            ("00001f9000001f91 0001f92", Channel::Result),
            ("0x001f9000001f9100001f92", Channel::Document),
            ("00001f9000001f91-0001f92", Channel::Result),
        ];
        for (input, expected) in cases {
            match payload(input).decode() {
                Err(HandshakeError::Malformed { channel, .. }) => assert_eq!(channel, expected),
                other => panic!("expected malformed {expected} field, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            HandshakePayload::from_bytes(b"00001f9000001f9100001f9"),
            Err(HandshakeError::Length(23))
        ));
        assert!(matches!(
            HandshakePayload::from_bytes(b"00001f9000001f9100001f920"),
            Err(HandshakeError::Length(25))
        ));
        assert!(matches!(
            HandshakePayload::from_bytes(b""),
            Err(HandshakeError::Length(0))
        ));
    }

    #[test]
    fn malformed_error_message() {
        let err = payload("00001f90+0001f9100001f92").decode().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @r#"malformed descriptor port in handshake: "+0001f91""#);
    }

    #[tokio::test]
    async fn read_concatenates_short_reads() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for piece in ["0000", "1f9000001f", "9100001f92", "FAILURE"] {
                tx.write_all(piece.as_bytes()).await.unwrap();
                tx.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let handshake = read_handshake(&mut rx).await.unwrap();
        assert_eq!(handshake.as_bytes(), b"00001f9000001f9100001f92");
        writer.await.unwrap();

        // Trailing stdout bytes are not part of the handshake.
        let mut rest = String::new();
        rx.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "FAILURE");
    }

    #[tokio::test]
    async fn read_fails_on_early_eof() {
        let mut reader: &[u8] = b"00001f90";
        let err = read_handshake(&mut reader).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Incomplete { received: 8 }));
        insta::assert_snapshot!(err.to_string(), @"worker closed stdout after 8 of 24 handshake bytes");
    }
}
