//! Wire protocol between the bridge (parent) and a worker subprocess.
//!
//! # Architecture
//!
//! - **handshake**: 24-byte hex payload the worker prints on stdout, announcing its ports
//! - **channels**: the three loopback TCP connections (document, descriptor, result)

pub mod channels;
pub mod handshake;
