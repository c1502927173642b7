//! Transport layer for the SMB2 connection core
//!
//! A transport is a reliable bidirectional byte stream carrying
//! length-prefixed SMB2 messages. The 4-byte big-endian Direct-TCP prefix
//! is hidden here: `read_size` yields the payload length of the next
//! message and `write_frame` prepends the prefix to an outgoing message.
//!
//! The connection owns the stream through exactly two workers — the sender
//! writes, the receiver reads — so a transport splits into independent
//! halves at connection start.

use crate::error::Result;
use async_trait::async_trait;

pub mod tcp;

pub use tcp::DirectTcpTransport;

/// Reading half of a transport, owned by the receiver worker
#[async_trait]
pub trait ReadTransport: Send {
    /// Payload length of the next message, blocking until one arrives
    async fn read_size(&mut self) -> Result<u32>;

    /// Fill `buf` with exactly one message payload
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Writing half of a transport, owned by the sender worker
#[async_trait]
pub trait WriteTransport: Send {
    /// Write one framed message (prefix plus payload) in full
    async fn write_frame(&mut self, payload: &[u8]) -> Result<()>;

    /// Close the stream for writing
    async fn close(&mut self) -> Result<()>;
}

/// A full-duplex transport that can be split for the two workers
pub trait Transport: Send {
    fn split(self: Box<Self>) -> (Box<dyn ReadTransport>, Box<dyn WriteTransport>);
}
