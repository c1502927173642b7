//! Direct TCP (port 445) transport with 4-byte length framing

use super::{ReadTransport, Transport, WriteTransport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Largest frame accepted from the wire; the prefix length field is 24 bits
const MAX_FRAME_SIZE: u32 = 0x00FF_FFFF;

/// Direct TCP transport for SMB2 (the framing used on port 445)
pub struct DirectTcpTransport {
    stream: TcpStream,
}

impl DirectTcpTransport {
    /// Connect to a remote SMB server
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }

    /// Wrap an already-connected stream
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Transport for DirectTcpTransport {
    fn split(self: Box<Self>) -> (Box<dyn ReadTransport>, Box<dyn WriteTransport>) {
        let (read, write) = self.stream.into_split();
        (
            Box::new(TcpReadHalf { read }),
            Box::new(TcpWriteHalf { write }),
        )
    }
}

struct TcpReadHalf {
    read: OwnedReadHalf,
}

#[async_trait]
impl ReadTransport for TcpReadHalf {
    async fn read_size(&mut self) -> Result<u32> {
        let mut prefix = [0u8; 4];
        self.read.read_exact(&mut prefix).await?;
        let size = BigEndian::read_u32(&prefix);
        if size > MAX_FRAME_SIZE {
            return Err(Error::InvalidResponse(format!(
                "invalid frame length prefix: 0x{:08x}",
                size
            )));
        }
        Ok(size)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read.read_exact(buf).await?;
        Ok(())
    }
}

struct TcpWriteHalf {
    write: OwnedWriteHalf,
}

#[async_trait]
impl WriteTransport for TcpWriteHalf {
    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(payload);
        self.write.write_all(&frame).await?;
        self.write.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.write.shutdown().await?;
        Ok(())
    }
}
