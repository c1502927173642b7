//! SMB2 CANCEL and ECHO messages

use super::common::{Packet, Smb2Header};
use crate::error::Result;
use crate::protocol::smb2_constants::{structure_size, Smb2Command};
use byteorder::{LittleEndian, WriteBytesExt};

/// SMB2 CANCEL request.
///
/// Cancels do not consume a message id or credits; the connection sends
/// them outside the outstanding-request table. The header must reference
/// the in-flight request being canceled: its message id, and its async id
/// with `ASYNC_COMMAND` set once the server has gone asynchronous.
#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub header: Smb2Header,
}

impl CancelRequest {
    pub fn new() -> Self {
        Self {
            header: Smb2Header::new(Smb2Command::Cancel),
        }
    }
}

impl Default for CancelRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet for CancelRequest {
    fn command(&self) -> Smb2Command {
        Smb2Command::Cancel
    }

    fn header(&self) -> &Smb2Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Smb2Header {
        &mut self.header
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut pkt = self.header.serialize()?;
        pkt.write_u16::<LittleEndian>(structure_size::CANCEL_REQUEST)?;
        pkt.write_u16::<LittleEndian>(0)?;
        Ok(pkt)
    }
}

/// SMB2 ECHO request, usable as a connection liveness probe
#[derive(Debug, Clone)]
pub struct EchoRequest {
    pub header: Smb2Header,
}

impl EchoRequest {
    pub fn new() -> Self {
        Self {
            header: Smb2Header::new(Smb2Command::Echo),
        }
    }
}

impl Default for EchoRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet for EchoRequest {
    fn command(&self) -> Smb2Command {
        Smb2Command::Echo
    }

    fn header(&self) -> &Smb2Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Smb2Header {
        &mut self.header
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut pkt = self.header.serialize()?;
        pkt.write_u16::<LittleEndian>(4)?;
        pkt.write_u16::<LittleEndian>(0)?;
        Ok(pkt)
    }
}
