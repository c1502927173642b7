//! SMB2 SESSION_SETUP and LOGOFF messages

use super::common::{Packet, Smb2Header, SmbMessage};
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{
    structure_size, SessionFlags, Smb2Capabilities, Smb2Command, SMB2_HEADER_SIZE,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// SMB2 SESSION_SETUP request
#[derive(Debug, Clone)]
pub struct SessionSetupRequest {
    pub header: Smb2Header,
    pub flags: u8,
    pub security_mode: u8,
    pub capabilities: Smb2Capabilities,
    pub previous_session_id: u64,
    pub security_buffer: Vec<u8>,
}

impl SessionSetupRequest {
    pub fn new(security_mode: u8, security_buffer: Vec<u8>) -> Self {
        Self {
            header: Smb2Header::new(Smb2Command::SessionSetup),
            flags: 0,
            security_mode,
            capabilities: Smb2Capabilities::empty(),
            previous_session_id: 0,
            security_buffer,
        }
    }

    fn serialize_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(24 + self.security_buffer.len());
        buf.write_u16::<LittleEndian>(structure_size::SESSION_SETUP_REQUEST)?;
        buf.push(self.flags);
        buf.push(self.security_mode);
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.write_u32::<LittleEndian>(0)?; // Channel
        buf.write_u16::<LittleEndian>((SMB2_HEADER_SIZE + 24) as u16)?;
        buf.write_u16::<LittleEndian>(self.security_buffer.len() as u16)?;
        buf.write_u64::<LittleEndian>(self.previous_session_id)?;
        buf.extend_from_slice(&self.security_buffer);
        Ok(buf)
    }
}

impl Packet for SessionSetupRequest {
    fn command(&self) -> Smb2Command {
        Smb2Command::SessionSetup
    }

    fn header(&self) -> &Smb2Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Smb2Header {
        &mut self.header
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut pkt = self.header.serialize()?;
        pkt.extend_from_slice(&self.serialize_body()?);
        Ok(pkt)
    }
}

/// SMB2 SESSION_SETUP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupResponse {
    pub session_flags: SessionFlags,
    pub security_buffer: Vec<u8>,
}

impl SmbMessage for SessionSetupResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::InvalidResponse(
                "broken session setup response format".into(),
            ));
        }

        let mut cursor = io::Cursor::new(buf);
        let structure_size = cursor.read_u16::<LittleEndian>()?;
        if structure_size != structure_size::SESSION_SETUP_RESPONSE {
            return Err(Error::InvalidResponse(
                "broken session setup response format".into(),
            ));
        }
        let session_flags = SessionFlags::from_bits_truncate(cursor.read_u16::<LittleEndian>()?);
        let security_buffer_offset = cursor.read_u16::<LittleEndian>()? as usize;
        let security_buffer_length = cursor.read_u16::<LittleEndian>()? as usize;

        let security_buffer = if security_buffer_length > 0 {
            let start = security_buffer_offset
                .checked_sub(SMB2_HEADER_SIZE)
                .ok_or_else(|| Error::InvalidResponse("invalid security buffer offset".into()))?;
            if start + security_buffer_length > buf.len() {
                return Err(Error::InvalidResponse(
                    "security buffer extends beyond message".into(),
                ));
            }
            buf[start..start + security_buffer_length].to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            session_flags,
            security_buffer,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(8 + self.security_buffer.len());
        buf.write_u16::<LittleEndian>(structure_size::SESSION_SETUP_RESPONSE)?;
        buf.write_u16::<LittleEndian>(self.session_flags.bits())?;
        let offset = if self.security_buffer.is_empty() {
            0
        } else {
            SMB2_HEADER_SIZE + 8
        };
        buf.write_u16::<LittleEndian>(offset as u16)?;
        buf.write_u16::<LittleEndian>(self.security_buffer.len() as u16)?;
        buf.extend_from_slice(&self.security_buffer);
        Ok(buf)
    }

    fn size(&self) -> usize {
        8 + self.security_buffer.len()
    }
}

/// SMB2 LOGOFF request
#[derive(Debug, Clone)]
pub struct LogoffRequest {
    pub header: Smb2Header,
}

impl LogoffRequest {
    pub fn new() -> Self {
        Self {
            header: Smb2Header::new(Smb2Command::Logoff),
        }
    }
}

impl Default for LogoffRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet for LogoffRequest {
    fn command(&self) -> Smb2Command {
        Smb2Command::Logoff
    }

    fn header(&self) -> &Smb2Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Smb2Header {
        &mut self.header
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut pkt = self.header.serialize()?;
        pkt.write_u16::<LittleEndian>(structure_size::LOGOFF_REQUEST)?;
        pkt.write_u16::<LittleEndian>(0)?;
        Ok(pkt)
    }
}
