//! Common types and traits for SMB2 messages

use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{
    Smb2Command, Smb2HeaderFlags, SMB2_HEADER_SIZE, SMB2_MAGIC, SMB2_TRANSFORM_HEADER_SIZE,
    SMB2_TRANSFORM_MAGIC,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};

/// Trait for SMB message bodies that can be parsed from and serialized to bytes
pub trait SmbMessage: Sized {
    /// Parse message from bytes
    fn parse(buf: &[u8]) -> Result<Self>;

    /// Serialize message to bytes
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Get the size of the message when serialized
    fn size(&self) -> usize;
}

/// Trait for complete request packets submitted to the connection.
///
/// The connection stamps message id, credit fields, and session/tree ids
/// into the header before encoding, then signs or encrypts the result.
pub trait Packet: Send {
    /// Command opcode carried in the header
    fn command(&self) -> Smb2Command;

    /// Header, as it will be sent
    fn header(&self) -> &Smb2Header;

    /// Mutable header for id/credit stamping
    fn header_mut(&mut self) -> &mut Smb2Header;

    /// Encode header plus body into wire bytes
    fn encode(&self) -> Result<Vec<u8>>;
}

/// SMB2 packet header (64 bytes).
///
/// The bytes at offsets 32..40 carry either a 32-bit reserved field and the
/// tree id (synchronous form) or a 64-bit async id when `ASYNC_COMMAND` is
/// set in the flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smb2Header {
    pub credit_charge: u16,
    pub status: u32,
    pub command: Smb2Command,
    pub credit_request: u16,
    pub flags: Smb2HeaderFlags,
    pub next_command: u32,
    pub message_id: u64,
    pub tree_id: u32,
    pub async_id: u64,
    pub session_id: u64,
    pub signature: [u8; 16],
}

impl Smb2Header {
    pub const SIZE: usize = SMB2_HEADER_SIZE;

    pub fn new(command: Smb2Command) -> Self {
        Self {
            credit_charge: 0,
            status: 0,
            command,
            credit_request: 0,
            flags: Smb2HeaderFlags::empty(),
            next_command: 0,
            message_id: 0,
            tree_id: 0,
            async_id: 0,
            session_id: 0,
            signature: [0; 16],
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::InvalidResponse(format!(
                "packet too short for SMB2 header: {} bytes",
                buf.len()
            )));
        }
        if buf[0..4] != SMB2_MAGIC {
            return Err(Error::InvalidResponse("invalid SMB2 magic".into()));
        }

        let mut cursor = io::Cursor::new(&buf[4..Self::SIZE]);
        let structure_size = cursor.read_u16::<LittleEndian>()?;
        if structure_size != Self::SIZE as u16 {
            return Err(Error::InvalidResponse(format!(
                "invalid SMB2 header structure size: {}",
                structure_size
            )));
        }
        let credit_charge = cursor.read_u16::<LittleEndian>()?;
        let status = cursor.read_u32::<LittleEndian>()?;
        let command = Smb2Command::from_u16(cursor.read_u16::<LittleEndian>()?)?;
        let credit_request = cursor.read_u16::<LittleEndian>()?;
        let flags = Smb2HeaderFlags::from_bits_truncate(cursor.read_u32::<LittleEndian>()?);
        let next_command = cursor.read_u32::<LittleEndian>()?;
        let message_id = cursor.read_u64::<LittleEndian>()?;

        let (tree_id, async_id) = if flags.contains(Smb2HeaderFlags::ASYNC_COMMAND) {
            (0, cursor.read_u64::<LittleEndian>()?)
        } else {
            let _reserved = cursor.read_u32::<LittleEndian>()?;
            (cursor.read_u32::<LittleEndian>()?, 0)
        };

        let session_id = cursor.read_u64::<LittleEndian>()?;
        let mut signature = [0u8; 16];
        cursor.read_exact(&mut signature)?;

        Ok(Self {
            credit_charge,
            status,
            command,
            credit_request,
            flags,
            next_command,
            message_id,
            tree_id,
            async_id,
            session_id,
            signature,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&SMB2_MAGIC);
        buf.write_u16::<LittleEndian>(Self::SIZE as u16)?;
        buf.write_u16::<LittleEndian>(self.credit_charge)?;
        buf.write_u32::<LittleEndian>(self.status)?;
        buf.write_u16::<LittleEndian>(self.command.to_u16())?;
        buf.write_u16::<LittleEndian>(self.credit_request)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        buf.write_u32::<LittleEndian>(self.next_command)?;
        buf.write_u64::<LittleEndian>(self.message_id)?;
        if self.flags.contains(Smb2HeaderFlags::ASYNC_COMMAND) {
            buf.write_u64::<LittleEndian>(self.async_id)?;
        } else {
            buf.write_u32::<LittleEndian>(0)?;
            buf.write_u32::<LittleEndian>(self.tree_id)?;
        }
        buf.write_u64::<LittleEndian>(self.session_id)?;
        buf.extend_from_slice(&self.signature);
        Ok(buf)
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(Smb2HeaderFlags::SERVER_TO_REDIR)
    }
}

/// SMB2 transform header (52 bytes) wrapping an encrypted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformHeader {
    pub signature: [u8; 16],
    pub nonce: [u8; 16],
    pub original_message_size: u32,
    pub flags: u16,
    pub session_id: u64,
}

impl TransformHeader {
    pub const SIZE: usize = SMB2_TRANSFORM_HEADER_SIZE;

    /// Offset of the region authenticated as associated data (nonce onward)
    pub const AAD_OFFSET: usize = 20;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::InvalidResponse(format!(
                "packet too short for transform header: {} bytes",
                buf.len()
            )));
        }
        if buf[0..4] != SMB2_TRANSFORM_MAGIC {
            return Err(Error::InvalidResponse("invalid transform magic".into()));
        }

        let mut signature = [0u8; 16];
        signature.copy_from_slice(&buf[4..20]);
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&buf[20..36]);

        let mut cursor = io::Cursor::new(&buf[36..Self::SIZE]);
        let original_message_size = cursor.read_u32::<LittleEndian>()?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let session_id = cursor.read_u64::<LittleEndian>()?;

        Ok(Self {
            signature,
            nonce,
            original_message_size,
            flags,
            session_id,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&SMB2_TRANSFORM_MAGIC);
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.nonce);
        buf.write_u32::<LittleEndian>(self.original_message_size)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(self.flags)?;
        buf.write_u64::<LittleEndian>(self.session_id)?;
        Ok(buf)
    }
}
