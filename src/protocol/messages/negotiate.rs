//! SMB2 NEGOTIATE messages and SMB 3.1.1 negotiate contexts

use super::common::{Packet, Smb2Header, SmbMessage};
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::{
    context_type, structure_size, SecurityMode, Smb2Capabilities, Smb2Command, Smb2Dialect,
    SMB2_HEADER_SIZE,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};
use uuid::Uuid;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// SMB 3.1.1 negotiate context (8-byte-aligned TLV)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateContext {
    PreauthIntegrity {
        hash_algorithms: Vec<u16>,
        salt: Vec<u8>,
    },
    Encryption {
        ciphers: Vec<u16>,
    },
    Unknown {
        context_type: u16,
        data: Vec<u8>,
    },
}

impl NegotiateContext {
    pub fn context_type(&self) -> u16 {
        match self {
            Self::PreauthIntegrity { .. } => context_type::PREAUTH_INTEGRITY_CAPABILITIES,
            Self::Encryption { .. } => context_type::ENCRYPTION_CAPABILITIES,
            Self::Unknown { context_type, .. } => *context_type,
        }
    }

    fn data(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::PreauthIntegrity {
                hash_algorithms,
                salt,
            } => {
                buf.write_u16::<LittleEndian>(hash_algorithms.len() as u16)?;
                buf.write_u16::<LittleEndian>(salt.len() as u16)?;
                for alg in hash_algorithms {
                    buf.write_u16::<LittleEndian>(*alg)?;
                }
                buf.extend_from_slice(salt);
            }
            Self::Encryption { ciphers } => {
                buf.write_u16::<LittleEndian>(ciphers.len() as u16)?;
                for cipher in ciphers {
                    buf.write_u16::<LittleEndian>(*cipher)?;
                }
            }
            Self::Unknown { data, .. } => buf.extend_from_slice(data),
        }
        Ok(buf)
    }

    fn from_type_and_data(ctx_type: u16, data: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(data);
        match ctx_type {
            context_type::PREAUTH_INTEGRITY_CAPABILITIES => {
                if data.len() < 4 {
                    return Err(Error::InvalidResponse(
                        "broken hash context data format".into(),
                    ));
                }
                let alg_count = cursor.read_u16::<LittleEndian>()? as usize;
                let salt_len = cursor.read_u16::<LittleEndian>()? as usize;
                if data.len() < 4 + alg_count * 2 + salt_len {
                    return Err(Error::InvalidResponse(
                        "broken hash context data format".into(),
                    ));
                }
                let mut hash_algorithms = Vec::with_capacity(alg_count);
                for _ in 0..alg_count {
                    hash_algorithms.push(cursor.read_u16::<LittleEndian>()?);
                }
                let mut salt = vec![0u8; salt_len];
                cursor.read_exact(&mut salt)?;
                Ok(Self::PreauthIntegrity {
                    hash_algorithms,
                    salt,
                })
            }
            context_type::ENCRYPTION_CAPABILITIES => {
                if data.len() < 2 {
                    return Err(Error::InvalidResponse(
                        "broken cipher context data format".into(),
                    ));
                }
                let cipher_count = cursor.read_u16::<LittleEndian>()? as usize;
                if data.len() < 2 + cipher_count * 2 {
                    return Err(Error::InvalidResponse(
                        "broken cipher context data format".into(),
                    ));
                }
                let mut ciphers = Vec::with_capacity(cipher_count);
                for _ in 0..cipher_count {
                    ciphers.push(cursor.read_u16::<LittleEndian>()?);
                }
                Ok(Self::Encryption { ciphers })
            }
            _ => Ok(Self::Unknown {
                context_type: ctx_type,
                data: data.to_vec(),
            }),
        }
    }

    fn size(&self) -> usize {
        let data_len = match self {
            Self::PreauthIntegrity {
                hash_algorithms,
                salt,
            } => 4 + hash_algorithms.len() * 2 + salt.len(),
            Self::Encryption { ciphers } => 2 + ciphers.len() * 2,
            Self::Unknown { data, .. } => data.len(),
        };
        8 + data_len
    }
}

/// Serialize a context list, aligning each entry to an 8-byte boundary.
///
/// `wire_offset` is the absolute offset of the list from the start of the
/// SMB2 header, used to compute alignment padding.
fn serialize_contexts(contexts: &[NegotiateContext], mut wire_offset: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for (i, ctx) in contexts.iter().enumerate() {
        if i > 0 {
            let padded = align8(wire_offset);
            buf.resize(buf.len() + padded - wire_offset, 0);
            wire_offset = padded;
        }
        let data = ctx.data()?;
        buf.write_u16::<LittleEndian>(ctx.context_type())?;
        buf.write_u16::<LittleEndian>(data.len() as u16)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.extend_from_slice(&data);
        wire_offset += 8 + data.len();
    }
    Ok(buf)
}

/// Parse `count` contexts from `buf`, which starts 8-aligned on the wire
fn parse_contexts(buf: &[u8], count: usize) -> Result<Vec<NegotiateContext>> {
    let mut contexts = Vec::with_capacity(count);
    let mut rest = buf;
    for i in 0..count {
        if rest.len() < 8 {
            return Err(Error::InvalidResponse(
                "broken negotiate context format".into(),
            ));
        }
        let mut cursor = io::Cursor::new(&rest[..8]);
        let ctx_type = cursor.read_u16::<LittleEndian>()?;
        let data_len = cursor.read_u16::<LittleEndian>()? as usize;
        let _reserved = cursor.read_u32::<LittleEndian>()?;
        if rest.len() < 8 + data_len {
            return Err(Error::InvalidResponse(
                "broken negotiate context format".into(),
            ));
        }
        contexts.push(NegotiateContext::from_type_and_data(
            ctx_type,
            &rest[8..8 + data_len],
        )?);

        if i + 1 < count {
            let next = align8(8 + data_len);
            if rest.len() < next {
                return Err(Error::InvalidResponse(
                    "broken negotiate context format".into(),
                ));
            }
            rest = &rest[next..];
        }
    }
    Ok(contexts)
}

/// SMB2 NEGOTIATE request
#[derive(Debug, Clone)]
pub struct NegotiateRequest {
    pub header: Smb2Header,
    pub security_mode: SecurityMode,
    pub capabilities: Smb2Capabilities,
    pub client_guid: Uuid,
    pub dialects: Vec<Smb2Dialect>,
    pub contexts: Vec<NegotiateContext>,
}

impl NegotiateRequest {
    pub fn new(dialects: Vec<Smb2Dialect>) -> Self {
        Self {
            header: Smb2Header::new(Smb2Command::Negotiate),
            security_mode: SecurityMode::SIGNING_ENABLED,
            capabilities: Smb2Capabilities::empty(),
            client_guid: Uuid::nil(),
            dialects,
            contexts: Vec::new(),
        }
    }

    fn serialize_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u16::<LittleEndian>(structure_size::NEGOTIATE_REQUEST)?;
        buf.write_u16::<LittleEndian>(self.dialects.len() as u16)?;
        buf.write_u16::<LittleEndian>(self.security_mode.bits())?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.extend_from_slice(self.client_guid.as_bytes());

        if self.contexts.is_empty() {
            // ClientStartTime, unused since SMB 3.1.1 redefined the field
            buf.write_u64::<LittleEndian>(0)?;
        } else {
            let dialects_end = SMB2_HEADER_SIZE + 36 + self.dialects.len() * 2;
            let context_offset = align8(dialects_end);
            buf.write_u32::<LittleEndian>(context_offset as u32)?;
            buf.write_u16::<LittleEndian>(self.contexts.len() as u16)?;
            buf.write_u16::<LittleEndian>(0)?;
        }

        for dialect in &self.dialects {
            buf.write_u16::<LittleEndian>(dialect.to_u16())?;
        }

        if !self.contexts.is_empty() {
            let dialects_end = SMB2_HEADER_SIZE + 36 + self.dialects.len() * 2;
            let context_offset = align8(dialects_end);
            buf.resize(buf.len() + context_offset - dialects_end, 0);
            buf.extend_from_slice(&serialize_contexts(&self.contexts, context_offset)?);
        }

        Ok(buf)
    }
}

impl Packet for NegotiateRequest {
    fn command(&self) -> Smb2Command {
        Smb2Command::Negotiate
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

/// SMB2 NEGOTIATE response
#[derive(Debug, Clone)]
pub struct NegotiateResponse {
    pub security_mode: SecurityMode,
    pub dialect_revision: Smb2Dialect,
    pub server_guid: Uuid,
    pub capabilities: Smb2Capabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub system_time: u64,
    pub server_start_time: u64,
    pub security_blob: Vec<u8>,
    pub contexts: Vec<NegotiateContext>,
}

impl NegotiateResponse {
    pub fn new(dialect: Smb2Dialect) -> Self {
        Self {
            security_mode: SecurityMode::SIGNING_ENABLED,
            dialect_revision: dialect,
            server_guid: Uuid::nil(),
            capabilities: Smb2Capabilities::empty(),
            max_transact_size: 1 << 20,
            max_read_size: 1 << 20,
            max_write_size: 1 << 20,
            system_time: 0,
            server_start_time: 0,
            security_blob: Vec::new(),
            contexts: Vec::new(),
        }
    }
}

impl SmbMessage for NegotiateResponse {
    /// Parse from the response body; buffer offsets in the message are
    /// relative to the start of the SMB2 header and adjusted here.
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 64 {
            return Err(Error::InvalidResponse(
                "broken negotiate response format".into(),
            ));
        }

        let mut cursor = io::Cursor::new(buf);
        let structure_size = cursor.read_u16::<LittleEndian>()?;
        if structure_size != structure_size::NEGOTIATE_RESPONSE {
            return Err(Error::InvalidResponse(
                "broken negotiate response format".into(),
            ));
        }

        let security_mode = SecurityMode::from_bits_truncate(cursor.read_u16::<LittleEndian>()?);
        let dialect_revision = Smb2Dialect::from_u16(cursor.read_u16::<LittleEndian>()?)?;
        let context_count = cursor.read_u16::<LittleEndian>()? as usize;

        let mut guid_bytes = [0u8; 16];
        cursor.read_exact(&mut guid_bytes)?;
        let server_guid = Uuid::from_bytes(guid_bytes);

        let capabilities = Smb2Capabilities::from_bits_truncate(cursor.read_u32::<LittleEndian>()?);
        let max_transact_size = cursor.read_u32::<LittleEndian>()?;
        let max_read_size = cursor.read_u32::<LittleEndian>()?;
        let max_write_size = cursor.read_u32::<LittleEndian>()?;
        let system_time = cursor.read_u64::<LittleEndian>()?;
        let server_start_time = cursor.read_u64::<LittleEndian>()?;
        let security_buffer_offset = cursor.read_u16::<LittleEndian>()? as usize;
        let security_buffer_length = cursor.read_u16::<LittleEndian>()? as usize;
        let context_offset = cursor.read_u32::<LittleEndian>()? as usize;

        let security_blob = if security_buffer_length > 0 {
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

        let contexts = if context_count > 0 {
            let start = context_offset
                .checked_sub(SMB2_HEADER_SIZE)
                .filter(|off| *off <= buf.len())
                .ok_or_else(|| Error::InvalidResponse("invalid negotiate context offset".into()))?;
            parse_contexts(&buf[start..], context_count)?
        } else {
            Vec::new()
        };

        Ok(Self {
            security_mode,
            dialect_revision,
            server_guid,
            capabilities,
            max_transact_size,
            max_read_size,
            max_write_size,
            system_time,
            server_start_time,
            security_blob,
            contexts,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u16::<LittleEndian>(structure_size::NEGOTIATE_RESPONSE)?;
        buf.write_u16::<LittleEndian>(self.security_mode.bits())?;
        buf.write_u16::<LittleEndian>(self.dialect_revision.to_u16())?;
        buf.write_u16::<LittleEndian>(self.contexts.len() as u16)?;
        buf.extend_from_slice(self.server_guid.as_bytes());
        buf.write_u32::<LittleEndian>(self.capabilities.bits())?;
        buf.write_u32::<LittleEndian>(self.max_transact_size)?;
        buf.write_u32::<LittleEndian>(self.max_read_size)?;
        buf.write_u32::<LittleEndian>(self.max_write_size)?;
        buf.write_u64::<LittleEndian>(self.system_time)?;
        buf.write_u64::<LittleEndian>(self.server_start_time)?;

        let security_buffer_offset = if self.security_blob.is_empty() {
            0
        } else {
            SMB2_HEADER_SIZE + 64
        };
        buf.write_u16::<LittleEndian>(security_buffer_offset as u16)?;
        buf.write_u16::<LittleEndian>(self.security_blob.len() as u16)?;

        let blob_end = SMB2_HEADER_SIZE + 64 + self.security_blob.len();
        let context_offset = if self.contexts.is_empty() {
            0
        } else {
            align8(blob_end)
        };
        buf.write_u32::<LittleEndian>(context_offset as u32)?;

        buf.extend_from_slice(&self.security_blob);

        if !self.contexts.is_empty() {
            buf.resize(buf.len() + context_offset - blob_end, 0);
            buf.extend_from_slice(&serialize_contexts(&self.contexts, context_offset)?);
        }

        Ok(buf)
    }

    fn size(&self) -> usize {
        64 + self.security_blob.len()
            + self.contexts.iter().map(|c| align8(c.size())).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::smb2_constants::{cipher, hash_algorithm, CLIENT_DIALECTS};

    #[test]
    fn test_negotiate_request_plain() {
        let mut req = NegotiateRequest::new(vec![Smb2Dialect::Smb202, Smb2Dialect::Smb210]);
        req.client_guid = Uuid::from_bytes([9; 16]);
        let body = req.serialize_body().unwrap();
        assert_eq!(body.len(), 36 + 4);
        assert_eq!(&body[0..2], &36u16.to_le_bytes());
        assert_eq!(&body[2..4], &2u16.to_le_bytes());
        assert_eq!(&body[36..38], &0x0202u16.to_le_bytes());
        assert_eq!(&body[38..40], &0x0210u16.to_le_bytes());
    }

    #[test]
    fn test_negotiate_request_with_contexts() {
        let mut req = NegotiateRequest::new(CLIENT_DIALECTS.to_vec());
        req.contexts = vec![
            NegotiateContext::PreauthIntegrity {
                hash_algorithms: vec![hash_algorithm::SHA512],
                salt: vec![0xAB; 32],
            },
            NegotiateContext::Encryption {
                ciphers: vec![cipher::AES128_CCM, cipher::AES128_GCM],
            },
        ];
        let body = req.serialize_body().unwrap();

        // dialects end at 36 + 10 = 46 in the body, 110 on the wire;
        // the context list starts at the next 8-byte boundary (112)
        let context_offset =
            u32::from_le_bytes([body[28], body[29], body[30], body[31]]) as usize;
        assert_eq!(context_offset, 112);
        let context_count = u16::from_le_bytes([body[32], body[33]]);
        assert_eq!(context_count, 2);

        let list = &body[context_offset - SMB2_HEADER_SIZE..];
        let parsed = parse_contexts(list, 2).unwrap();
        assert_eq!(parsed, req.contexts);
    }

    #[test]
    fn test_negotiate_response_roundtrip() {
        let mut resp = NegotiateResponse::new(Smb2Dialect::Smb311);
        resp.server_guid = Uuid::from_bytes([3; 16]);
        resp.capabilities = Smb2Capabilities::LARGE_MTU | Smb2Capabilities::ENCRYPTION;
        resp.security_blob = vec![1, 2, 3, 4, 5];
        resp.contexts = vec![
            NegotiateContext::PreauthIntegrity {
                hash_algorithms: vec![hash_algorithm::SHA512],
                salt: vec![7; 32],
            },
            NegotiateContext::Encryption {
                ciphers: vec![cipher::AES128_GCM],
            },
        ];

        let bytes = resp.serialize().unwrap();
        let parsed = NegotiateResponse::parse(&bytes).unwrap();
        assert_eq!(parsed.dialect_revision, Smb2Dialect::Smb311);
        assert_eq!(parsed.capabilities, resp.capabilities);
        assert_eq!(parsed.security_blob, resp.security_blob);
        assert_eq!(parsed.contexts, resp.contexts);
    }

    #[test]
    fn test_negotiate_response_wildcard() {
        let resp = NegotiateResponse::new(Smb2Dialect::Smb2Wildcard);
        let bytes = resp.serialize().unwrap();
        let parsed = NegotiateResponse::parse(&bytes).unwrap();
        assert_eq!(parsed.dialect_revision, Smb2Dialect::Smb2Wildcard);
    }

    #[test]
    fn test_negotiate_response_rejects_short() {
        assert!(NegotiateResponse::parse(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_unknown_context_skipped_not_rejected() {
        let contexts = vec![
            NegotiateContext::Unknown {
                context_type: 0x0005,
                data: vec![1, 2, 3],
            },
            NegotiateContext::Encryption {
                ciphers: vec![cipher::AES128_CCM],
            },
        ];
        let bytes = serialize_contexts(&contexts, 0).unwrap();
        let parsed = parse_contexts(&bytes, 2).unwrap();
        assert_eq!(parsed, contexts);
    }
}
