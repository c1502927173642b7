//! SMB2 ERROR response body

use super::common::SmbMessage;
use crate::error::{Error, Result};
use crate::protocol::smb2_constants::structure_size;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// SMB2 ERROR response body.
///
/// With `error_context_count == 0` the body carries a single opaque error
/// data blob; otherwise a list of 8-aligned error-context entries, each of
/// which is surfaced as one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error_data: Vec<Vec<u8>>,
}

impl SmbMessage for ErrorResponse {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::InvalidResponse(
                "broken error response format".into(),
            ));
        }

        let mut cursor = io::Cursor::new(buf);
        let structure_size = cursor.read_u16::<LittleEndian>()?;
        if structure_size != structure_size::ERROR_RESPONSE {
            return Err(Error::InvalidResponse(
                "broken error response format".into(),
            ));
        }
        let context_count = cursor.read_u8()? as usize;
        let _reserved = cursor.read_u8()?;
        let byte_count = cursor.read_u32::<LittleEndian>()? as usize;

        let mut rest = &buf[8..];
        if context_count == 0 {
            let len = byte_count.min(rest.len());
            return Ok(Self {
                error_data: vec![rest[..len].to_vec()],
            });
        }

        let mut error_data = Vec::with_capacity(context_count);
        for i in 0..context_count {
            if rest.len() < 8 {
                return Err(Error::InvalidResponse(
                    "broken error context response format".into(),
                ));
            }
            let mut ctx = io::Cursor::new(&rest[..8]);
            let data_len = ctx.read_u32::<LittleEndian>()? as usize;
            let _error_id = ctx.read_u32::<LittleEndian>()?;
            if rest.len() < 8 + data_len {
                return Err(Error::InvalidResponse(
                    "broken error context response format".into(),
                ));
            }
            error_data.push(rest[8..8 + data_len].to_vec());

            if i + 1 < context_count {
                let next = align8(8 + data_len);
                if rest.len() < next {
                    return Err(Error::InvalidResponse(
                        "broken error context response format".into(),
                    ));
                }
                rest = &rest[next..];
            }
        }

        Ok(Self { error_data })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u16::<LittleEndian>(structure_size::ERROR_RESPONSE)?;
        match self.error_data.as_slice() {
            [] => {
                buf.push(0);
                buf.push(0);
                buf.write_u32::<LittleEndian>(0)?;
                buf.push(0); // ErrorData must occupy at least one byte
            }
            [blob] => {
                buf.push(0);
                buf.push(0);
                buf.write_u32::<LittleEndian>(blob.len() as u32)?;
                if blob.is_empty() {
                    buf.push(0);
                } else {
                    buf.extend_from_slice(blob);
                }
            }
            contexts => {
                buf.push(contexts.len() as u8);
                buf.push(0);
                buf.write_u32::<LittleEndian>(0)?;
                let mut offset = 0usize;
                for (i, data) in contexts.iter().enumerate() {
                    if i > 0 {
                        let padded = align8(offset);
                        buf.resize(buf.len() + padded - offset, 0);
                        offset = padded;
                    }
                    buf.write_u32::<LittleEndian>(data.len() as u32)?;
                    buf.write_u32::<LittleEndian>(0)?;
                    buf.extend_from_slice(data);
                    offset += 8 + data.len();
                }
            }
        }
        Ok(buf)
    }

    fn size(&self) -> usize {
        8 + self
            .error_data
            .iter()
            .map(|d| align8(8 + d.len()))
            .sum::<usize>()
            .max(1)
    }
}
