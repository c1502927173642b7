//! SMB2/3 protocol constants

use bitflags::bitflags;

/// SMB2 packet header magic (0xFE 'S' 'M' 'B')
pub const SMB2_MAGIC: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// SMB2 transform header magic (0xFD 'S' 'M' 'B')
pub const SMB2_TRANSFORM_MAGIC: [u8; 4] = [0xFD, b'S', b'M', b'B'];

/// SMB2 header size
pub const SMB2_HEADER_SIZE: usize = 64;

/// SMB2 transform header size
pub const SMB2_TRANSFORM_HEADER_SIZE: usize = 52;

/// Payload size covered by a single credit
pub const CREDIT_PAYLOAD_SIZE: usize = 64 * 1024;

/// Message id carried by server-initiated notifications (oplock breaks)
pub const SMB2_NOTIFICATION_MESSAGE_ID: u64 = u64::MAX;

/// Structure sizes for SMB2 messages
pub mod structure_size {
    pub const NEGOTIATE_REQUEST: u16 = 36;
    pub const NEGOTIATE_RESPONSE: u16 = 65;
    pub const SESSION_SETUP_REQUEST: u16 = 25;
    pub const SESSION_SETUP_RESPONSE: u16 = 9;
    pub const LOGOFF_REQUEST: u16 = 4;
    pub const LOGOFF_RESPONSE: u16 = 4;
    pub const CANCEL_REQUEST: u16 = 4;
    pub const IOCTL_RESPONSE: u16 = 49;
    pub const ERROR_RESPONSE: u16 = 9;
}

/// NTSTATUS values the connection core interprets (subset of [MS-ERREF])
pub mod nt_status {
    pub const SUCCESS: u32 = 0x00000000;
    pub const PENDING: u32 = 0x00000103;
    pub const NOTIFY_ENUM_DIR: u32 = 0x0000010C;
    pub const BUFFER_OVERFLOW: u32 = 0x80000005;
    pub const MORE_PROCESSING_REQUIRED: u32 = 0xC0000016;
    pub const ACCESS_DENIED: u32 = 0xC0000022;
    pub const OBJECT_NAME_NOT_FOUND: u32 = 0xC0000034;
    pub const OBJECT_NAME_COLLISION: u32 = 0xC0000035;
    pub const OBJECT_PATH_NOT_FOUND: u32 = 0xC000003A;
    pub const LOGON_FAILURE: u32 = 0xC000006D;
    pub const CANNOT_DELETE: u32 = 0xC0000121;
    pub const USER_SESSION_DELETED: u32 = 0xC0000203;

    /// Check the severity bits for an error-class status
    pub fn is_error(status: u32) -> bool {
        status & 0xC0000000 == 0xC0000000
    }
}

/// SMB2 Commands (opcodes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Smb2Command {
    Negotiate = 0x00,
    SessionSetup = 0x01,
    Logoff = 0x02,
    TreeConnect = 0x03,
    TreeDisconnect = 0x04,
    Create = 0x05,
    Close = 0x06,
    Flush = 0x07,
    Read = 0x08,
    Write = 0x09,
    Lock = 0x0A,
    Ioctl = 0x0B,
    Cancel = 0x0C,
    Echo = 0x0D,
    QueryDirectory = 0x0E,
    ChangeNotify = 0x0F,
    QueryInfo = 0x10,
    SetInfo = 0x11,
    OplockBreak = 0x12,
}

impl TryFrom<u16> for Smb2Command {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Negotiate),
            0x01 => Ok(Self::SessionSetup),
            0x02 => Ok(Self::Logoff),
            0x03 => Ok(Self::TreeConnect),
            0x04 => Ok(Self::TreeDisconnect),
            0x05 => Ok(Self::Create),
            0x06 => Ok(Self::Close),
            0x07 => Ok(Self::Flush),
            0x08 => Ok(Self::Read),
            0x09 => Ok(Self::Write),
            0x0A => Ok(Self::Lock),
            0x0B => Ok(Self::Ioctl),
            0x0C => Ok(Self::Cancel),
            0x0D => Ok(Self::Echo),
            0x0E => Ok(Self::QueryDirectory),
            0x0F => Ok(Self::ChangeNotify),
            0x10 => Ok(Self::QueryInfo),
            0x11 => Ok(Self::SetInfo),
            0x12 => Ok(Self::OplockBreak),
            _ => Err(crate::Error::InvalidResponse(format!(
                "invalid SMB2 command: 0x{:04x}",
                value
            ))),
        }
    }
}

impl Smb2Command {
    pub fn from_u16(value: u16) -> crate::Result<Self> {
        value.try_into()
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// SMB2 dialect revisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum Smb2Dialect {
    Smb202 = 0x0202,
    Smb210 = 0x0210,
    /// Wildcard marker in a multi-protocol negotiate response
    Smb2Wildcard = 0x02FF,
    Smb300 = 0x0300,
    Smb302 = 0x0302,
    Smb311 = 0x0311,
}

impl TryFrom<u16> for Smb2Dialect {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0202 => Ok(Self::Smb202),
            0x0210 => Ok(Self::Smb210),
            0x02FF => Ok(Self::Smb2Wildcard),
            0x0300 => Ok(Self::Smb300),
            0x0302 => Ok(Self::Smb302),
            0x0311 => Ok(Self::Smb311),
            _ => Err(crate::Error::InvalidResponse(format!(
                "unknown SMB2 dialect: 0x{:04x}",
                value
            ))),
        }
    }
}

impl Smb2Dialect {
    pub fn from_u16(value: u16) -> crate::Result<Self> {
        value.try_into()
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// SMB 3.x dialects derive per-direction keys and use AES-CMAC signing
    pub fn is_smb3(self) -> bool {
        matches!(self, Self::Smb300 | Self::Smb302 | Self::Smb311)
    }
}

/// Dialects offered when no specific dialect is pinned
pub const CLIENT_DIALECTS: [Smb2Dialect; 5] = [
    Smb2Dialect::Smb202,
    Smb2Dialect::Smb210,
    Smb2Dialect::Smb300,
    Smb2Dialect::Smb302,
    Smb2Dialect::Smb311,
];

bitflags! {
    /// SMB2 header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Smb2HeaderFlags: u32 {
        const SERVER_TO_REDIR = 0x00000001;
        const ASYNC_COMMAND = 0x00000002;
        const RELATED_OPERATIONS = 0x00000004;
        const SIGNED = 0x00000008;
        const DFS_OPERATIONS = 0x10000000;
        const REPLAY_OPERATION = 0x20000000;
    }
}

bitflags! {
    /// SMB2 negotiate security mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecurityMode: u16 {
        const SIGNING_ENABLED = 0x0001;
        const SIGNING_REQUIRED = 0x0002;
    }
}

bitflags! {
    /// SMB2 capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Smb2Capabilities: u32 {
        const DFS = 0x00000001;
        const LEASING = 0x00000002;
        const LARGE_MTU = 0x00000004;
        const MULTI_CHANNEL = 0x00000008;
        const PERSISTENT_HANDLES = 0x00000010;
        const DIRECTORY_LEASING = 0x00000020;
        const ENCRYPTION = 0x00000040;
    }
}

/// Capabilities advertised by this client
pub const CLIENT_CAPABILITIES: Smb2Capabilities =
    Smb2Capabilities::LARGE_MTU.union(Smb2Capabilities::ENCRYPTION);

bitflags! {
    /// Session flags from a SESSION_SETUP response
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: u16 {
        const IS_GUEST = 0x0001;
        const IS_NULL = 0x0002;
        const ENCRYPT_DATA = 0x0004;
    }
}

bitflags! {
    /// Share flags from a TREE_CONNECT response (subset the core interprets)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShareFlags: u32 {
        const DFS = 0x00000001;
        const DFS_ROOT = 0x00000002;
        const ENCRYPT_DATA = 0x00008000;
    }
}

/// Negotiate context types (SMB 3.1.1)
pub mod context_type {
    pub const PREAUTH_INTEGRITY_CAPABILITIES: u16 = 0x0001;
    pub const ENCRYPTION_CAPABILITIES: u16 = 0x0002;
}

/// Preauth-integrity hash algorithm ids
pub mod hash_algorithm {
    pub const SHA512: u16 = 0x0001;
}

/// Encryption cipher ids
pub mod cipher {
    pub const AES128_CCM: u16 = 0x0001;
    pub const AES128_GCM: u16 = 0x0002;
}

/// Ciphers offered by this client, in preference order
pub const CLIENT_CIPHERS: [u16; 2] = [cipher::AES128_CCM, cipher::AES128_GCM];

/// Transform header flags
pub mod transform_flags {
    pub const ENCRYPTED: u16 = 0x0001;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smb2_magic() {
        assert_eq!(SMB2_MAGIC, [0xFE, b'S', b'M', b'B']);
        assert_eq!(SMB2_TRANSFORM_MAGIC, [0xFD, b'S', b'M', b'B']);
    }

    #[test]
    fn test_smb2_commands() {
        assert_eq!(Smb2Command::Negotiate as u16, 0x00);
        assert_eq!(Smb2Command::SessionSetup as u16, 0x01);
        assert_eq!(Smb2Command::Cancel as u16, 0x0C);
        assert_eq!(
            Smb2Command::from_u16(0x0F).unwrap(),
            Smb2Command::ChangeNotify
        );
        assert!(Smb2Command::from_u16(0x13).is_err());
    }

    #[test]
    fn test_dialect_values() {
        assert_eq!(Smb2Dialect::Smb202.to_u16(), 0x0202);
        assert_eq!(Smb2Dialect::Smb311.to_u16(), 0x0311);
        assert_eq!(Smb2Dialect::Smb2Wildcard.to_u16(), 0x02FF);
        assert!(!Smb2Dialect::Smb210.is_smb3());
        assert!(!Smb2Dialect::Smb2Wildcard.is_smb3());
        assert!(Smb2Dialect::Smb300.is_smb3());
        assert!(Smb2Dialect::Smb311.is_smb3());
    }

    #[test]
    fn test_nt_status_severity() {
        assert!(nt_status::is_error(nt_status::ACCESS_DENIED));
        assert!(!nt_status::is_error(nt_status::PENDING));
        assert!(!nt_status::is_error(nt_status::BUFFER_OVERFLOW));
    }

    #[test]
    fn test_client_capabilities() {
        assert!(CLIENT_CAPABILITIES.contains(Smb2Capabilities::LARGE_MTU));
        assert!(CLIENT_CAPABILITIES.contains(Smb2Capabilities::ENCRYPTION));
    }
}
