//! SMB2 wire protocol: header codecs, message bodies, constants

pub mod messages;
pub mod smb2_constants;

pub use messages::common::{Packet, Smb2Header, SmbMessage, TransformHeader};
pub use smb2_constants::{Smb2Command, Smb2Dialect};
