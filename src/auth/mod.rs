//! Authentication initiator contract consumed by session setup
//!
//! Kerberos, NTLM, and anonymous initiators live outside the connection
//! core; session setup only drives the token exchange below and consumes
//! the resulting session key.

use crate::error::Result;

/// DER-encoded GSS-API mechanism object identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Oid(Vec<u8>);

impl Oid {
    pub fn from_der(der: Vec<u8>) -> Self {
        Self(der)
    }

    pub fn as_der(&self) -> &[u8] {
        &self.0
    }
}

/// A security-context initiator (client side of a GSS-API mechanism).
///
/// SPNEGO wraps the chosen mechanism; the connection core treats tokens as
/// opaque and only cares about the resulting 16-byte session key.
pub trait Initiator: Send {
    /// Mechanism object identifier
    fn oid(&self) -> Oid;

    /// Produce the initial security token
    fn init_sec_context(&mut self) -> Result<Vec<u8>>;

    /// Consume a server challenge and produce the next token
    fn accept_sec_context(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// The established session key, zero-padded to 16 bytes if shorter
    fn session_key(&self) -> [u8; 16];

    /// Message integrity code over `input` under the mechanism's key
    fn sum(&self, input: &[u8]) -> Vec<u8>;
}
