//! SMB2/SMB3 client connection core: negotiation, credit flow control,
//! and request multiplexing

pub mod conn;
pub mod credit;
pub mod outstanding;
pub mod session;


pub use conn::{accept, ConnState, Connection, PendingRequest};
pub use credit::CreditAccount;
pub use session::{Session, TreeConn};

use crate::crypto::random_bytes;
use crate::error::{Error, Result};
use crate::protocol::messages::common::{Packet, SmbMessage};
use crate::protocol::messages::negotiate::{NegotiateContext, NegotiateRequest, NegotiateResponse};
use crate::protocol::smb2_constants::{
    cipher, hash_algorithm, SecurityMode, Smb2Command, Smb2Dialect, CLIENT_CAPABILITIES,
    CLIENT_CIPHERS, CLIENT_DIALECTS,
};
use conn::Negotiated;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default ceiling the client asks the server to grow the credit balance to
const DEFAULT_MAX_CREDIT_BALANCE: u16 = 128;

/// Options for establishing a connection.
///
/// Plays the role of a client configuration: signing policy, client
/// identity, dialect pinning, and credit ceiling.
#[derive(Debug, Clone)]
pub struct Negotiator {
    /// Enforce signing even if the server does not require it
    pub require_message_signing: bool,
    /// Client GUID; generated from the OS CSPRNG when unset
    pub client_guid: Option<Uuid>,
    /// Offer a single dialect instead of the full client list
    pub specified_dialect: Option<Smb2Dialect>,
    /// Ceiling for the credit balance requested from the server
    pub max_credit_balance: u16,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self {
            require_message_signing: false,
            client_guid: None,
            specified_dialect: None,
            max_credit_balance: DEFAULT_MAX_CREDIT_BALANCE,
        }
    }
}

impl Negotiator {
    fn make_request(
        &self,
        specified: Option<Smb2Dialect>,
        client_guid: Uuid,
    ) -> Result<NegotiateRequest> {
        let dialects = match specified {
            Some(Smb2Dialect::Smb2Wildcard) => {
                return Err(Error::Internal("unsupported dialect specified".into()))
            }
            Some(dialect) => vec![dialect],
            None => CLIENT_DIALECTS.to_vec(),
        };

        let mut req = NegotiateRequest::new(dialects);
        req.security_mode = if self.require_message_signing {
            SecurityMode::SIGNING_REQUIRED
        } else {
            SecurityMode::SIGNING_ENABLED
        };
        req.capabilities = CLIENT_CAPABILITIES;
        req.client_guid = client_guid;

        if req.dialects.contains(&Smb2Dialect::Smb311) {
            let mut salt = vec![0u8; 32];
            random_bytes(&mut salt)?;
            req.contexts = vec![
                NegotiateContext::PreauthIntegrity {
                    hash_algorithms: vec![hash_algorithm::SHA512],
                    salt,
                },
                NegotiateContext::Encryption {
                    ciphers: CLIENT_CIPHERS.to_vec(),
                },
            ];
        }

        Ok(req)
    }

    /// Run the NEGOTIATE exchange over `transport` and return the live
    /// connection.
    ///
    /// A wildcard SMB 2.?? response re-issues negotiation pinned to 2.1;
    /// a response disagreeing with a pinned dialect fails.
    pub async fn negotiate(
        &self,
        transport: Box<dyn crate::transport::Transport>,
        ctx: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        let conn = Connection::start(transport, self.max_credit_balance);
        let client_guid = self.client_guid.unwrap_or_else(Uuid::new_v4);
        let mut specified = self.specified_dialect;

        conn.set_state(ConnState::Negotiating).await;

        loop {
            let mut req = self.make_request(specified, client_guid)?;
            let (charge, _) = conn.loan_credit(0, ctx).await?;
            req.header_mut().credit_charge = charge;

            let pending = conn.send(&mut req, ctx).await?;
            let req_bytes = pending.pkt().to_vec();
            let pkt = conn.recv(pending).await?;

            let body = accept(Smb2Command::Negotiate, pkt.clone())?;
            let response = NegotiateResponse::parse(&body)?;

            if response.dialect_revision == Smb2Dialect::Smb2Wildcard {
                specified = Some(Smb2Dialect::Smb210);
                continue;
            }
            if let Some(dialect) = specified {
                if dialect != response.dialect_revision {
                    return Err(Error::InvalidResponse("unexpected dialect returned".into()));
                }
            }

            let mut negotiated = Negotiated {
                dialect: response.dialect_revision,
                capabilities: CLIENT_CAPABILITIES & response.capabilities,
                require_signing: self.require_message_signing
                    || response
                        .security_mode
                        .contains(SecurityMode::SIGNING_REQUIRED),
                max_transact_size: response.max_transact_size,
                max_read_size: response.max_read_size,
                max_write_size: response.max_write_size,
                preauth_hash_id: 0,
                cipher_id: 0,
            };

            if response.dialect_revision == Smb2Dialect::Smb311 {
                for context in &response.contexts {
                    match context {
                        NegotiateContext::PreauthIntegrity {
                            hash_algorithms, ..
                        } => {
                            if hash_algorithms.len() != 1 {
                                return Err(Error::InvalidResponse(
                                    "multiple hash algorithms".into(),
                                ));
                            }
                            if hash_algorithms[0] != hash_algorithm::SHA512 {
                                return Err(Error::InvalidResponse("unknown hash algorithm".into()));
                            }
                            negotiated.preauth_hash_id = hash_algorithms[0];
                        }
                        NegotiateContext::Encryption { ciphers } => {
                            if ciphers.len() != 1 {
                                return Err(Error::InvalidResponse(
                                    "multiple cipher algorithms".into(),
                                ));
                            }
                            match ciphers[0] {
                                cipher::AES128_CCM | cipher::AES128_GCM => {
                                    negotiated.cipher_id = ciphers[0];
                                }
                                _ => {
                                    return Err(Error::InvalidResponse(
                                        "unknown cipher algorithm".into(),
                                    ))
                                }
                            }
                        }
                        NegotiateContext::Unknown { .. } => {}
                    }
                }

                if negotiated.preauth_hash_id != hash_algorithm::SHA512 {
                    return Err(Error::InvalidResponse(
                        "missing preauth integrity context".into(),
                    ));
                }

                let hash = crate::crypto::preauth_hash_step(&[0u8; 64], &req_bytes);
                let hash = crate::crypto::preauth_hash_step(&hash, &pkt);
                conn.init_preauth(hash);
            }

            conn.neg
                .set(negotiated)
                .map_err(|_| Error::Internal("connection already negotiated".into()))?;
            conn.set_state(ConnState::Negotiated).await;
            return Ok(conn);
        }
    }
}
