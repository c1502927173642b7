//! Authenticated session state, key derivation, and session setup

use crate::auth::Initiator;
use crate::client::conn::{accept, ConnState, Connection};
use crate::crypto::{derive_key, Sealer, Signer};
use crate::error::{Error, Result};
use crate::protocol::messages::common::{Packet, Smb2Header, SmbMessage};
use crate::protocol::messages::session::{LogoffRequest, SessionSetupRequest, SessionSetupResponse};
use crate::protocol::smb2_constants::{
    cipher, nt_status, SecurityMode, SessionFlags, ShareFlags, Smb2Command, Smb2Dialect,
    Smb2HeaderFlags,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Handle to a connected share, registered by the tree-connect layer so
/// the receiver can sanity-check inbound tree ids and the send path can
/// honor per-share encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConn {
    pub tree_id: u32,
    pub share_flags: ShareFlags,
}

pub(crate) struct SessionKeys {
    pub signer: Signer,
    pub application_key: [u8; 16],
    pub sealer: Option<Sealer>,
    pub opener: Option<Sealer>,
}

/// Derive the per-direction session keys for `dialect` from the
/// SPNEGO-established session key.
///
/// SMB 2.x signs with the session key directly. SMB 3.0/3.0.2 derive keys
/// with fixed labels; SMB 3.1.1 binds the preauth-integrity hash into every
/// derivation.
pub(crate) fn derive_session_keys(
    dialect: Smb2Dialect,
    cipher_id: u16,
    session_key: [u8; 16],
    preauth_hash: Option<[u8; 64]>,
) -> Result<SessionKeys> {
    if !dialect.is_smb3() {
        return Ok(SessionKeys {
            signer: Signer::HmacSha256 { key: session_key },
            application_key: session_key,
            sealer: None,
            opener: None,
        });
    }

    if dialect == Smb2Dialect::Smb311 {
        let context = preauth_hash.ok_or_else(|| {
            Error::Internal("missing preauth integrity hash for SMB 3.1.1 key derivation".into())
        })?;
        let signing_key = derive_key(&session_key, b"SMBSigningKey\0", &context)?;
        let application_key = derive_key(&session_key, b"SMBAppKey\0", &context)?;
        let (sealer, opener) = if cipher_id != 0 {
            let encryption_key = derive_key(&session_key, b"SMBC2SCipherKey\0", &context)?;
            let decryption_key = derive_key(&session_key, b"SMBS2CCipherKey\0", &context)?;
            (
                Some(Sealer::new(cipher_id, encryption_key)?),
                Some(Sealer::new(cipher_id, decryption_key)?),
            )
        } else {
            (None, None)
        };
        return Ok(SessionKeys {
            signer: Signer::AesCmac { key: signing_key },
            application_key,
            sealer,
            opener,
        });
    }

    let signing_key = derive_key(&session_key, b"SMB2AESCMAC\0", b"SmbSign\0")?;
    let application_key = derive_key(&session_key, b"SMB2APP\0", b"SmbRpc\0")?;
    let encryption_key = derive_key(&session_key, b"SMB2AESCCM\0", b"ServerIn \0")?;
    let decryption_key = derive_key(&session_key, b"SMB2AESCCM\0", b"ServerOut\0")?;
    Ok(SessionKeys {
        signer: Signer::AesCmac { key: signing_key },
        application_key,
        sealer: Some(Sealer::new(cipher::AES128_CCM, encryption_key)?),
        opener: Some(Sealer::new(cipher::AES128_CCM, decryption_key)?),
    })
}

/// An authenticated session bound to one connection
pub struct Session {
    session_id: u64,
    flags: SessionFlags,
    dialect: Smb2Dialect,
    signer: Signer,
    application_key: [u8; 16],
    sealer: Option<Sealer>,
    opener: Option<Sealer>,
    tree_conns: RwLock<HashMap<u32, TreeConn>>,
}

impl Session {
    pub(crate) fn new(
        session_id: u64,
        flags: SessionFlags,
        dialect: Smb2Dialect,
        keys: SessionKeys,
    ) -> Self {
        Self {
            session_id,
            flags,
            dialect,
            signer: keys.signer,
            application_key: keys.application_key,
            sealer: keys.sealer,
            opener: keys.opener,
            tree_conns: RwLock::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn dialect(&self) -> Smb2Dialect {
        self.dialect
    }

    /// Guest and anonymous sessions have no key material worth signing with
    pub fn is_guest_or_null(&self) -> bool {
        self.flags
            .intersects(SessionFlags::IS_GUEST | SessionFlags::IS_NULL)
    }

    /// Key handed to layers above the connection (DCE/RPC binding etc.)
    pub fn application_key(&self) -> &[u8; 16] {
        &self.application_key
    }

    pub(crate) fn sign(&self, pkt: &mut [u8]) -> Result<()> {
        self.signer.sign(pkt)
    }

    pub(crate) fn verify(&self, pkt: &[u8]) -> bool {
        self.signer.verify(pkt)
    }

    /// Encrypt outbound cleartext into a transform envelope
    pub(crate) fn seal(&self, pkt: &[u8]) -> Result<Vec<u8>> {
        let sealer = self
            .sealer
            .as_ref()
            .ok_or_else(|| Error::Internal("encryption is not negotiated".into()))?;
        sealer.seal(self.session_id, pkt)
    }

    /// Decrypt an inbound transform envelope back to cleartext
    pub(crate) fn open(&self, pkt: &[u8]) -> Result<Vec<u8>> {
        let opener = self
            .opener
            .as_ref()
            .ok_or_else(|| Error::InvalidResponse("encryption is not negotiated".into()))?;
        opener.open(pkt)
    }

    // --- tree-connect registry ---

    pub fn register_tree(&self, tree: TreeConn) {
        self.lock_trees_mut().insert(tree.tree_id, tree);
    }

    pub fn forget_tree(&self, tree_id: u32) {
        self.lock_trees_mut().remove(&tree_id);
    }

    pub fn has_tree(&self, tree_id: u32) -> bool {
        self.lock_trees().contains_key(&tree_id)
    }

    pub fn has_trees(&self) -> bool {
        !self.lock_trees().is_empty()
    }

    pub fn tree(&self, tree_id: u32) -> Option<TreeConn> {
        self.lock_trees().get(&tree_id).copied()
    }

    fn lock_trees(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u32, TreeConn>> {
        match self.tree_conns.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_trees_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u32, TreeConn>> {
        match self.tree_conns.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Connection {
    /// Authenticate against the server by driving `initiator` through the
    /// SESSION_SETUP token exchange.
    ///
    /// On SMB 3.1.1 every request and every non-final response is folded
    /// into the preauth-integrity hash; the final STATUS_SUCCESS response
    /// is excluded, since its signature is verified with the keys that
    /// hash produces.
    pub async fn session_setup(
        &self,
        initiator: &mut dyn Initiator,
        ctx: &CancellationToken,
    ) -> Result<Arc<Session>> {
        let (dialect, cipher_id, capabilities, require_signing) = {
            let neg = self.negotiated()?;
            (
                neg.dialect,
                neg.cipher_id,
                neg.capabilities,
                neg.require_signing,
            )
        };
        self.set_state(ConnState::SessionSetup).await;

        let security_mode = if require_signing {
            SecurityMode::SIGNING_REQUIRED
        } else {
            SecurityMode::SIGNING_ENABLED
        };

        let mut token = initiator.init_sec_context()?;
        let mut session_id = 0u64;

        loop {
            let (charge, _) = self.loan_credit(0, ctx).await?;
            let mut req = SessionSetupRequest::new(security_mode.bits() as u8, token.clone());
            req.capabilities = capabilities;
            req.header_mut().credit_charge = charge;
            req.header_mut().session_id = session_id;

            let pending = self.send(&mut req, ctx).await?;
            self.preauth_update(pending.pkt());
            let pkt = self.recv(pending).await?;

            let header = Smb2Header::parse(&pkt)?;
            let body = accept(Smb2Command::SessionSetup, pkt.clone())?;
            let response = SessionSetupResponse::parse(&body)?;
            session_id = header.session_id;

            if header.status == nt_status::MORE_PROCESSING_REQUIRED {
                self.preauth_update(&pkt);
                token = initiator.accept_sec_context(&response.security_buffer)?;
                continue;
            }

            let keys = derive_session_keys(
                dialect,
                cipher_id,
                initiator.session_key(),
                self.preauth_value(),
            )?;
            let session = Arc::new(Session::new(
                session_id,
                response.session_flags,
                dialect,
                keys,
            ));

            if header.flags.contains(Smb2HeaderFlags::SIGNED) {
                if !session.verify(&pkt) {
                    return Err(Error::InvalidResponse(
                        "unverified session setup response".into(),
                    ));
                }
            } else if require_signing && !session.is_guest_or_null() {
                return Err(Error::InvalidResponse("signing required".into()));
            }

            self.enable_session(session.clone());
            self.set_state(ConnState::Established).await;
            return Ok(session);
        }
    }

    /// Log the session off and forget it. The connection stays usable for
    /// a fresh session setup.
    pub async fn logoff(&self, session: &Arc<Session>, ctx: &CancellationToken) -> Result<()> {
        let (charge, _) = self.loan_credit(0, ctx).await?;
        let mut req = LogoffRequest::new();
        req.header_mut().credit_charge = charge;
        req.header_mut().session_id = session.session_id();

        self.send_recv(Smb2Command::Logoff, &mut req, ctx).await?;
        self.clear_session();
        self.set_state(ConnState::Negotiated).await;
        Ok(())
    }
}
