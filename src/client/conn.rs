//! Connection multiplexer: send/receive workers, message-id assignment,
//! compound dispatch, and shutdown propagation

use crate::client::credit::CreditAccount;
use crate::client::outstanding::{OutstandingRequests, RequestRecord};
use crate::client::session::{Session, TreeConn};
use crate::error::{Error, ResponseError, Result};
use crate::protocol::messages::cancel::CancelRequest;
use crate::protocol::messages::common::{Packet, Smb2Header, SmbMessage};
use crate::protocol::messages::error::ErrorResponse;
use crate::protocol::smb2_constants::{
    nt_status, structure_size, Smb2Capabilities, Smb2Command, Smb2Dialect, Smb2HeaderFlags,
    SessionFlags, ShareFlags, CREDIT_PAYLOAD_SIZE, SMB2_HEADER_SIZE, SMB2_MAGIC,
    SMB2_NOTIFICATION_MESSAGE_ID,
};
use crate::transport::{ReadTransport, Transport, WriteTransport};
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deadline applied to each transport write
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra room kept in the receive buffer for the transform header
const RECV_BUFFER_MARGIN: usize = 16;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Negotiating,
    Negotiated,
    SessionSetup,
    Established,
    Closing,
    Closed,
}

/// Parameters fixed by a successful NEGOTIATE exchange
pub(crate) struct Negotiated {
    pub dialect: Smb2Dialect,
    pub capabilities: Smb2Capabilities,
    pub require_signing: bool,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub preauth_hash_id: u16,
    pub cipher_id: u16,
}

struct ConnInner {
    sequence_window: u64,
    err: Option<Error>,
    state: ConnState,
}

struct Outbound {
    frame: Bytes,
    ack: oneshot::Sender<Result<()>>,
}

/// A request that has been accepted by the transport and awaits its reply
pub struct PendingRequest {
    pub(crate) record: Arc<RequestRecord>,
    rx: oneshot::Receiver<Result<Vec<u8>>>,
    pkt: Bytes,
    ctx: CancellationToken,
}

impl PendingRequest {
    pub fn message_id(&self) -> u64 {
        self.record.msg_id
    }

    /// Server-assigned async id, 0 until a STATUS_PENDING reply arrives
    pub fn async_id(&self) -> u64 {
        self.record.async_id()
    }

    /// Wire bytes of the request as sent
    pub(crate) fn pkt(&self) -> &[u8] {
        &self.pkt
    }
}

/// A negotiated client connection multiplexing concurrent exchanges over
/// one transport.
///
/// Two background workers own the transport: the sender drains an outbound
/// queue, the receiver demultiplexes replies to waiters by message id.
/// Dropping the connection alone does not stop the workers; call
/// [`Connection::close`] to tear the transport down.
pub struct Connection {
    write_tx: mpsc::Sender<Outbound>,
    inner: Mutex<ConnInner>,
    pub(crate) outstanding: OutstandingRequests,
    pub(crate) account: CreditAccount,
    pub(crate) neg: OnceLock<Negotiated>,
    session: RwLock<Option<Arc<Session>>>,
    use_session: AtomicBool,
    preauth_hash: std::sync::Mutex<Option<[u8; 64]>>,
    rdone: CancellationToken,
    wdone: CancellationToken,
}

impl Connection {
    /// Split the transport and start the two workers. The connection is
    /// not usable until negotiation completes.
    pub(crate) fn start(transport: Box<dyn Transport>, max_credit_balance: u16) -> Arc<Self> {
        let (read_half, write_half) = transport.split();
        let (write_tx, write_rx) = mpsc::channel(1);

        let conn = Arc::new(Self {
            write_tx,
            inner: Mutex::new(ConnInner {
                sequence_window: 0,
                err: None,
                state: ConnState::New,
            }),
            outstanding: OutstandingRequests::new(),
            account: CreditAccount::new(max_credit_balance),
            neg: OnceLock::new(),
            session: RwLock::new(None),
            use_session: AtomicBool::new(false),
            preauth_hash: std::sync::Mutex::new(None),
            rdone: CancellationToken::new(),
            wdone: CancellationToken::new(),
        });

        tokio::spawn(run_sender(write_half, write_rx, conn.wdone.clone()));
        tokio::spawn(run_receiver(read_half, conn.clone()));

        conn
    }

    // --- negotiated parameters ---

    pub(crate) fn negotiated(&self) -> Result<&Negotiated> {
        self.neg
            .get()
            .ok_or_else(|| Error::Internal("connection not negotiated".into()))
    }

    pub fn dialect(&self) -> Option<Smb2Dialect> {
        self.neg.get().map(|n| n.dialect)
    }

    pub fn capabilities(&self) -> Smb2Capabilities {
        self.neg
            .get()
            .map(|n| n.capabilities)
            .unwrap_or(Smb2Capabilities::empty())
    }

    pub fn require_signing(&self) -> bool {
        self.neg.get().map(|n| n.require_signing).unwrap_or(false)
    }

    pub fn max_transact_size(&self) -> u32 {
        self.neg.get().map(|n| n.max_transact_size).unwrap_or(0)
    }

    pub fn max_read_size(&self) -> u32 {
        self.neg.get().map(|n| n.max_read_size).unwrap_or(0)
    }

    pub fn max_write_size(&self) -> u32 {
        self.neg.get().map(|n| n.max_write_size).unwrap_or(0)
    }

    pub async fn state(&self) -> ConnState {
        self.inner.lock().await.state
    }

    pub(crate) async fn set_state(&self, state: ConnState) {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnState::Closed {
            inner.state = state;
        }
    }

    // --- session plumbing ---

    pub fn session(&self) -> Option<Arc<Session>> {
        match self.session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install the session and switch the receiver into session-aware mode
    /// (signature verification, decryption, tree checks).
    pub(crate) fn enable_session(&self, session: Arc<Session>) {
        match self.session.write() {
            Ok(mut guard) => *guard = Some(session),
            Err(poisoned) => *poisoned.into_inner() = Some(session),
        }
        self.use_session.store(true, Ordering::Release);
    }

    pub(crate) fn clear_session(&self) {
        match self.session.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        self.use_session.store(false, Ordering::Release);
    }

    fn session_enabled(&self) -> bool {
        self.use_session.load(Ordering::Acquire)
    }

    // --- preauth-integrity hash chain (SMB 3.1.1) ---

    pub(crate) fn init_preauth(&self, value: [u8; 64]) {
        *self.lock_preauth() = Some(value);
    }

    /// Fold `message` into the running hash, if the chain is active
    pub(crate) fn preauth_update(&self, message: &[u8]) {
        let mut guard = self.lock_preauth();
        if let Some(current) = guard.as_ref() {
            *guard = Some(crate::crypto::preauth_hash_step(current, message));
        }
    }

    pub(crate) fn preauth_value(&self) -> Option<[u8; 64]> {
        *self.lock_preauth()
    }

    fn lock_preauth(&self) -> std::sync::MutexGuard<'_, Option<[u8; 64]>> {
        match self.preauth_hash.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --- credit flow ---

    /// Borrow credits for a payload of `payload_size` bytes. Returns the
    /// credit charge to place in the header and the payload size the grant
    /// actually covers; callers must shrink their payload when the grant
    /// is partial.
    pub async fn loan_credit(
        &self,
        payload_size: usize,
        ctx: &CancellationToken,
    ) -> Result<(u16, usize)> {
        let charge = if !self.capabilities().contains(Smb2Capabilities::LARGE_MTU) {
            1
        } else {
            (payload_size.saturating_sub(1) / CREDIT_PAYLOAD_SIZE + 1) as u16
        };

        let (granted, is_complete) = self.account.loan(charge, ctx).await?;
        if is_complete {
            Ok((granted, payload_size))
        } else {
            Ok((granted, CREDIT_PAYLOAD_SIZE * granted as usize))
        }
    }

    /// Return a loan for a request that will never be sent
    pub fn charge_credit(&self, credit_charge: u16) {
        self.account.charge(credit_charge, credit_charge);
    }

    // --- send / recv ---

    pub async fn send(
        &self,
        req: &mut dyn Packet,
        ctx: &CancellationToken,
    ) -> Result<PendingRequest> {
        self.send_with(req, None, ctx).await
    }

    /// Send a request in the scope of a tree connect. The connection mutex
    /// is held across encode, sign/seal, and the sender hand-off so wire
    /// order matches message-id order.
    pub async fn send_with(
        &self,
        req: &mut dyn Packet,
        tree: Option<&TreeConn>,
        ctx: &CancellationToken,
    ) -> Result<PendingRequest> {
        let mut inner = self.inner.lock().await;

        if let Some(err) = &inner.err {
            return Err(err.clone());
        }
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }

        let (record, rx, frame) = self.make_request(&mut inner, req, tree)?;
        let is_cancel = req.command() == Smb2Command::Cancel;
        let msg_id = record.msg_id;

        let (ack_tx, ack_rx) = oneshot::channel();
        let outbound = Outbound {
            frame: frame.clone(),
            ack: ack_tx,
        };

        tokio::select! {
            res = self.write_tx.send(outbound) => {
                if res.is_err() {
                    self.unwind(is_cancel, msg_id);
                    return Err(inner.err.clone().unwrap_or(Error::ConnectionClosed));
                }
            }
            _ = ctx.cancelled() => {
                self.unwind(is_cancel, msg_id);
                return Err(Error::Canceled);
            }
        }

        tokio::select! {
            res = ack_rx => match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.unwind(is_cancel, msg_id);
                    return Err(e);
                }
                Err(_) => {
                    self.unwind(is_cancel, msg_id);
                    return Err(inner.err.clone().unwrap_or(Error::ConnectionClosed));
                }
            },
            _ = ctx.cancelled() => {
                self.unwind(is_cancel, msg_id);
                return Err(Error::Canceled);
            }
        }

        Ok(PendingRequest {
            record,
            rx,
            pkt: frame,
            ctx: ctx.clone(),
        })
    }

    fn unwind(&self, is_cancel: bool, msg_id: u64) {
        if !is_cancel {
            self.outstanding.pop(msg_id);
        }
    }

    /// Assign the message id, stamp credits and session/tree ids, encode,
    /// and apply encryption or signing. Inserts the record into the
    /// outstanding table before the bytes reach the sender.
    fn make_request(
        &self,
        inner: &mut ConnInner,
        req: &mut dyn Packet,
        tree: Option<&TreeConn>,
    ) -> Result<(Arc<RequestRecord>, oneshot::Receiver<Result<Vec<u8>>>, Bytes)> {
        let is_cancel = req.command() == Smb2Command::Cancel;
        let session = self.session();

        {
            let header = req.header_mut();
            if !is_cancel {
                header.message_id = inner.sequence_window;
                let charge = header.credit_charge;
                inner.sequence_window += charge as u64;
                if header.credit_request == 0 {
                    header.credit_request = charge;
                }
                header.credit_request = header
                    .credit_request
                    .saturating_add(self.account.opening());
            }

            if let Some(session) = &session {
                header.session_id = session.session_id();
                if let Some(tree) = tree {
                    header.tree_id = tree.tree_id;
                }
            }
        }

        let mut pkt = req.encode()?;

        if let Some(session) = &session {
            if req.command() != Smb2Command::SessionSetup {
                let encrypt = session.flags().contains(SessionFlags::ENCRYPT_DATA)
                    || tree
                        .map(|t| t.share_flags.contains(ShareFlags::ENCRYPT_DATA))
                        .unwrap_or(false);
                if encrypt {
                    pkt = session.seal(&pkt)?;
                } else if !session.is_guest_or_null() {
                    session.sign(&mut pkt)?;
                }
            }
        }

        let (record, rx) = RequestRecord::new(req.header().message_id, req.header().credit_request);
        if !is_cancel {
            self.outstanding.set(record.msg_id, record.clone());
        }

        Ok((record, rx, Bytes::from(pkt)))
    }

    /// Await the reply for a previously sent request
    pub async fn recv(&self, pending: PendingRequest) -> Result<Vec<u8>> {
        let PendingRequest {
            record, rx, ctx, ..
        } = pending;

        tokio::select! {
            res = rx => match res {
                Ok(result) => result,
                Err(_) => Err(self.stored_err().await),
            },
            _ = ctx.cancelled() => {
                self.outstanding.pop(record.msg_id);
                Err(Error::Canceled)
            }
        }
    }

    /// Send `req`, await the reply, and validate command and status.
    /// Returns the response body with the header stripped.
    pub async fn send_recv(
        &self,
        cmd: Smb2Command,
        req: &mut dyn Packet,
        ctx: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let pending = self.send(req, ctx).await?;
        let pkt = self.recv(pending).await?;
        accept(cmd, pkt)
    }

    /// Issue an SMB2 CANCEL for an in-flight request.
    ///
    /// The cancel frame references the pending request's message id, and
    /// its async id once the server has answered STATUS_PENDING; it does
    /// not consume a message id or enter the outstanding table.
    pub async fn cancel(&self, pending: &PendingRequest, ctx: &CancellationToken) -> Result<()> {
        let mut req = CancelRequest::new();
        let header = req.header_mut();
        header.message_id = pending.message_id();
        let async_id = pending.async_id();
        if async_id != 0 {
            header.async_id = async_id;
            header.flags |= Smb2HeaderFlags::ASYNC_COMMAND;
        }
        self.send(&mut req, ctx).await?;
        Ok(())
    }

    /// Signal the workers to exit and tear the transport down. Pending
    /// callers observe a connection-closed error.
    pub async fn close(&self) {
        self.set_state(ConnState::Closing).await;
        self.rdone.cancel();
    }

    async fn stored_err(&self) -> Error {
        self.inner
            .lock()
            .await
            .err
            .clone()
            .unwrap_or(Error::ConnectionClosed)
    }

    // --- receiver-side frame processing ---

    fn process_frame(&self, frame: &[u8]) {
        let has_session = self.session_enabled();

        let mut is_encrypted = false;
        let decrypted: Option<Vec<u8>> = if has_session && !frame.starts_with(&SMB2_MAGIC) {
            match self.try_decrypt(frame) {
                Ok(plain) => {
                    is_encrypted = true;
                    Some(plain)
                }
                Err(e) => {
                    debug!("skip: {}", e);
                    return;
                }
            }
        } else {
            None
        };
        let pkt = decrypted.as_deref().unwrap_or(frame);

        if has_session {
            if let Err(e) = self.check_session(pkt) {
                debug!("skip: {}", e);
                return;
            }
        }

        let mut rest = pkt;
        loop {
            let header = match Smb2Header::parse(rest) {
                Ok(header) => header,
                Err(e) => {
                    debug!("skip: {}", e);
                    return;
                }
            };

            let off = header.next_command as usize;
            let (element, next) = if off == 0 || off == rest.len() {
                (rest, None)
            } else if off < SMB2_HEADER_SIZE || off > rest.len() {
                debug!("skip: invalid compound chain offset {}", off);
                return;
            } else {
                (&rest[..off], Some(&rest[off..]))
            };

            let verify_err = if has_session {
                self.try_verify(element, &header, is_encrypted).err()
            } else {
                None
            };
            self.dispatch(element, &header, verify_err);

            match next {
                Some(next) => rest = next,
                None => return,
            }
        }
    }

    /// Decrypt a transform-framed packet under the active session
    fn try_decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let header = crate::protocol::messages::common::TransformHeader::parse(frame)?;
        let session = self
            .session()
            .filter(|s| s.session_id() == header.session_id)
            .ok_or_else(|| Error::InvalidResponse("unknown session id returned".into()))?;
        session.open(frame)
    }

    /// Session/tree sanity for an inbound frame.
    ///
    /// Only tree ids already registered are validated; a TREE_CONNECT
    /// response carries a tree id that cannot be in the registry yet, so
    /// unknown ids pass through.
    fn check_session(&self, pkt: &[u8]) -> Result<()> {
        let header = Smb2Header::parse(pkt)?;
        if let Some(session) = self.session() {
            if session.session_id() != header.session_id {
                return Err(Error::InvalidResponse("unknown session id returned".into()));
            }
            if let Some(tree) = session.tree(header.tree_id) {
                if tree.tree_id != header.tree_id {
                    return Err(Error::InvalidResponse("unknown tree id returned".into()));
                }
            }
        }
        Ok(())
    }

    /// Enforce the signing policy on one compound element
    fn try_verify(&self, element: &[u8], header: &Smb2Header, is_encrypted: bool) -> Result<()> {
        if header.message_id == SMB2_NOTIFICATION_MESSAGE_ID {
            return Ok(());
        }

        if header.flags.contains(Smb2HeaderFlags::SIGNED) {
            let session = self
                .session()
                .filter(|s| s.session_id() == header.session_id)
                .ok_or_else(|| Error::InvalidResponse("unknown session id returned".into()))?;
            if !session.verify(element) {
                return Err(Error::InvalidResponse("unverified packet returned".into()));
            }
            return Ok(());
        }

        if self.require_signing() && !is_encrypted {
            if let Some(session) = self.session() {
                if !session.is_guest_or_null() && session.session_id() == header.session_id {
                    return Err(Error::InvalidResponse("signing required".into()));
                }
            }
        }
        Ok(())
    }

    /// Correlate one element with its waiter
    fn dispatch(&self, element: &[u8], header: &Smb2Header, verify_err: Option<Error>) {
        let msg_id = header.message_id;
        let Some(record) = self.outstanding.pop(msg_id) else {
            debug!("skip: unknown message id {}", msg_id);
            return;
        };

        if let Some(err) = verify_err {
            record.complete(Err(err));
            return;
        }

        if header.status == nt_status::PENDING {
            record.set_async_id(header.async_id);
            self.account.charge(header.credit_request, record.credit_request);
            self.outstanding.set(msg_id, record);
            return;
        }

        self.account.charge(header.credit_request, record.credit_request);
        if !record.complete(Ok(element.to_vec())) {
            debug!("skip: late reply for message id {}", msg_id);
        }
    }

    /// Record the terminal error, fail all outstanding requests, and stop
    /// the sender. Called once, from the receiver's exit path.
    async fn shutdown(&self, err: Error) {
        let mut inner = self.inner.lock().await;
        self.outstanding.shutdown(err.clone());
        inner.err = Some(err);
        inner.state = ConnState::Closed;
        self.wdone.cancel();
    }
}

/// Single writer draining the outbound queue onto the transport
async fn run_sender(
    mut transport: Box<dyn WriteTransport>,
    mut write_rx: mpsc::Receiver<Outbound>,
    wdone: CancellationToken,
) {
    loop {
        let outbound = tokio::select! {
            _ = wdone.cancelled() => break,
            out = write_rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };

        let result = match timeout(WRITE_TIMEOUT, transport.write_frame(&outbound.frame)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Transport(Arc::new(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline exceeded",
            )))),
        };
        let _ = outbound.ack.send(result);
    }
    let _ = transport.close().await;
}

/// Single reader reassembling frames and dispatching them to waiters
async fn run_receiver(mut transport: Box<dyn ReadTransport>, conn: Arc<Connection>) {
    // reusable receive buffer, grown to the largest observed frame
    let mut buf: Vec<u8> = vec![0; 4096];

    let err = loop {
        let size = tokio::select! {
            _ = conn.rdone.cancelled() => break Error::ConnectionClosed,
            res = transport.read_size() => match res {
                Ok(size) => size as usize,
                Err(e) => break e,
            },
        };

        if buf.len() < size + RECV_BUFFER_MARGIN {
            buf.resize(size + RECV_BUFFER_MARGIN, 0);
        }
        if let Err(e) = transport.read_exact(&mut buf[..size]).await {
            break e;
        }

        conn.process_frame(&buf[..size]);
    };

    if !matches!(err, Error::ConnectionClosed) {
        warn!("receiver exiting: {}", err);
    }
    conn.shutdown(err).await;
}

/// Validate a reply against the request's command and map its NTSTATUS.
/// Returns the response body with the 64-byte header stripped.
pub fn accept(cmd: Smb2Command, mut pkt: Vec<u8>) -> Result<Vec<u8>> {
    let header = Smb2Header::parse(&pkt)?;
    if header.command != cmd {
        return Err(Error::InvalidResponse(format!(
            "expected command {:?}, got {:?}",
            cmd, header.command
        )));
    }

    match header.status {
        nt_status::SUCCESS => {
            pkt.drain(..SMB2_HEADER_SIZE);
            return Ok(pkt);
        }
        nt_status::OBJECT_NAME_COLLISION => return Err(Error::AlreadyExists),
        nt_status::OBJECT_NAME_NOT_FOUND | nt_status::OBJECT_PATH_NOT_FOUND => {
            return Err(Error::NotFound)
        }
        nt_status::ACCESS_DENIED | nt_status::CANNOT_DELETE => {
            return Err(Error::PermissionDenied)
        }
        _ => {}
    }

    match (cmd, header.status) {
        (Smb2Command::SessionSetup, nt_status::MORE_PROCESSING_REQUIRED) => {
            pkt.drain(..SMB2_HEADER_SIZE);
            Ok(pkt)
        }
        (Smb2Command::QueryInfo | Smb2Command::Read, nt_status::BUFFER_OVERFLOW) => {
            Err(Error::Response(ResponseError::new(header.status)))
        }
        // a truncated IOCTL response still carries usable output; keep it
        // on the error when the body is well formed
        (Smb2Command::Ioctl, nt_status::BUFFER_OVERFLOW)
            if ioctl_response_is_valid(&pkt[SMB2_HEADER_SIZE..]) =>
        {
            let status = header.status;
            pkt.drain(..SMB2_HEADER_SIZE);
            Err(Error::Response(ResponseError::with_data(status, vec![pkt])))
        }
        (Smb2Command::ChangeNotify, nt_status::NOTIFY_ENUM_DIR) => {
            Err(Error::Response(ResponseError::new(header.status)))
        }
        _ => Err(accept_error(header.status, &pkt[SMB2_HEADER_SIZE..])),
    }
}

/// Minimal shape check on an IOCTL response body: fixed part present and
/// the output buffer within bounds. Offsets count from the packet header.
fn ioctl_response_is_valid(body: &[u8]) -> bool {
    if body.len() < 48 {
        return false;
    }
    if u16::from_le_bytes([body[0], body[1]]) != structure_size::IOCTL_RESPONSE {
        return false;
    }
    let output_offset = u32::from_le_bytes([body[32], body[33], body[34], body[35]]) as usize;
    let output_count = u32::from_le_bytes([body[36], body[37], body[38], body[39]]) as usize;
    if output_count == 0 {
        return true;
    }
    match output_offset.checked_sub(SMB2_HEADER_SIZE) {
        Some(start) => start + output_count <= body.len(),
        None => false,
    }
}

/// Build a structured response error from an SMB2 ERROR body
fn accept_error(status: u32, body: &[u8]) -> Error {
    match ErrorResponse::parse(body) {
        Ok(resp) => Error::Response(ResponseError::with_data(status, resp.error_data)),
        Err(e) => e,
    }
}
