//! Client connection: bind, alter-context, and the call multiplexer.
//!
//! One `Connection` owns one transport stream. All writes pass through a
//! single async mutex so fragments of concurrent calls never interleave on
//! the wire; waiting for a response never holds that lock. A dedicated
//! reader task is the stream's only reader: it reassembles inbound fragments
//! per call ID and resolves the issuing task's oneshot. Calls are matched to
//! responses purely by call ID, so any number may be outstanding at once.
//!
//! A caller that gives up (timeout, dropped future) releases its waiting
//! primitive but cannot retract the request already in flight; the reader
//! keeps consuming the eventual response against a tombstone entry and then
//! discards it, keeping the call-ID space clean.

use crate::auth::{protect_pdu, unseal_stub, verify_inbound, AuthLevel, Negotiator, SecurityProvider};
use crate::error::{Result, RpcError};
use crate::fragment::{max_stub_len, split_stub, FragmentAssembler};
use crate::operation::{self, Operation};
use crate::pdu::{
    ContextElement, ContextResult, PacketFlags, Pdu, PduBody, PduHeader, ResponseBody, SyntaxId,
    DEFAULT_MAX_FRAG,
};
use crate::transport::{PduTransport, DEFAULT_MAX_PDU_SIZE};
use bytes::Bytes;
use msrpc_ndr::NdrReader;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Options for establishing a bound connection.
pub struct BindOptions {
    /// Authentication mechanism and level; `None` binds unauthenticated
    pub security: Option<(Box<dyn SecurityProvider>, AuthLevel)>,
    /// Fragment size to propose (the server may negotiate it down)
    pub max_frag: u16,
    /// Largest inbound PDU accepted
    pub max_pdu_size: usize,
    /// Default per-call timeout; `None` waits indefinitely
    pub call_timeout: Option<Duration>,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            security: None,
            max_frag: DEFAULT_MAX_FRAG,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            call_timeout: None,
        }
    }
}

impl BindOptions {
    pub fn with_security(
        mut self,
        provider: Box<dyn SecurityProvider>,
        level: AuthLevel,
    ) -> Self {
        self.security = Some((provider, level));
        self
    }

    pub fn with_max_frag(mut self, max_frag: u16) -> Self {
        self.max_frag = max_frag;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

enum CallReply {
    Response(Bytes),
    Control(Pdu),
}

enum Pending {
    Call {
        tx: oneshot::Sender<Result<CallReply>>,
        assembler: FragmentAssembler,
    },
    Control {
        tx: oneshot::Sender<Result<CallReply>>,
    },
    /// Caller gave up; consume and discard the eventual reply.
    Abandoned { assembler: FragmentAssembler },
}

struct Inner {
    writer: tokio::sync::Mutex<PduTransport<BoxedWrite>>,
    pending: Mutex<HashMap<u32, Pending>>,
    security: Mutex<Option<Negotiator>>,
    contexts: Mutex<HashMap<u16, SyntaxId>>,
    next_call_id: AtomicU32,
    next_context_id: AtomicU16,
    max_xmit_frag: AtomicU16,
    default_timeout: Option<Duration>,
}

impl Inner {
    fn register_call(&self, call_id: u32) -> oneshot::Receiver<Result<CallReply>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            call_id,
            Pending::Call {
                tx,
                assembler: FragmentAssembler::new(call_id),
            },
        );
        rx
    }

    fn register_control(&self, call_id: u32) -> oneshot::Receiver<Result<CallReply>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(call_id, Pending::Control { tx });
        rx
    }

    fn abandon(&self, call_id: u32) {
        let mut pending = self.pending.lock();
        if let Some(Pending::Call { assembler, .. }) = pending.remove(&call_id) {
            pending.insert(call_id, Pending::Abandoned { assembler });
        }
    }

    /// Fail every outstanding call; the connection is dead.
    fn fail_all(&self, cause: &RpcError) {
        let entries: Vec<_> = self.pending.lock().drain().collect();
        if !entries.is_empty() {
            debug!(%cause, calls = entries.len(), "failing all pending calls");
        }
        for (_, entry) in entries {
            match entry {
                Pending::Call { tx, .. } | Pending::Control { tx } => {
                    let _ = tx.send(Err(RpcError::ConnectionClosed));
                }
                Pending::Abandoned { .. } => {}
            }
        }
    }

    fn handle_inbound(&self, raw: Bytes) -> Result<()> {
        let header = PduHeader::decode(&raw)?;
        verify_inbound(&self.security, &raw, header.auth_length)?;

        let pdu = Pdu::decode(&raw)?;
        match pdu.body {
            PduBody::Response(body) => self.route_response(pdu.header, body),
            PduBody::Fault(body) => {
                let did_not_execute = pdu
                    .header
                    .flags
                    .contains(PacketFlags::DID_NOT_EXECUTE);
                self.route_error(
                    pdu.header.call_id,
                    RpcError::fault(body.status, did_not_execute),
                )
            }
            PduBody::BindAck(_) | PduBody::AlterContextResponse(_) | PduBody::BindNak(_) => {
                self.route_control(pdu)
            }
            PduBody::Shutdown => {
                debug!("server requested shutdown");
                Err(RpcError::ConnectionClosed)
            }
            other => {
                trace!(packet_type = ?other.packet_type(), "ignoring unexpected PDU");
                Ok(())
            }
        }
    }

    fn route_response(&self, header: PduHeader, body: ResponseBody) -> Result<()> {
        let stub = unseal_stub(&self.security, &body.stub)?;
        let mut pending = self.pending.lock();
        match pending.get_mut(&header.call_id) {
            Some(Pending::Call { assembler, .. }) => {
                let outcome =
                    assembler.accept(&header, body.context_id, None, body.alloc_hint, &stub);
                match outcome {
                    Ok(Some(complete)) => {
                        if let Some(Pending::Call { tx, .. }) = pending.remove(&header.call_id) {
                            let _ = tx.send(Ok(CallReply::Response(complete)));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Framing error: fatal to this call only.
                        if let Some(Pending::Call { tx, .. }) = pending.remove(&header.call_id) {
                            let _ = tx.send(Err(e));
                        }
                    }
                }
                Ok(())
            }
            Some(Pending::Abandoned { assembler }) => {
                match assembler.accept(&header, body.context_id, None, body.alloc_hint, &stub) {
                    Ok(None) => {}
                    Ok(Some(_)) | Err(_) => {
                        trace!(call_id = header.call_id, "discarding abandoned call's reply");
                        pending.remove(&header.call_id);
                    }
                }
                Ok(())
            }
            Some(Pending::Control { .. }) => {
                Err(RpcError::MalformedPdu("response PDU for a control call"))
            }
            None => {
                debug!(call_id = header.call_id, "response for unknown call");
                Ok(())
            }
        }
    }

    fn route_error(&self, call_id: u32, err: RpcError) -> Result<()> {
        match self.pending.lock().remove(&call_id) {
            Some(Pending::Call { tx, .. }) | Some(Pending::Control { tx }) => {
                let _ = tx.send(Err(err));
            }
            Some(Pending::Abandoned { .. }) | None => {
                debug!(call_id, %err, "fault for absent call");
            }
        }
        Ok(())
    }

    fn route_control(&self, pdu: Pdu) -> Result<()> {
        let call_id = pdu.call_id();
        match self.pending.lock().remove(&call_id) {
            Some(Pending::Control { tx }) => {
                let _ = tx.send(Ok(CallReply::Control(pdu)));
                Ok(())
            }
            other => {
                if let Some(entry) = other {
                    self.pending.lock().insert(call_id, entry);
                }
                debug!(call_id, "control reply with no waiting control call");
                Ok(())
            }
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut transport: PduTransport<BoxedRead>) {
    loop {
        let raw = match transport.read_pdu().await {
            Ok(raw) => raw,
            Err(e) => {
                inner.fail_all(&e);
                return;
            }
        };
        match inner.handle_inbound(raw) {
            Ok(()) => {}
            Err(e @ RpcError::IntegrityViolation) | Err(e @ RpcError::ConnectionClosed) => {
                // Integrity failure means the transport can no longer be
                // trusted; both cases end the connection.
                inner.fail_all(&e);
                return;
            }
            Err(e) => warn!(%e, "error handling inbound PDU"),
        }
    }
}

/// A bound client connection.
pub struct Connection {
    inner: Arc<Inner>,
    primary_context: u16,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("primary_context", &self.primary_context)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect over TCP and bind to `interface`.
    pub async fn connect(
        addr: SocketAddr,
        interface: SyntaxId,
        options: BindOptions,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Self::bind(stream, interface, options).await
    }

    /// Bind to `interface` over an already-established stream.
    pub async fn bind<S>(stream: S, interface: SyntaxId, options: BindOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut rx: PduTransport<BoxedRead> =
            PduTransport::new(Box::new(read_half) as BoxedRead).with_max_pdu_size(options.max_pdu_size);
        let mut tx: PduTransport<BoxedWrite> = PduTransport::new(Box::new(write_half));

        let mut negotiator = options
            .security
            .map(|(provider, level)| Negotiator::new(provider, level));

        let call_id = 1;
        let context_id = 0;
        let context_list = vec![ContextElement::new(context_id, interface)];

        let mut bind = Pdu::bind(call_id, context_list.clone());
        if let PduBody::Bind(body) = &mut bind.body {
            body.max_xmit_frag = options.max_frag;
            body.max_recv_frag = options.max_frag;
        }
        bind.header.flags = PacketFlags::complete().with(PacketFlags::CONC_MPX);
        if let Some(neg) = negotiator.as_mut() {
            let token = neg.initiate()?;
            bind = bind.with_auth(neg.token_trailer(token));
        }
        debug!(%interface, call_id, "sending bind");
        tx.write_pdu(&bind.encode()?).await?;

        let raw = rx.read_pdu().await?;
        let Pdu { header, body, auth } = Pdu::decode(&raw)?;
        let ack = match body {
            PduBody::BindAck(ack) => ack,
            PduBody::BindNak(nak) => {
                return Err(RpcError::BindRejected(format!(
                    "bind_nak, reason {}",
                    nak.reason
                )))
            }
            PduBody::Fault(fault) => {
                return Err(RpcError::fault(
                    fault.status,
                    header.flags.contains(PacketFlags::DID_NOT_EXECUTE),
                ))
            }
            _ => return Err(RpcError::MalformedPdu("unexpected reply to bind")),
        };
        match ack.results.first() {
            Some(res) if res.result == ContextResult::Acceptance => {}
            Some(res) => {
                return Err(RpcError::BindRejected(format!(
                    "presentation context rejected, reason {}",
                    res.reason
                )))
            }
            None => return Err(RpcError::BindRejected("empty result list".into())),
        }
        debug!(
            max_xmit = ack.max_xmit_frag,
            max_recv = ack.max_recv_frag,
            assoc_group = ack.assoc_group_id,
            "bind accepted"
        );

        if let Some(neg) = negotiator.as_mut() {
            complete_handshake(neg, &mut tx, &mut rx, auth, call_id, &context_list).await?;
        }

        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(tx),
            pending: Mutex::new(HashMap::new()),
            security: Mutex::new(negotiator),
            contexts: Mutex::new(HashMap::from([(context_id, interface)])),
            next_call_id: AtomicU32::new(2),
            next_context_id: AtomicU16::new(1),
            max_xmit_frag: AtomicU16::new(ack.max_xmit_frag),
            default_timeout: options.call_timeout,
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&inner), rx));

        Ok(Self {
            inner,
            primary_context: context_id,
            reader,
        })
    }

    /// The presentation context established at bind time.
    pub fn primary_context(&self) -> u16 {
        self.primary_context
    }

    /// The interface bound to `context_id`, if negotiated.
    pub fn interface_for(&self, context_id: u16) -> Option<SyntaxId> {
        self.inner.contexts.lock().get(&context_id).copied()
    }

    /// Invoke `op` on the primary presentation context, blocking this task
    /// until the matching response (or fault) arrives.
    pub async fn invoke(&self, op: &mut dyn Operation) -> Result<()> {
        self.invoke_on(self.primary_context, op, self.inner.default_timeout)
            .await
    }

    /// Invoke with an explicit timeout; expiry behaves like cancellation.
    pub async fn invoke_with_timeout(
        &self,
        op: &mut dyn Operation,
        timeout: Duration,
    ) -> Result<()> {
        self.invoke_on(self.primary_context, op, Some(timeout)).await
    }

    /// Invoke on a specific presentation context (from `alter_context`).
    pub async fn invoke_on(
        &self,
        context_id: u16,
        op: &mut dyn Operation,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let stub = operation::marshal_request(op)?;
        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::SeqCst);
        trace!(call_id, opnum = op.opnum(), name = op.op_name(), "invoking");

        let rx = self.inner.register_call(call_id);
        if let Err(e) = self
            .send_request(call_id, context_id, op.opnum(), stub)
            .await
        {
            self.inner.pending.lock().remove(&call_id);
            return Err(e);
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.abandon(call_id);
                    return Err(RpcError::Timeout);
                }
            },
            None => rx.await,
        };
        let reply = reply.map_err(|_| RpcError::ConnectionClosed)??;

        match reply {
            CallReply::Response(stub) => {
                let mut r = NdrReader::new(stub);
                op.unmarshal_response(&mut r)?;
                r.finish()?;
                Ok(())
            }
            CallReply::Control(_) => Err(RpcError::MalformedPdu("control reply to a request")),
        }
    }

    /// Add a presentation context for `interface` without re-binding.
    /// Returns the new context ID for use with `invoke_on`.
    pub async fn alter_context(&self, interface: SyntaxId) -> Result<u16> {
        let context_id = self.inner.next_context_id.fetch_add(1, Ordering::SeqCst);
        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::SeqCst);
        debug!(%interface, context_id, "altering context");

        let rx = self.inner.register_control(call_id);
        let pdu = Pdu::alter_context(call_id, vec![ContextElement::new(context_id, interface)]);
        let send_result = async {
            let raw = protect_pdu(&self.inner.security, pdu)?;
            self.inner.writer.lock().await.write_pdu(&raw).await
        }
        .await;
        if let Err(e) = send_result {
            self.inner.pending.lock().remove(&call_id);
            return Err(e);
        }

        let reply = rx.await.map_err(|_| RpcError::ConnectionClosed)??;
        let pdu = match reply {
            CallReply::Control(pdu) => pdu,
            CallReply::Response(_) => {
                return Err(RpcError::MalformedPdu("response reply to alter-context"))
            }
        };
        match pdu.body {
            PduBody::AlterContextResponse(ack) => match ack.results.first() {
                Some(res) if res.result == ContextResult::Acceptance => {
                    self.inner.contexts.lock().insert(context_id, interface);
                    Ok(context_id)
                }
                _ => Err(RpcError::ContextUnavailable(interface.to_string())),
            },
            PduBody::BindNak(nak) => Err(RpcError::BindRejected(format!(
                "alter-context refused, reason {}",
                nak.reason
            ))),
            _ => Err(RpcError::MalformedPdu("unexpected alter-context reply")),
        }
    }

    async fn send_request(
        &self,
        call_id: u32,
        context_id: u16,
        opnum: u16,
        stub: Bytes,
    ) -> Result<()> {
        let inner = &self.inner;
        let signature_len = {
            let sec = inner.security.lock();
            sec.as_ref()
                .filter(|n| n.is_established() && n.level().requires_signing())
                .map_or(0, |neg| neg.signature_len())
        };

        let max_frag = inner.max_xmit_frag.load(Ordering::Relaxed);
        let max_stub = max_stub_len(max_frag, signature_len, false);
        if max_stub == 0 {
            return Err(RpcError::MalformedPdu("negotiated fragment size too small"));
        }

        let total = stub.len() as u32;
        let fragments = split_stub(&stub, max_stub);
        if fragments.len() > 1 {
            debug!(call_id, fragments = fragments.len(), total, "fragmenting request");
        }

        // One critical section for all of this call's fragments: concurrent
        // calls' fragments must not interleave on the wire.
        let mut writer = inner.writer.lock().await;
        for fragment in fragments {
            // Sealing is per PDU: each fragment's stub is sealed on its own.
            let piece = {
                let sec = inner.security.lock();
                match sec.as_ref().filter(|n| n.is_established()) {
                    Some(neg) => neg.seal(&fragment.data)?,
                    None => fragment.data,
                }
            };
            let mut pdu = Pdu::request(call_id, context_id, opnum, piece);
            if let PduBody::Request(body) = &mut pdu.body {
                body.alloc_hint = total;
            }
            let mut flags = PacketFlags::new();
            if fragment.first {
                flags = flags.with(PacketFlags::FIRST_FRAG);
            }
            if fragment.last {
                flags = flags.with(PacketFlags::LAST_FRAG);
            }
            pdu.header.flags = flags;

            let raw = protect_pdu(&inner.security, pdu)?;
            writer.write_pdu(&raw).await?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.inner.fail_all(&RpcError::ConnectionClosed);
    }
}

/// Run the post-bind authentication legs: challenge in, response out via
/// auth3 (final) or alter-context (if the mechanism needs more round trips).
async fn complete_handshake(
    neg: &mut Negotiator,
    tx: &mut PduTransport<BoxedWrite>,
    rx: &mut PduTransport<BoxedRead>,
    first_reply: Option<crate::auth::AuthTrailer>,
    call_id: u32,
    context_list: &[ContextElement],
) -> Result<()> {
    let mut server_token = first_reply.map(|t| t.value);
    while !neg.is_established() {
        let token = server_token.take().ok_or_else(|| {
            RpcError::HandshakeFailed("server completed bind without an auth token".into())
        })?;
        let advance = neg.advance(&token)?;
        match advance.token {
            Some(out) if advance.established => {
                // Final leg rides an auth3 PDU; it has no reply.
                let auth3 =
                    Pdu::new(call_id, PduBody::Auth3).with_auth(neg.token_trailer(out));
                tx.write_pdu(&auth3.encode()?).await?;
                neg.response_sent();
            }
            Some(out) => {
                let alter = Pdu::alter_context(call_id, context_list.to_vec())
                    .with_auth(neg.token_trailer(out));
                tx.write_pdu(&alter.encode()?).await?;

                let raw = rx.read_pdu().await?;
                let reply = Pdu::decode(&raw)?;
                match reply.body {
                    PduBody::AlterContextResponse(_) => {
                        server_token = reply.auth.map(|t| t.value);
                    }
                    PduBody::Fault(fault) => {
                        return Err(RpcError::fault(fault.status, false));
                    }
                    _ => {
                        return Err(RpcError::HandshakeFailed(
                            "unexpected reply during handshake".into(),
                        ))
                    }
                }
            }
            None if advance.established => {}
            None => {
                return Err(RpcError::HandshakeFailed(
                    "mechanism stalled without a token".into(),
                ))
            }
        }
    }
    debug!("security context established");
    Ok(())
}
