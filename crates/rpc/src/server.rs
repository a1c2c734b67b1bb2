//! DCE RPC server.
//!
//! Each accepted connection runs in its own task, bounded by a semaphore.
//! Within a connection the reader is single-threaded (reassembly state is
//! not shared), but every fully reassembled request is dispatched on a
//! spawned task, so handlers for different calls run concurrently while all
//! responses funnel through the connection's single write lock.

use crate::auth::{protect_pdu, unseal_stub, verify_inbound, AuthLevel, Negotiator, SecurityProvider};
use crate::error::{FaultCode, Result, RpcError};
use crate::fragment::{max_stub_len, split_stub, FragmentAssembler};
use crate::operation::{self, ServerHandle};
use crate::pdu::{
    BindAckBody, BindBody, ContextResultElement, PacketFlags, Pdu, PduBody, PduHeader,
    RequestBody, SyntaxId, DEFAULT_MAX_FRAG,
};
use crate::transport::{PduTransport, DEFAULT_MAX_PDU_SIZE};
use bytes::Bytes;
use msrpc_ndr::NdrReader;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Creates one security provider instance per accepted connection.
pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn SecurityProvider> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_pdu_size: usize,
    pub max_connections: usize,
    pub max_frag: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            max_connections: 1024,
            max_frag: DEFAULT_MAX_FRAG,
        }
    }
}

struct ServerInner {
    interfaces: RwLock<HashMap<SyntaxId, ServerHandle>>,
    config: ServerConfig,
    security: Mutex<Option<(ProviderFactory, AuthLevel)>>,
    assoc_group: AtomicU32,
}

/// A DCE RPC server: a handler registry plus an accept loop.
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                interfaces: RwLock::new(HashMap::new()),
                config,
                security: Mutex::new(None),
                assoc_group: AtomicU32::new(1),
            }),
        }
    }

    /// Accept authenticated binds, creating a provider per connection.
    pub fn with_security(self, factory: ProviderFactory, level: AuthLevel) -> Self {
        *self.inner.security.lock() = Some((factory, level));
        self
    }

    /// Register the dispatcher for one interface. The handle follows the
    /// generated `*ServerHandle` shape: unmarshal the request selected by the
    /// opnum, execute it, and return the operation ready to marshal its
    /// response.
    pub fn register(&self, interface: SyntaxId, handle: ServerHandle) {
        info!(%interface, "registering interface");
        self.inner.interfaces.write().insert(interface, handle);
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let limit = Arc::new(Semaphore::new(self.inner.config.max_connections));
        info!(
            addr = ?listener.local_addr().ok(),
            max_connections = self.inner.config.max_connections,
            "RPC server listening"
        );

        loop {
            let (stream, peer) = listener.accept().await?;
            let permit = match Arc::clone(&limit).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(%peer, "connection limit reached, rejecting");
                    continue;
                }
            };

            let _ = stream.set_nodelay(true);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let _permit = permit;
                match serve_stream_inner(inner, stream).await {
                    Ok(()) | Err(RpcError::ConnectionClosed) => {
                        debug!(%peer, "connection closed")
                    }
                    Err(e) => warn!(%peer, %e, "connection error"),
                }
            });
        }
    }

    /// Bind a TCP listener and serve on it.
    pub async fn serve_addr(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve a single already-established stream (named-pipe style layering
    /// and in-memory tests).
    pub async fn serve_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        serve_stream_inner(Arc::clone(&self.inner), stream).await
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection state. Only the connection's read task touches the
/// assemblers; the security context and write half are shared with dispatch
/// tasks.
struct ConnState {
    presentation: HashMap<u16, SyntaxId>,
    assemblers: HashMap<u32, FragmentAssembler>,
    security: Arc<Mutex<Option<Negotiator>>>,
    max_frag: u16,
}

async fn serve_stream_inner<S>(inner: Arc<ServerInner>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut rx: PduTransport<BoxedRead> =
        PduTransport::new(Box::new(read_half) as BoxedRead).with_max_pdu_size(inner.config.max_pdu_size);
    let tx: Arc<tokio::sync::Mutex<PduTransport<BoxedWrite>>> =
        Arc::new(tokio::sync::Mutex::new(PduTransport::new(Box::new(
            write_half,
        ))));

    let mut conn = ConnState {
        presentation: HashMap::new(),
        assemblers: HashMap::new(),
        security: Arc::new(Mutex::new(None)),
        max_frag: inner.config.max_frag,
    };

    loop {
        let raw = match rx.read_pdu().await {
            Ok(raw) => raw,
            Err(RpcError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };

        let header = PduHeader::decode(&raw)?;
        // Verification failure means the transport is no longer trusted;
        // the `?` tears the connection down.
        verify_inbound(&conn.security, &raw, header.auth_length)?;

        let pdu = match Pdu::decode(&raw) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!(%e, "malformed inbound PDU");
                continue;
            }
        };

        match pdu.body {
            PduBody::Bind(body) => {
                handle_bind(&inner, &mut conn, &tx, &pdu.header, body, pdu.auth, false).await?;
            }
            PduBody::AlterContext(body) => {
                handle_bind(&inner, &mut conn, &tx, &pdu.header, body, pdu.auth, true).await?;
            }
            PduBody::Auth3 => {
                if let Some(trailer) = pdu.auth {
                    let mut sec = conn.security.lock();
                    if let Some(neg) = sec.as_mut() {
                        neg.advance(&trailer.value)?;
                    }
                }
            }
            PduBody::Request(body) => {
                handle_request(&inner, &mut conn, &tx, &pdu.header, body)?;
            }
            PduBody::Shutdown | PduBody::Cancel | PduBody::Orphaned => {
                debug!(packet_type = ?pdu.header.packet_type, "peer control PDU");
            }
            other => {
                trace!(packet_type = ?other.packet_type(), "ignoring unexpected PDU");
            }
        }
    }
}

/// Negotiate presentation contexts (and an auth leg, when present) for a
/// bind or alter-context PDU, and send the matching ack.
async fn handle_bind(
    inner: &Arc<ServerInner>,
    conn: &mut ConnState,
    tx: &Arc<tokio::sync::Mutex<PduTransport<BoxedWrite>>>,
    header: &PduHeader,
    body: BindBody,
    auth: Option<crate::auth::AuthTrailer>,
    is_alter: bool,
) -> Result<()> {
    let mut results = Vec::with_capacity(body.context_list.len());
    {
        let interfaces = inner.interfaces.read();
        for element in &body.context_list {
            let known = interfaces.contains_key(&element.abstract_syntax);
            let ndr_ok = element
                .transfer_syntaxes
                .iter()
                .any(|ts| *ts == SyntaxId::ndr_transfer());
            if known && ndr_ok {
                debug!(
                    context_id = element.context_id,
                    interface = %element.abstract_syntax,
                    "accepting presentation context"
                );
                conn.presentation
                    .insert(element.context_id, element.abstract_syntax);
                results.push(ContextResultElement::accepted());
            } else {
                debug!(
                    context_id = element.context_id,
                    interface = %element.abstract_syntax,
                    known,
                    "rejecting presentation context"
                );
                // Reason: 1 = abstract syntax unsupported, 2 = transfer
                // syntax unsupported.
                results.push(ContextResultElement::rejected(if known { 2 } else { 1 }));
            }
        }
    }

    let mut reply_trailer = None;
    if let Some(trailer) = auth {
        let (factory, level) = inner.security.lock().clone().ok_or_else(|| {
            RpcError::HandshakeFailed("client requested auth on an unauthenticated server".into())
        })?;
        let mut sec = conn.security.lock();
        let neg = sec.get_or_insert_with(|| Negotiator::new(factory(), level));
        let advance = neg.advance(&trailer.value)?;
        if let Some(token) = advance.token {
            reply_trailer = Some(neg.token_trailer(token));
        }
    }

    conn.max_frag = conn.max_frag.min(body.max_xmit_frag).min(body.max_recv_frag);
    let ack = BindAckBody {
        max_xmit_frag: conn.max_frag,
        max_recv_frag: conn.max_frag,
        assoc_group_id: if body.assoc_group_id != 0 {
            body.assoc_group_id
        } else {
            inner.assoc_group.fetch_add(1, Ordering::SeqCst)
        },
        secondary_addr: String::new(),
        results,
    };

    let ack_body = if is_alter {
        PduBody::AlterContextResponse(ack)
    } else {
        PduBody::BindAck(ack)
    };
    let mut pdu = Pdu::new(header.call_id, ack_body);
    let raw = if let Some(trailer) = reply_trailer {
        pdu = pdu.with_auth(trailer);
        pdu.encode()?
    } else {
        // Signs the ack on an already-established context (alter-context
        // after the handshake); a no-op before establishment.
        protect_pdu(&conn.security, pdu)?
    };
    tx.lock().await.write_pdu(&raw).await?;
    Ok(())
}

/// Feed one request fragment; on the last fragment, hand the reassembled
/// call to a dispatch task.
fn handle_request(
    inner: &Arc<ServerInner>,
    conn: &mut ConnState,
    tx: &Arc<tokio::sync::Mutex<PduTransport<BoxedWrite>>>,
    header: &PduHeader,
    body: RequestBody,
) -> Result<()> {
    let call_id = header.call_id;
    let stub = unseal_stub(&conn.security, &body.stub)?;

    let assembler = conn
        .assemblers
        .entry(call_id)
        .or_insert_with(|| FragmentAssembler::new(call_id));
    let complete = match assembler.accept(
        header,
        body.context_id,
        Some(body.opnum),
        body.alloc_hint,
        &stub,
    ) {
        Ok(Some(complete)) => complete,
        Ok(None) => return Ok(()),
        Err(e) => {
            // Framing error: fault this call, keep the connection.
            warn!(call_id, %e, "request reassembly failed");
            conn.assemblers.remove(&call_id);
            spawn_fault(
                Arc::clone(tx),
                Arc::clone(&conn.security),
                call_id,
                body.context_id,
                FaultCode::NCA_PROTO_ERROR,
                true,
            );
            return Ok(());
        }
    };
    let assembler = match conn.assemblers.remove(&call_id) {
        Some(assembler) => assembler,
        None => return Ok(()),
    };

    let context_id = assembler.context_id();
    let opnum = assembler.opnum().unwrap_or(body.opnum);
    let syntax = conn.presentation.get(&context_id).copied();
    let handle = syntax.and_then(|s| inner.interfaces.read().get(&s).cloned());

    trace!(call_id, context_id, opnum, "dispatching request");
    let tx = Arc::clone(tx);
    let security = Arc::clone(&conn.security);
    let max_frag = conn.max_frag;
    tokio::spawn(dispatch(
        tx, security, syntax, handle, call_id, context_id, opnum, complete, max_frag,
    ));
    Ok(())
}

/// Run one call to completion: locate the handler, execute, respond or
/// fault. Runs on its own task so dispatches of different calls proceed
/// concurrently.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    tx: Arc<tokio::sync::Mutex<PduTransport<BoxedWrite>>>,
    security: Arc<Mutex<Option<Negotiator>>>,
    syntax: Option<SyntaxId>,
    handle: Option<ServerHandle>,
    call_id: u32,
    context_id: u16,
    opnum: u16,
    stub: Bytes,
    max_frag: u16,
) {
    let result = execute(syntax, handle, opnum, stub);
    let outcome = match result {
        Ok(response_stub) => {
            send_response(&tx, &security, call_id, context_id, response_stub, max_frag).await
        }
        Err(e) => {
            // Expected against buggy or probing peers; not alarming.
            debug!(call_id, opnum, %e, "call failed, sending fault");
            let (status, did_not_execute) = fault_for(&e);
            send_fault(&tx, &security, call_id, context_id, status, did_not_execute).await
        }
    };
    if let Err(e) = outcome {
        warn!(call_id, %e, "failed to transmit reply");
    }
}

fn execute(
    syntax: Option<SyntaxId>,
    handle: Option<ServerHandle>,
    opnum: u16,
    stub: Bytes,
) -> Result<Bytes> {
    let syntax = syntax.ok_or(RpcError::Fault {
        code: FaultCode::ContextMismatch,
        did_not_execute: true,
    })?;
    let handle = handle.ok_or_else(|| RpcError::UnknownInterface(syntax.to_string()))?;

    let mut reader = NdrReader::new(stub);
    let mut op = handle(opnum, &mut reader)?;
    reader.finish()?;
    operation::marshal_response(op.as_mut())
}

/// Map a dispatch failure to its wire fault status.
fn fault_for(err: &RpcError) -> (u32, bool) {
    match err {
        RpcError::UnknownOperation(_) => (FaultCode::NCA_OP_RNG_ERROR, true),
        RpcError::UnknownInterface(_) => (FaultCode::NCA_UNK_IF, true),
        RpcError::ContextUnavailable(_) => (FaultCode::NCA_CONTEXT_MISMATCH, true),
        RpcError::Ndr(_) => (FaultCode::NCA_FAULT_NDR, true),
        RpcError::Fault {
            code,
            did_not_execute,
        } => (code.status(), *did_not_execute),
        _ => (FaultCode::NCA_PROTO_ERROR, false),
    }
}

async fn send_response(
    tx: &tokio::sync::Mutex<PduTransport<BoxedWrite>>,
    security: &Mutex<Option<Negotiator>>,
    call_id: u32,
    context_id: u16,
    stub: Bytes,
    max_frag: u16,
) -> Result<()> {
    let signature_len = {
        let sec = security.lock();
        sec.as_ref()
            .filter(|n| n.is_established() && n.level().requires_signing())
            .map_or(0, |neg| neg.signature_len())
    };

    let max_stub = max_stub_len(max_frag, signature_len, false);
    if max_stub == 0 {
        return Err(RpcError::MalformedPdu("negotiated fragment size too small"));
    }
    let total = stub.len() as u32;
    let fragments = split_stub(&stub, max_stub);

    let mut writer = tx.lock().await;
    for fragment in fragments {
        // Sealing is per PDU: each fragment's stub is sealed on its own.
        let piece = {
            let sec = security.lock();
            match sec.as_ref().filter(|n| n.is_established()) {
                Some(neg) => neg.seal(&fragment.data)?,
                None => fragment.data,
            }
        };
        let mut pdu = Pdu::response(call_id, context_id, piece);
        if let PduBody::Response(body) = &mut pdu.body {
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

        let raw = protect_pdu(security, pdu)?;
        writer.write_pdu(&raw).await?;
    }
    Ok(())
}

async fn send_fault(
    tx: &tokio::sync::Mutex<PduTransport<BoxedWrite>>,
    security: &Mutex<Option<Negotiator>>,
    call_id: u32,
    context_id: u16,
    status: u32,
    did_not_execute: bool,
) -> Result<()> {
    let pdu = Pdu::fault(call_id, context_id, status, did_not_execute);
    let raw = protect_pdu(security, pdu)?;
    tx.lock().await.write_pdu(&raw).await
}

fn spawn_fault(
    tx: Arc<tokio::sync::Mutex<PduTransport<BoxedWrite>>>,
    security: Arc<Mutex<Option<Negotiator>>>,
    call_id: u32,
    context_id: u16,
    status: u32,
    did_not_execute: bool,
) {
    tokio::spawn(async move {
        if let Err(e) =
            send_fault(&tx, &security, call_id, context_id, status, did_not_execute).await
        {
            warn!(call_id, %e, "failed to transmit fault");
        }
    });
}
