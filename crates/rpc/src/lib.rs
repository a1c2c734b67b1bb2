//! MSRPC (DCE/RPC) client and server runtime
//!
//! This crate is the session/transport half of the MSRPC core: PDU framing,
//! fragmentation and reassembly, the authentication handshake, and the call
//! multiplexer that generated interface stubs invoke through the
//! [`Operation`] contract. The companion `msrpc-ndr` crate is the codec half.
//!
//! # Client
//!
//! ```no_run
//! use msrpc::{BindOptions, Connection, SyntaxId, Uuid};
//!
//! # struct OpenKey;
//! # impl msrpc::Operation for OpenKey {
//! #     fn opnum(&self) -> u16 { 0 }
//! #     fn op_name(&self) -> &'static str { "/demo/v1/OpenKey" }
//! #     fn marshal_request(&mut self, _: &mut msrpc::NdrWriter) -> msrpc_ndr::Result<()> { Ok(()) }
//! #     fn unmarshal_request(&mut self, _: &mut msrpc::NdrReader) -> msrpc_ndr::Result<()> { Ok(()) }
//! #     fn marshal_response(&mut self, _: &mut msrpc::NdrWriter) -> msrpc_ndr::Result<()> { Ok(()) }
//! #     fn unmarshal_response(&mut self, _: &mut msrpc::NdrReader) -> msrpc_ndr::Result<()> { Ok(()) }
//! # }
//! #[tokio::main]
//! async fn main() -> msrpc::Result<()> {
//!     let interface = SyntaxId::new(
//!         Uuid::parse("338cd001-2244-31f1-aaaa-900038001003").unwrap(),
//!         1,
//!         0,
//!     );
//!     let conn = Connection::connect(
//!         "127.0.0.1:135".parse().unwrap(),
//!         interface,
//!         BindOptions::default(),
//!     )
//!     .await?;
//!
//!     let mut op = OpenKey;
//!     conn.invoke(&mut op).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Server
//!
//! ```no_run
//! use msrpc::{RpcServer, SyntaxId, Uuid};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> msrpc::Result<()> {
//!     let interface = SyntaxId::new(
//!         Uuid::parse("338cd001-2244-31f1-aaaa-900038001003").unwrap(),
//!         1,
//!         0,
//!     );
//!     let server = RpcServer::new();
//!     server.register(
//!         interface,
//!         Arc::new(|opnum: u16, _reader: &mut msrpc::NdrReader| {
//!             Err(msrpc::RpcError::UnknownOperation(opnum))
//!         }),
//!     );
//!     server.serve_addr("127.0.0.1:4135".parse().unwrap()).await
//! }
//! ```

pub mod auth;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod operation;
pub mod pdu;
pub mod server;
pub mod transport;

pub use auth::{
    auth_padding, Advance, AuthLevel, AuthTrailer, AuthType, HandshakeState, Negotiator,
    SecurityProvider, SecurityStep,
};
pub use connection::{BindOptions, Connection};
pub use error::{FaultCode, Result, RpcError};
pub use fragment::{max_stub_len, split_stub, AssemblyState, FragmentAssembler, StubFragment};
pub use operation::{Operation, PayloadHook, ServerHandle};
pub use pdu::{
    BindAckBody, BindBody, BindNakBody, ContextElement, ContextResult, ContextResultElement,
    DataRepresentation, FaultBody, PacketFlags, PacketType, Pdu, PduBody, PduHeader, RequestBody,
    ResponseBody, SyntaxId, DEFAULT_MAX_FRAG, NDR_TRANSFER_SYNTAX, RPC_VERSION,
};
pub use server::{ProviderFactory, RpcServer, ServerConfig};
pub use transport::{PduTransport, DEFAULT_MAX_PDU_SIZE};

// The codec surface, re-exported so stubs depend on one crate.
pub use msrpc_ndr as ndr;
pub use msrpc_ndr::{
    CString, NdrContext, NdrDecode, NdrEncode, NdrError, NdrReader, NdrUnion, NdrWriter, Shared,
    Uuid, WString,
};
