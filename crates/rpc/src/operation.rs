//! The operation contract: the seam between this core and the generated
//! per-interface stub layer.
//!
//! Every generated operation exposes its opnum, a diagnostic name, and four
//! marshal methods. The connection invokes these generically; it never
//! inspects operation-specific fields. Servers plug in a [`ServerHandle`]
//! per interface, the shape every generated `*ServerHandle` dispatcher has:
//! given an opnum and a reader positioned at the request stub, unmarshal,
//! execute, and hand back the operation ready to marshal its response.

use crate::error::Result;
use msrpc_ndr::{NdrReader, NdrWriter};
use std::sync::Arc;

/// An optional pre-marshal hook. Operations that need to fix up derived
/// fields (lengths computed from slices, for instance) before their payload
/// is written implement this and surface it from
/// [`Operation::request_hook`] / [`Operation::response_hook`].
pub trait PayloadHook {
    fn prepare(&mut self) -> msrpc_ndr::Result<()>;
}

/// One RPC operation: an opnum plus its four marshal/unmarshal methods.
///
/// A call flows through exactly two of them per side: the client marshals
/// the request and unmarshals the response into the same value; the server
/// does the reverse.
pub trait Operation: Send {
    /// The operation number carried in the request PDU
    fn opnum(&self) -> u16;

    /// Diagnostic name, e.g. `/winreg/v1/OpenHKLM`
    fn op_name(&self) -> &'static str;

    fn marshal_request(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()>;

    fn unmarshal_request(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()>;

    fn marshal_response(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()>;

    fn unmarshal_response(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()>;

    /// Hook run before `marshal_request`, if this operation wants one.
    fn request_hook(&mut self) -> Option<&mut dyn PayloadHook> {
        None
    }

    /// Hook run before `marshal_response`, if this operation wants one.
    fn response_hook(&mut self) -> Option<&mut dyn PayloadHook> {
        None
    }
}

/// Server-side dispatcher for one interface: unmarshal the request selected
/// by `opnum` from `reader`, execute it, and return the operation with its
/// response fields populated. Unknown opnums fail with
/// [`RpcError::UnknownOperation`](crate::RpcError::UnknownOperation), which
/// the connection maps to an `nca_s_op_rng_error` fault.
pub type ServerHandle =
    Arc<dyn Fn(u16, &mut NdrReader) -> Result<Box<dyn Operation>> + Send + Sync>;

/// Marshal an operation's request stub, running its hook first.
pub fn marshal_request(op: &mut dyn Operation) -> Result<bytes::Bytes> {
    if let Some(hook) = op.request_hook() {
        hook.prepare()?;
    }
    let mut w = NdrWriter::new();
    op.marshal_request(&mut w)?;
    Ok(w.finish()?)
}

/// Marshal an operation's response stub, running its hook first.
pub fn marshal_response(op: &mut dyn Operation) -> Result<bytes::Bytes> {
    if let Some(hook) = op.response_hook() {
        hook.prepare()?;
    }
    let mut w = NdrWriter::new();
    op.marshal_response(&mut w)?;
    Ok(w.finish()?)
}
