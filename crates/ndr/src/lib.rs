//! NDR (Network Data Representation) runtime library
//!
//! This crate implements the NDR wire format used by DCE RPC and MS-RPCE.
//! Generated interface stubs marshal through the [`NdrWriter`] / [`NdrReader`]
//! facade, which owns the three things every NDR message needs:
//!
//! - alignment-tracked primitive encoding (primitives align to their natural
//!   size; the facade tracks the byte offset from the start of the stub data)
//! - the deferred-pointer work list: flat fields first, then every pointer's
//!   payload in encounter order (`write_deferred` / `read_deferred`)
//! - the referent table that transmits aliased full-pointer targets once and
//!   resolves repeated referent IDs to one shared decoded value
//!
//! Containers (conformant/varying arrays, counted strings) and discriminated
//! unions layer on top of the facade.

mod arrays;
mod context;
mod decode;
mod encode;
mod error;
mod primitives;
mod reader;
mod strings;
mod unions;
mod writer;

pub use context::NdrContext;
pub use decode::NdrDecode;
pub use encode::NdrEncode;
pub use error::{NdrError, Result, MAX_NDR_ALLOCATION};
pub use primitives::Uuid;
pub use reader::{NdrReader, Shared};
pub use strings::{CString, WString};
pub use unions::NdrUnion;
pub use writer::{NdrWriter, PointerKind};

/// Re-export bytes for convenience
pub use bytes::{Buf, BufMut, Bytes, BytesMut};
