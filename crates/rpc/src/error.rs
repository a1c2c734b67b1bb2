//! Error types for the RPC session/transport layer.
//!
//! The taxonomy matters operationally: NDR decode errors and remote faults
//! are local to one call and expected against a correct peer; framing errors
//! are fatal to the affected call; security and transport errors are fatal to
//! the whole connection.

use msrpc_ndr::NdrError;
use thiserror::Error;

/// A remote-reported fault status, decoded from a fault PDU.
///
/// Known MS-RPCE / C706 statuses get a typed variant; anything else is
/// preserved verbatim in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// `nca_s_op_rng_error`: the opnum selects no operation
    OperationRangeError,
    /// `nca_s_unk_if`: the interface is not registered
    UnknownInterface,
    /// `nca_s_fault_context_mismatch`: the presentation context is not bound
    ContextMismatch,
    /// `nca_s_fault_remote_no_memory`
    RemoteNoMemory,
    /// `nca_s_proto_error`: the peer considers our PDU malformed
    ProtocolError,
    /// `nca_s_fault_ndr`: the peer failed to unmarshal the stub data
    MarshalingError,
    /// `ERROR_ACCESS_DENIED`
    AccessDenied,
    /// `nca_s_fault_cancel`: the call was cancelled remotely
    Cancelled,
    /// Any status without a dedicated variant
    Other(u32),
}

impl FaultCode {
    pub const NCA_OP_RNG_ERROR: u32 = 0x1c01_0002;
    pub const NCA_UNK_IF: u32 = 0x1c01_0003;
    pub const NCA_PROTO_ERROR: u32 = 0x1c01_000b;
    pub const NCA_CONTEXT_MISMATCH: u32 = 0x1c00_001a;
    pub const NCA_REMOTE_NO_MEMORY: u32 = 0x1c00_001b;
    pub const NCA_FAULT_NDR: u32 = 0x0000_06f7;
    pub const NCA_FAULT_CANCEL: u32 = 0x1c00_000d;
    pub const ACCESS_DENIED: u32 = 0x0000_0005;

    pub fn from_status(status: u32) -> Self {
        match status {
            Self::NCA_OP_RNG_ERROR => Self::OperationRangeError,
            Self::NCA_UNK_IF => Self::UnknownInterface,
            Self::NCA_CONTEXT_MISMATCH => Self::ContextMismatch,
            Self::NCA_REMOTE_NO_MEMORY => Self::RemoteNoMemory,
            Self::NCA_PROTO_ERROR => Self::ProtocolError,
            Self::NCA_FAULT_NDR => Self::MarshalingError,
            Self::NCA_FAULT_CANCEL => Self::Cancelled,
            Self::ACCESS_DENIED => Self::AccessDenied,
            other => Self::Other(other),
        }
    }

    /// The wire status for this code.
    pub fn status(&self) -> u32 {
        match self {
            Self::OperationRangeError => Self::NCA_OP_RNG_ERROR,
            Self::UnknownInterface => Self::NCA_UNK_IF,
            Self::ContextMismatch => Self::NCA_CONTEXT_MISMATCH,
            Self::RemoteNoMemory => Self::NCA_REMOTE_NO_MEMORY,
            Self::ProtocolError => Self::NCA_PROTO_ERROR,
            Self::MarshalingError => Self::NCA_FAULT_NDR,
            Self::Cancelled => Self::NCA_FAULT_CANCEL,
            Self::AccessDenied => Self::ACCESS_DENIED,
            Self::Other(status) => *status,
        }
    }
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OperationRangeError => write!(f, "operation out of range"),
            Self::UnknownInterface => write!(f, "unknown interface"),
            Self::ContextMismatch => write!(f, "presentation context mismatch"),
            Self::RemoteNoMemory => write!(f, "remote out of memory"),
            Self::ProtocolError => write!(f, "protocol error"),
            Self::MarshalingError => write!(f, "remote unmarshaling failure"),
            Self::Cancelled => write!(f, "call cancelled"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::Other(status) => write!(f, "status 0x{status:08x}"),
        }
    }
}

/// RPC error types
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("RPC version mismatch: {0}")]
    VersionMismatch(u8),

    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("malformed PDU: {0}")]
    MalformedPdu(&'static str),

    #[error("PDU too large: {size} bytes exceeds maximum {max}")]
    PduTooLarge { size: usize, max: usize },

    #[error("fragment length mismatch: header declares {declared} bytes, received {received}")]
    FragmentMismatch { declared: usize, received: usize },

    #[error("fragment out of order for call {0}")]
    FragmentOutOfOrder(u32),

    #[error("call ID mismatch: expected {expected}, got {got}")]
    CallIdMismatch { expected: u32, got: u32 },

    #[error("bind rejected: {0}")]
    BindRejected(String),

    #[error("no presentation context for interface {0}")]
    ContextUnavailable(String),

    #[error("unknown interface: {0}")]
    UnknownInterface(String),

    #[error("unknown operation: opnum {0}")]
    UnknownOperation(u16),

    #[error("authentication handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("message integrity violation")]
    IntegrityViolation,

    /// A peer-reported failure carried in a fault PDU; not a transport
    /// failure. `did_not_execute` is the peer's claim that the operation was
    /// never dispatched.
    #[error("remote fault: {code}")]
    Fault { code: FaultCode, did_not_execute: bool },

    #[error(transparent)]
    Ndr(#[from] NdrError),
}

impl RpcError {
    pub fn fault(status: u32, did_not_execute: bool) -> Self {
        Self::Fault {
            code: FaultCode::from_status(status),
            did_not_execute,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
