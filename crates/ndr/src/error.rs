//! NDR error types

use thiserror::Error;

/// Upper bound on a single decoded allocation (bytes). Counts above this are
/// treated as hostile input rather than honored.
pub const MAX_NDR_ALLOCATION: usize = 16 * 1024 * 1024;

/// NDR encoding/decoding errors.
///
/// All variants are local to the call being decoded; the connection that
/// carried the data stays usable.
#[derive(Debug, Error)]
pub enum NdrError {
    /// Not enough data left in the buffer
    #[error("unexpected end of buffer: needed {needed} bytes, have {have}")]
    UnexpectedEof { needed: usize, have: usize },

    /// A referent ID that cannot be resolved to defined pointee data
    #[error("dangling referent: id 0x{0:08x}")]
    DanglingReferent(u32),

    /// A null referent ID where a reference pointer was expected
    #[error("null reference pointer")]
    NullReferencePointer,

    /// Container counts violate `offset + actual_count <= max_count`
    #[error("malformed container: offset {offset} + actual {actual} exceeds max {max}")]
    MalformedContainer { max: u32, offset: u32, actual: u32 },

    /// A union discriminant that selects no known arm
    #[error("invalid union discriminant: {0}")]
    InvalidDiscriminant(i64),

    /// String-specific malformation (bad offset, missing terminator)
    #[error("invalid string: {0}")]
    InvalidString(&'static str),

    /// A count field requests more memory than we are willing to allocate
    #[error("allocation limit exceeded: requested {requested}, limit {limit}")]
    AllocationLimitExceeded { requested: usize, limit: usize },

    /// UTF-16 decoding error
    #[error("UTF-16 error: {0}")]
    Utf16Error(#[from] std::char::DecodeUtf16Error),

    /// UTF-8 decoding error
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),
}

/// Result type for NDR operations
pub type Result<T> = std::result::Result<T, NdrError>;
