//! NDR decoding trait

use crate::{NdrReader, Result};

/// Trait for types that can be decoded from NDR format.
///
/// Implementations read themselves through the [`NdrReader`] facade, which
/// owns position tracking, alignment, and the deferred-pointer work list.
pub trait NdrDecode: Sized {
    /// Decode a value at the reader's current position.
    fn ndr_decode(r: &mut NdrReader) -> Result<Self>;

    /// NDR alignment requirement for this type
    fn ndr_align() -> usize {
        1
    }
}
