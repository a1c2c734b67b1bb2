//! NDR discriminated unions.
//!
//! A union transmits its discriminant tag followed by exactly one arm's
//! payload. The tag's size and alignment come from the union's declared
//! switch type, which is why the discriminant is an associated type rather
//! than a fixed integer.

use crate::{NdrDecode, NdrEncode, NdrReader, Result};

/// A discriminated union.
///
/// Encode with [`NdrWriter::write_union`](crate::NdrWriter::write_union) and
/// decode with [`NdrReader::read_union`](crate::NdrReader::read_union).
/// `decode_arm` must fail with
/// [`NdrError::InvalidDiscriminant`](crate::NdrError::InvalidDiscriminant)
/// for a tag that selects no arm.
pub trait NdrUnion: Sized {
    /// The switch type: its encoding determines the tag's size and alignment.
    type Discriminant: NdrEncode + NdrDecode + Copy;

    /// The tag selecting this value's arm.
    fn discriminant(&self) -> Self::Discriminant;

    /// Encode the selected arm's payload (tag already written).
    fn encode_arm(&self, w: &mut crate::NdrWriter) -> Result<()>;

    /// Decode the arm selected by `tag` (tag already read).
    fn decode_arm(r: &mut NdrReader, tag: Self::Discriminant) -> Result<Self>;
}
