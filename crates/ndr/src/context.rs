//! Byte-order context shared by the writer and reader.
//!
//! NDR transmits an explicit data-representation label with every message;
//! the context captures the integer byte order selected by that label and
//! provides endian-dispatching primitive accessors plus the alignment
//! arithmetic every encoder uses.

use bytes::{Buf, BufMut};

/// NDR encoding/decoding context.
#[derive(Debug, Clone, Copy)]
pub struct NdrContext {
    /// Whether multi-byte integers use little-endian byte order
    pub little_endian: bool,
}

macro_rules! endian_accessors {
    ($($put:ident / $get:ident => $ty:ty, $put_le:ident, $put_be:ident, $get_le:ident, $get_be:ident;)*) => {
        $(
            #[inline]
            pub fn $put<B: BufMut>(&self, buf: &mut B, value: $ty) {
                if self.little_endian { buf.$put_le(value) } else { buf.$put_be(value) }
            }

            #[inline]
            pub fn $get<B: Buf>(&self, buf: &mut B) -> $ty {
                if self.little_endian { buf.$get_le() } else { buf.$get_be() }
            }
        )*
    };
}

impl NdrContext {
    /// Default NDR context: little-endian (the representation every Microsoft
    /// peer sends).
    pub fn new() -> Self {
        Self { little_endian: true }
    }

    /// Context with explicit byte order, as selected by a PDU's data
    /// representation label.
    pub fn with_byte_order(little_endian: bool) -> Self {
        Self { little_endian }
    }

    /// Padding needed so that `position` becomes a multiple of `alignment`.
    #[inline]
    pub fn align_padding(position: usize, alignment: usize) -> usize {
        if alignment <= 1 {
            return 0;
        }
        match position % alignment {
            0 => 0,
            rem => alignment - rem,
        }
    }

    endian_accessors! {
        put_u16 / get_u16 => u16, put_u16_le, put_u16, get_u16_le, get_u16;
        put_i16 / get_i16 => i16, put_i16_le, put_i16, get_i16_le, get_i16;
        put_u32 / get_u32 => u32, put_u32_le, put_u32, get_u32_le, get_u32;
        put_i32 / get_i32 => i32, put_i32_le, put_i32, get_i32_le, get_i32;
        put_u64 / get_u64 => u64, put_u64_le, put_u64, get_u64_le, get_u64;
        put_i64 / get_i64 => i64, put_i64_le, put_i64, get_i64_le, get_i64;
        put_f32 / get_f32 => f32, put_f32_le, put_f32, get_f32_le, get_f32;
        put_f64 / get_f64 => f64, put_f64_le, put_f64, get_f64_le, get_f64;
    }
}

impl Default for NdrContext {
    fn default() -> Self {
        Self::new()
    }
}
