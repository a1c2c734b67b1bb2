//! NDR string types.
//!
//! Strings are conformant varying arrays of characters with a mandatory NUL
//! terminator that is counted in `actual_count`:
//!
//! ```text
//! max_count: u32    # capacity in characters, including the terminator
//! offset: u32       # always 0
//! actual_count: u32 # transmitted characters, including the terminator
//! chars[actual_count]
//! ```
//!
//! An empty string still transmits all three counts with
//! `actual_count == 1` (the terminator alone).

use crate::{NdrDecode, NdrEncode, NdrError, NdrReader, NdrWriter, Result};

/// Unicode string (`[string] wchar_t*`), UTF-16LE on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct WString(pub String);

impl WString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for WString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for WString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl NdrEncode for WString {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        let utf16: Vec<u16> = self.0.encode_utf16().collect();
        let count_with_nul = (utf16.len() + 1) as u32;

        w.write_u32(count_with_nul);
        w.write_u32(0);
        w.write_u32(count_with_nul);
        for unit in &utf16 {
            w.write_u16(*unit);
        }
        w.write_u16(0);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for WString {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let (_, actual) = read_string_counts(r)?;
        r.check_allocation(actual, 2)?;

        let mut utf16 = Vec::with_capacity(actual);
        for _ in 0..actual {
            utf16.push(r.read_u16()?);
        }
        if utf16.pop() != Some(0) {
            return Err(NdrError::InvalidString("missing NUL terminator"));
        }

        let decoded: std::result::Result<String, _> = char::decode_utf16(utf16).collect();
        Ok(Self(decoded?))
    }

    fn ndr_align() -> usize {
        4
    }
}

/// ANSI string (`[string] char*`), one byte per character on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct CString(pub String);

impl CString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for CString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl NdrEncode for CString {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        let bytes = self.0.as_bytes();
        let count_with_nul = (bytes.len() + 1) as u32;

        w.write_u32(count_with_nul);
        w.write_u32(0);
        w.write_u32(count_with_nul);
        w.write_bytes(bytes);
        w.write_u8(0);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for CString {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let (_, actual) = read_string_counts(r)?;
        r.check_allocation(actual, 1)?;

        let mut bytes = r.read_bytes(actual)?;
        if bytes.pop() != Some(0) {
            return Err(NdrError::InvalidString("missing NUL terminator"));
        }
        Ok(Self(String::from_utf8(bytes)?))
    }

    fn ndr_align() -> usize {
        4
    }
}

/// Read and validate the `(max, offset, actual)` triple shared by both
/// string flavors. Returns `(max, actual)` in character units.
fn read_string_counts(r: &mut NdrReader) -> Result<(usize, usize)> {
    let max = r.read_u32()?;
    let offset = r.read_u32()?;
    let actual = r.read_u32()?;

    if offset != 0 {
        return Err(NdrError::InvalidString("non-zero offset"));
    }
    if actual > max {
        return Err(NdrError::MalformedContainer {
            max,
            offset,
            actual,
        });
    }
    if actual == 0 {
        return Err(NdrError::InvalidString("zero-length counted string"));
    }
    Ok((max as usize, actual as usize))
}
