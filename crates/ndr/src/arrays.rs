//! Conformant and varying array encodings.
//!
//! Three wire shapes, all of whose count fields are mandatory even for empty
//! containers:
//!
//! - conformant: `max_count` then elements
//! - varying: `offset`, `actual_count` then elements
//! - conformant varying: `max_count`, `offset`, `actual_count` then elements,
//!   with the invariant `offset + actual_count <= max_count`

use crate::{NdrDecode, NdrEncode, NdrError, NdrReader, NdrWriter, Result};

impl NdrWriter {
    /// Conformant array: `max_count` prefix, then every element.
    pub fn write_conformant_array<T: NdrEncode>(&mut self, elements: &[T]) -> Result<()> {
        self.write_u32(elements.len() as u32);
        for element in elements {
            element.ndr_encode(self)?;
        }
        Ok(())
    }

    /// Varying array: `offset` and `actual_count`, then the elements.
    pub fn write_varying_array<T: NdrEncode>(&mut self, elements: &[T]) -> Result<()> {
        self.write_u32(0);
        self.write_u32(elements.len() as u32);
        for element in elements {
            element.ndr_encode(self)?;
        }
        Ok(())
    }

    /// Conformant varying array with `max_count == actual_count` and a zero
    /// offset, the shape every full transfer uses.
    pub fn write_conformant_varying_array<T: NdrEncode>(&mut self, elements: &[T]) -> Result<()> {
        self.write_u32(elements.len() as u32);
        self.write_varying_array(elements)
    }

    /// Conformant varying array with an explicit capacity ceiling. `max`
    /// below the element count is a caller bug surfaced as a malformed
    /// container rather than silently clamped.
    pub fn write_conformant_varying_slice<T: NdrEncode>(
        &mut self,
        max: u32,
        elements: &[T],
    ) -> Result<()> {
        if (elements.len() as u32) > max {
            return Err(NdrError::MalformedContainer {
                max,
                offset: 0,
                actual: elements.len() as u32,
            });
        }
        self.write_u32(max);
        self.write_varying_array(elements)
    }
}

impl NdrReader {
    /// Conformant array: `max_count` elements follow.
    pub fn read_conformant_array<T: NdrDecode>(&mut self) -> Result<Vec<T>> {
        let max = self.read_u32()? as usize;
        self.check_allocation(max, 1)?;
        self.read_elements(max)
    }

    /// Varying array: `offset` then `actual_count` elements.
    pub fn read_varying_array<T: NdrDecode>(&mut self) -> Result<Vec<T>> {
        let offset = self.read_u32()?;
        let actual = self.read_u32()? as usize;
        if offset != 0 {
            // Partial transfers are legal on the wire but nothing in this
            // stack produces them; reject rather than misinterpret.
            return Err(NdrError::MalformedContainer {
                max: actual as u32,
                offset,
                actual: actual as u32,
            });
        }
        self.check_allocation(actual, 1)?;
        self.read_elements(actual)
    }

    /// Conformant varying array; enforces `offset + actual <= max`.
    pub fn read_conformant_varying_array<T: NdrDecode>(&mut self) -> Result<Vec<T>> {
        let max = self.read_u32()?;
        let offset = self.read_u32()?;
        let actual = self.read_u32()?;

        if offset.checked_add(actual).map_or(true, |end| end > max) {
            return Err(NdrError::MalformedContainer {
                max,
                offset,
                actual,
            });
        }
        if offset != 0 {
            return Err(NdrError::MalformedContainer {
                max,
                offset,
                actual,
            });
        }
        self.check_allocation(actual as usize, 1)?;
        self.read_elements(actual as usize)
    }

    fn read_elements<T: NdrDecode>(&mut self, count: usize) -> Result<Vec<T>> {
        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            elements.push(T::ndr_decode(self)?);
        }
        Ok(elements)
    }
}
