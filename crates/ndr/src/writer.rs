//! The NDR writer facade.
//!
//! NDR lays out a structure in two phases: the flat ("immediate") fields
//! first, then the pointee data of every pointer field, in the order the
//! pointers were encountered. The writer owns that ordering as an explicit
//! FIFO work list: pointer writes enqueue their payload encoder, and
//! `write_deferred` flushes the queue after the flat fields are done.
//!
//! Full (`[ptr]`) pointers may alias. The writer keeps a referent table keyed
//! by the target's `Arc` address; an aliased target is transmitted once and
//! every later occurrence writes only the previously assigned referent ID.

use crate::{NdrContext, NdrEncode, NdrUnion, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// The three NDR pointer semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    /// `[ref]`: always present, never aliased
    Ref,
    /// `[unique]`: may be null, never aliased
    Unique,
    /// `[ptr]`: may be null, may alias another pointer in the same message
    Full,
}

/// First referent ID handed out; matches the range Microsoft encoders use,
/// which keeps captures easy to compare against real traffic.
const FIRST_REFERENT_ID: u32 = 0x0002_0000;

type DeferredWrite = Box<dyn FnOnce(&mut NdrWriter) -> Result<()>>;

/// NDR writer: buffer, position, deferral queue, and referent table for one
/// marshaled message. Referent IDs have no meaning outside this instance.
pub struct NdrWriter {
    buf: BytesMut,
    ctx: NdrContext,
    position: usize,
    deferred: VecDeque<DeferredWrite>,
    referents: HashMap<usize, u32>,
    next_referent: u32,
    flushing: bool,
}

macro_rules! write_primitive {
    ($($name:ident => $ty:ty, $size:expr, $put:ident;)*) => {
        $(
            pub fn $name(&mut self, value: $ty) {
                self.align($size);
                self.ctx.$put(&mut self.buf, value);
                self.position += $size;
            }
        )*
    };
}

impl NdrWriter {
    pub fn new() -> Self {
        Self::with_context(NdrContext::new())
    }

    pub fn with_context(ctx: NdrContext) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            ctx,
            position: 0,
            deferred: VecDeque::new(),
            referents: HashMap::new(),
            next_referent: FIRST_REFERENT_ID,
            flushing: false,
        }
    }

    pub fn context(&self) -> NdrContext {
        self.ctx
    }

    /// Current byte offset from the start of the stub data
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pad with zero bytes until the position is a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let padding = NdrContext::align_padding(self.position, alignment);
        self.buf.put_bytes(0, padding);
        self.position += padding;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
        self.position += 1;
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
        self.position += 1;
    }

    write_primitive! {
        write_u16 => u16, 2, put_u16;
        write_i16 => i16, 2, put_i16;
        write_u32 => u32, 4, put_u32;
        write_i32 => i32, 4, put_i32;
        write_u64 => u64, 8, put_u64;
        write_i64 => i64, 8, put_i64;
        write_f32 => f32, 4, put_f32;
        write_f64 => f64, 8, put_f64;
    }

    /// Append raw bytes with no alignment.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
        self.position += data.len();
    }

    /// Overwrite a previously written little/big-endian u16 in place.
    /// Used for length fields whose value is known only after the body is
    /// encoded (PDU `frag_length`, `auth_length`).
    pub fn patch_u16(&mut self, at: usize, value: u16) {
        let bytes = if self.ctx.little_endian {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        self.buf[at..at + 2].copy_from_slice(&bytes);
    }

    /// Encode a fixed-size value with its natural NDR alignment.
    pub fn write_data<T: NdrEncode>(&mut self, value: &T) -> Result<()> {
        value.ndr_encode(self)
    }

    /// Encode a union: discriminant tag, then exactly one arm.
    pub fn write_union<U: NdrUnion>(&mut self, value: &U) -> Result<()> {
        value.discriminant().ndr_encode(self)?;
        value.encode_arm(self)
    }

    /// Queue work onto the deferred list without writing anything inline.
    pub fn defer(&mut self, f: impl FnOnce(&mut NdrWriter) -> Result<()> + 'static) {
        self.deferred.push_back(Box::new(f));
    }

    /// Write a `[ref]` pointer: inline nonzero referent ID, payload deferred.
    /// Ref pointers cannot be null, so there is no absent form.
    pub fn write_ref_pointer(
        &mut self,
        defer: impl FnOnce(&mut NdrWriter) -> Result<()> + 'static,
    ) -> Result<()> {
        let id = self.alloc_referent();
        self.write_u32(id);
        self.defer(defer);
        Ok(())
    }

    /// Write a `[unique]` pointer: inline referent ID (0 when null), payload
    /// deferred when present. Unique pointers never alias, so every present
    /// pointer gets a fresh ID.
    pub fn write_unique_pointer(
        &mut self,
        present: Option<impl FnOnce(&mut NdrWriter) -> Result<()> + 'static>,
    ) -> Result<()> {
        match present {
            None => self.write_u32(0),
            Some(defer) => {
                let id = self.alloc_referent();
                self.write_u32(id);
                self.defer(defer);
            }
        }
        Ok(())
    }

    /// Convenience form of [`write_unique_pointer`](Self::write_unique_pointer)
    /// for targets that are cheap to clone into the deferred closure.
    pub fn write_unique_data<T: NdrEncode + Clone + 'static>(
        &mut self,
        value: Option<&T>,
    ) -> Result<()> {
        match value {
            None => {
                self.write_u32(0);
                Ok(())
            }
            Some(v) => {
                let v = v.clone();
                self.write_unique_pointer(Some(move |w: &mut NdrWriter| v.ndr_encode(w)))
            }
        }
    }

    /// Write a `[ptr]` (full) pointer. The target's identity is its `Arc`
    /// address: the first occurrence writes a fresh ID and queues the
    /// payload; every later occurrence of the same target writes the same ID
    /// and queues nothing, so aliased data is transmitted exactly once.
    pub fn write_full_pointer<T: NdrEncode + 'static>(
        &mut self,
        value: Option<&Arc<T>>,
    ) -> Result<()> {
        let target = match value {
            None => {
                self.write_u32(0);
                return Ok(());
            }
            Some(target) => target,
        };

        let identity = Arc::as_ptr(target) as usize;
        if let Some(&id) = self.referents.get(&identity) {
            self.write_u32(id);
            return Ok(());
        }

        let id = self.alloc_referent();
        self.referents.insert(identity, id);
        self.write_u32(id);

        let payload = Arc::clone(target);
        self.defer(move |w| payload.ndr_encode(w));
        Ok(())
    }

    /// Flush the deferred work list in FIFO order. Callbacks may enqueue
    /// further deferrals (nested pointers); those are drained in the same
    /// pass. Re-entrant calls from inside a callback are absorbed so the
    /// queue is only ever drained by the outermost caller, preserving order.
    pub fn write_deferred(&mut self) -> Result<()> {
        if self.flushing {
            return Ok(());
        }
        self.flushing = true;
        while let Some(f) = self.deferred.pop_front() {
            if let Err(e) = f(self) {
                self.flushing = false;
                return Err(e);
            }
        }
        self.flushing = false;
        Ok(())
    }

    /// Flush any remaining deferrals and return the marshaled bytes.
    pub fn finish(self) -> Result<Bytes> {
        Ok(self.finish_mut()?.freeze())
    }

    /// Like [`finish`](Self::finish), but keeps the buffer mutable so callers
    /// can patch in values computed over the encoded bytes (PDU signatures).
    pub fn finish_mut(mut self) -> Result<BytesMut> {
        self.write_deferred()?;
        Ok(self.buf)
    }

    fn alloc_referent(&mut self) -> u32 {
        let id = self.next_referent;
        self.next_referent = self.next_referent.wrapping_add(4);
        id
    }
}

impl Default for NdrWriter {
    fn default() -> Self {
        Self::new()
    }
}
