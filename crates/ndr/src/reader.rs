//! The NDR reader facade.
//!
//! Mirrors the writer's two-phase layout: flat fields decode immediately,
//! pointer payloads decode later when `read_deferred` drains the work list.
//! Because a pointer's payload arrives after the pointer itself, pointer
//! reads hand back a [`Shared`] placeholder that the deferred pass fills in.
//!
//! The read-side referent table resolves aliased full pointers: the first
//! sighting of a referent ID defines it (placeholder allocated, fill queued),
//! and every repeated sighting of the same ID resolves to a clone of the same
//! placeholder, so decoded aliases preserve object identity.

use crate::error::MAX_NDR_ALLOCATION;
use crate::{NdrContext, NdrDecode, NdrError, NdrUnion, Result};
use bytes::{Buf, Bytes};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

/// A decoded pointer target, filled in when its deferred payload is read.
///
/// Clones share the underlying slot; aliased full pointers decode to clones
/// of one `Shared`, so `ptr_eq` observes the aliasing.
#[derive(Debug)]
pub struct Shared<T> {
    slot: Arc<OnceLock<T>>,
    referent: u32,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            referent: self.referent,
        }
    }
}

impl<T> Shared<T> {
    fn empty(referent: u32) -> Self {
        Self {
            slot: Arc::new(OnceLock::new()),
            referent,
        }
    }

    /// The wire referent ID this value was transmitted under.
    pub fn referent(&self) -> u32 {
        self.referent
    }

    /// The decoded value. Fails with `DanglingReferent` if the deferred fill
    /// for this referent never ran.
    pub fn value(&self) -> Result<&T> {
        self.slot
            .get()
            .ok_or(NdrError::DanglingReferent(self.referent))
    }

    /// Whether two placeholders resolve to the same underlying value.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.slot, &b.slot)
    }

    fn fill(&self, value: T) {
        // A referent is filled at most once; the table never queues a second
        // fill for the same ID.
        let _ = self.slot.set(value);
    }
}

type DeferredRead = Box<dyn FnOnce(&mut NdrReader) -> Result<()>>;

/// NDR reader: buffer, position, deferral queue, and referent table for one
/// marshaled message.
pub struct NdrReader {
    buf: Bytes,
    ctx: NdrContext,
    position: usize,
    deferred: VecDeque<DeferredRead>,
    referents: HashMap<u32, Box<dyn Any>>,
    flushing: bool,
}

macro_rules! read_primitive {
    ($($name:ident => $ty:ty, $size:expr, $get:ident;)*) => {
        $(
            pub fn $name(&mut self) -> Result<$ty> {
                self.align($size)?;
                self.need($size)?;
                let value = self.ctx.$get(&mut self.buf);
                self.position += $size;
                Ok(value)
            }
        )*
    };
}

impl NdrReader {
    pub fn new(data: Bytes) -> Self {
        Self::with_context(data, NdrContext::new())
    }

    pub fn with_context(data: Bytes, ctx: NdrContext) -> Self {
        Self {
            buf: data,
            ctx,
            position: 0,
            deferred: VecDeque::new(),
            referents: HashMap::new(),
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

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(NdrError::UnexpectedEof {
                needed: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Skip padding so the position becomes a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = NdrContext::align_padding(self.position, alignment);
        self.need(padding)?;
        self.buf.advance(padding);
        self.position += padding;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        self.position += 1;
        Ok(self.buf.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.need(1)?;
        self.position += 1;
        Ok(self.buf.get_i8())
    }

    read_primitive! {
        read_u16 => u16, 2, get_u16;
        read_i16 => i16, 2, get_i16;
        read_u32 => u32, 4, get_u32;
        read_i32 => i32, 4, get_i32;
        read_u64 => u64, 8, get_u64;
        read_i64 => i64, 8, get_i64;
        read_f32 => f32, 4, get_f32;
        read_f64 => f64, 8, get_f64;
    }

    /// Consume `n` raw bytes with no alignment.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.need(n)?;
        let mut out = vec![0u8; n];
        self.buf.copy_to_slice(&mut out);
        self.position += n;
        Ok(out)
    }

    /// Decode a fixed-size value with its natural NDR alignment.
    pub fn read_data<T: NdrDecode>(&mut self) -> Result<T> {
        T::ndr_decode(self)
    }

    /// Decode a union: discriminant tag, then the arm it selects. An
    /// unrecognized tag is an `InvalidDiscriminant` error, never a guess.
    pub fn read_union<U: NdrUnion>(&mut self) -> Result<U> {
        let tag = <U::Discriminant as NdrDecode>::ndr_decode(self)?;
        U::decode_arm(self, tag)
    }

    /// Queue work onto the deferred list.
    pub fn defer(&mut self, f: impl FnOnce(&mut NdrReader) -> Result<()> + 'static) {
        self.deferred.push_back(Box::new(f));
    }

    /// Read a `[ref]` pointer: inline referent ID (must be nonzero), payload
    /// deferred.
    pub fn read_ref_pointer<T: NdrDecode + 'static>(&mut self) -> Result<Shared<T>> {
        let id = self.read_u32()?;
        if id == 0 {
            return Err(NdrError::NullReferencePointer);
        }
        Ok(self.defer_fill(id))
    }

    /// Read a `[unique]` pointer: `None` for a zero referent ID, otherwise a
    /// placeholder filled by the deferred pass. Unique pointers never alias,
    /// so no table entry is made.
    pub fn read_unique_pointer<T: NdrDecode + 'static>(&mut self) -> Result<Option<Shared<T>>> {
        let id = self.read_u32()?;
        if id == 0 {
            return Ok(None);
        }
        Ok(Some(self.defer_fill(id)))
    }

    /// Read a `[ptr]` (full) pointer with aliasing: the first sighting of an
    /// ID defines it, repeated sightings resolve to the same shared value. A
    /// repeated ID whose defined type differs is a dangling referent.
    pub fn read_full_pointer<T: NdrDecode + 'static>(&mut self) -> Result<Option<Shared<T>>> {
        let id = self.read_u32()?;
        if id == 0 {
            return Ok(None);
        }

        if let Some(entry) = self.referents.get(&id) {
            let shared = entry
                .downcast_ref::<Shared<T>>()
                .ok_or(NdrError::DanglingReferent(id))?;
            return Ok(Some(shared.clone()));
        }

        let shared = self.defer_fill::<T>(id);
        self.referents.insert(id, Box::new(shared.clone()));
        Ok(Some(shared))
    }

    fn defer_fill<T: NdrDecode + 'static>(&mut self, id: u32) -> Shared<T> {
        let shared = Shared::<T>::empty(id);
        let fill = shared.clone();
        self.defer(move |r| {
            fill.fill(T::ndr_decode(r)?);
            Ok(())
        });
        shared
    }

    /// Drain the deferred work list in FIFO order, filling every placeholder
    /// handed out by the pointer reads. Re-entrant calls from inside a
    /// callback are absorbed (single drain, order preserved).
    pub fn read_deferred(&mut self) -> Result<()> {
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

    /// Drain any remaining deferrals; every placeholder is filled afterwards.
    pub fn finish(mut self) -> Result<()> {
        self.read_deferred()
    }

    /// Bound a count field before allocating for it: the elements must at
    /// least fit in the remaining buffer (at `min_elem_size` bytes each) and
    /// stay under the global allocation cap.
    pub(crate) fn check_allocation(&self, count: usize, min_elem_size: usize) -> Result<()> {
        let bytes = count.checked_mul(min_elem_size.max(1)).ok_or(
            NdrError::AllocationLimitExceeded {
                requested: count,
                limit: MAX_NDR_ALLOCATION,
            },
        )?;
        if bytes > MAX_NDR_ALLOCATION {
            return Err(NdrError::AllocationLimitExceeded {
                requested: bytes,
                limit: MAX_NDR_ALLOCATION,
            });
        }
        if bytes > self.buf.remaining() {
            return Err(NdrError::UnexpectedEof {
                needed: bytes,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }
}
