//! PDU fragmentation and reassembly.
//!
//! A marshaled stub larger than the negotiated maximum fragment size is
//! split across multiple request/response PDUs carrying the same call ID:
//! FIRST_FRAG on the first, LAST_FRAG on the last, both on a singleton.
//! Reassembly is per call ID; DCE/RPC delivers fragments of one call in
//! order on a connection, so out-of-order arrival is a protocol error, not
//! something to buffer around.

use crate::auth::AuthTrailer;
use crate::error::{Result, RpcError};
use crate::pdu::{PduHeader, RequestBody};
use bytes::{Bytes, BytesMut};

/// One slice of a fragmented stub, with its fragment flags.
#[derive(Debug, Clone)]
pub struct StubFragment {
    pub data: Bytes,
    pub first: bool,
    pub last: bool,
}

/// Largest stub payload that fits in a single fragment of `max_frag` bytes.
///
/// Room is reserved for the 16-byte PDU header, the 8-byte request/response
/// body header, the optional 16-byte object UUID, and the worst-case auth
/// overhead (3 pad bytes + 8-byte trailer header + signature).
pub fn max_stub_len(max_frag: u16, signature_len: usize, has_object: bool) -> usize {
    let mut overhead = PduHeader::SIZE + RequestBody::HEADER_SIZE;
    if has_object {
        overhead += 16;
    }
    if signature_len > 0 {
        overhead += 3 + AuthTrailer::HEADER_SIZE + signature_len;
    }
    (max_frag as usize).saturating_sub(overhead)
}

/// Split a stub into fragments of at most `max_stub` bytes each. An empty
/// stub still yields one (complete) fragment.
pub fn split_stub(stub: &Bytes, max_stub: usize) -> Vec<StubFragment> {
    if stub.len() <= max_stub {
        return vec![StubFragment {
            data: stub.clone(),
            first: true,
            last: true,
        }];
    }

    let total = stub.len();
    let mut fragments = Vec::with_capacity(total.div_ceil(max_stub));
    let mut offset = 0;
    while offset < total {
        let len = (total - offset).min(max_stub);
        fragments.push(StubFragment {
            data: stub.slice(offset..offset + len),
            first: offset == 0,
            last: offset + len == total,
        });
        offset += len;
    }
    fragments
}

/// Reassembly progress for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    /// Nothing received yet
    Empty,
    /// First fragment seen, waiting for the last
    Accumulating,
    /// Last fragment seen; the stub has been taken
    Complete,
    /// A framing error poisoned this call's reassembly
    Failed,
}

/// Accumulates the fragments of one call back into its logical stub.
#[derive(Debug)]
pub struct FragmentAssembler {
    call_id: u32,
    state: AssemblyState,
    stub: BytesMut,
    context_id: u16,
    opnum: Option<u16>,
}

impl FragmentAssembler {
    pub fn new(call_id: u32) -> Self {
        Self {
            call_id,
            state: AssemblyState::Empty,
            stub: BytesMut::new(),
            context_id: 0,
            opnum: None,
        }
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    /// Context ID captured from the first fragment
    pub fn context_id(&self) -> u16 {
        self.context_id
    }

    /// Opnum captured from the first fragment (requests only)
    pub fn opnum(&self) -> Option<u16> {
        self.opnum
    }

    /// Feed one fragment. Returns the complete stub once the last fragment
    /// arrives, `None` while accumulation continues. Any protocol violation
    /// moves the assembler to `Failed` and stays there.
    pub fn accept(
        &mut self,
        header: &PduHeader,
        context_id: u16,
        opnum: Option<u16>,
        alloc_hint: u32,
        stub: &[u8],
    ) -> Result<Option<Bytes>> {
        if header.call_id != self.call_id {
            return self.fail(RpcError::CallIdMismatch {
                expected: self.call_id,
                got: header.call_id,
            });
        }

        let first = header.flags.is_first_frag();
        let last = header.flags.is_last_frag();

        match self.state {
            AssemblyState::Empty => {
                if !first {
                    return self.fail(RpcError::FragmentOutOfOrder(self.call_id));
                }
                self.state = AssemblyState::Accumulating;
                self.context_id = context_id;
                self.opnum = opnum;
                if alloc_hint > 0 {
                    // Hint only; a lying peer just costs us a realloc.
                    self.stub.reserve((alloc_hint as usize).min(1 << 20));
                }
            }
            AssemblyState::Accumulating => {
                if first {
                    return self.fail(RpcError::FragmentOutOfOrder(self.call_id));
                }
                if context_id != self.context_id {
                    return self.fail(RpcError::FragmentOutOfOrder(self.call_id));
                }
            }
            AssemblyState::Complete | AssemblyState::Failed => {
                return self.fail(RpcError::FragmentOutOfOrder(self.call_id));
            }
        }

        self.stub.extend_from_slice(stub);

        if last {
            self.state = AssemblyState::Complete;
            Ok(Some(self.stub.split().freeze()))
        } else {
            Ok(None)
        }
    }

    fn fail(&mut self, err: RpcError) -> Result<Option<Bytes>> {
        self.state = AssemblyState::Failed;
        Err(err)
    }
}
