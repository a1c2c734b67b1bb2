//! PDU framing over a byte stream.
//!
//! Connection-oriented DCE RPC PDUs are self-delimiting: the header's
//! `frag_length` covers the whole fragment, so the reader pulls exactly one
//! PDU at a time. A stream that ends before `frag_length` bytes arrive is a
//! fragment-length mismatch, fatal to the read side.

use crate::error::{Result, RpcError};
use crate::pdu::PduHeader;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest PDU accepted from the wire (64 KB, the conventional DCE limit)
pub const DEFAULT_MAX_PDU_SIZE: usize = 65536;

/// Reads and writes whole PDUs over any async byte stream.
pub struct PduTransport<T> {
    inner: T,
    max_pdu_size: usize,
}

impl<T> PduTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }

    pub fn with_max_pdu_size(mut self, max_pdu_size: usize) -> Self {
        self.max_pdu_size = max_pdu_size;
        self
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> PduTransport<T> {
    /// Read exactly one PDU, validating its declared length.
    pub async fn read_pdu(&mut self) -> Result<Bytes> {
        let mut header = [0u8; PduHeader::SIZE];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(RpcError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }

        let parsed = PduHeader::decode(&header)?;
        let frag_length = parsed.frag_length as usize;
        if frag_length < PduHeader::SIZE {
            return Err(RpcError::MalformedPdu("frag_length shorter than header"));
        }
        if frag_length > self.max_pdu_size {
            return Err(RpcError::PduTooLarge {
                size: frag_length,
                max: self.max_pdu_size,
            });
        }

        let mut body = vec![0u8; frag_length - PduHeader::SIZE];
        let mut filled = 0;
        while filled < body.len() {
            let n = self.inner.read(&mut body[filled..]).await?;
            if n == 0 {
                // The peer declared more bytes than it delivered.
                return Err(RpcError::FragmentMismatch {
                    declared: frag_length,
                    received: PduHeader::SIZE + filled,
                });
            }
            filled += n;
        }

        let mut pdu = BytesMut::with_capacity(frag_length);
        pdu.extend_from_slice(&header);
        pdu.extend_from_slice(&body);
        Ok(pdu.freeze())
    }
}

impl<T: AsyncWrite + Unpin> PduTransport<T> {
    /// Write one already-encoded PDU and flush it.
    pub async fn write_pdu(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
