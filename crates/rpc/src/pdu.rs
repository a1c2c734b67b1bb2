//! Connection-oriented DCE RPC PDU definitions.
//!
//! Wire format per DCE 1.1 (C706) and MS-RPCE. Every PDU starts with the
//! 16-byte common header:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |  vers  |vers_min| ptype  | pflags |
//! +--------+--------+--------+--------+
//! |        data representation        |
//! +--------+--------+--------+--------+
//! |   frag_len      |   auth_len      |
//! +--------+--------+--------+--------+
//! |             call_id               |
//! +--------+--------+--------+--------+
//! ```
//!
//! An alter-context PDU uses the bind body layout and an
//! alter-context-response uses the bind-ack layout, so both pairs share one
//! body type here.

use crate::auth::{auth_padding, AuthTrailer};
use crate::error::{Result, RpcError};
use bytes::{Bytes, BytesMut};
use msrpc_ndr::{NdrContext, NdrReader, NdrWriter, Uuid};

/// DCE RPC protocol version
pub const RPC_VERSION: u8 = 5;
/// DCE RPC protocol minor version
pub const RPC_VERSION_MINOR: u8 = 0;

/// Default fragment size negotiated at bind time
pub const DEFAULT_MAX_FRAG: u16 = 4280;

/// NDR transfer syntax, the one presentation syntax this stack speaks
pub const NDR_TRANSFER_SYNTAX: &str = "8a885d04-1ceb-11c9-9fe8-08002b104860";
pub const NDR_TRANSFER_VERSION: u16 = 2;

/// Connection-oriented packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResponse = 15,
    Auth3 = 16,
    Shutdown = 17,
    Cancel = 18,
    Orphaned = 19,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Request,
            2 => Self::Response,
            3 => Self::Fault,
            11 => Self::Bind,
            12 => Self::BindAck,
            13 => Self::BindNak,
            14 => Self::AlterContext,
            15 => Self::AlterContextResponse,
            16 => Self::Auth3,
            17 => Self::Shutdown,
            18 => Self::Cancel,
            19 => Self::Orphaned,
            _ => return None,
        })
    }
}

/// Packet flags (second header byte)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    pub const FIRST_FRAG: u8 = 0x01;
    pub const LAST_FRAG: u8 = 0x02;
    pub const PENDING_CANCEL: u8 = 0x04;
    pub const CONC_MPX: u8 = 0x10;
    pub const DID_NOT_EXECUTE: u8 = 0x20;
    pub const MAYBE: u8 = 0x40;
    pub const OBJECT_UUID: u8 = 0x80;

    pub fn new() -> Self {
        Self(0)
    }

    /// Both fragment flags: a complete single-fragment PDU.
    pub fn complete() -> Self {
        Self(Self::FIRST_FRAG | Self::LAST_FRAG)
    }

    pub fn with(mut self, flag: u8) -> Self {
        self.0 |= flag;
        self
    }

    pub fn contains(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_first_frag(&self) -> bool {
        self.contains(Self::FIRST_FRAG)
    }

    pub fn is_last_frag(&self) -> bool {
        self.contains(Self::LAST_FRAG)
    }
}

/// Data representation format label (4 bytes in the header).
///
/// Byte 0 carries the character set in its low nibble and the integer byte
/// order in its high nibble; byte 1 is the floating point representation;
/// bytes 2-3 are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRepresentation {
    pub little_endian: bool,
    pub ebcdic: bool,
    /// 0 = IEEE, 1 = VAX, 2 = Cray, 3 = IBM
    pub float_rep: u8,
}

impl DataRepresentation {
    /// The NDR label every Microsoft peer sends: little-endian, ASCII, IEEE.
    pub fn ndr() -> Self {
        Self {
            little_endian: true,
            ebcdic: false,
            float_rep: 0,
        }
    }

    pub fn encode(&self) -> [u8; 4] {
        let byte0 = u8::from(self.ebcdic) | (u8::from(self.little_endian) << 4);
        [byte0, self.float_rep, 0, 0]
    }

    pub fn decode(raw: [u8; 4]) -> Self {
        Self {
            little_endian: (raw[0] & 0xF0) != 0,
            ebcdic: (raw[0] & 0x0F) != 0,
            float_rep: raw[1],
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::ndr()
    }
}

/// Interface or transfer syntax identity: UUID plus packed version
/// (major in the low 16 bits, minor in the high 16 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u32,
}

impl SyntaxId {
    pub fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: (major as u32) | ((minor as u32) << 16),
        }
    }

    pub fn major_version(&self) -> u16 {
        self.version as u16
    }

    pub fn minor_version(&self) -> u16 {
        (self.version >> 16) as u16
    }

    /// The NDR transfer syntax this stack negotiates.
    pub fn ndr_transfer() -> Self {
        let uuid = Uuid::parse(NDR_TRANSFER_SYNTAX);
        debug_assert!(uuid.is_some());
        Self::new(uuid.unwrap_or(Uuid::NIL), NDR_TRANSFER_VERSION, 0)
    }

    fn encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_data(&self.uuid)?;
        w.write_u32(self.version);
        Ok(())
    }

    fn decode(r: &mut NdrReader) -> Result<Self> {
        let uuid = r.read_data::<Uuid>()?;
        let version = r.read_u32()?;
        Ok(Self { uuid, version })
    }
}

impl std::fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} v{}.{}",
            self.uuid,
            self.major_version(),
            self.minor_version()
        )
    }
}

/// One presentation context proposed at bind/alter-context time.
#[derive(Debug, Clone)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    pub fn new(context_id: u16, abstract_syntax: SyntaxId) -> Self {
        Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes: vec![SyntaxId::ndr_transfer()],
        }
    }

    fn encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_u16(self.context_id);
        w.write_u8(self.transfer_syntaxes.len() as u8);
        w.write_u8(0); // reserved
        self.abstract_syntax.encode(w)?;
        for ts in &self.transfer_syntaxes {
            ts.encode(w)?;
        }
        Ok(())
    }

    fn decode(r: &mut NdrReader) -> Result<Self> {
        let context_id = r.read_u16()?;
        let n_transfer = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let abstract_syntax = SyntaxId::decode(r)?;
        let mut transfer_syntaxes = Vec::with_capacity(n_transfer as usize);
        for _ in 0..n_transfer {
            transfer_syntaxes.push(SyntaxId::decode(r)?);
        }
        Ok(Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        })
    }
}

/// Per-context negotiation outcome on bind-ack/alter-context-response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContextResult {
    Acceptance = 0,
    UserRejection = 1,
    ProviderRejection = 2,
}

impl ContextResult {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            _ => Self::ProviderRejection,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextResultElement {
    pub result: ContextResult,
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

impl ContextResultElement {
    pub fn accepted() -> Self {
        Self {
            result: ContextResult::Acceptance,
            reason: 0,
            transfer_syntax: SyntaxId::ndr_transfer(),
        }
    }

    pub fn rejected(reason: u16) -> Self {
        Self {
            result: ContextResult::ProviderRejection,
            reason,
            transfer_syntax: SyntaxId::new(Uuid::NIL, 0, 0),
        }
    }
}

/// Common PDU header (16 bytes)
#[derive(Debug, Clone)]
pub struct PduHeader {
    pub version: u8,
    pub version_minor: u8,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub data_rep: DataRepresentation,
    /// Total length of this fragment, header and auth trailer included
    pub frag_length: u16,
    /// Length of the auth trailer's auth_value
    pub auth_length: u16,
    pub call_id: u32,
}

impl PduHeader {
    pub const SIZE: usize = 16;

    pub fn new(packet_type: PacketType, call_id: u32) -> Self {
        Self {
            version: RPC_VERSION,
            version_minor: RPC_VERSION_MINOR,
            packet_type,
            flags: PacketFlags::complete(),
            data_rep: DataRepresentation::ndr(),
            frag_length: 0,
            auth_length: 0,
            call_id,
        }
    }

    fn encode(&self, w: &mut NdrWriter) {
        w.write_u8(self.version);
        w.write_u8(self.version_minor);
        w.write_u8(self.packet_type as u8);
        w.write_u8(self.flags.0);
        w.write_bytes(&self.data_rep.encode());
        w.write_u16(self.frag_length);
        w.write_u16(self.auth_length);
        w.write_u32(self.call_id);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(RpcError::MalformedPdu("header truncated"));
        }
        let version = data[0];
        if version != RPC_VERSION {
            return Err(RpcError::VersionMismatch(version));
        }
        let packet_type =
            PacketType::from_u8(data[2]).ok_or(RpcError::InvalidPacketType(data[2]))?;
        let data_rep = DataRepresentation::decode([data[4], data[5], data[6], data[7]]);

        let (frag_length, auth_length, call_id) = if data_rep.is_little_endian() {
            (
                u16::from_le_bytes([data[8], data[9]]),
                u16::from_le_bytes([data[10], data[11]]),
                u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            )
        } else {
            (
                u16::from_be_bytes([data[8], data[9]]),
                u16::from_be_bytes([data[10], data[11]]),
                u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            )
        };

        Ok(Self {
            version,
            version_minor: data[1],
            packet_type,
            flags: PacketFlags(data[3]),
            data_rep,
            frag_length,
            auth_length,
            call_id,
        })
    }
}

/// Bind body, also the alter-context body (identical layout; only the packet
/// type differs).
#[derive(Debug, Clone)]
pub struct BindBody {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub context_list: Vec<ContextElement>,
}

impl BindBody {
    pub fn new(context_list: Vec<ContextElement>) -> Self {
        Self {
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id: 0,
            context_list,
        }
    }

    fn encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_u16(self.max_xmit_frag);
        w.write_u16(self.max_recv_frag);
        w.write_u32(self.assoc_group_id);
        w.write_u8(self.context_list.len() as u8);
        w.write_u8(0); // reserved
        w.write_u16(0); // reserved
        for element in &self.context_list {
            element.encode(w)?;
        }
        Ok(())
    }

    fn decode(r: &mut NdrReader) -> Result<Self> {
        let max_xmit_frag = r.read_u16()?;
        let max_recv_frag = r.read_u16()?;
        let assoc_group_id = r.read_u32()?;
        let n_contexts = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let _reserved2 = r.read_u16()?;
        let mut context_list = Vec::with_capacity(n_contexts as usize);
        for _ in 0..n_contexts {
            context_list.push(ContextElement::decode(r)?);
        }
        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            context_list,
        })
    }
}

/// Bind-ack body, also the alter-context-response body.
#[derive(Debug, Clone)]
pub struct BindAckBody {
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    /// Server endpoint address, empty when not applicable
    pub secondary_addr: String,
    pub results: Vec<ContextResultElement>,
}

impl BindAckBody {
    fn encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_u16(self.max_xmit_frag);
        w.write_u16(self.max_recv_frag);
        w.write_u32(self.assoc_group_id);

        let addr = self.secondary_addr.as_bytes();
        w.write_u16(addr.len() as u16 + 1);
        w.write_bytes(addr);
        w.write_u8(0);
        w.align(4);

        w.write_u8(self.results.len() as u8);
        w.write_u8(0); // reserved
        w.write_u16(0); // reserved
        for element in &self.results {
            w.write_u16(element.result as u16);
            w.write_u16(element.reason);
            element.transfer_syntax.encode(w)?;
        }
        Ok(())
    }

    fn decode(r: &mut NdrReader) -> Result<Self> {
        let max_xmit_frag = r.read_u16()?;
        let max_recv_frag = r.read_u16()?;
        let assoc_group_id = r.read_u32()?;

        let addr_len = r.read_u16()? as usize;
        let mut addr = r.read_bytes(addr_len)?;
        if addr.last() == Some(&0) {
            addr.pop();
        }
        let secondary_addr = String::from_utf8_lossy(&addr).into_owned();
        r.align(4)?;

        let n_results = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let _reserved2 = r.read_u16()?;
        let mut results = Vec::with_capacity(n_results as usize);
        for _ in 0..n_results {
            let result = ContextResult::from_u16(r.read_u16()?);
            let reason = r.read_u16()?;
            let transfer_syntax = SyntaxId::decode(r)?;
            results.push(ContextResultElement {
                result,
                reason,
                transfer_syntax,
            });
        }
        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            secondary_addr,
            results,
        })
    }
}

/// Bind-nak body: the server refused the association outright.
#[derive(Debug, Clone)]
pub struct BindNakBody {
    pub reason: u16,
    pub versions: Vec<(u8, u8)>,
}

impl BindNakBody {
    fn encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_u16(self.reason);
        w.write_u8(self.versions.len() as u8);
        for (major, minor) in &self.versions {
            w.write_u8(*major);
            w.write_u8(*minor);
        }
        Ok(())
    }

    fn decode(r: &mut NdrReader) -> Result<Self> {
        let reason = r.read_u16()?;
        let n_versions = r.read_u8()?;
        let mut versions = Vec::with_capacity(n_versions as usize);
        for _ in 0..n_versions {
            versions.push((r.read_u8()?, r.read_u8()?));
        }
        Ok(Self { reason, versions })
    }
}

/// Request body
#[derive(Debug, Clone)]
pub struct RequestBody {
    /// Total stub size across every fragment of this call
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    /// Present only with the OBJECT_UUID header flag
    pub object: Option<Uuid>,
    pub stub: Bytes,
}

impl RequestBody {
    /// alloc_hint(4) + context_id(2) + opnum(2)
    pub const HEADER_SIZE: usize = 8;

    fn encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_u32(self.alloc_hint);
        w.write_u16(self.context_id);
        w.write_u16(self.opnum);
        if let Some(object) = &self.object {
            w.write_data(object)?;
        }
        w.write_bytes(&self.stub);
        Ok(())
    }

    fn decode(r: &mut NdrReader, has_object: bool, stub_len: usize) -> Result<Self> {
        let alloc_hint = r.read_u32()?;
        let context_id = r.read_u16()?;
        let opnum = r.read_u16()?;
        let object = if has_object {
            Some(r.read_data::<Uuid>()?)
        } else {
            None
        };
        let stub = Bytes::from(r.read_bytes(stub_len)?);
        Ok(Self {
            alloc_hint,
            context_id,
            opnum,
            object,
            stub,
        })
    }
}

/// Response body
#[derive(Debug, Clone)]
pub struct ResponseBody {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub: Bytes,
}

impl ResponseBody {
    /// alloc_hint(4) + context_id(2) + cancel_count(1) + reserved(1)
    pub const HEADER_SIZE: usize = 8;

    fn encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_u32(self.alloc_hint);
        w.write_u16(self.context_id);
        w.write_u8(self.cancel_count);
        w.write_u8(0); // reserved
        w.write_bytes(&self.stub);
        Ok(())
    }

    fn decode(r: &mut NdrReader, stub_len: usize) -> Result<Self> {
        let alloc_hint = r.read_u32()?;
        let context_id = r.read_u16()?;
        let cancel_count = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let stub = Bytes::from(r.read_bytes(stub_len)?);
        Ok(Self {
            alloc_hint,
            context_id,
            cancel_count,
            stub,
        })
    }
}

/// Fault body
#[derive(Debug, Clone)]
pub struct FaultBody {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub status: u32,
}

impl FaultBody {
    fn encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_u32(self.alloc_hint);
        w.write_u16(self.context_id);
        w.write_u8(self.cancel_count);
        w.write_u8(0); // reserved
        w.write_u32(self.status);
        w.write_u32(0); // reserved2
        Ok(())
    }

    fn decode(r: &mut NdrReader) -> Result<Self> {
        let alloc_hint = r.read_u32()?;
        let context_id = r.read_u16()?;
        let cancel_count = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let status = r.read_u32()?;
        let _reserved2 = r.read_u32().unwrap_or(0);
        Ok(Self {
            alloc_hint,
            context_id,
            cancel_count,
            status,
        })
    }
}

/// Decoded PDU body, one variant per packet type this stack speaks.
#[derive(Debug, Clone)]
pub enum PduBody {
    Bind(BindBody),
    BindAck(BindAckBody),
    BindNak(BindNakBody),
    AlterContext(BindBody),
    AlterContextResponse(BindAckBody),
    Auth3,
    Request(RequestBody),
    Response(ResponseBody),
    Fault(FaultBody),
    Shutdown,
    Cancel,
    Orphaned,
}

impl PduBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Bind(_) => PacketType::Bind,
            Self::BindAck(_) => PacketType::BindAck,
            Self::BindNak(_) => PacketType::BindNak,
            Self::AlterContext(_) => PacketType::AlterContext,
            Self::AlterContextResponse(_) => PacketType::AlterContextResponse,
            Self::Auth3 => PacketType::Auth3,
            Self::Request(_) => PacketType::Request,
            Self::Response(_) => PacketType::Response,
            Self::Fault(_) => PacketType::Fault,
            Self::Shutdown => PacketType::Shutdown,
            Self::Cancel => PacketType::Cancel,
            Self::Orphaned => PacketType::Orphaned,
        }
    }
}

/// A complete PDU: header, body, and optional auth trailer.
#[derive(Debug, Clone)]
pub struct Pdu {
    pub header: PduHeader,
    pub body: PduBody,
    pub auth: Option<AuthTrailer>,
}

impl Pdu {
    pub fn new(call_id: u32, body: PduBody) -> Self {
        Self {
            header: PduHeader::new(body.packet_type(), call_id),
            body,
            auth: None,
        }
    }

    pub fn with_auth(mut self, trailer: AuthTrailer) -> Self {
        self.auth = Some(trailer);
        self
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.header.flags = flags;
        self
    }

    pub fn call_id(&self) -> u32 {
        self.header.call_id
    }

    /// Encode into a mutable buffer. `frag_length` and `auth_length` are
    /// patched after the body is written; the OBJECT_UUID flag is derived
    /// from the body.
    pub fn encode_mut(&self) -> Result<BytesMut> {
        let ctx = NdrContext::with_byte_order(self.header.data_rep.is_little_endian());
        let mut w = NdrWriter::with_context(ctx);

        let mut header = self.header.clone();
        if let PduBody::Request(body) = &self.body {
            if body.object.is_some() {
                header.flags = header.flags.with(PacketFlags::OBJECT_UUID);
            }
        }
        header.encode(&mut w);

        match &self.body {
            PduBody::Bind(body) | PduBody::AlterContext(body) => body.encode(&mut w)?,
            PduBody::BindAck(body) | PduBody::AlterContextResponse(body) => body.encode(&mut w)?,
            PduBody::BindNak(body) => body.encode(&mut w)?,
            PduBody::Auth3 => w.write_bytes(&[0u8; 4]),
            PduBody::Request(body) => body.encode(&mut w)?,
            PduBody::Response(body) => body.encode(&mut w)?,
            PduBody::Fault(body) => body.encode(&mut w)?,
            PduBody::Shutdown | PduBody::Cancel | PduBody::Orphaned => {}
        }

        let auth_length = if let Some(trailer) = &self.auth {
            let body_len = w.len() - PduHeader::SIZE;
            let pad = auth_padding(body_len);
            w.write_bytes(&vec![0u8; pad]);
            trailer.encode(&mut w, pad as u8);
            trailer.value.len() as u16
        } else {
            0
        };

        let frag_length = w.len() as u16;
        w.patch_u16(8, frag_length);
        w.patch_u16(10, auth_length);
        Ok(w.finish_mut()?)
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(self.encode_mut()?.freeze())
    }

    /// Decode one complete PDU from exactly `frag_length` bytes.
    pub fn decode(data: &Bytes) -> Result<Pdu> {
        let header = PduHeader::decode(data)?;
        let frag_length = header.frag_length as usize;
        if frag_length != data.len() {
            return Err(RpcError::FragmentMismatch {
                declared: frag_length,
                received: data.len(),
            });
        }

        // Locate the auth trailer (at the very end) and the padding that
        // precedes it, so the stub extent can be computed.
        let (auth, trailer_len, pad_len) = if header.auth_length > 0 {
            let total = AuthTrailer::HEADER_SIZE + header.auth_length as usize;
            if frag_length < PduHeader::SIZE + total {
                return Err(RpcError::MalformedPdu("auth trailer extends past PDU"));
            }
            let trailer = AuthTrailer::decode(
                &data[frag_length - total..],
                header.auth_length as usize,
                header.data_rep.is_little_endian(),
            )
            .ok_or(RpcError::MalformedPdu("bad auth trailer"))?;
            let pad = trailer.pad_length as usize;
            (Some(trailer), total, pad)
        } else {
            (None, 0, 0)
        };

        let body_end = frag_length - trailer_len;
        let body_region = data.slice(PduHeader::SIZE..body_end);
        let ctx = NdrContext::with_byte_order(header.data_rep.is_little_endian());
        let mut r = NdrReader::with_context(body_region, ctx);

        let stub_len = |body_header: usize, object: usize| -> Result<usize> {
            (body_end - PduHeader::SIZE)
                .checked_sub(body_header + object + pad_len)
                .ok_or(RpcError::MalformedPdu("body shorter than its fixed header"))
        };

        let body = match header.packet_type {
            PacketType::Bind => PduBody::Bind(BindBody::decode(&mut r)?),
            PacketType::AlterContext => PduBody::AlterContext(BindBody::decode(&mut r)?),
            PacketType::BindAck => PduBody::BindAck(BindAckBody::decode(&mut r)?),
            PacketType::AlterContextResponse => {
                PduBody::AlterContextResponse(BindAckBody::decode(&mut r)?)
            }
            PacketType::BindNak => PduBody::BindNak(BindNakBody::decode(&mut r)?),
            PacketType::Auth3 => PduBody::Auth3,
            PacketType::Request => {
                let has_object = header.flags.contains(PacketFlags::OBJECT_UUID);
                let object_len = if has_object { 16 } else { 0 };
                let stub_len = stub_len(RequestBody::HEADER_SIZE, object_len)?;
                PduBody::Request(RequestBody::decode(&mut r, has_object, stub_len)?)
            }
            PacketType::Response => {
                let stub_len = stub_len(ResponseBody::HEADER_SIZE, 0)?;
                PduBody::Response(ResponseBody::decode(&mut r, stub_len)?)
            }
            PacketType::Fault => PduBody::Fault(FaultBody::decode(&mut r)?),
            PacketType::Shutdown => PduBody::Shutdown,
            PacketType::Cancel => PduBody::Cancel,
            PacketType::Orphaned => PduBody::Orphaned,
        };

        Ok(Pdu { header, body, auth })
    }

    // Convenience constructors for the common PDUs.

    pub fn request(call_id: u32, context_id: u16, opnum: u16, stub: Bytes) -> Self {
        Self::new(
            call_id,
            PduBody::Request(RequestBody {
                alloc_hint: stub.len() as u32,
                context_id,
                opnum,
                object: None,
                stub,
            }),
        )
    }

    pub fn response(call_id: u32, context_id: u16, stub: Bytes) -> Self {
        Self::new(
            call_id,
            PduBody::Response(ResponseBody {
                alloc_hint: stub.len() as u32,
                context_id,
                cancel_count: 0,
                stub,
            }),
        )
    }

    pub fn fault(call_id: u32, context_id: u16, status: u32, did_not_execute: bool) -> Self {
        let mut pdu = Self::new(
            call_id,
            PduBody::Fault(FaultBody {
                alloc_hint: 0,
                context_id,
                cancel_count: 0,
                status,
            }),
        );
        if did_not_execute {
            pdu.header.flags = pdu.header.flags.with(PacketFlags::DID_NOT_EXECUTE);
        }
        pdu
    }

    pub fn bind(call_id: u32, context_list: Vec<ContextElement>) -> Self {
        Self::new(call_id, PduBody::Bind(BindBody::new(context_list)))
    }

    pub fn alter_context(call_id: u32, context_list: Vec<ContextElement>) -> Self {
        let mut body = BindBody::new(context_list);
        body.assoc_group_id = 0;
        Self::new(call_id, PduBody::AlterContext(body))
    }
}
