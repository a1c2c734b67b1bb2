//! Authentication support: the auth trailer wire format, the pluggable
//! security-mechanism trait, and the handshake negotiator.
//!
//! The negotiator drives the multi-leg handshake carried inside
//! bind / bind_ack / alter_context / auth3 PDUs and, once established,
//! produces and verifies the per-PDU trailer. Mechanism cryptography (what
//! the tokens and signatures contain) lives behind [`SecurityProvider`];
//! this module only owns the state machine and the wire framing around it.

use crate::error::{Result, RpcError};
use crate::pdu::Pdu;
use bytes::Bytes;
use msrpc_ndr::NdrWriter;

/// Authentication services (MS-RPCE 2.2.1.1.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    None = 0,
    /// GSS Negotiate (SPNEGO)
    GssNegotiate = 9,
    /// NTLM
    Ntlm = 10,
    /// Kerberos
    GssKerberos = 16,
    /// Netlogon secure channel
    Netlogon = 68,
}

impl AuthType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            9 => Some(Self::GssNegotiate),
            10 => Some(Self::Ntlm),
            16 => Some(Self::GssKerberos),
            68 => Some(Self::Netlogon),
            _ => None,
        }
    }
}

/// Authentication levels (MS-RPCE 2.2.1.1.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AuthLevel {
    None = 1,
    Connect = 2,
    Call = 3,
    Pkt = 4,
    /// Sign each PDU
    PktIntegrity = 5,
    /// Sign and seal each PDU
    PktPrivacy = 6,
}

impl AuthLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Connect),
            3 => Some(Self::Call),
            4 => Some(Self::Pkt),
            5 => Some(Self::PktIntegrity),
            6 => Some(Self::PktPrivacy),
            _ => None,
        }
    }

    pub fn requires_signing(&self) -> bool {
        matches!(self, Self::PktIntegrity | Self::PktPrivacy)
    }

    pub fn requires_sealing(&self) -> bool {
        matches!(self, Self::PktPrivacy)
    }
}

/// Padding inserted between the stub and the auth trailer so the trailer
/// starts 4-aligned.
pub fn auth_padding(body_len: usize) -> usize {
    match body_len % 4 {
        0 => 0,
        rem => 4 - rem,
    }
}

/// Authentication trailer appended to authenticated PDUs (MS-RPCE 2.2.2.11).
///
/// ```text
/// auth_type (1) | auth_level (1) | auth_pad_len (1) | reserved (1)
/// auth_context_id (4)
/// auth_value (auth_length bytes)
/// ```
#[derive(Debug, Clone)]
pub struct AuthTrailer {
    pub auth_type: AuthType,
    pub level: AuthLevel,
    pub pad_length: u8,
    pub context_id: u32,
    pub value: Bytes,
}

impl AuthTrailer {
    /// Fixed header portion, excluding auth_value
    pub const HEADER_SIZE: usize = 8;

    pub fn new(auth_type: AuthType, level: AuthLevel, context_id: u32, value: Bytes) -> Self {
        Self {
            auth_type,
            level,
            pad_length: 0,
            context_id,
            value,
        }
    }

    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.value.len()
    }

    pub fn encode(&self, w: &mut NdrWriter, pad_length: u8) {
        w.write_u8(self.auth_type as u8);
        w.write_u8(self.level as u8);
        w.write_u8(pad_length);
        w.write_u8(0); // reserved
        w.write_u32(self.context_id);
        w.write_bytes(&self.value);
    }

    /// Decode from the tail of a PDU; `data` starts at the trailer header.
    pub fn decode(data: &[u8], auth_length: usize, little_endian: bool) -> Option<Self> {
        if data.len() < Self::HEADER_SIZE + auth_length {
            return None;
        }
        let auth_type = AuthType::from_u8(data[0])?;
        let level = AuthLevel::from_u8(data[1])?;
        let pad_length = data[2];
        let context_id = if little_endian {
            u32::from_le_bytes([data[4], data[5], data[6], data[7]])
        } else {
            u32::from_be_bytes([data[4], data[5], data[6], data[7]])
        };
        let value =
            Bytes::copy_from_slice(&data[Self::HEADER_SIZE..Self::HEADER_SIZE + auth_length]);
        Some(Self {
            auth_type,
            level,
            pad_length,
            context_id,
            value,
        })
    }
}

/// One leg's worth of handshake output from a provider.
#[derive(Debug)]
pub struct SecurityStep {
    /// Token to carry to the peer, if this leg produces one
    pub token: Option<Bytes>,
    /// Whether the provider's context is now established
    pub complete: bool,
}

/// A pluggable authentication mechanism.
///
/// Implementations own token generation and per-PDU cryptography; the
/// negotiator owns when each method is called. `step` receives the peer's
/// latest token (`None` on the initiating leg) and returns the next token to
/// send plus whether the context is complete.
pub trait SecurityProvider: Send {
    fn auth_type(&self) -> AuthType;

    /// Advance the handshake by one leg.
    fn step(&mut self, peer_token: Option<&[u8]>) -> Result<SecurityStep>;

    /// Length of the signature produced by `sign`, fixed per mechanism.
    fn signature_len(&self) -> usize;

    /// Sign `data` (the PDU bytes up to the auth_value).
    fn sign(&self, data: &[u8]) -> Result<Bytes>;

    /// Verify `signature` over `data`; any failure is an integrity violation.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()>;

    /// Encrypt one PDU's stub bytes for packet privacy. Called once per
    /// fragment; must preserve length so fragment sizing stays exact.
    fn seal(&self, stub: &[u8]) -> Result<Bytes>;

    /// Decrypt one PDU's stub bytes for packet privacy.
    fn unseal(&self, stub: &[u8]) -> Result<Bytes>;
}

/// Handshake progress, one state per completed leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No authentication configured or nothing exchanged yet
    NoAuth,
    /// Negotiate token sent (client: in the bind; server: seen it)
    NegotiateSent,
    /// Challenge token exchanged (bind_ack leg)
    ChallengeReceived,
    /// Response token exchanged (auth3 / alter_context leg)
    ResponseSent,
    /// Context complete; per-PDU protection active
    Established,
}

/// What the caller should do with the negotiator's latest output.
#[derive(Debug)]
pub struct Advance {
    /// Token to place in the next control PDU's trailer, if any
    pub token: Option<Bytes>,
    /// Whether the security context is now established
    pub established: bool,
}

/// Drives one connection's authentication handshake and, once established,
/// its per-PDU protection. Connection-wide state; mutation is confined to the
/// bind/alter-context control path.
pub struct Negotiator {
    provider: Box<dyn SecurityProvider>,
    level: AuthLevel,
    context_id: u32,
    state: HandshakeState,
}

impl Negotiator {
    pub fn new(provider: Box<dyn SecurityProvider>, level: AuthLevel) -> Self {
        Self {
            provider,
            level,
            context_id: 0,
            state: HandshakeState::NoAuth,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn level(&self) -> AuthLevel {
        self.level
    }

    pub fn auth_type(&self) -> AuthType {
        self.provider.auth_type()
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Produce the initiating token (client side, carried in the bind PDU).
    pub fn initiate(&mut self) -> Result<Bytes> {
        let step = self.provider.step(None)?;
        let token = step
            .token
            .ok_or_else(|| RpcError::HandshakeFailed("provider produced no initial token".into()))?;
        self.state = HandshakeState::NegotiateSent;
        Ok(token)
    }

    /// Feed the peer's latest token and advance one leg. Either side calls
    /// this for every trailer it receives until established.
    pub fn advance(&mut self, peer_token: &[u8]) -> Result<Advance> {
        let step = self
            .provider
            .step(Some(peer_token))
            .map_err(|e| RpcError::HandshakeFailed(e.to_string()))?;

        self.state = match self.state {
            HandshakeState::NoAuth => HandshakeState::NegotiateSent,
            HandshakeState::NegotiateSent => HandshakeState::ChallengeReceived,
            HandshakeState::ChallengeReceived => HandshakeState::ResponseSent,
            other => other,
        };
        if step.complete {
            self.state = HandshakeState::Established;
        }

        Ok(Advance {
            token: step.token,
            established: step.complete,
        })
    }

    /// Note that our response leg went out (the auth3 PDU has no reply).
    pub fn response_sent(&mut self) {
        if self.state != HandshakeState::Established {
            self.state = HandshakeState::ResponseSent;
        }
    }

    /// Build a trailer carrying a handshake token.
    pub fn token_trailer(&self, token: Bytes) -> AuthTrailer {
        AuthTrailer::new(self.provider.auth_type(), self.level, self.context_id, token)
    }

    /// Build the per-PDU signing trailer with a placeholder value; the caller
    /// patches in the real signature after encoding.
    pub fn signature_trailer(&self) -> AuthTrailer {
        AuthTrailer::new(
            self.provider.auth_type(),
            self.level,
            self.context_id,
            Bytes::from(vec![0u8; self.provider.signature_len()]),
        )
    }

    pub fn signature_len(&self) -> usize {
        self.provider.signature_len()
    }

    pub fn sign(&self, data: &[u8]) -> Result<Bytes> {
        self.provider.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        self.provider
            .verify(data, signature)
            .map_err(|_| RpcError::IntegrityViolation)
    }

    pub fn seal(&self, stub: &[u8]) -> Result<Bytes> {
        if self.level.requires_sealing() {
            self.provider.seal(stub)
        } else {
            Ok(Bytes::copy_from_slice(stub))
        }
    }

    pub fn unseal(&self, stub: &[u8]) -> Result<Bytes> {
        if self.level.requires_sealing() {
            self.provider.unseal(stub)
        } else {
            Ok(Bytes::copy_from_slice(stub))
        }
    }
}

/// Encode `pdu`, appending a computed signature trailer when the security
/// context is established at a signing level. The signature covers every
/// encoded byte up to the trailer's auth_value.
pub(crate) fn protect_pdu(
    security: &parking_lot::Mutex<Option<Negotiator>>,
    pdu: Pdu,
) -> Result<bytes::Bytes> {
    let sec = security.lock();
    match sec
        .as_ref()
        .filter(|n| n.is_established() && n.level().requires_signing())
    {
        Some(neg) => {
            let pdu = pdu.with_auth(neg.signature_trailer());
            let mut raw = pdu.encode_mut()?;
            let signature_offset = raw.len() - neg.signature_len();
            let signature = neg.sign(&raw[..signature_offset])?;
            raw[signature_offset..].copy_from_slice(&signature);
            Ok(raw.freeze())
        }
        None => pdu.encode(),
    }
}

/// Verify an inbound PDU's signature trailer once the context is
/// established. Failure is an integrity violation, fatal to the connection.
pub(crate) fn verify_inbound(
    security: &parking_lot::Mutex<Option<Negotiator>>,
    raw: &bytes::Bytes,
    auth_length: u16,
) -> Result<()> {
    if auth_length == 0 {
        return Ok(());
    }
    let sec = security.lock();
    if let Some(neg) = sec.as_ref().filter(|n| n.is_established()) {
        let auth_length = auth_length as usize;
        if raw.len() < auth_length {
            return Err(RpcError::IntegrityViolation);
        }
        let signature_offset = raw.len() - auth_length;
        neg.verify(&raw[..signature_offset], &raw[signature_offset..])?;
    }
    Ok(())
}

/// Decrypt a stub received under packet privacy; identity otherwise.
pub(crate) fn unseal_stub(
    security: &parking_lot::Mutex<Option<Negotiator>>,
    stub: &bytes::Bytes,
) -> Result<bytes::Bytes> {
    let sec = security.lock();
    match sec.as_ref().filter(|n| n.is_established()) {
        Some(neg) => neg.unseal(stub),
        None => Ok(stub.clone()),
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("auth_type", &self.provider.auth_type())
            .field("level", &self.level)
            .field("state", &self.state)
            .finish()
    }
}
