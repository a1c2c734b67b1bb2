//! Shared fixtures for the integration tests: a test interface with a few
//! operations, a loopback server launcher, and a mock security mechanism.
#![allow(dead_code)]

use bytes::Bytes;
use msrpc::{
    AuthType, FaultCode, NdrReader, NdrWriter, Operation, RpcError, RpcServer, SecurityProvider,
    SecurityStep, ServerHandle, Shared, SyntaxId, Uuid,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const ECHO_UUID: &str = "f1a2b3c4-d5e6-4890-abcd-ef1234567890";
pub const SECOND_UUID: &str = "0a0b0c0d-1111-4222-8333-444455556666";

pub fn echo_syntax() -> SyntaxId {
    SyntaxId::new(Uuid::parse(ECHO_UUID).unwrap(), 1, 0)
}

pub fn second_syntax() -> SyntaxId {
    SyntaxId::new(Uuid::parse(SECOND_UUID).unwrap(), 2, 1)
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Opnum 0: echo a byte array.
#[derive(Debug, Default)]
pub struct EchoOp {
    pub input: Vec<u8>,
    pub output: Vec<u8>,
}

impl Operation for EchoOp {
    fn opnum(&self) -> u16 {
        0
    }

    fn op_name(&self) -> &'static str {
        "/echo/v1/Echo"
    }

    fn marshal_request(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_conformant_array(&self.input)?;
        w.write_deferred()
    }

    fn unmarshal_request(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.input = r.read_conformant_array()?;
        r.read_deferred()
    }

    fn marshal_response(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_conformant_array(&self.output)?;
        w.write_deferred()
    }

    fn unmarshal_response(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.output = r.read_conformant_array()?;
        r.read_deferred()
    }
}

/// Opnum 1: server sleeps for the requested duration, then echoes it.
#[derive(Debug, Default)]
pub struct DelayOp {
    pub millis: u64,
}

impl Operation for DelayOp {
    fn opnum(&self) -> u16 {
        1
    }

    fn op_name(&self) -> &'static str {
        "/echo/v1/Delay"
    }

    fn marshal_request(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_u64(self.millis);
        Ok(())
    }

    fn unmarshal_request(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.millis = r.read_u64()?;
        Ok(())
    }

    fn marshal_response(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_u64(self.millis);
        Ok(())
    }

    fn unmarshal_response(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.millis = r.read_u64()?;
        Ok(())
    }
}

/// Opnum 2: a unique pointer plus two full pointers to the same target.
/// The server reports what it observed: presence, aliasing, and the value.
#[derive(Debug, Default)]
pub struct ProbePointersOp {
    // client inputs
    pub maybe: Option<u32>,
    pub shared: Option<Arc<u32>>,
    // server observations, echoed back
    pub observed_unique: bool,
    pub observed_alias: bool,
    pub observed_value: u32,
}

impl Operation for ProbePointersOp {
    fn opnum(&self) -> u16 {
        2
    }

    fn op_name(&self) -> &'static str {
        "/echo/v1/ProbePointers"
    }

    fn marshal_request(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_unique_data(self.maybe.as_ref())?;
        match &self.shared {
            Some(target) => {
                w.write_full_pointer(Some(target))?;
                w.write_full_pointer(Some(target))?;
            }
            None => {
                w.write_full_pointer::<u32>(None)?;
                w.write_full_pointer::<u32>(None)?;
            }
        }
        w.write_deferred()
    }

    fn unmarshal_request(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        let unique = r.read_unique_pointer::<u32>()?;
        let first = r.read_full_pointer::<u32>()?;
        let second = r.read_full_pointer::<u32>()?;
        r.read_deferred()?;

        self.observed_unique = unique.is_some();
        self.observed_alias = match (&first, &second) {
            (Some(a), Some(b)) => Shared::ptr_eq(a, b),
            _ => false,
        };
        self.observed_value = match &first {
            Some(shared) => *shared.value()?,
            None => 0,
        };
        Ok(())
    }

    fn marshal_response(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_data(&self.observed_unique)?;
        w.write_data(&self.observed_alias)?;
        w.write_u32(self.observed_value);
        Ok(())
    }

    fn unmarshal_response(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.observed_unique = r.read_data()?;
        self.observed_alias = r.read_data()?;
        self.observed_value = r.read_u32()?;
        Ok(())
    }
}

/// Opnum 3: returns `count` pattern bytes, for response-side fragmentation.
#[derive(Debug, Default)]
pub struct GenerateOp {
    pub count: u32,
    pub data: Vec<u8>,
}

impl Operation for GenerateOp {
    fn opnum(&self) -> u16 {
        3
    }

    fn op_name(&self) -> &'static str {
        "/echo/v1/Generate"
    }

    fn marshal_request(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_u32(self.count);
        Ok(())
    }

    fn unmarshal_request(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.count = r.read_u32()?;
        Ok(())
    }

    fn marshal_response(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_conformant_array(&self.data)?;
        w.write_deferred()
    }

    fn unmarshal_response(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.data = r.read_conformant_array()?;
        r.read_deferred()
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// The dispatcher for the echo interface, in the generated `*ServerHandle`
/// shape: unmarshal, execute, return the operation ready to respond.
pub fn echo_handle() -> ServerHandle {
    Arc::new(
        |opnum: u16, r: &mut NdrReader| -> msrpc::Result<Box<dyn Operation>> {
            match opnum {
                0 => {
                    let mut op = EchoOp::default();
                    op.unmarshal_request(r)?;
                    op.output = op.input.clone();
                    Ok(Box::new(op))
                }
                1 => {
                    let mut op = DelayOp::default();
                    op.unmarshal_request(r)?;
                    std::thread::sleep(Duration::from_millis(op.millis));
                    Ok(Box::new(op))
                }
                2 => {
                    let mut op = ProbePointersOp::default();
                    op.unmarshal_request(r)?;
                    Ok(Box::new(op))
                }
                3 => {
                    let mut op = GenerateOp::default();
                    op.unmarshal_request(r)?;
                    op.data = pattern(op.count as usize);
                    Ok(Box::new(op))
                }
                7 => Err(RpcError::Fault {
                    code: FaultCode::AccessDenied,
                    did_not_execute: false,
                }),
                other => Err(RpcError::UnknownOperation(other)),
            }
        },
    )
}

/// Opnum 7 client side: always faulted by the server.
#[derive(Debug, Default)]
pub struct DeniedOp;

impl Operation for DeniedOp {
    fn opnum(&self) -> u16 {
        7
    }

    fn op_name(&self) -> &'static str {
        "/echo/v1/Denied"
    }

    fn marshal_request(&mut self, _w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        Ok(())
    }

    fn unmarshal_request(&mut self, _r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        Ok(())
    }

    fn marshal_response(&mut self, _w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        Ok(())
    }

    fn unmarshal_response(&mut self, _r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        Ok(())
    }
}

/// Start `server` on a loopback listener; returns the bound address.
pub async fn start_server(server: RpcServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

/// Start a default server exposing the echo interface.
pub async fn start_echo_server() -> SocketAddr {
    let server = RpcServer::new();
    server.register(echo_syntax(), echo_handle());
    start_server(server).await
}

/// Mock three-leg mechanism (negotiate -> challenge -> response) with
/// checksum signing and XOR sealing. Stands in for a real SSPI package.
pub struct TestProvider {
    is_client: bool,
    legs: usize,
}

impl TestProvider {
    pub fn client() -> Box<dyn SecurityProvider> {
        Box::new(Self {
            is_client: true,
            legs: 0,
        })
    }

    pub fn server() -> Box<dyn SecurityProvider> {
        Box::new(Self {
            is_client: false,
            legs: 0,
        })
    }
}

impl SecurityProvider for TestProvider {
    fn auth_type(&self) -> AuthType {
        AuthType::Ntlm
    }

    fn step(&mut self, peer_token: Option<&[u8]>) -> msrpc::Result<SecurityStep> {
        self.legs += 1;
        if self.is_client {
            match (self.legs, peer_token) {
                (1, None) => Ok(SecurityStep {
                    token: Some(Bytes::from_static(b"NEGOTIATE")),
                    complete: false,
                }),
                (2, Some(b"CHALLENGE")) => Ok(SecurityStep {
                    token: Some(Bytes::from_static(b"RESPONSE")),
                    complete: true,
                }),
                _ => Err(RpcError::HandshakeFailed("unexpected client leg".into())),
            }
        } else {
            match (self.legs, peer_token) {
                (1, Some(b"NEGOTIATE")) => Ok(SecurityStep {
                    token: Some(Bytes::from_static(b"CHALLENGE")),
                    complete: false,
                }),
                (2, Some(b"RESPONSE")) => Ok(SecurityStep {
                    token: None,
                    complete: true,
                }),
                _ => Err(RpcError::HandshakeFailed("unexpected server leg".into())),
            }
        }
    }

    fn signature_len(&self) -> usize {
        8
    }

    fn sign(&self, data: &[u8]) -> msrpc::Result<Bytes> {
        let mut sum = 0xcbf2_9ce4_8422_2325u64;
        for &byte in data {
            sum = (sum ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3);
        }
        Ok(Bytes::copy_from_slice(&sum.to_le_bytes()))
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> msrpc::Result<()> {
        if self.sign(data)?.as_ref() == signature {
            Ok(())
        } else {
            Err(RpcError::IntegrityViolation)
        }
    }

    fn seal(&self, stub: &[u8]) -> msrpc::Result<Bytes> {
        Ok(stub.iter().map(|b| b ^ 0xA5).collect())
    }

    fn unseal(&self, stub: &[u8]) -> msrpc::Result<Bytes> {
        self.seal(stub)
    }
}
