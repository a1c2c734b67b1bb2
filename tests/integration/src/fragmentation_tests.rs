//! Large-payload tests: requests and responses that exceed the negotiated
//! fragment size must split, reassemble byte-for-byte, and mark their
//! first/last fragments correctly on the wire.

mod common;

use bytes::Bytes;
use common::*;
use msrpc::{
    BindOptions, Connection, ContextElement, Pdu, PduBody, PduTransport, RpcServer, ServerConfig,
};
use tokio::net::TcpStream;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_request_roundtrip() {
    init_logging();
    let addr = start_echo_server().await;

    let conn = Connection::connect(
        addr,
        echo_syntax(),
        BindOptions::default().with_max_frag(4096),
    )
    .await
    .unwrap();

    // ~25 request fragments at a 4 KB fragment size.
    let mut op = EchoOp {
        input: pattern(100_000),
        output: Vec::new(),
    };
    conn.invoke(&mut op).await.unwrap();
    assert_eq!(op.output, op.input);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_response_roundtrip() {
    init_logging();
    let server = RpcServer::with_config(ServerConfig {
        max_frag: 2048,
        ..ServerConfig::default()
    });
    server.register(echo_syntax(), echo_handle());
    let addr = start_server(server).await;

    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();

    let mut op = GenerateOp {
        count: 60_000,
        data: Vec::new(),
    };
    conn.invoke(&mut op).await.unwrap();
    assert_eq!(op.data, pattern(60_000));
}

/// An 8 KB response against a 4 KB negotiated fragment size arrives as
/// exactly two fragments. Spoken raw so the fragment boundaries are visible.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_8k_response_is_exactly_two_fragments() {
    init_logging();
    let addr = start_echo_server().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut rx = PduTransport::new(read_half);
    let mut tx = PduTransport::new(write_half);

    // Bind at 4 KB fragments.
    let mut bind = Pdu::bind(1, vec![ContextElement::new(0, echo_syntax())]);
    if let PduBody::Bind(body) = &mut bind.body {
        body.max_xmit_frag = 4096;
        body.max_recv_frag = 4096;
    }
    tx.write_pdu(&bind.encode().unwrap()).await.unwrap();
    let raw = rx.read_pdu().await.unwrap();
    assert!(matches!(
        Pdu::decode(&raw).unwrap().body,
        PduBody::BindAck(_)
    ));

    // Ask for an 8 KB generated payload. The response stub (count prefix +
    // 8000 bytes) exceeds one 4 KB fragment but fits in two.
    let mut w = msrpc::NdrWriter::new();
    w.write_u32(8000);
    let request = Pdu::request(2, 0, 3, w.finish().unwrap());
    tx.write_pdu(&request.encode().unwrap()).await.unwrap();

    let mut fragments = Vec::new();
    loop {
        let raw = rx.read_pdu().await.unwrap();
        let pdu = Pdu::decode(&raw).unwrap();
        let last = pdu.header.flags.is_last_frag();
        match pdu.body {
            PduBody::Response(body) => fragments.push((pdu.header.flags, body.stub)),
            other => panic!("expected response fragment, got {other:?}"),
        }
        if last {
            break;
        }
    }

    assert_eq!(fragments.len(), 2, "expected exactly two fragments");
    assert!(fragments[0].0.is_first_frag() && !fragments[0].0.is_last_frag());
    assert!(!fragments[1].0.is_first_frag() && fragments[1].0.is_last_frag());

    // Each fragment fits the negotiated limit and the stubs concatenate to
    // the original marshaled payload.
    let mut stub = Vec::new();
    for (_, piece) in &fragments {
        assert!(piece.len() + 24 <= 4096);
        stub.extend_from_slice(piece);
    }
    let mut r = msrpc::NdrReader::new(Bytes::from(stub));
    let data = r.read_conformant_array::<u8>().unwrap();
    assert_eq!(data, pattern(8000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_large_transfers() {
    init_logging();
    let server = RpcServer::with_config(ServerConfig {
        max_frag: 1024,
        ..ServerConfig::default()
    });
    server.register(echo_syntax(), echo_handle());
    let addr = start_server(server).await;

    let conn = std::sync::Arc::new(
        Connection::connect(addr, echo_syntax(), BindOptions::default())
            .await
            .unwrap(),
    );

    let tasks: Vec<_> = (0..8u32)
        .map(|i| {
            let conn = std::sync::Arc::clone(&conn);
            tokio::spawn(async move {
                let payload = pattern(5_000 + i as usize * 997);
                let mut op = EchoOp {
                    input: payload.clone(),
                    output: Vec::new(),
                };
                conn.invoke(&mut op).await.unwrap();
                assert_eq!(op.output, payload);
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
}
