//! Call multiplexing: many outstanding calls on one connection, matched to
//! their callers purely by call ID, plus cancellation and timeout behavior.

mod common;

use common::*;
use futures::future::join_all;
use msrpc::{BindOptions, Connection, RpcError};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_calls_route_to_correct_callers() {
    init_logging();
    let addr = start_echo_server().await;
    let conn = Arc::new(
        Connection::connect(addr, echo_syntax(), BindOptions::default())
            .await
            .unwrap(),
    );

    // Each task sends a distinct payload; any cross-wiring of call IDs
    // would hand a task someone else's response.
    let tasks: Vec<_> = (0..32u32)
        .map(|i| {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let payload: Vec<u8> = (0..64 + i as usize)
                    .map(|j| (i as usize * 31 + j) as u8)
                    .collect();
                let mut op = EchoOp {
                    input: payload.clone(),
                    output: Vec::new(),
                };
                conn.invoke(&mut op).await.unwrap();
                assert_eq!(op.output, payload, "call {i} got someone else's reply");
            })
        })
        .collect();

    for task in join_all(tasks).await {
        task.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_call_does_not_block_fast_calls() {
    init_logging();
    let addr = start_echo_server().await;
    let conn = Arc::new(
        Connection::connect(addr, echo_syntax(), BindOptions::default())
            .await
            .unwrap(),
    );

    let slow = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut op = DelayOp { millis: 400 };
            conn.invoke(&mut op).await.unwrap();
        })
    };

    // Issued after the slow call, must complete well before it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = Instant::now();
    let mut op = EchoOp {
        input: vec![1, 2, 3],
        output: Vec::new(),
    };
    conn.invoke(&mut op).await.unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "fast call waited on the slow one"
    );

    slow.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_behaves_like_cancellation() {
    init_logging();
    let addr = start_echo_server().await;
    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();

    let mut slow = DelayOp { millis: 500 };
    let err = conn
        .invoke_with_timeout(&mut slow, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    // The abandoned call's response is consumed and discarded by the
    // connection; the next call must work normally.
    let mut op = EchoOp {
        input: vec![9; 128],
        output: Vec::new(),
    };
    conn.invoke(&mut op).await.unwrap();
    assert_eq!(op.output, vec![9; 128]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_loss_fails_pending_calls() {
    init_logging();

    // A server that accepts the bind, then drops the connection mid-call.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut rx = msrpc::PduTransport::new(read_half);
        let mut tx = msrpc::PduTransport::new(write_half);

        let raw = rx.read_pdu().await.unwrap();
        let bind = msrpc::Pdu::decode(&raw).unwrap();
        let ack = msrpc::Pdu::new(
            bind.call_id(),
            msrpc::PduBody::BindAck(msrpc::BindAckBody {
                max_xmit_frag: 4280,
                max_recv_frag: 4280,
                assoc_group_id: 1,
                secondary_addr: String::new(),
                results: vec![msrpc::ContextResultElement::accepted()],
            }),
        );
        tx.write_pdu(&ack.encode().unwrap()).await.unwrap();

        // Swallow the request, then vanish.
        let _ = rx.read_pdu().await;
    });

    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();
    let mut op = EchoOp {
        input: vec![1],
        output: Vec::new(),
    };
    let err = conn.invoke(&mut op).await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed));
}
