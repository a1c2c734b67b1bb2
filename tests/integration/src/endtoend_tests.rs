//! End-to-end scenarios across the full stack: pointer semantics observed
//! server-side, typed remote faults, alter-context, and bind rejection.

mod common;

use common::*;
use msrpc::{
    BindOptions, Connection, FaultCode, NdrReader, Operation, RpcError, RpcServer, SyntaxId, Uuid,
};
use std::sync::Arc;

/// Scenario: unauthenticated bind, request with a null unique pointer; the
/// server observes the parameter as absent and answers with a single
/// unsigned response fragment.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_null_unique_pointer_observed_absent() {
    init_logging();
    let addr = start_echo_server().await;
    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();

    let mut op = ProbePointersOp {
        maybe: None,
        shared: None,
        ..Default::default()
    };
    conn.invoke(&mut op).await.unwrap();
    assert!(!op.observed_unique, "server saw a value behind a null pointer");
    assert!(!op.observed_alias);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_present_unique_pointer_observed() {
    init_logging();
    let addr = start_echo_server().await;
    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();

    let mut op = ProbePointersOp {
        maybe: Some(17),
        shared: None,
        ..Default::default()
    };
    conn.invoke(&mut op).await.unwrap();
    assert!(op.observed_unique);
}

/// Scenario: two full pointers in one request referencing the same object
/// decode server-side to one shared value, not two copies.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aliased_full_pointers_share_identity_remotely() {
    init_logging();
    let addr = start_echo_server().await;
    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();

    let mut op = ProbePointersOp {
        maybe: None,
        shared: Some(Arc::new(0xCAFE)),
        ..Default::default()
    };
    conn.invoke(&mut op).await.unwrap();
    assert!(op.observed_alias, "server decoded two copies, not one value");
    assert_eq!(op.observed_value, 0xCAFE);
}

/// Scenario: a fault PDU with a specific status decodes to a typed remote
/// error carrying that status, not a decode or framing error.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fault_surfaces_as_typed_error() {
    init_logging();
    let addr = start_echo_server().await;
    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();

    let mut op = DeniedOp;
    let err = conn.invoke(&mut op).await.unwrap_err();
    match err {
        RpcError::Fault {
            code,
            did_not_execute,
        } => {
            assert_eq!(code, FaultCode::AccessDenied);
            assert!(!did_not_execute);
        }
        other => panic!("expected typed fault, got {other:?}"),
    }
}

/// An unregistered opnum maps to an operation-range fault with the
/// did-not-execute flag.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_opnum_faults_with_op_range_error() {
    init_logging();
    let addr = start_echo_server().await;
    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();

    struct Bogus;
    impl Operation for Bogus {
        fn opnum(&self) -> u16 {
            99
        }
        fn op_name(&self) -> &'static str {
            "/echo/v1/Bogus"
        }
        fn marshal_request(&mut self, _w: &mut msrpc::NdrWriter) -> msrpc_ndr::Result<()> {
            Ok(())
        }
        fn unmarshal_request(&mut self, _r: &mut NdrReader) -> msrpc_ndr::Result<()> {
            Ok(())
        }
        fn marshal_response(&mut self, _w: &mut msrpc::NdrWriter) -> msrpc_ndr::Result<()> {
            Ok(())
        }
        fn unmarshal_response(&mut self, _r: &mut NdrReader) -> msrpc_ndr::Result<()> {
            Ok(())
        }
    }

    let err = conn.invoke(&mut Bogus).await.unwrap_err();
    match err {
        RpcError::Fault {
            code,
            did_not_execute,
        } => {
            assert_eq!(code, FaultCode::OperationRangeError);
            assert!(did_not_execute);
        }
        other => panic!("expected op-range fault, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bind_to_unknown_interface_rejected() {
    init_logging();
    let addr = start_echo_server().await;

    let unknown = SyntaxId::new(
        Uuid::parse("ffffffff-eeee-4ddd-8ccc-bbbbaaaa9999").unwrap(),
        1,
        0,
    );
    let err = Connection::connect(addr, unknown, BindOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::BindRejected(_)));
}

/// Alter-context adds a second interface on the live connection; calls on
/// each context dispatch to the right handler.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alter_context_adds_interface() {
    init_logging();
    let server = RpcServer::new();
    server.register(echo_syntax(), echo_handle());
    server.register(second_syntax(), echo_handle());
    let addr = start_server(server).await;

    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();

    let second_ctx = conn.alter_context(second_syntax()).await.unwrap();
    assert_ne!(second_ctx, conn.primary_context());
    assert_eq!(conn.interface_for(second_ctx), Some(second_syntax()));

    let mut op = EchoOp {
        input: vec![5; 32],
        output: Vec::new(),
    };
    conn.invoke_on(second_ctx, &mut op, None).await.unwrap();
    assert_eq!(op.output, vec![5; 32]);

    // The original context still works.
    let mut op = EchoOp {
        input: vec![6; 32],
        output: Vec::new(),
    };
    conn.invoke(&mut op).await.unwrap();
    assert_eq!(op.output, vec![6; 32]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alter_context_to_unknown_interface_fails() {
    init_logging();
    let addr = start_echo_server().await;
    let conn = Connection::connect(addr, echo_syntax(), BindOptions::default())
        .await
        .unwrap();

    let unknown = SyntaxId::new(
        Uuid::parse("ffffffff-eeee-4ddd-8ccc-bbbbaaaa9999").unwrap(),
        1,
        0,
    );
    let err = conn.alter_context(unknown).await.unwrap_err();
    assert!(matches!(err, RpcError::ContextUnavailable(_)));
}
