//! MSRPC echo service demo.
//!
//! Runs a server exposing a two-operation echo interface, or a client that
//! binds to it and round-trips a message, exercising the full stack: NDR
//! marshal, bind negotiation, fragmentation, and call multiplexing.
//!
//! ```text
//! cargo run -p echo-service -- serve --listen 127.0.0.1:4135
//! cargo run -p echo-service -- call --addr 127.0.0.1:4135 --message "hello"
//! ```

use clap::{Parser, Subcommand};
use msrpc::{
    BindOptions, Connection, NdrReader, NdrWriter, Operation, RpcError, RpcServer, SyntaxId, Uuid,
    WString,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

const ECHO_UUID: &str = "6d2b3c4d-5e6f-4a80-9102-13243546bead";

fn echo_syntax() -> SyntaxId {
    let uuid = Uuid::parse(ECHO_UUID).expect("static UUID is valid");
    SyntaxId::new(uuid, 1, 0)
}

/// Opnum 0: echo a string back to the caller.
#[derive(Debug, Default)]
struct EchoOp {
    message: WString,
    reply: WString,
}

impl Operation for EchoOp {
    fn opnum(&self) -> u16 {
        0
    }

    fn op_name(&self) -> &'static str {
        "/echo/v1/Echo"
    }

    fn marshal_request(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_data(&self.message)
    }

    fn unmarshal_request(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.message = r.read_data()?;
        Ok(())
    }

    fn marshal_response(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_data(&self.reply)
    }

    fn unmarshal_response(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.reply = r.read_data()?;
        Ok(())
    }
}

/// Opnum 1: reverse the characters of a string.
#[derive(Debug, Default)]
struct ReverseOp {
    message: WString,
    reply: WString,
}

impl Operation for ReverseOp {
    fn opnum(&self) -> u16 {
        1
    }

    fn op_name(&self) -> &'static str {
        "/echo/v1/Reverse"
    }

    fn marshal_request(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_data(&self.message)
    }

    fn unmarshal_request(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.message = r.read_data()?;
        Ok(())
    }

    fn marshal_response(&mut self, w: &mut NdrWriter) -> msrpc_ndr::Result<()> {
        w.write_data(&self.reply)
    }

    fn unmarshal_response(&mut self, r: &mut NdrReader) -> msrpc_ndr::Result<()> {
        self.reply = r.read_data()?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(name = "echo-service", about = "MSRPC echo service demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the echo server
    Serve {
        #[arg(long, default_value = "127.0.0.1:4135")]
        listen: SocketAddr,
    },
    /// Bind to a server and invoke both operations
    Call {
        #[arg(long, default_value = "127.0.0.1:4135")]
        addr: SocketAddr,
        #[arg(long, default_value = "hello, msrpc")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> msrpc::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { listen } => {
            let server = RpcServer::new();
            server.register(
                echo_syntax(),
                Arc::new(
                    |opnum: u16, r: &mut NdrReader| -> msrpc::Result<Box<dyn Operation>> {
                        match opnum {
                            0 => {
                                let mut op = EchoOp::default();
                                op.unmarshal_request(r)?;
                                info!(message = %op.message.as_str(), "echo");
                                op.reply = op.message.clone();
                                Ok(Box::new(op))
                            }
                            1 => {
                                let mut op = ReverseOp::default();
                                op.unmarshal_request(r)?;
                                info!(message = %op.message.as_str(), "reverse");
                                op.reply = WString::new(
                                    op.message.as_str().chars().rev().collect::<String>(),
                                );
                                Ok(Box::new(op))
                            }
                            other => Err(RpcError::UnknownOperation(other)),
                        }
                    },
                ),
            );
            server.serve_addr(listen).await
        }
        Command::Call { addr, message } => {
            let conn = Connection::connect(addr, echo_syntax(), BindOptions::default()).await?;

            let mut echo = EchoOp {
                message: WString::new(message.clone()),
                ..Default::default()
            };
            conn.invoke(&mut echo).await?;
            info!(reply = %echo.reply.as_str(), "echo replied");

            let mut reverse = ReverseOp {
                message: WString::new(message),
                ..Default::default()
            };
            conn.invoke(&mut reverse).await?;
            info!(reply = %reverse.reply.as_str(), "reverse replied");
            Ok(())
        }
    }
}
