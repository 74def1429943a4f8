//! Echo - two peers over the in-process transport.
//!
//! This example demonstrates:
//! - Building a serving peer and a dialing peer with the builder pattern
//! - Registering a method handler with typed input/output
//! - A call large enough to be split into transit chunks
//! - The server calling back into the client over the same socket
//!
//! Run with `RUST_LOG=sockrpc=debug cargo run --example echo` to see the
//! chunking in the logs.

use serde::{Deserialize, Serialize};
use sockrpc::transport::memory_transport;
use sockrpc::{ChunkingConfig, Peer, RequestContext};
use tracing_subscriber::EnvFilter;

/// Input structure for the echo method.
#[derive(Serialize, Deserialize, Debug)]
struct EchoInput {
    message: String,
}

/// Output structure for the echo method.
#[derive(Serialize, Deserialize, Debug)]
struct EchoOutput {
    echo: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (connector, mut listener) = memory_transport();

    let server = Peer::builder()
        .handle("echo", |data: EchoInput, ctx: RequestContext| async move {
            ctx.respond(&EchoOutput { echo: data.message })
        })
        .build();

    let client = Peer::builder()
        .connector(connector)
        .chunking(ChunkingConfig::limited(256, 32))
        .handle("greet", |name: String, ctx: RequestContext| async move {
            ctx.respond(&format!("hello, {}", name))
        })
        .on_open(|_: (), _ctx| async {
            tracing::info!("client connected");
            Ok(())
        })
        .build();

    client.connect("mem://echo").await?;
    let accepted = listener.accept().await.ok_or("listener closed")?;
    let served = server.serve(accepted);

    let message = "the quick brown fox jumps over the lazy dog ".repeat(40);
    let reply: EchoOutput = client
        .call("echo", &EchoInput { message: message.clone() })
        .await?;
    println!("echoed {} bytes intact: {}", reply.echo.len(), reply.echo == message);

    let greeting: String = served.call("greet", "server").await?;
    println!("{}", greeting);

    client.close();
    Ok(())
}
