use std::sync::Arc;

use async_std::net::TcpListener;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bencode_rpc::rpc::{serve_conn, Registry};

#[derive(Deserialize)]
struct Args {
    #[serde(rename = "A")]
    a: i64,
    #[serde(rename = "B")]
    b: i64,
}

#[derive(Serialize)]
struct Sum {
    #[serde(rename = "C")]
    c: i64,
}

fn registry() -> bencode_rpc::Result<Registry> {
    let mut registry = Registry::new();
    registry.register("Greeter.Hello", |name: String| async move {
        Ok::<_, String>(format!("Hello there {}", name))
    })?;
    registry.register("Arith.Add", |args: Args| async move {
        args.a
            .checked_add(args.b)
            .map(|c| Sum { c })
            .ok_or("overflow")
    })?;
    Ok(registry)
}

#[async_std::main]
async fn main() -> bencode_rpc::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let registry = Arc::new(registry()?);
    let listener = TcpListener::bind("127.0.0.1:12345").await?;
    info!("listening on port 12345");

    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        let stream = stream?;
        let peer = stream.peer_addr().ok();
        let registry = registry.clone();
        async_std::task::spawn(async move {
            info!(?peer, "client connected");
            match serve_conn(stream, &registry).await {
                Ok(()) => info!(?peer, "client disconnected"),
                Err(e) => warn!(?peer, error = %e, "connection failed"),
            }
        });
    }
    Ok(())
}
