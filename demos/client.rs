use async_std::net::TcpStream;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bencode_rpc::rpc::Client;

#[derive(Serialize)]
struct Args {
    #[serde(rename = "A")]
    a: i64,
    #[serde(rename = "B")]
    b: i64,
}

#[derive(Deserialize)]
struct Sum {
    #[serde(rename = "C")]
    c: i64,
}

#[async_std::main]
async fn main() -> bencode_rpc::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let stream = TcpStream::connect("127.0.0.1:12345").await?;
    let (client, driver) = Client::new(stream);
    let driver = async_std::task::spawn(driver.run());

    let greeting: String = client.call("Greeter.Hello", "Bob").await?;
    info!(%greeting, "got hello");

    let (small, large) = futures::join!(
        client.call::<_, Sum>("Arith.Add", &Args { a: 7, b: 8 }),
        client.call::<_, Sum>("Arith.Add", &Args { a: i64::MAX, b: 1 }),
    );
    info!(sum = small?.c, "7 + 8");
    if let Err(e) = large {
        warn!(error = %e, "max + 1");
    }

    client.close().await?;
    driver.await
}
