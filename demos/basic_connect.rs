//! Connect to a plain `ws://` endpoint, send one message and print what comes back.
//!
//! ```text
//! RUST_LOG=info cargo run --example basic_connect -- ws://127.0.0.1:9001/echo
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use ws_core::{DeliveredMessage, Destination, WsCall, WsClient, WsConsumer};

struct Printer {
    tx: mpsc::UnboundedSender<String>,
}

impl WsConsumer for Printer {
    fn on_message(&self, message: DeliveredMessage) {
        let line = match message.as_str() {
            Some(text) => text.to_string(),
            None => format!("<{} binary bytes>", message.data.len()),
        };
        let _ = self.tx.send(line);
    }

    fn on_close(&self, code: u16, reason: &str, remote: bool) {
        let _ = self
            .tx
            .send(format!("closed code={code} reason={reason:?} remote={remote}"));
    }

    fn auto_json_parse(&self) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9001/".to_string());
    let destination: Destination = url.parse()?;
    if destination.scheme.is_secure() {
        return Err("this demo does not terminate TLS; use a ws:// url".into());
    }

    let stream = TcpStream::connect((destination.host.as_str(), destination.effective_port())).await?;
    stream.set_nodelay(true)?;

    let client = WsClient::builder().build()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = client
        .connect(stream, &destination, Arc::new(Printer { tx }), WsCall::new())
        .await?;

    connection.send_text("hello from ws-core")?;
    while let Ok(Some(line)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        println!("{line}");
        if line.starts_with("closed") {
            break;
        }
    }

    connection.close();
    connection.closed().await;
    Ok(())
}
