//! Client that pings the server, lists its tools and adds two numbers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use mcp_uds::{FnHandler, JsonRpcMessage, TransportError, UnixTransportBuilder};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn run(socket: PathBuf) -> anyhow::Result<()> {
    let client = UnixTransportBuilder::new_client()
        .with_env()?
        .socket_path(socket)
        .build_client()?;

    let (tx, mut replies) = mpsc::unbounded_channel();
    client
        .connect(FnHandler::new(move |message: JsonRpcMessage| {
            let _ = tx.send(message);
            std::future::ready(Ok::<_, TransportError>(None))
        }))
        .await
        .with_context(|| format!("failed to connect to {}", client.socket_path().display()))?;
    info!(path = %client.socket_path().display(), "connected");

    let requests = [
        JsonRpcMessage::request("ping", None, 1_i64),
        JsonRpcMessage::request("tools/list", None, 2_i64),
        JsonRpcMessage::request(
            "tools/call",
            Some(json!({"name": "add", "arguments": {"a": 2, "b": 3}})),
            3_i64,
        ),
    ];

    for request in requests {
        let method = request.method().unwrap_or_default().to_owned();
        client.send_message(request).await?;

        let reply = match tokio::time::timeout(REPLY_TIMEOUT, replies.recv()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => bail!("connection closed while waiting for {method}"),
            Err(_) => bail!("no reply to {method} within {REPLY_TIMEOUT:?}"),
        };
        println!("{method} -> {}", serde_json::to_string(&reply)?);
    }

    client.close_gracefully().await?;
    Ok(())
}
