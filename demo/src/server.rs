//! Calculator server.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use mcp_uds::{
    JsonRpcError, JsonRpcMessage, MessageHandler, TransportEvent, TransportResult,
    UnixServerTransportProvider, UnixTransportBuilder,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const SERVER_NAME: &str = "mcp-uds-demo";

/// Answers `initialize`, `ping`, `tools/list` and `tools/call`.
#[derive(Debug)]
pub(crate) struct Calculator {
    protocol_versions: &'static [&'static str],
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct AddArgs {
    a: f64,
    b: f64,
}

impl Calculator {
    pub(crate) fn new(protocol_versions: &'static [&'static str]) -> Self {
        Self { protocol_versions }
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": self.protocol_versions.first().copied().unwrap_or_default(),
            "capabilities": { "tools": {} },
            "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
        })
    }

    fn list_tools() -> Value {
        json!({
            "tools": [{
                "name": "add",
                "description": "Add two numbers",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "a": { "type": "number" },
                        "b": { "type": "number" }
                    },
                    "required": ["a", "b"]
                }
            }]
        })
    }

    fn call_tool(params: Option<&Value>) -> Result<Value, JsonRpcError> {
        let params = params.cloned().unwrap_or(Value::Null);
        let call: CallParams = serde_json::from_value(params)
            .map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?;
        match call.name.as_str() {
            "add" => {
                let args: AddArgs = serde_json::from_value(call.arguments)
                    .map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?;
                let sum = args.a + args.b;
                Ok(json!({
                    "content": [{ "type": "text", "text": sum.to_string() }],
                    "isError": false
                }))
            }
            other => Err(JsonRpcError::invalid_params(&format!("unknown tool: {other}"))),
        }
    }
}

#[async_trait]
impl MessageHandler for Calculator {
    async fn handle(&self, message: JsonRpcMessage) -> TransportResult<Option<JsonRpcMessage>> {
        let request = match message {
            JsonRpcMessage::Request(request) => request,
            other => {
                debug!(method = ?other.method(), "ignoring non-request message");
                return Ok(None);
            }
        };

        let outcome = match request.method.as_str() {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(json!("pong")),
            "tools/list" => Ok(Self::list_tools()),
            "tools/call" => Self::call_tool(request.params.as_ref()),
            other => Err(JsonRpcError::method_not_found(other)),
        };

        let reply = match outcome {
            Ok(result) => JsonRpcMessage::success(result, request.id),
            Err(error) => {
                debug!(method = %request.method, code = error.code, "request failed");
                JsonRpcMessage::error(error, Some(request.id))
            }
        };
        Ok(Some(reply))
    }
}

pub(crate) async fn run(socket: PathBuf, restart: bool) -> anyhow::Result<()> {
    let config = UnixTransportBuilder::new_server()
        .with_env()?
        .socket_path(socket)
        .restart_on_disconnect(restart)
        .config()
        .clone();

    let provider = UnixServerTransportProvider::bind(config)
        .await
        .context("failed to prepare socket path")?;
    let events = provider
        .subscribe_events()
        .context("event stream already taken")?;
    let closed = forward_events(events);

    provider
        .attach_handler(Calculator::new(provider.protocol_versions()))
        .await
        .with_context(|| format!("failed to listen on {}", provider.socket_path().display()))?;
    info!(path = %provider.socket_path().display(), restart, "calculator server ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for Ctrl-C")?;
            info!("shutting down");
        }
        _ = closed => {
            info!("session ended");
        }
    }

    provider.close_gracefully().await?;
    Ok(())
}

/// Log transport events in the background. The receiver fires on `Closed`,
/// or when the event stream ends.
fn forward_events(mut events: mpsc::Receiver<TransportEvent>) -> oneshot::Receiver<()> {
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut closed_tx = Some(closed_tx);
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Error { error, context } => {
                    warn!(%error, ?context, "transport error");
                }
                TransportEvent::Closed => {
                    if let Some(tx) = closed_tx.take() {
                        let _ = tx.send(());
                    }
                }
                other => debug!(event = ?other, "transport event"),
            }
        }
    });
    closed_rx
}
