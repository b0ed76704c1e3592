//! Line-delimited JSON-RPC over stdio and TCP
//!
//! Each connection reads one request per line and writes one response per
//! line. A connection that calls `subscribe` also receives
//! `notifications/nowPlaying` lines interleaved with its responses.

use std::sync::Arc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};

use super::message::{notification, Request, Response, RpcError};
use crate::error::ServerError;
use crate::playback::PlaybackNotice;
use crate::server::{method_info, MidiServer, METHODS};

/// MCP protocol revision announced by `initialize`
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const NOW_PLAYING: &str = "notifications/nowPlaying";

/// Per-connection state
#[derive(Default)]
struct Connection {
    feed: Option<broadcast::Receiver<PlaybackNotice>>,
}

/// Serve one client until it closes its input
pub async fn serve_connection<R, W>(
    server: Arc<MidiServer>,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut connection = Connection::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(response) = process_line(&server, &mut connection, &line).await {
                    write_json(&mut writer, &response).await?;
                }
            }
            Some(notice) = next_notice(&mut connection.feed) => {
                let params = serde_json::to_value(&notice).unwrap_or(Value::Null);
                write_json(&mut writer, &notification(NOW_PLAYING, params)).await?;
            }
        }
    }

    log::debug!("Connection closed");
    Ok(())
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Wait for the next notice; pends forever when not subscribed
async fn next_notice(
    feed: &mut Option<broadcast::Receiver<PlaybackNotice>>,
) -> Option<PlaybackNotice> {
    let Some(rx) = feed.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(notice) => return Some(notice),
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Subscriber lagged, {} notices dropped", skipped);
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Handle one input line; `None` when no response is due
async fn process_line(
    server: &Arc<MidiServer>,
    connection: &mut Connection,
    line: &str,
) -> Option<Response> {
    let request = match Request::parse(line) {
        Ok(request) => request,
        Err(rejected) => {
            log::warn!("Rejected request: {}", rejected.error.message);
            return Some(Response::failure(rejected.id, rejected.error));
        }
    };

    let id = request.id.clone();
    let outcome = dispatch(server, connection, request).await;
    // Notifications never get a reply, even on error
    let id = id?;
    Some(match outcome {
        Ok(result) => Response::success(Some(id), result),
        Err(error) => Response::failure(Some(id), error),
    })
}

async fn dispatch(
    server: &Arc<MidiServer>,
    connection: &mut Connection,
    request: Request,
) -> Result<Value, RpcError> {
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "tools": {} },
        })),
        "ping" => Ok(json!({})),
        "subscribe" => {
            connection.feed = Some(server.feed().subscribe());
            log::debug!("Connection subscribed to playback feed");
            Ok(json!({ "subscribed": true }))
        }
        "unsubscribe" => {
            let was = connection.feed.take().is_some();
            Ok(json!({ "subscribed": false, "wasSubscribed": was }))
        }
        "tools/list" => Ok(json!({ "tools": tool_list() })),
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params("missing tool name"))?
                .to_string();
            if method_info(&name).is_none() {
                return Err(RpcError::invalid_params(format!("unknown tool '{}'", name)));
            }
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or(Value::Null);

            Ok(match run_blocking(server, name, arguments).await {
                Ok(result) => json!({
                    "content": [{ "type": "text", "text": result.to_string() }],
                    "structuredContent": result,
                    "isError": false,
                }),
                Err(error) => json!({
                    "content": [{ "type": "text", "text": error.message }],
                    "isError": true,
                }),
            })
        }
        method if method.starts_with("notifications/") => Ok(Value::Null),
        _ => run_blocking(server, request.method, request.params).await,
    }
}

/// Run a dispatch method on the blocking pool
async fn run_blocking(
    server: &Arc<MidiServer>,
    method: String,
    params: Value,
) -> Result<Value, RpcError> {
    let server = Arc::clone(server);
    let joined = tokio::task::spawn_blocking(move || {
        let result = server.handle(&method, params);
        if let Err(e) = &result {
            log::warn!("{} failed: {}", method, e);
        }
        result.map_err(|e: ServerError| RpcError::from(&e))
    })
    .await;

    match joined {
        Ok(result) => result,
        Err(e) => Err(RpcError::internal(e)),
    }
}

/// MCP tool descriptors for every dispatch method
pub fn tool_list() -> Vec<Value> {
    METHODS
        .iter()
        .map(|m| {
            let properties: serde_json::Map<String, Value> = m
                .params
                .iter()
                .map(|(name, kind, _)| (name.to_string(), json!({ "type": kind })))
                .collect();
            let required: Vec<&str> = m
                .params
                .iter()
                .filter(|(_, _, required)| *required)
                .map(|(name, _, _)| *name)
                .collect();
            json!({
                "name": m.name,
                "description": m.description,
                "inputSchema": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            })
        })
        .collect()
}

/// Serve JSON-RPC on stdin/stdout
pub async fn serve_stdio(server: Arc<MidiServer>) -> std::io::Result<()> {
    log::info!("Serving JSON-RPC on stdio");
    serve_connection(server, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Accept TCP clients forever, one task per connection
pub async fn serve_tcp(server: Arc<MidiServer>, addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("Serving JSON-RPC on tcp://{}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await?;
        log::info!("Client connected: {}", peer);
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let (reader, writer) = socket.into_split();
            if let Err(e) = serve_connection(server, reader, writer).await {
                log::warn!("Connection {} ended with error: {}", peer, e);
            }
            log::info!("Client disconnected: {}", peer);
        });
    }
}
