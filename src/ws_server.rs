//! Client-facing WebSocket listener: accepts connections, authenticates the
//! `hello` handshake, and dispatches frames into the `EventHub`/`Orchestrator`
//! pair.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::AgentKind;
use crate::event_hub::{ByeReason, ClientFrame, ErrorCode, ServerFrame};
use crate::types::{AgentRequest, SafetyMode};
use crate::AppContext;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind and serve until a shutdown signal arrives (SIGTERM/Ctrl-C). Each
/// accepted connection runs in its own task; the hub and orchestrator are
/// shared behind `Arc` across all of them.
pub async fn serve(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let addr = format!("127.0.0.1:{}", ctx.config.ws_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "weave websocket server listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping websocket server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "accept error");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Constant-time comparison so a wrong bearer token cannot be narrowed down
/// by response timing.
fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Maps an [`OrchestratorError`](crate::orchestrator::OrchestratorError)'s
/// code to a wire [`ErrorCode`]. Returns `None` for codes that carry no
/// direct client-facing error frame — `crisis` is delivered entirely
/// through events.
fn wire_error_code(code: &str) -> Option<ErrorCode> {
    Some(match code {
        "overloaded" => ErrorCode::Overloaded,
        "deadline-exceeded" => ErrorCode::DeadlineExceeded,
        "no-target" => ErrorCode::NoTarget,
        "circuit-open" => ErrorCode::CircuitOpen,
        "blocked-content" => ErrorCode::BlockedContent,
        "invalid-request" => ErrorCode::InvalidRequest,
        "internal" => ErrorCode::Internal,
        "crisis" => return None,
        _ => ErrorCode::Internal,
    })
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(4 * 1024 * 1024),
        max_frame_size: Some(1024 * 1024),
        ..Default::default()
    };
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut stream) = ws.split();

    let first = tokio::time::timeout(HELLO_TIMEOUT, stream.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(t)))) => t,
        _ => return Ok(()),
    };
    let hello: ClientFrame = match serde_json::from_str(&text) {
        Ok(frame) => frame,
        Err(_) => {
            let _ = sink.send(frame_to_message(&ServerFrame::error(ErrorCode::InvalidRequest, "expected hello frame", None))).await;
            return Ok(());
        }
    };
    let ClientFrame::Hello { owner_id, token } = hello else {
        let _ = sink.send(frame_to_message(&ServerFrame::error(ErrorCode::Unauthenticated, "hello must be the first frame", None))).await;
        return Ok(());
    };
    if !ctx.config.ws_auth_token.is_empty() && !tokens_equal(&token, &ctx.config.ws_auth_token) {
        let _ = sink.send(frame_to_message(&ServerFrame::error(ErrorCode::Unauthenticated, "invalid token", None))).await;
        return Ok(());
    }

    let connection_id = Uuid::new_v4().to_string();
    let mut rx = ctx.hub.connect(&connection_id, &owner_id).await;
    debug!(peer = %peer, connection_id = %connection_id, owner_id, "client connected");

    let welcome = ServerFrame::Welcome { instance_id: ctx.hub.instance_id().to_string(), server_time: chrono::Utc::now().timestamp_millis() };
    sink.send(frame_to_message(&welcome)).await?;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = dispatch_frame(&text, &owner_id, &connection_id, &ctx).await {
                            if sink.send(frame_to_message(&reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, err = %e, "websocket error");
                        break;
                    }
                    _ => {}
                }
            }
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sink.send(frame_to_message(&frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    ctx.hub.disconnect(&connection_id, ByeReason::ServerShutdown).await;
    debug!(connection_id = %connection_id, "client disconnected");
    Ok(())
}

fn frame_to_message(frame: &ServerFrame) -> Message {
    Message::Text(serde_json::to_string(frame).unwrap_or_default())
}

/// Handles one text frame after the `hello` handshake. Returns a frame to
/// send back immediately, or `None` when the reply (if any) already went
/// out through the hub's event stream.
async fn dispatch_frame(text: &str, owner_id: &str, connection_id: &str, ctx: &Arc<AppContext>) -> Option<ServerFrame> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => return Some(ServerFrame::error(ErrorCode::InvalidRequest, format!("malformed frame: {e}"), None)),
    };

    match frame {
        ClientFrame::Hello { .. } => Some(ServerFrame::error(ErrorCode::InvalidRequest, "hello already completed", None)),
        ClientFrame::Subscribe { topics, since } => match ctx.hub.subscribe(connection_id, topics.clone(), since).await {
            Ok(()) => Some(ServerFrame::Subscribed { topics }),
            Err(_) => Some(ServerFrame::error(ErrorCode::Internal, "subscribe failed", None)),
        },
        ClientFrame::Unsubscribe { topics } => {
            let _ = ctx.hub.unsubscribe(connection_id, topics).await;
            None
        }
        ClientFrame::Ping => Some(ServerFrame::Pong { server_time: chrono::Utc::now().timestamp_millis() }),
        ClientFrame::Request { conversation_id, request_id, payload, safety_mode, deadline_ms } => {
            handle_request(owner_id, conversation_id, request_id, payload, safety_mode, deadline_ms, ctx).await
        }
    }
}

async fn handle_request(
    owner_id: &str,
    conversation_id: String,
    request_id: String,
    payload: serde_json::Value,
    safety_mode: SafetyMode,
    deadline_ms: i64,
    ctx: &Arc<AppContext>,
) -> Option<ServerFrame> {
    let request = AgentRequest {
        request_id: request_id.clone(),
        conversation_id,
        agent_kind: AgentKind::Input,
        payload,
        deadline: chrono::Utc::now() + chrono::Duration::milliseconds(deadline_ms.max(0)),
        safety_mode,
    };

    match ctx.orchestrator.handle(request, owner_id).await {
        Ok(_) => None,
        Err(err) => wire_error_code(err.error_code())
            .map(|code| ServerFrame::error(code, err.to_string(), Some(request_id))),
    }
}
