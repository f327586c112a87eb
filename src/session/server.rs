//! WebSocket endpoint: `ws://host:port/?token=<ws_token>`.
//!
//! Each accepted socket gets a writer task draining its [`ClientLink`] and a
//! reader loop feeding the session manager. Bad tokens are closed with 1008
//! before any session state is touched.

use super::manager::SessionManager;
use super::types::{ClientFrame, ClientInput, ClientLink};
use crate::error::{BridgeError, CLOSE_INTERNAL_ERROR};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Close reasons are limited to 123 bytes on the wire.
const MAX_CLOSE_REASON: usize = 123;
/// How long a finished connection waits for its last frames to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Accept WebSocket clients until `shutdown` is cancelled.
pub async fn serve(
    manager: Arc<SessionManager>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    info!(addr = %listener.local_addr()?, "WebSocket endpoint listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        handle_socket(manager, stream, peer).await;
                    });
                }
                Err(e) => warn!(error = %e, "WebSocket accept failed"),
            }
        }
    }
    debug!("WebSocket endpoint stopped accepting");
    Ok(())
}

async fn handle_socket(manager: Arc<SessionManager>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let mut token: Option<String> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        token = request
            .uri()
            .query()
            .and_then(|q| query_param(q, "token"));
        Ok(response)
    };
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let lookup = match token {
        Some(t) => manager.lookup_token(t).await,
        None => Ok(None),
    };
    let row = match lookup {
        Ok(Some(row)) => row,
        Ok(None) => {
            let err = BridgeError::InvalidToken;
            warn!(peer = %peer, error = %err, "Rejecting connection");
            reject(ws, err.close_code(), &err.to_string()).await;
            return;
        }
        Err(e) => {
            error!(peer = %peer, error = %e, "Session lookup failed");
            reject(ws, CLOSE_INTERNAL_ERROR, "Session lookup failed").await;
            return;
        }
    };

    let token = row.ws_token.clone();
    let session_id = row.session_id.clone();
    let (mut sink, mut incoming) = ws.split();
    let (link, mut outbound) = ClientLink::new();
    let link_id = link.id();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let (message, last) = match frame {
                ClientFrame::Text(text) => (Message::Text(text), false),
                ClientFrame::Binary(bytes) => (Message::Binary(bytes), false),
                ClientFrame::Close(code, reason) => (close_message(code, &reason), true),
            };
            if sink.send(message).await.is_err() || last {
                break;
            }
        }
        let _ = sink.close().await;
    });

    info!(peer = %peer, session_id = %session_id, "Client connected");
    if let Err(e) = manager.handle_connection(row, link).await {
        debug!(session_id = %session_id, error = %e, "Connection not attached");
    }

    while let Some(message) = incoming.next().await {
        match message {
            Ok(Message::Text(text)) => {
                manager.client_input(&token, link_id, ClientInput::Text(text))
            }
            Ok(Message::Binary(bytes)) => {
                manager.client_input(&token, link_id, ClientInput::Binary(bytes))
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }
    manager.client_disconnected(&token, link_id);
    info!(peer = %peer, session_id = %session_id, "Client disconnected");

    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn reject(mut ws: WebSocketStream<TcpStream>, code: u16, reason: &str) {
    let _ = ws.send(close_message(code, reason)).await;
    let _ = ws.close(None).await;
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(truncate_reason(reason)),
    }))
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Percent-decoded value of `key`. `+` stays literal, since tokens may be
/// base64 and the door client encodes it as `%2B`.
fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut pieces = pair.splitn(2, '=');
        let name = pieces.next().unwrap_or_default();
        let value = pieces.next().unwrap_or_default();
        if name != key || value.is_empty() {
            return None;
        }
        urlencoding::decode(value).ok().map(Cow::into_owned)
    })
}
