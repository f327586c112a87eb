//! Client side of the WebSocket opening handshake.

use crate::error::BridgeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::debug;

const MAX_RESPONSE_HEADER: usize = 8 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Random 16-byte `Sec-WebSocket-Key`, base64 encoded.
pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

pub fn build_request(host: &str, port: u16, token: &str, key: &str) -> String {
    format!(
        "GET /?token={token} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        token = urlencoding::encode(token),
    )
}

/// Check the status line and `Sec-WebSocket-Accept` of a response header block.
pub fn validate_response(head: &str, key: &str) -> Result<(), BridgeError> {
    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap_or_default();
    let code = status.split_whitespace().nth(1);
    if code != Some("101") {
        return Err(BridgeError::Handshake(format!(
            "unexpected status line: {}",
            status
        )));
    }

    let expected = derive_accept_key(key.as_bytes());
    let accept = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("sec-websocket-accept")
            .then(|| value.trim())
    });
    match accept {
        Some(value) if value == expected => Ok(()),
        Some(value) => Err(BridgeError::Handshake(format!(
            "accept key mismatch: {}",
            value
        ))),
        None => Err(BridgeError::Handshake(
            "missing Sec-WebSocket-Accept".to_string(),
        )),
    }
}

/// Run the handshake over `stream`.
///
/// Returns any bytes that arrived after the header block; they belong to the
/// first frames and must seed the frame buffer.
pub async fn perform<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    token: &str,
) -> Result<BytesMut, BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    stream
        .write_all(build_request(host, port, token, &key).as_bytes())
        .await?;

    let mut buf = BytesMut::with_capacity(1024);
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_RESPONSE_HEADER {
            return Err(BridgeError::Handshake(
                "response header too large".to_string(),
            ));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(BridgeError::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }
    };

    let head = buf.split_to(header_end + 4);
    let head = String::from_utf8_lossy(&head[..header_end]);
    validate_response(&head, &key)?;
    debug!(leftover = buf.len(), "WebSocket handshake complete");
    Ok(buf)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Connect to the bridge and complete the handshake.
pub async fn connect(
    host: &str,
    port: u16,
    token: &str,
) -> Result<(TcpStream, BytesMut), BridgeError> {
    let connecting = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let leftover = perform(&mut stream, host, port, token).await?;
        Ok::<_, BridgeError>((stream, leftover))
    };
    tokio::time::timeout(CONNECT_TIMEOUT, connecting)
        .await
        .map_err(|_| BridgeError::Handshake(format!("timed out connecting to {}:{}", host, port)))?
}
