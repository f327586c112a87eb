//! Telnet ⇄ bridge relay loop for `door` mode.

use super::frame::{client_frame, close_payload, parse_frame, Opcode, Parsed};
use super::handshake;
use super::keys::KeyTranslator;
use super::telnet::{escape_iac, negotiation_preamble, TelnetFilter};
use crate::codepage::{decode_cp437, encode_cp437};
use crate::config::DoorClientConfig;
use crate::error::{BridgeError, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const UNREACHABLE_MESSAGE: &[u8] =
    b"\r\nSorry, could not reach the game bridge. Please try again later.\r\n";
const EXPIRED_MESSAGE: &[u8] =
    b"\r\nYour door session has expired. Please re-enter the door from the menu.\r\n";
const FAILED_MESSAGE: &[u8] = b"\r\nThe door could not be started. Please try again later.\r\n";
const LOST_MESSAGE: &[u8] = b"\r\nThe game bridge closed the connection.\r\n";

/// Connect to the bridge and relay the caller's telnet stream until either
/// side closes.
pub async fn run_door_client<R, W>(
    config: &DoorClientConfig,
    telnet_in: R,
    mut telnet_out: W,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    telnet_out.write_all(&negotiation_preamble()).await?;
    telnet_out.flush().await?;

    let (bridge, leftover) =
        match handshake::connect(&config.bridge_host, config.bridge_port, &config.token).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(
                    host = %config.bridge_host,
                    port = config.bridge_port,
                    error = %e,
                    "Could not reach the game bridge"
                );
                telnet_out.write_all(UNREACHABLE_MESSAGE).await?;
                telnet_out.flush().await?;
                return Err(e);
            }
        };
    info!(host = %config.bridge_host, port = config.bridge_port, "Connected to game bridge");

    relay(bridge, leftover, telnet_in, telnet_out, config.esc_flush()).await
}

enum Event {
    Data {
        opcode: Opcode,
        fin: bool,
        payload: Vec<u8>,
    },
    Ping(Vec<u8>),
    Pong,
    Close(Option<u16>),
}

fn next_event(buf: &mut BytesMut) -> Result<Option<Event>, BridgeError> {
    let (event, consumed) = match parse_frame(buf)? {
        Parsed::Incomplete => return Ok(None),
        Parsed::Data {
            opcode,
            fin,
            payload,
            remaining,
        } => (
            Event::Data {
                opcode,
                fin,
                payload,
            },
            buf.len() - remaining.len(),
        ),
        Parsed::Ping { payload, remaining } => (Event::Ping(payload), buf.len() - remaining.len()),
        Parsed::Pong { remaining, .. } => (Event::Pong, buf.len() - remaining.len()),
        Parsed::Close {
            code,
            reason,
            remaining,
        } => {
            debug!(code = ?code, reason = %reason, "Bridge sent close");
            (Event::Close(code), buf.len() - remaining.len())
        }
    };
    buf.advance(consumed);
    Ok(Some(event))
}

/// Reassembles fragmented bridge messages.
#[derive(Default)]
struct Message {
    opcode: Option<Opcode>,
    bytes: Vec<u8>,
}

impl Message {
    /// Returns the telnet bytes once the final fragment arrives.
    fn push(&mut self, opcode: Opcode, fin: bool, payload: Vec<u8>) -> Option<Vec<u8>> {
        if opcode != Opcode::Continuation {
            self.opcode = Some(opcode);
            self.bytes.clear();
        }
        self.bytes.extend_from_slice(&payload);
        if !fin {
            return None;
        }
        let bytes = std::mem::take(&mut self.bytes);
        match self.opcode.take() {
            Some(Opcode::Binary) => Some(escape_iac(&bytes)),
            _ => Some(escape_iac(&encode_cp437(&String::from_utf8_lossy(&bytes)))),
        }
    }
}

/// Relay an upgraded bridge connection against the telnet stream.
///
/// `leftover` holds bytes read past the handshake response.
pub async fn relay<B, R, W>(
    mut bridge: B,
    leftover: BytesMut,
    mut telnet_in: R,
    mut telnet_out: W,
    esc_flush: Duration,
) -> Result<(), BridgeError>
where
    B: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut filter = TelnetFilter::new();
    let mut keys = KeyTranslator::new();
    let mut frames = leftover;
    let mut message = Message::default();
    let mut input = [0u8; 4096];

    loop {
        while let Some(event) = next_event(&mut frames)? {
            match event {
                Event::Data {
                    opcode,
                    fin,
                    payload,
                } => {
                    if let Some(out) = message.push(opcode, fin, payload) {
                        telnet_out.write_all(&out).await?;
                        telnet_out.flush().await?;
                    }
                }
                Event::Ping(payload) => {
                    bridge.write_all(&client_frame(Opcode::Pong, &payload)).await?;
                }
                Event::Pong => {}
                Event::Close(code) => {
                    let reply = match code {
                        Some(code) => close_payload(code, ""),
                        None => Vec::new(),
                    };
                    let _ = bridge.write_all(&client_frame(Opcode::Close, &reply)).await;
                    let _ = bridge.shutdown().await;
                    match code {
                        Some(CLOSE_POLICY_VIOLATION) => telnet_out.write_all(EXPIRED_MESSAGE).await?,
                        Some(CLOSE_INTERNAL_ERROR) => telnet_out.write_all(FAILED_MESSAGE).await?,
                        _ => {}
                    }
                    telnet_out.flush().await?;
                    info!(code = ?code, "Door session closed by bridge");
                    return Ok(());
                }
            }
        }

        tokio::select! {
            read = telnet_in.read(&mut input) => {
                let n = read?;
                if n == 0 {
                    let close = client_frame(Opcode::Close, &close_payload(CLOSE_NORMAL, ""));
                    let _ = bridge.write_all(&close).await;
                    let _ = bridge.shutdown().await;
                    info!("Caller hung up");
                    return Ok(());
                }
                let data = filter.feed(&input[..n]);
                if let Some((cols, rows)) = filter.take_window_size() {
                    debug!(cols, rows, "Caller reported window size");
                }
                send_text(&mut bridge, &keys.feed(&data)).await?;
            }
            read = bridge.read_buf(&mut frames) => {
                if read? == 0 {
                    telnet_out.write_all(LOST_MESSAGE).await?;
                    telnet_out.flush().await?;
                    info!("Bridge connection ended without close");
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(esc_flush), if keys.has_pending() => {
                send_text(&mut bridge, &keys.flush()).await?;
            }
        }
    }
}

async fn send_text<B>(bridge: &mut B, bytes: &[u8]) -> Result<(), BridgeError>
where
    B: AsyncWrite + Unpin,
{
    if bytes.is_empty() {
        return Ok(());
    }
    let text = decode_cp437(bytes);
    bridge
        .write_all(&client_frame(Opcode::Text, text.as_bytes()))
        .await?;
    Ok(())
}
