//! Serial-over-TCP transport shared by the emulator adapters.
//!
//! The bridge owns the listening socket; the emulator's virtual COM port
//! connects to it. Bytes written before the emulator connects are queued and
//! flushed once it does. Closing the transport drops the socket, which the
//! emulator sees as carrier loss.

use crate::error::BridgeError;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Callback receiving bytes produced by the emulator.
pub type DataSink = Arc<dyn Fn(Bytes) + Send + Sync>;

const READ_BUFFER_SIZE: usize = 4096;

/// One emulator's serial line.
pub struct TcpTransport {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    sink: Arc<Mutex<Option<DataSink>>>,
    task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Start serving the emulator connection on an already-bound listener.
    pub fn serve(listener: TcpListener, label: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: Arc<Mutex<Option<DataSink>>> = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run_transport(listener, rx, sink.clone(), label));
        Self {
            outbound: Some(tx),
            sink,
            task: Some(task),
        }
    }

    /// Register the callback for emulator output, replacing any previous one.
    pub fn on_data(&self, sink: DataSink) {
        let mut slot = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(sink);
    }

    /// Queue bytes for the emulator.
    pub fn write(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let tx = self.outbound.as_ref().ok_or(BridgeError::TransportClosed)?;
        tx.send(Bytes::copy_from_slice(bytes))
            .map_err(|_| BridgeError::TransportClosed)
    }

    /// Drop the line. Safe to call more than once.
    pub fn close(&mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut slot = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_transport(
    listener: TcpListener,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    sink: Arc<Mutex<Option<DataSink>>>,
    label: String,
) {
    let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(transport = %label, error = %e, "Emulator transport accept failed");
            return;
        }
    };
    // One emulator per transport; stop listening once it is connected.
    drop(listener);
    let _ = stream.set_nodelay(true);
    debug!(transport = %label, peer = %peer, "Emulator connected to transport");

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let callback = {
                            let slot = sink.lock().unwrap_or_else(|e| e.into_inner());
                            slot.clone()
                        };
                        if let Some(callback) = callback {
                            callback(Bytes::copy_from_slice(&buf[..n]));
                        }
                    }
                    Err(e) => {
                        debug!(transport = %label, error = %e, "Emulator transport read failed");
                        break;
                    }
                }
            }
            next = outbound.recv() => {
                match next {
                    Some(bytes) => {
                        if let Err(e) = writer.write_all(&bytes).await {
                            debug!(transport = %label, error = %e, "Emulator transport write failed");
                            break;
                        }
                    }
                    None => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
        }
    }
    debug!(transport = %label, "Emulator transport closed");
}
