//! Signaling over a newline-delimited JSON stream
//!
//! Requests are wrapped in an [`Envelope::Request`] with a fresh id and
//! resolved when the [`Envelope::Response`] carrying that id comes back.
//! Unsolicited [`Envelope::Event`]s are forwarded on a channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_common::io::{read_envelope, write_envelope};
use parley_common::protocol::{Envelope, SignalingEvent, SignalingRequest, SignalingResponse};

use super::Signaling;
use crate::error::{PipelineError, PipelineResult};

/// How long a request may wait for its response
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Requests awaiting a response, keyed by envelope id
type PendingRequests = Arc<Mutex<HashMap<Uuid, oneshot::Sender<SignalingResponse>>>>;

/// Drop every pending sender so waiting requests fail with `TransportClosed`
fn fail_pending(pending: &PendingRequests) {
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
}

/// Signaling client over any byte stream
pub struct SignalingClient {
    cmd_tx: mpsc::UnboundedSender<Envelope>,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    timeout: Duration,
}

impl SignalingClient {
    /// Start the reader and writer tasks over a split stream
    ///
    /// Returns the client and the receiver of server events. Must be called
    /// from within a tokio runtime.
    pub fn connect<R, W>(reader: R, writer: W) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        // Separate tasks so a read is never cancelled mid-line by a select!
        tokio::spawn(reader_task(
            BufReader::new(reader),
            pending.clone(),
            event_tx,
            closed.clone(),
        ));
        tokio::spawn(writer_task(
            writer,
            cmd_rx,
            shutdown_rx,
            pending.clone(),
            closed.clone(),
        ));

        let client = Self {
            cmd_tx,
            pending,
            closed,
            shutdown: Mutex::new(Some(shutdown_tx)),
            timeout: REQUEST_TIMEOUT,
        };
        (client, event_rx)
    }

    /// Override the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the stream and fail every pending request
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.lock().ok().and_then(|mut s| s.take()) {
            let _ = tx.send(());
        }
        fail_pending(&self.pending);
    }

    fn forget(&self, id: &Uuid) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }
}

#[async_trait]
impl Signaling for SignalingClient {
    async fn request(&self, request: SignalingRequest) -> PipelineResult<SignalingResponse> {
        if self.is_closed() {
            return Err(PipelineError::TransportClosed);
        }

        let id = Uuid::new_v4();
        let name = request.name();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        // The reader may have failed everything between the check and insert
        if self.is_closed() {
            self.forget(&id);
            return Err(PipelineError::TransportClosed);
        }

        if self
            .cmd_tx
            .send(Envelope::Request { id, body: request })
            .is_err()
        {
            self.forget(&id);
            return Err(PipelineError::TransportClosed);
        }
        debug!(%id, request = name, "signaling request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(PipelineError::TransportClosed),
            Err(_) => {
                self.forget(&id);
                Err(PipelineError::Signaling(format!("{} timed out", name)))
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Route responses to their pending requests and forward events
async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingRequests,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }

        match read_envelope(&mut reader).await {
            Ok(Some(Envelope::Response { id, body })) => {
                let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => debug!(%id, "response for unknown request"),
                }
            }
            Ok(Some(Envelope::Event { body })) => {
                // The event receiver going away is not fatal for requests
                let _ = event_tx.send(body);
            }
            Ok(Some(Envelope::Request { id, .. })) => {
                warn!(%id, "ignoring request from server");
            }
            Ok(None) => {
                debug!("signaling stream closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "signaling read failed");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending);
}

/// Write queued requests until shutdown or a write error
async fn writer_task<W>(
    mut writer: W,
    mut cmd_rx: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown_rx: oneshot::Receiver<()>,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            Some(envelope) = cmd_rx.recv() => {
                if let Err(e) = write_envelope(&mut writer, &envelope).await {
                    warn!(error = %e, "signaling write failed");
                    break;
                }
            }
            _ = &mut shutdown_rx => break,
            else => break,
        }
    }

    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending);
    let _ = writer.shutdown().await;
}

// =============================================================================
// Tests
// =============================================================================
