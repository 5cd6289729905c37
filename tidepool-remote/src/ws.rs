//! WebSocket RPC client implementing [`RemoteApi`].
//!
//! Provides:
//! - Connection setup with background reader/writer tasks
//! - Request-id correlation of out-of-order responses
//! - Failing every outstanding call when the connection drops
//!
//! ```text
//!  call() ──► pending[id] = oneshot ──► outgoing mpsc ──► writer task ──► socket
//!                   ▲                                                      │
//!                   └─────────── reader task ◄── ResponseFrame{id, ..} ◄───┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use tidepool_core::Blob;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::api::{AuthToken, RemoteApi, RemoteError};
use crate::key::RemotePath;
use crate::protocol::{RemoteRequest, RemoteResponse, RequestFrame, ResponseFrame};

type PendingMap = FxHashMap<u64, oneshot::Sender<RemoteResponse>>;
type PendingCalls = Arc<Mutex<PendingMap>>;

/// Lock the pending map. It is never held across an await.
fn lock(pending: &PendingCalls) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a call's pending entry however the call ends, including when
/// the caller's future is dropped by a timeout.
struct PendingEntry<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// A connected WebSocket remote.
pub struct WsRemote {
    url: String,
    outgoing: mpsc::Sender<Outgoing>,
    pending: PendingCalls,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl WsRemote {
    /// Connect to `url` and spawn the reader and writer tasks.
    pub async fn connect(url: impl Into<String>) -> Result<Self, RemoteError> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| {
            log::warn!("connect to {url} failed: {e}");
            RemoteError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(256);
        let pending: PendingCalls = Arc::new(Mutex::new(FxHashMap::default()));
        let closed = Arc::new(AtomicBool::new(false));

        // Writer task: forward outgoing frames to the socket
        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                let message = match outgoing {
                    Outgoing::Frame(data) => Message::Binary(data.into()),
                    Outgoing::Close => Message::Close(None),
                };
                let is_close = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || is_close {
                    break;
                }
            }
        });

        // Reader task: route responses to their callers
        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_url = url.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ResponseFrame::decode(&bytes) {
                            Ok(frame) => {
                                let waiter = lock(&reader_pending).remove(&frame.id);
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(frame.response);
                                    }
                                    None => log::debug!("response for unknown request {}", frame.id),
                                }
                            }
                            Err(e) => log::warn!("dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail everything still waiting
            let dropped = {
                let mut pending = lock(&reader_pending);
                reader_closed.store(true, Ordering::SeqCst);
                let dropped = pending.len();
                pending.clear();
                dropped
            };
            log::info!("disconnected from {reader_url} ({dropped} call(s) failed)");
        });

        log::info!("connected to {url}");
        Ok(Self {
            url,
            outgoing: out_tx,
            pending,
            closed,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a response.
    pub fn outstanding(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send a close frame. Outstanding calls fail once the server
    /// acknowledges.
    pub async fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close).await;
    }

    /// Send one request and wait for its response.
    pub async fn call(
        &self,
        request: RemoteRequest,
        auth: &AuthToken,
    ) -> Result<RemoteResponse, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame {
            id,
            auth: auth.as_str().to_owned(),
            request,
        }
        .encode()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if self.closed.load(Ordering::SeqCst) {
                return Err(RemoteError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        if self.outgoing.send(Outgoing::Frame(frame)).await.is_err() {
            return Err(RemoteError::ConnectionClosed);
        }

        let response = rx.await.map_err(|_| RemoteError::ConnectionClosed)?;
        response.into_result()
    }
}

fn unexpected(response: RemoteResponse) -> RemoteError {
    RemoteError::Protocol(format!("unexpected response: {response:?}"))
}

impl RemoteApi for WsRemote {
    async fn get(
        &self,
        scope: &str,
        path: &RemotePath,
        auth: &AuthToken,
    ) -> Result<Option<Blob>, RemoteError> {
        let request = RemoteRequest::Get {
            scope: scope.to_owned(),
            path: path.clone(),
        };
        match self.call(request, auth).await? {
            RemoteResponse::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn set(
        &self,
        scope: &str,
        path: &RemotePath,
        value: &[u8],
        auth: &AuthToken,
    ) -> Result<(), RemoteError> {
        let request = RemoteRequest::Set {
            scope: scope.to_owned(),
            path: path.clone(),
            value: value.to_vec(),
        };
        match self.call(request, auth).await? {
            RemoteResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn list(
        &self,
        scope: &str,
        path: Option<&RemotePath>,
        auth: &AuthToken,
    ) -> Result<Vec<String>, RemoteError> {
        let request = RemoteRequest::List {
            scope: scope.to_owned(),
            path: path.cloned(),
        };
        match self.call(request, auth).await? {
            RemoteResponse::Keys(keys) => Ok(keys),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 9 (discard) is not expected to run a WebSocket server
        let result = WsRemote::connect("ws://127.0.0.1:9").await;
        assert!(matches!(result, Err(RemoteError::ConnectionClosed)));
    }

    #[test]
    fn test_unexpected_response_is_protocol_error() {
        let err = unexpected(RemoteResponse::Ack);
        assert!(err.to_string().contains("unexpected response"));
    }
}
