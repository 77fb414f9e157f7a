//! Chunk worker - drives one chunk's connection lifecycle
//!
//! Each worker is independent: it requests its range (window by window when
//! a chunk size limit applies), streams the body, and reports everything to
//! the coordinator over a channel. Workers never touch shared aggregate
//! state; they only report their own deltas.

use crate::engine::planner::sub_ranges;
use crate::error::DownloadError;
use crate::transport::{ByteRange, Transport, TransportError, TransportRequest, TransportResponse};
use bytes::Bytes;
use fastdl_types::{ChunkId, ChunkRange, WorkerState};
use futures::StreamExt;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

/// Report sent from a worker to its coordinator
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    State {
        id: ChunkId,
        state: WorkerState,
    },
    Data {
        id: ChunkId,
        bytes: Bytes,
    },
    /// The connection is paused; sending on `decision` lets it proceed
    SslErrors {
        id: ChunkId,
        errors: Vec<String>,
        decision: oneshot::Sender<()>,
    },
    Finished {
        id: ChunkId,
    },
    Failed {
        id: ChunkId,
        error: DownloadError,
    },
}

/// A worker that downloads one top-level chunk
pub(crate) struct ChunkWorker {
    range: ChunkRange,
    url: Url,
    chunk_size_limit: Option<u64>,
    headers: Vec<(String, String)>,
    transport: Arc<dyn Transport>,
    tx: mpsc::Sender<WorkerMessage>,
    ssl_decision_timeout: Duration,
    /// Set once the caller overrides TLS errors; never granted twice
    ssl_overridden: bool,
    /// Bytes received for this chunk across all windows
    position: u64,
    state: WorkerState,
}

impl ChunkWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        range: ChunkRange,
        url: Url,
        chunk_size_limit: Option<u64>,
        headers: Vec<(String, String)>,
        transport: Arc<dyn Transport>,
        tx: mpsc::Sender<WorkerMessage>,
        ssl_decision_timeout: Duration,
    ) -> Self {
        Self {
            range,
            url,
            chunk_size_limit,
            headers,
            transport,
            tx,
            ssl_decision_timeout,
            ssl_overridden: false,
            position: 0,
            state: WorkerState::Idle,
        }
    }

    /// Run the worker to a terminal state
    pub async fn run(mut self) {
        let id = self.range.id;
        info!(
            "Starting chunk {} (bytes {}-{:?})",
            id, self.range.start, self.range.end
        );

        match self.download().await {
            Ok(()) => {
                info!("Chunk {} complete ({} bytes)", id, self.position);
                self.set_state(WorkerState::Completed).await;
                let _ = self.tx.send(WorkerMessage::Finished { id }).await;
            }
            Err(DownloadError::Cancelled) => {
                debug!("Chunk {} stopped, coordinator is gone", id);
            }
            Err(error) => {
                warn!("Chunk {} failed after {} bytes: {}", id, self.position, error);
                self.set_state(WorkerState::Failed).await;
                let _ = self.tx.send(WorkerMessage::Failed { id, error }).await;
            }
        }
    }

    async fn download(&mut self) -> Result<(), DownloadError> {
        let mut windows = sub_ranges(&self.range, self.chunk_size_limit).peekable();

        while let Some(window) = windows.next() {
            self.fetch_window(&window).await?;

            if windows.peek().is_some() {
                debug!(
                    "Chunk {} window ending at {:?} drained, requesting next",
                    self.range.id, window.end
                );
                self.set_state(WorkerState::Draining).await;
            }
        }

        Ok(())
    }

    /// Request one window and stream it to the coordinator
    async fn fetch_window(&mut self, window: &ChunkRange) -> Result<(), DownloadError> {
        let id = self.range.id;
        let range = ByteRange::for_chunk(window);

        self.set_state(WorkerState::Connecting).await;
        let response = self.connect(range).await?;

        let status = response.status;
        let acceptable = if range.is_some() {
            status == StatusCode::PARTIAL_CONTENT
        } else {
            status.is_success()
        };
        if !acceptable {
            return Err(DownloadError::ChunkTransport {
                id,
                message: format!("unexpected HTTP {} for range {:?}", status, range),
            });
        }

        // The served range must start where the window does, or offsets drift
        if let Some(requested) = range {
            match response.content_range() {
                Some((first, last))
                    if first == requested.start
                        && requested.end.map_or(true, |end| end == last) => {}
                served => {
                    return Err(DownloadError::ChunkTransport {
                        id,
                        message: format!(
                            "server sent range {:?} for {}",
                            served,
                            requested.header_value()
                        ),
                    })
                }
            }
        }

        self.set_state(WorkerState::Streaming).await;

        let expected = window.len();
        let mut received = 0u64;
        let mut body = response.body;

        while let Some(piece) = body.next().await {
            let mut bytes = piece.map_err(|e| DownloadError::from_chunk(id, e))?;

            // Never let a chunk spill past its window
            if let Some(expected) = expected {
                let room = expected - received;
                if bytes.len() as u64 > room {
                    bytes.truncate(room as usize);
                }
            }
            if bytes.is_empty() {
                continue;
            }

            let len = bytes.len() as u64;
            received += len;
            self.position += len;
            self.report(WorkerMessage::Data { id, bytes }).await?;

            if Some(received) == expected {
                break;
            }
        }

        match expected {
            Some(expected) if received < expected => Err(DownloadError::ChunkTransport {
                id,
                message: format!(
                    "connection closed after {} of {} bytes",
                    received, expected
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Issue the request, pausing on TLS errors until the caller decides
    async fn connect(&mut self, range: Option<ByteRange>) -> Result<TransportResponse, DownloadError> {
        let id = self.range.id;

        loop {
            let request = TransportRequest::get(self.url.clone())
                .with_range(range)
                .with_headers(&self.headers)
                .ignoring_ssl_errors(self.ssl_overridden);

            let errors = match self.transport.send(request).await {
                Ok(response) => return Ok(response),
                Err(TransportError::Tls(errors)) if !self.ssl_overridden => errors,
                Err(error) => return Err(DownloadError::from_chunk(id, error)),
            };

            warn!("Chunk {} paused on SSL errors: {:?}", id, errors);
            self.set_state(WorkerState::PendingValidation).await;

            let (decision_tx, decision_rx) = oneshot::channel();
            self.report(WorkerMessage::SslErrors {
                id,
                errors: errors.clone(),
                decision: decision_tx,
            })
            .await?;

            match tokio::time::timeout(self.ssl_decision_timeout, decision_rx).await {
                Ok(Ok(())) => {
                    info!("Chunk {} continuing with SSL errors ignored", id);
                    self.ssl_overridden = true;
                    self.set_state(WorkerState::Connecting).await;
                }
                _ => return Err(DownloadError::SslValidationFailed(errors)),
            }
        }
    }

    async fn set_state(&mut self, state: WorkerState) {
        if self.state == state {
            return;
        }
        self.state = state;
        let _ = self
            .tx
            .send(WorkerMessage::State {
                id: self.range.id,
                state,
            })
            .await;
    }

    /// Send a report, treating a closed channel as cancellation
    async fn report(&self, message: WorkerMessage) -> Result<(), DownloadError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| DownloadError::Cancelled)
    }
}
