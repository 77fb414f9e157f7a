//! Session coordinator - probes, plans, spawns workers and aggregates
//!
//! The coordinator task is the single writer of the session's aggregate
//! state. Workers report deltas over a channel; the coordinator folds them
//! into [`SessionInner`] and republishes them as [`DownloadEvent`]s.

use crate::engine::chunk_worker::{ChunkWorker, WorkerMessage};
use crate::engine::planner::{self, ChunkPlan};
use crate::engine::prober::{self, ResolvedTarget};
use crate::error::DownloadError;
use crate::transport::Transport;
use bytes::BytesMut;
use fastdl_types::{
    ChunkId, ChunkRange, DownloadEvent, ErrorCode, SessionState, Settings, WorkerState,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

/// Per-chunk bookkeeping shared with the public handle
pub(crate) struct ChunkSlot {
    pub range: ChunkRange,
    pub state: WorkerState,
    /// Bytes received from the network
    pub received: u64,
    /// Bytes already drained by the caller
    pub consumed: u64,
    pub buffer: BytesMut,
    pub error: Option<ErrorCode>,
    pub ssl_errors: Vec<String>,
    pub ssl_decision: Option<oneshot::Sender<()>>,
}

impl ChunkSlot {
    fn new(range: ChunkRange) -> Self {
        Self {
            range,
            state: WorkerState::Idle,
            received: 0,
            consumed: 0,
            buffer: BytesMut::new(),
            error: None,
            ssl_errors: Vec::new(),
            ssl_decision: None,
        }
    }
}

/// Aggregate session state
pub(crate) struct SessionInner {
    pub state: SessionState,
    pub resolved_url: Option<Url>,
    pub content_length: Option<u64>,
    pub simultaneous: bool,
    pub connections: usize,
    pub bytes_received: u64,
    /// First error recorded for the session
    pub error: Option<ErrorCode>,
    pub chunks: Vec<ChunkSlot>,
}

impl SessionInner {
    pub fn chunk(&self, id: ChunkId) -> Option<&ChunkSlot> {
        self.chunks.get(id as usize)
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut ChunkSlot> {
        self.chunks.get_mut(id as usize)
    }

    fn record_error(&mut self, code: ErrorCode) {
        self.error.get_or_insert(code);
    }

    /// Move to `state` unless the session already ended
    fn advance(&mut self, state: SessionState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        true
    }
}

/// Fan-out of events to every subscriber
#[derive(Default)]
pub(crate) struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DownloadEvent>>>,
    muted: AtomicBool,
}

impl EventHub {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: DownloadEvent) {
        if self.muted.load(Ordering::Acquire) {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        // Re-checked under the lock so nothing is delivered once `mute` returns
        if self.muted.load(Ordering::Acquire) {
            return;
        }
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Suppress every later event
    pub fn mute(&self) {
        let _subscribers = self.subscribers.lock();
        self.muted.store(true, Ordering::Release);
    }
}

/// State shared between the coordinator task and the public handle
pub(crate) struct SessionShared {
    pub inner: Mutex<SessionInner>,
    pub hub: EventHub,
}

impl SessionShared {
    pub fn new(connections: usize) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                resolved_url: None,
                content_length: None,
                simultaneous: false,
                connections,
                bytes_received: 0,
                error: None,
                chunks: Vec::new(),
            }),
            hub: EventHub::default(),
        }
    }

    /// Silence the session and mark it cancelled. Paused chunks lose their
    /// pending SSL decision.
    pub fn cancel(&self) {
        self.hub.mute();
        let mut inner = self.inner.lock();
        inner.advance(SessionState::Cancelled);
        for slot in inner.chunks.iter_mut() {
            slot.ssl_decision = None;
        }
    }
}

/// Drives one session from probe to the terminal event
pub(crate) struct Coordinator {
    url: Url,
    settings: Settings,
    transport: Arc<dyn Transport>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        url: Url,
        settings: Settings,
        transport: Arc<dyn Transport>,
        shared: Arc<SessionShared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            url,
            settings,
            transport,
            shared,
            cancel,
        }
    }

    /// Run until every chunk is terminal, or until cancelled
    pub async fn run(self) {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => self.mark_cancelled(),
            _ = self.drive() => {}
        }
    }

    fn mark_cancelled(&self) {
        self.shared.cancel();
        info!("Session cancelled");
    }

    async fn drive(&self) {
        let hub = &self.shared.hub;
        if !self.shared.inner.lock().advance(SessionState::Resolving) {
            return;
        }
        info!("Resolving {}", self.url);

        let probed = prober::probe(
            self.transport.as_ref(),
            self.url.clone(),
            self.settings.max_redirects,
            &self.settings.headers,
            |url| {
                hub.emit(DownloadEvent::Redirected {
                    url: url.to_string(),
                })
            },
        )
        .await;

        let target = match probed {
            Ok(target) => target,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let plan = planner::plan(
            target.content_length,
            target.accepts_ranges,
            self.settings.connections,
            self.settings.chunk_size_limit,
        );
        self.resolve(&target, &plan);
        hub.emit(DownloadEvent::Resolved {
            url: target.url.to_string(),
        });

        self.download(&target.url, &plan).await;

        if !self.shared.inner.lock().advance(SessionState::Finished) {
            return;
        }
        info!("Session finished");
        hub.emit(DownloadEvent::Finished);
    }

    /// Probe failure: no chunk is planned, the session ends here
    fn fail(&self, e: DownloadError) {
        error!("Probe failed: {}", e);
        let code = e.code();
        {
            let mut inner = self.shared.inner.lock();
            inner.record_error(code);
            if !inner.advance(SessionState::Failed) {
                return;
            }
        }
        self.shared.hub.emit(DownloadEvent::Failed {
            code,
            message: e.to_string(),
        });
        self.shared.hub.emit(DownloadEvent::Finished);
    }

    fn resolve(&self, target: &ResolvedTarget, plan: &ChunkPlan) {
        info!(
            "Planned {} chunk(s) (simultaneous: {}, chunk limit: {:?})",
            plan.connections(),
            plan.simultaneous,
            plan.chunk_size_limit
        );
        let mut inner = self.shared.inner.lock();
        inner.resolved_url = Some(target.url.clone());
        inner.content_length = target.content_length;
        inner.simultaneous = plan.simultaneous;
        inner.connections = plan.connections();
        inner.chunks = plan.chunks.iter().copied().map(ChunkSlot::new).collect();
        inner.advance(SessionState::Downloading);
    }

    /// Spawn one worker per chunk and fold their reports until all are terminal
    async fn download(&self, url: &Url, plan: &ChunkPlan) {
        let (tx, mut rx) = mpsc::channel(self.settings.worker_channel_capacity.max(1));
        let mut workers = JoinSet::new();

        for range in &plan.chunks {
            let worker = ChunkWorker::new(
                *range,
                url.clone(),
                plan.chunk_size_limit,
                self.settings.headers.clone(),
                self.transport.clone(),
                tx.clone(),
                Duration::from_secs(self.settings.ssl_decision_timeout_secs),
            );
            workers.spawn(worker.run());
        }
        drop(tx);

        let mut remaining = plan.chunks.len();
        while remaining > 0 {
            match rx.recv().await {
                Some(message) => {
                    if self.handle(message) {
                        remaining -= 1;
                    }
                }
                None => break,
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Chunk worker panicked: {}", e);
            }
        }

        if remaining > 0 {
            self.fail_unfinished();
        }
    }

    /// Fold one worker report into the aggregate. Returns true when the
    /// report is the chunk's terminal one.
    fn handle(&self, message: WorkerMessage) -> bool {
        let hub = &self.shared.hub;

        match message {
            WorkerMessage::State { id, state } => {
                let mut inner = self.shared.inner.lock();
                if let Some(slot) = inner.chunk_mut(id) {
                    if !slot.state.is_terminal() {
                        slot.state = state;
                    }
                }
                false
            }
            WorkerMessage::Data { id, bytes } => {
                let len = bytes.len() as u64;
                let (chunk_received, chunk_total, total_received, total) = {
                    let mut inner = self.shared.inner.lock();
                    let Some(slot) = inner.chunk_mut(id) else {
                        return false;
                    };
                    slot.buffer.extend_from_slice(&bytes);
                    slot.received += len;
                    let (chunk_received, chunk_total) = (slot.received, slot.range.len());

                    inner.bytes_received += len;
                    (chunk_received, chunk_total, inner.bytes_received, inner.content_length)
                };

                hub.emit(DownloadEvent::ChunkReady { id });
                hub.emit(DownloadEvent::ChunkProgress {
                    id,
                    bytes_received: chunk_received,
                    bytes_total: chunk_total,
                });
                hub.emit(DownloadEvent::Progress {
                    bytes_received: total_received,
                    bytes_total: total,
                });
                false
            }
            WorkerMessage::SslErrors {
                id,
                errors,
                decision,
            } => {
                {
                    let mut inner = self.shared.inner.lock();
                    if let Some(slot) = inner.chunk_mut(id) {
                        slot.state = WorkerState::PendingValidation;
                        slot.ssl_errors = errors.clone();
                        slot.ssl_decision = Some(decision);
                    }
                }
                hub.emit(DownloadEvent::SslErrors { id, errors });
                false
            }
            WorkerMessage::Finished { id } => {
                {
                    let mut inner = self.shared.inner.lock();
                    if let Some(slot) = inner.chunk_mut(id) {
                        slot.state = WorkerState::Completed;
                        slot.ssl_decision = None;
                    }
                }
                hub.emit(DownloadEvent::ChunkFinished { id });
                true
            }
            WorkerMessage::Failed { id, error } => {
                let code = error.code();
                {
                    let mut inner = self.shared.inner.lock();
                    inner.record_error(code);
                    if let Some(slot) = inner.chunk_mut(id) {
                        slot.state = WorkerState::Failed;
                        slot.error = Some(code);
                        slot.ssl_decision = None;
                    }
                }
                hub.emit(DownloadEvent::ChunkError {
                    id,
                    code,
                    message: error.to_string(),
                });
                true
            }
        }
    }

    /// Chunks whose worker vanished without a terminal report
    fn fail_unfinished(&self) {
        let lost: Vec<ChunkId> = {
            let mut inner = self.shared.inner.lock();
            let lost: Vec<ChunkId> = inner
                .chunks
                .iter_mut()
                .filter(|slot| !slot.state.is_terminal())
                .map(|slot| {
                    slot.state = WorkerState::Failed;
                    slot.error = Some(ErrorCode::ChunkTransportError);
                    slot.range.id
                })
                .collect();
            if !lost.is_empty() {
                inner.record_error(ErrorCode::ChunkTransportError);
            }
            lost
        };

        for id in lost {
            warn!("Chunk {} ended without reporting", id);
            self.shared.hub.emit(DownloadEvent::ChunkError {
                id,
                code: ErrorCode::ChunkTransportError,
                message: "worker ended unexpectedly".to_string(),
            });
        }
    }
}
