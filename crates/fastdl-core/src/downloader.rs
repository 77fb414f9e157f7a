//! Public download handle
//!
//! A [`FastDownloader`] owns one session. It is configured before `start`,
//! then observed through its event stream and accessors while the session
//! coordinator runs on the tokio runtime.

use crate::config::{clamp_connections, normalize_settings, validate_settings};
use crate::engine::{parse_target, Coordinator, SessionShared};
use crate::transport::{ReqwestTransport, Transport};
use bytes::Bytes;
use fastdl_types::{
    ChunkId, DownloadEvent, ErrorCode, SessionState, Settings, WorkerState,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

/// Bytes drained from one chunk, with the offsets needed to place them.
///
/// `head + pos` is the absolute offset of `data[0]` in the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    pub id: ChunkId,
    /// Start offset of the chunk
    pub head: u64,
    /// Bytes of the chunk consumed before this read
    pub pos: u64,
    pub data: Bytes,
}

impl ChunkData {
    /// Absolute offset where `data` belongs
    pub fn offset(&self) -> u64 {
        self.head + self.pos
    }
}

/// Handle to a single parallel chunked download
pub struct FastDownloader {
    url: String,
    settings: Settings,
    transport: Option<Arc<dyn Transport>>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    session_id: Uuid,
    started: bool,
    task: Option<JoinHandle<()>>,
}

impl FastDownloader {
    /// Create a downloader for `url` following at most `max_redirects` hops
    pub fn new(url: impl Into<String>, max_redirects: u32) -> Self {
        Self::with_settings(
            url,
            Settings {
                max_redirects,
                ..Settings::default()
            },
        )
    }

    /// Create a downloader with explicit settings
    pub fn with_settings(url: impl Into<String>, settings: Settings) -> Self {
        let settings = normalize_settings(settings);
        Self {
            url: url.into(),
            shared: Arc::new(SessionShared::new(settings.connections)),
            settings,
            transport: None,
            cancel: CancellationToken::new(),
            session_id: Uuid::new_v4(),
            started: false,
            task: None,
        }
    }

    /// Use `transport` instead of the default reqwest client
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set connection count and chunk size limit. Ignored once started.
    pub fn configure(&mut self, connections: usize, chunk_size_limit: Option<u64>) -> bool {
        self.set_number_of_simultaneous_connections(connections)
            && self.set_chunk_size_limit(chunk_size_limit)
    }

    pub fn set_number_of_simultaneous_connections(&mut self, connections: usize) -> bool {
        if self.started {
            warn!("Ignoring connection count change on a started download");
            return false;
        }
        let clamped = clamp_connections(connections);
        if clamped != connections {
            warn!("Requested {} connections, using {}", connections, clamped);
        }
        self.settings.connections = clamped;
        self.shared.inner.lock().connections = clamped;
        true
    }

    pub fn set_chunk_size_limit(&mut self, chunk_size_limit: Option<u64>) -> bool {
        if self.started {
            warn!("Ignoring chunk size limit change on a started download");
            return false;
        }
        self.settings.chunk_size_limit = chunk_size_limit.filter(|limit| *limit > 0);
        true
    }

    /// Receive every event raised from now on, in order.
    ///
    /// A session raises, in order: `Redirected` per hop, then either
    /// `Failed` + `Finished`, or `Resolved` followed by per-chunk events and
    /// a single `Finished` after every chunk reached a terminal state.
    /// Cancelled sessions raise nothing further.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        self.shared.hub.subscribe()
    }

    /// Start the session. Returns false, raising no event, when already
    /// started, when the URL is invalid, or when no tokio runtime is running.
    pub fn start(&mut self) -> bool {
        if self.started {
            warn!("Download of {} already started", self.url);
            return false;
        }

        let url = match parse_target(&self.url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Not starting: {}", e);
                return false;
            }
        };

        if let Err(e) = validate_settings(&self.settings) {
            warn!("Not starting: {}", e);
            return false;
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Not starting {}: {}", url, e);
                return false;
            }
        };

        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => match ReqwestTransport::new(&self.settings) {
                Ok(transport) => Arc::new(transport) as Arc<dyn Transport>,
                Err(e) => {
                    error!("Not starting {}: {}", url, e);
                    return false;
                }
            },
        };

        let span = info_span!("session", id = %self.session_id, url = %url);
        let coordinator = Coordinator::new(
            url,
            self.settings.clone(),
            transport,
            self.shared.clone(),
            self.cancel.clone(),
        );

        self.started = true;
        self.task = Some(runtime.spawn(coordinator.run().instrument(span)));
        true
    }

    /// Cancel the session. Workers are dropped, buffered data stays readable
    /// and no further event is raised.
    pub fn abort(&self) {
        if !self.started || self.state().is_terminal() {
            return;
        }
        info!("Aborting session {}", self.session_id);
        self.shared.cancel();
        self.cancel.cancel();
    }

    /// Wait for the coordinator task to end
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Session task failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Session accessors
    // ------------------------------------------------------------------

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn max_redirects(&self) -> u32 {
        self.settings.max_redirects
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Final URL after redirects, once resolved
    pub fn resolved_url(&self) -> Option<Url> {
        self.shared.inner.lock().resolved_url.clone()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.shared.inner.lock().content_length
    }

    pub fn is_simultaneous_download_possible(&self) -> bool {
        self.shared.inner.lock().simultaneous
    }

    /// Requested count before resolution, planned chunk count after
    pub fn number_of_simultaneous_connections(&self) -> usize {
        self.shared.inner.lock().connections
    }

    pub fn chunk_size_limit(&self) -> Option<u64> {
        self.settings.chunk_size_limit
    }

    /// Sum of bytes received across all chunks
    pub fn bytes_received(&self) -> u64 {
        self.shared.inner.lock().bytes_received
    }

    /// True when the probe failed or any chunk failed
    pub fn is_error(&self) -> bool {
        self.shared.inner.lock().error.is_some()
    }

    /// First error recorded for the session
    pub fn error(&self) -> Option<ErrorCode> {
        self.shared.inner.lock().error
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.state().is_terminal()
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.inner.lock().resolved_url.is_some()
    }

    /// Whether the `Finished` event was raised
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Finished | SessionState::Failed
        )
    }

    // ------------------------------------------------------------------
    // Chunk accessors
    // ------------------------------------------------------------------

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.shared
            .inner
            .lock()
            .chunks
            .iter()
            .map(|slot| slot.range.id)
            .collect()
    }

    /// Start offset of the chunk in the resource
    pub fn head(&self, id: ChunkId) -> Option<u64> {
        self.shared.inner.lock().chunk(id).map(|slot| slot.range.start)
    }

    /// Bytes of the chunk already drained by the caller
    pub fn pos(&self, id: ChunkId) -> Option<u64> {
        self.shared.inner.lock().chunk(id).map(|slot| slot.consumed)
    }

    /// Buffered bytes not yet drained
    pub fn bytes_available(&self, id: ChunkId) -> usize {
        self.shared
            .inner
            .lock()
            .chunk(id)
            .map_or(0, |slot| slot.buffer.len())
    }

    /// Drain the chunk's buffer
    pub fn read_all(&self, id: ChunkId) -> Bytes {
        self.read_chunk(id).map(|chunk| chunk.data).unwrap_or_default()
    }

    /// Drain the chunk's buffer together with its head and position
    pub fn read_chunk(&self, id: ChunkId) -> Option<ChunkData> {
        let mut inner = self.shared.inner.lock();
        let slot = inner.chunk_mut(id)?;
        let data = slot.buffer.split().freeze();
        let chunk = ChunkData {
            id,
            head: slot.range.start,
            pos: slot.consumed,
            data,
        };
        slot.consumed += chunk.data.len() as u64;
        Some(chunk)
    }

    pub fn chunk_state(&self, id: ChunkId) -> Option<WorkerState> {
        self.shared.inner.lock().chunk(id).map(|slot| slot.state)
    }

    pub fn chunk_bytes_received(&self, id: ChunkId) -> Option<u64> {
        self.shared.inner.lock().chunk(id).map(|slot| slot.received)
    }

    pub fn chunk_error(&self, id: ChunkId) -> Option<ErrorCode> {
        self.shared.inner.lock().chunk(id).and_then(|slot| slot.error)
    }

    /// TLS errors the chunk last paused on
    pub fn chunk_ssl_errors(&self, id: ChunkId) -> Vec<String> {
        self.shared
            .inner
            .lock()
            .chunk(id)
            .map(|slot| slot.ssl_errors.clone())
            .unwrap_or_default()
    }

    /// Let a chunk paused on TLS errors continue. Returns false when the
    /// chunk is not waiting for a decision.
    pub fn ignore_ssl_errors(&self, id: ChunkId) -> bool {
        let decision = {
            let mut inner = self.shared.inner.lock();
            match inner.chunk_mut(id) {
                Some(slot) if slot.state == WorkerState::PendingValidation => {
                    slot.ssl_decision.take()
                }
                _ => None,
            }
        };

        match decision {
            Some(decision) => {
                info!("Ignoring SSL errors for chunk {}", id);
                decision.send(()).is_ok()
            }
            None => false,
        }
    }
}

impl Drop for FastDownloader {
    fn drop(&mut self) {
        self.abort();
    }
}
