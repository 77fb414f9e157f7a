//! Shared types for FastDL
//!
//! This crate contains the data structures shared between the download
//! engine and its consumers: chunk ranges, lifecycle states, error codes,
//! the event stream payloads, and engine settings.

use serde::{Deserialize, Serialize};

/// Hard ceiling on the number of simultaneous connections per session
pub const MAX_SIMULTANEOUS_CONNECTIONS: usize = 6;

/// Connection count used when the caller does not configure one
pub const DEFAULT_SIMULTANEOUS_CONNECTIONS: usize = 5;

/// Redirect hops followed by the prober when the caller does not say otherwise
pub const DEFAULT_MAX_REDIRECTS: u32 = 3;

/// Stable identifier of a top-level chunk, dense from 0 within a session
pub type ChunkId = u32;

// ============================================================================
// Chunk Types
// ============================================================================

/// One planned byte range of the remote resource.
///
/// `end` is inclusive. `None` means the range runs to the end of a resource
/// whose length is unknown, in which case the chunk is fetched without a
/// `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub id: ChunkId,
    pub start: u64,
    pub end: Option<u64>,
}

impl ChunkRange {
    pub fn new(id: ChunkId, start: u64, end: u64) -> Self {
        Self {
            id,
            start,
            end: Some(end),
        }
    }

    /// A single chunk covering the whole resource, length unknown
    pub fn unbounded(id: ChunkId) -> Self {
        Self {
            id,
            start: 0,
            end: None,
        }
    }

    /// Number of bytes in this range, `None` when unbounded
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    pub fn is_unbounded(&self) -> bool {
        self.end.is_none()
    }

    /// Value for the HTTP `Range` header, `None` for an unbounded range
    /// starting at zero (plain GET).
    pub fn range_header_value(&self) -> Option<String> {
        match self.end {
            Some(end) => Some(format!("bytes={}-{}", self.start, end)),
            None if self.start > 0 => Some(format!("bytes={}-", self.start)),
            None => None,
        }
    }
}

/// Lifecycle of a single chunk worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Connecting,
    /// Paused on TLS validation errors, waiting for the caller's decision
    PendingValidation,
    Streaming,
    /// A sub-range finished and the next one has not been requested yet
    Draining,
    Completed,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Completed | WorkerState::Failed)
    }
}

/// Lifecycle of a whole download session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Resolving,
    Downloading,
    /// Every chunk reached a terminal state (some may have failed)
    Finished,
    /// The probe failed; no chunk was ever spawned
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// Machine-readable failure category carried by error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TooManyRedirects,
    UnreachableHost,
    Timeout,
    ProtocolError,
    SslValidationFailed,
    ChunkTransportError,
}

impl ErrorCode {
    /// Prober-level failures end the session before any chunk is planned
    pub fn is_session_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::TooManyRedirects
                | ErrorCode::UnreachableHost
                | ErrorCode::Timeout
                | ErrorCode::ProtocolError
        )
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events raised by a download session, in the order described on
/// `FastDownloader::subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DownloadEvent {
    Redirected {
        url: String,
    },
    Resolved {
        url: String,
    },
    Progress {
        bytes_received: u64,
        bytes_total: Option<u64>,
    },
    ChunkProgress {
        id: ChunkId,
        bytes_received: u64,
        bytes_total: Option<u64>,
    },
    /// Bytes are buffered for the chunk; pull them with `read_chunk`
    ChunkReady {
        id: ChunkId,
    },
    ChunkFinished {
        id: ChunkId,
    },
    ChunkError {
        id: ChunkId,
        code: ErrorCode,
        message: String,
    },
    SslErrors {
        id: ChunkId,
        errors: Vec<String>,
    },
    /// The probe failed; `Finished` follows immediately
    Failed {
        code: ErrorCode,
        message: String,
    },
    Finished,
}

impl DownloadEvent {
    pub fn is_finished(&self) -> bool {
        matches!(self, DownloadEvent::Finished)
    }

    /// Chunk this event belongs to, if any
    pub fn chunk_id(&self) -> Option<ChunkId> {
        match self {
            DownloadEvent::ChunkProgress { id, .. }
            | DownloadEvent::ChunkReady { id }
            | DownloadEvent::ChunkFinished { id }
            | DownloadEvent::ChunkError { id, .. }
            | DownloadEvent::SslErrors { id, .. } => Some(*id),
            _ => None,
        }
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Requested number of simultaneous connections (clamped to the maximum)
    pub connections: usize,
    /// Optional upper bound, in bytes, for a single range request
    pub chunk_size_limit: Option<u64>,
    /// Redirect hops the prober may follow
    pub max_redirects: u32,
    /// Extra headers forwarded on the probe and every range request
    pub headers: Vec<(String, String)>,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// How long a chunk paused on TLS errors waits for an override
    pub ssl_decision_timeout_secs: u64,
    /// Accept invalid certificates for every request, probe included
    pub accept_invalid_certs: bool,
    /// Capacity of the worker-to-coordinator channel
    pub worker_channel_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connections: DEFAULT_SIMULTANEOUS_CONNECTIONS,
            chunk_size_limit: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            headers: Vec::new(),
            user_agent: "FastDL/0.1".to_string(),
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            ssl_decision_timeout_secs: 30,
            accept_invalid_certs: false,
            worker_channel_capacity: 64,
        }
    }
}
