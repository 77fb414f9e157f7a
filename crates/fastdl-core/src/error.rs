//! Error types for FastDL core

use crate::transport::TransportError;
use fastdl_types::{ChunkId, ErrorCode};
use thiserror::Error;

/// Errors that can occur in FastDL core
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Too many redirects (budget {budget})")]
    TooManyRedirects { budget: u32 },

    #[error("Host unreachable: {0}")]
    UnreachableHost(String),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SSL validation failed: {}", .0.join("; "))]
    SslValidationFailed(Vec<String>),

    #[error("Chunk {id} transport error: {message}")]
    ChunkTransport { id: ChunkId, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The coordinator went away; the worker stops without reporting
    #[error("Download was cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DownloadError {
    /// Event-level code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            DownloadError::TooManyRedirects { .. } => ErrorCode::TooManyRedirects,
            DownloadError::UnreachableHost(_) => ErrorCode::UnreachableHost,
            DownloadError::Timeout => ErrorCode::Timeout,
            DownloadError::SslValidationFailed(_) => ErrorCode::SslValidationFailed,
            DownloadError::ChunkTransport { .. } | DownloadError::Cancelled => {
                ErrorCode::ChunkTransportError
            }
            DownloadError::Protocol(_)
            | DownloadError::InvalidUrl(_)
            | DownloadError::Config(_)
            | DownloadError::Io(_)
            | DownloadError::Json(_) => ErrorCode::ProtocolError,
        }
    }

    /// Maps a transport failure seen by the prober.
    pub(crate) fn from_probe(error: TransportError) -> Self {
        match error {
            TransportError::Tls(errors) => DownloadError::SslValidationFailed(errors),
            TransportError::Connect(message) => DownloadError::UnreachableHost(message),
            TransportError::Timeout => DownloadError::Timeout,
            TransportError::Protocol(message) | TransportError::Body(message) => {
                DownloadError::Protocol(message)
            }
        }
    }

    /// Maps a transport failure seen by a chunk worker. Everything except an
    /// un-overridden TLS failure collapses into a chunk transport error.
    pub(crate) fn from_chunk(id: ChunkId, error: TransportError) -> Self {
        DownloadError::ChunkTransport {
            id,
            message: error.to_string(),
        }
    }
}
