//! Settings loading and validation
//!
//! Settings are plain JSON; missing fields fall back to their defaults.

use crate::error::DownloadError;
use fastdl_types::{Settings, MAX_SIMULTANEOUS_CONNECTIONS};
use std::path::Path;
use tokio::fs;
use tracing::warn;

/// Parse settings from a JSON document
pub fn settings_from_json(json: &str) -> Result<Settings, DownloadError> {
    let settings: Settings = serde_json::from_str(json)?;
    Ok(normalize_settings(settings))
}

/// Load settings from a JSON file
pub async fn load_settings(path: &Path) -> Result<Settings, DownloadError> {
    let content = fs::read_to_string(path).await?;
    settings_from_json(&content)
}

/// Save settings as pretty-printed JSON
pub async fn save_settings(path: &Path, settings: &Settings) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    fs::write(path, content).await?;
    Ok(())
}

/// Bring settings into the ranges the engine accepts
pub fn normalize_settings(mut settings: Settings) -> Settings {
    let connections = clamp_connections(settings.connections);
    if connections != settings.connections {
        warn!(
            "Requested {} connections, using {}",
            settings.connections, connections
        );
        settings.connections = connections;
    }

    settings.chunk_size_limit = settings.chunk_size_limit.filter(|limit| *limit > 0);
    settings.worker_channel_capacity = settings.worker_channel_capacity.max(1);
    settings
}

pub(crate) fn clamp_connections(connections: usize) -> usize {
    connections.clamp(1, MAX_SIMULTANEOUS_CONNECTIONS)
}

/// Check settings that cannot be silently corrected
pub fn validate_settings(settings: &Settings) -> Result<(), DownloadError> {
    for (name, _) in &settings.headers {
        if name.trim().is_empty() {
            return Err(DownloadError::Config("header name must not be empty".into()));
        }
    }
    if settings.connect_timeout_secs == 0 || settings.read_timeout_secs == 0 {
        return Err(DownloadError::Config("timeouts must be at least one second".into()));
    }
    Ok(())
}
