//! FastDL Core - Parallel chunked download engine
//!
//! Given a URL, the engine probes the target, splits the transfer into
//! byte-range chunks fetched over independent connections, and hands the
//! received bytes back with their absolute offsets so the caller can write
//! them straight into a pre-sized destination.

mod config;
mod downloader;
mod engine;
mod error;
mod transport;

#[cfg(test)]
mod testing;

pub use config::*;
pub use downloader::*;
pub use engine::*;
pub use error::*;
pub use transport::*;

pub use fastdl_types::*;
