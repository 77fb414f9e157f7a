//! Download Engine - the parallel chunked downloader
//!
//! - Range probing with observable redirect hops
//! - Near-equal chunk planning with optional bounded windows
//! - One independent worker per chunk, with an SSL override gate
//! - A single-writer coordinator that aggregates and republishes events

mod chunk_worker;
mod planner;
mod prober;
mod session;

pub use planner::*;
pub use prober::*;

pub(crate) use session::{Coordinator, SessionShared};
