//! Tiled inference core: tile geometry, splitting, merging and the request
//! store that correlates asynchronous tile outputs with their job.

pub mod config;
pub mod error;
pub mod geometry;
pub mod job;
pub mod logging;
pub mod merger;
pub mod orchestrator;
pub mod reshape;
pub mod splitter;
pub mod store;

pub use error::{TilingError, TilingResult};
