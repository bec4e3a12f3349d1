//! ffqueue: a transcoding job queue.
//!
//! Tasks are queued in a store, dispatched by the [`scheduler`] up to a
//! concurrency ceiling and run by the [`pipeline`] through optional
//! pre-processing, the external transcoder and optional post-processing.
//! The [`watchfolder`] monitor turns files dropped into watched directories
//! into tasks once their size has settled.

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod placeholder;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transcoder;
pub mod watchfolder;

pub use engine::{Engine, Stores};
pub use error::{Error, Result};
