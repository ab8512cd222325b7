//! Scraper server binary internals, exported as a library so integration
//! tests can drive the orchestrator directly.

pub mod orchestrator;

pub use orchestrator::{Orchestrator, RunSummary};
