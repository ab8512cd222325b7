//! Distributed contact-enrichment library.
//!
//! Many independent server processes share one PostgreSQL database and one
//! backlog of business leads. Each process claims disjoint batches of leads
//! (advisory locks, no broker), scrapes each lead's website with a bounded
//! pool of headless Chromium instances, and merges the extracted contact
//! data into the `lead_contacts` table.
//!
//! # Modules
//!
//! - [`claim`] - transaction-scoped batch claiming against the backlog
//! - [`sink`] - idempotent, mergeable write-back of scrape results
//! - [`pool`] - bounded, self-healing browser pool
//! - [`browser`] - chromiumoxide implementation of the pool's driver traits
//! - [`extract`] - the seam to the contact-extraction heuristics
//! - [`registry`] - per-server heartbeat rows for the dashboard

pub mod browser;
pub mod claim;
pub mod config;
pub mod error;
pub mod extract;
pub mod pool;
pub mod registry;
pub mod sink;
pub mod types;

pub use claim::{ClaimedBatch, WorkClaimCoordinator};
pub use config::{BrowserLaunchConfig, Config, PoolConfig};
pub use error::DbWriteError;
pub use extract::{ContactExtractor, ExtractedContacts, HrefContactExtractor};
pub use pool::{BrowserDriver, BrowserHandle, BrowserInstance, BrowserPool, PoolError};
pub use registry::{ServerRegistry, ServerStats};
pub use sink::{BatchWriteReport, ResultSink};
pub use types::{ContactRecord, ScrapeStatus, WorkItem};
