//! # testhist
//!
//! An async client for the test-history API of a website-testing dashboard,
//! with request coalescing: identical concurrent listings share one HTTP call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use testhist::config::ClientConfig;
//! use testhist::history::{HistoryApi, QueryParams};
//! use testhist::store::{HistoryStore, TracingReporter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::default().with_env_overrides();
//!     let api = HistoryApi::from_config(&config)?;
//!     let store = HistoryStore::new(api, Arc::new(TracingReporter));
//!
//!     store.load(QueryParams::new().page(1).page_size(10)).await?;
//!     println!("{} tests recorded", store.snapshot().total_records);
//!     Ok(())
//! }
//! ```

// ── Wire layer ────────────────────────────────────────────────────────────────
pub mod http;
pub mod transport;

// ── Client layer ──────────────────────────────────────────────────────────────
pub mod auth;
pub mod background;
pub mod cache;
pub mod config;
pub mod fetch;
pub mod history;
pub mod store;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheConfig, CacheKey, RequestCache};
pub use config::{ClientConfig, ConfigError};
pub use fetch::{FetchAdapter, FetchError};
pub use history::{HistoryApi, HistoryPage, QueryParams, TestRecord};
pub use store::{HistoryState, HistoryStore};
