//! Data layer module
//!
//! Handles all data persistence and caching:
//! - SQLite durable store (three collections: posts, queue, settings)
//! - Degraded-mode store handle
//! - Named response caches for the interception proxy
//! - Export/import of local state

mod cache;
mod database;
mod export;
mod models;
mod store;

pub use cache::{CachedResponse, ResponseCache, RUNTIME_CACHE, request_key};
pub use database::{AttemptOutcome, Database};
pub use export::{ExportDocument, ImportReport, export, import};
pub use models::*;
pub use store::StoreHandle;
