//! Request-interception cache for read traffic.
//!
//! Each request is classified by a static route table:
//! - cache-first for static assets
//! - network-first with cache and placeholder fallback for pages and data
//! - pass-through for mutations and dynamic endpoints
//!
//! Entries are tagged with a generation. A new generation is installed
//! into staging and becomes visible all at once on activation, which also
//! purges every other generation.

mod client;
mod layer;
mod routes;
mod storage;
mod traits;

pub use client::CachedHttpClient;
pub use layer::CacheLayer;
pub use routes::{Pattern, RouteTable, Strategy};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheRequest, CacheResult, CacheSource, CachedResponse};
