//! Raffica: a policy-driven, client-side HTTP response caching engine.
//!
//! An [`engine::Engine`] instance transparently intercepts requests, serves
//! fresh cached responses, and otherwise fetches upstream and stores the
//! result. Caching decisions come from a server-supplied policy kept live
//! over a WebSocket stream (with HTTP poll fallback); concurrent identical
//! fetches are deduplicated across sibling instances over a broadcast bus
//! with liveness heartbeats.

pub mod config;
pub mod dedup;
pub mod engine;
pub mod fetch;
pub mod pipeline;
pub mod policy;
pub mod proxy;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod util;

pub use config::EngineEnv;
pub use engine::{Engine, HostHub, PolicyPersistence};
pub use fetch::{Fetcher, HttpFetcher};
pub use policy::{CachePolicy, CacheSettings, PolicyStore, PrefetchMode};
pub use store::{CachedResponse, ResponseStore, StoreHub, TIMESTAMP_HEADER};
