//! Embercache core - storage engine, promise coordination, routing and smart
//! client for a distributed in-memory cache.
//!
//! Hosts are deliberately minimal (a bounded-memory LRU plus per-key upload
//! promises); clients carry the smarts: rendezvous host ranking, retries with
//! backoff, and write fan-out.

pub mod client;
pub mod constants;
pub mod error;
pub mod promise;
pub mod rendezvous;
pub mod retry;
pub mod storage;

pub use client::{
    CacheClient, CacheClientConfig, Entry, HostClient, Origin, PostOptions, PostOutcome,
};
pub use error::{CacheError, ClientError, Result};
pub use promise::{Promise, PromiseMap};
pub use rendezvous::{unsalted_hash64, Node, RendezvousRouter, Xxh3Hash64};
pub use retry::{
    cancel_pair, run_with_backoff, Attempt, Backoff, BackoffConfig, CancelHandle, CancelToken,
};
pub use storage::{InMemoryStorage, StoredEntry};
