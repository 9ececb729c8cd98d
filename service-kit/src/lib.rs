//! service-kit: shared client plumbing for backend services.
//!
//! Hot-reloadable client configurations (gRPC, HTTP, Redis, Ethereum JSON-RPC),
//! a Redis connection that rebuilds itself after connection failures, and a
//! batching layer that coalesces `eth_call`s into JSON-RPC batches.
pub mod batcher;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod observability;
pub mod reconnect;
pub mod retry;
pub mod task;

pub use batcher::{BatchConfig, Batcher};
pub use config::{HotConfig, Reloadable};
pub use context::RequestContext;
pub use error::{Error, Result};
pub use reconnect::{ClientFactory, Reconnectable, RefreshOutcome, RefreshPolicy, RefreshState};
pub use retry::{BackoffCfg, BackoffPolicy, ExponentialPolicy};
pub use task::{Resolver, Task};

pub use alloy_primitives;
pub use num_bigint;
pub use redis;
