//! # ratewarden - A Distributed Token-Bucket Rate Limiter
//!
//! A Redis-backed rate limiter built around atomic, server-side Lua
//! scripts: every `take`/`put`/`get` is a single round trip that reads the
//! store's own clock, drips tokens since the last visit, and (for `take`)
//! consumes atomically - no read-modify-write race between concurrent
//! callers sharing a key.
//!
//! ## Core Components
//!
//! - **[`bucket_config`]** - normalizes raw bucket configuration into resolvable types
//! - **[`resolver`]** - picks the effective bucket parameters for a given key
//! - **[`scripts`]** - the Lua scripts themselves and their reply parsing
//! - **[`store`]** - the `Store` trait and its Redis/cluster implementation
//! - **[`engine`]** - the unwrapped `take`/`wait`/`put`/`get` surface
//! - **[`resilience`]** - retry, timeout, and circuit breaker around the engine; exposes [`RateLimiter`]
//! - **[`ping`]** - background liveness probing and forced reconnects
//! - **[`throttler`]** - ties the above into one service handle; exposes [`Throttler`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ratewarden::{config::Config, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("config")?;
//!     let server = Server::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Request Flow
//!
//! 1. An HTTP request arrives at the Axum server (see [`handlers`]).
//! 2. [`validation`] checks the key and request shape.
//! 3. [`resilience::RateLimiter`] resolves the bucket and issues a Lua
//!    script against the store.
//! 4. The response carries `X-RateLimit-*` headers; a denied `take`
//!    returns `429`.

pub mod bucket_config;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod metrics;
pub mod ping;
pub mod resilience;
pub mod resolver;
pub mod scripts;
pub mod server;
pub mod store;
pub mod throttler;
pub mod validation;

pub use config::Config;
pub use error::ThrottlerError;
pub use resilience::RateLimiter;
pub use throttler::Throttler;

/// Result type alias for throttler operations.
pub type Result<T> = std::result::Result<T, ThrottlerError>;

/// Version of the ratewarden library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
