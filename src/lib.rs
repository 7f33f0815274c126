//! A distributed read-through cache backed by PostgreSQL.
//!
//! Each process that links this crate gets a local in-memory cache kept
//! coherent with a shared database table through a broadcast-on-mutation
//! protocol built on `LISTEN`/`NOTIFY`. Callers use [`Cache::get`] with a
//! loader closure; concurrent misses for the same key share one loader
//! invocation, and mutations by any process propagate to peers within one
//! round trip of the notification channel.
//!
//! ```no_run
//! # async fn run() -> relaycache::Result<()> {
//! use relaycache::{Cache, Config, Loaded};
//!
//! let config = Config::builder("postgres://localhost/app")
//!     .object_prefix("sessions")
//!     .build()?;
//! let cache = Cache::connect(config).await?;
//!
//! let value: String = cache
//!     .get(b"user:42", None, || async {
//!         Ok(Loaded::Value("expensive lookup result".to_string()))
//!     })
//!     .await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod facade;
pub mod gateway;
pub mod listener;
pub mod local_store;
pub mod metrics;
pub mod model;
pub mod schema;

pub use codec::{BincodeCodec, Codec};
pub use config::{BackoffConfig, Config, ConfigBuilder};
pub use error::{CacheError, Result};
pub use facade::{Cache, Loaded, Loader};
pub use metrics::Stats;
pub use model::{Entry, Event, EventOp};

/// Crate version, as reported in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
