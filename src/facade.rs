//! Cache Facade.
//!
//! The public surface: `get`, `set`, `delete`, `invalidate`, `close`.
//! Orchestrates the Gateway, Local Store, Coordinator and Listener, and is
//! the only component that knows the full read/write sequence. Cheap to
//! clone (an `Arc`-backed handle), matching the teacher's `ConnectionPool`
//! being `Clone` so callers share one instance across tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::codec::{BincodeCodec, Codec};
use crate::config::Config;
use crate::coordinator::{Coordinator, LoadOutcome, Reservation};
use crate::error::{CacheError, Result};
use crate::gateway::Gateway;
use crate::listener::{self, ListenerHandle};
use crate::local_store::{LocalStore, Lookup};
use crate::metrics::{FacadeCounters, Stats};
use crate::model::LocalEntry;

/// The longest key this facade will accept. Keys are opaque bytes, not
/// strings, so the bound is expressed in bytes rather than characters.
const MAX_KEY_LEN: usize = 8192;

/// What a loader produced: a value to cache, or one that the facade must
/// hand back to the caller without ever writing to the backend or the
/// local tier. Every single-flight waiter still receives the same value
/// either way.
#[derive(Debug, Clone)]
pub enum Loaded<V> {
    /// Cache the value with the call's effective TTL.
    Value(V),
    /// Return the value to every current caller, but never persist it.
    DoNotCache(V),
}

/// The caller-supplied source of truth for a missing key. Implemented for
/// any `Fn() -> Fut` closure, matching the teacher's `BackingStore` trait
/// in shape (an async trait with a blanket closure impl), so callers
/// rarely need to name this trait directly.
#[async_trait]
pub trait Loader<V>: Send + Sync {
    /// Produce a value, or the sentinel meaning "do not cache".
    async fn load(&self) -> std::result::Result<Loaded<V>, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl<V, F, Fut> Loader<V> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Loaded<V>, Box<dyn std::error::Error + Send + Sync>>>
        + Send,
    V: Send,
{
    async fn load(&self) -> std::result::Result<Loaded<V>, Box<dyn std::error::Error + Send + Sync>> {
        self().await
    }
}

/// Per-key exclusion for `set`, so overlapping upserts on the same key in
/// the same process never race: each caller still runs its own upsert,
/// just not concurrently with another caller's. Grounded in the teacher's
/// `DistributedMutex`/`LockHolder` (`enterprise::cache::lock`), simplified
/// to an in-process `tokio::sync::Mutex` per key rather than a fenced,
/// cross-process lock.
#[derive(Default)]
struct WriteLocks {
    locks: DashMap<Vec<u8>, Arc<AsyncMutex<()>>>,
}

impl WriteLocks {
    fn lock_for(&self, key: &[u8]) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

struct Inner {
    config: Config,
    gateway: Gateway,
    local_store: Arc<LocalStore>,
    coordinator: Coordinator,
    counters: Arc<FacadeCounters>,
    write_locks: WriteLocks,
    listener: AsyncMutex<Option<ListenerHandle>>,
    reaper: AsyncMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// The public cache client. Cheaply cloneable; every clone shares the same
/// pool, local tier, listener and in-flight tickets.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl Cache {
    /// Connect to the backend, ensure its schema exists, and (unless
    /// `disable_notify`) start the notification listener and the local
    /// store's reaper task.
    #[instrument(skip(config), fields(object_prefix = %config.object_prefix))]
    pub async fn connect(config: Config) -> Result<Self> {
        let gateway = Gateway::connect(
            &config.dsn,
            config.pool_size,
            &config.object_prefix,
            &config.channel(),
            config.gateway_timeout,
        )
        .await?;

        let local_store = Arc::new(LocalStore::new(config.local_max_entries));
        let counters = Arc::new(FacadeCounters::default());

        let listener = if config.disable_notify {
            None
        } else {
            Some(listener::spawn(
                gateway.pool().clone(),
                config.channel(),
                local_store.clone(),
                counters.clone(),
                config.listener_reconnect_backoff,
            ))
        };

        let reaper = {
            let local_store = local_store.clone();
            let interval = config.reaper_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    local_store.reap_expired();
                }
            })
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                local_store,
                coordinator: Coordinator::new(),
                counters,
                write_locks: WriteLocks::default(),
                listener: AsyncMutex::new(listener),
                reaper: AsyncMutex::new(Some(reaper)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Read a key, invoking `loader` on a miss. Uses the default
    /// (version-tagged bincode) codec and the configured default TTL.
    /// `deadline`, if set, cancels the whole call (returning
    /// [`CacheError::Cancelled`]) once it elapses.
    pub async fn get<V, L, Fut>(
        &self,
        key: &[u8],
        deadline: Option<Duration>,
        loader: L,
    ) -> Result<V>
    where
        V: Serialize + DeserializeOwned + Send,
        L: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<Loaded<V>, Box<dyn std::error::Error + Send + Sync>>>
            + Send,
    {
        self.get_with(key, None, deadline, &BincodeCodec, &loader).await
    }

    /// Like [`Cache::get`], overriding the TTL applied to a freshly loaded
    /// value.
    pub async fn get_with_ttl<V, L, Fut>(
        &self,
        key: &[u8],
        ttl: Duration,
        deadline: Option<Duration>,
        loader: L,
    ) -> Result<V>
    where
        V: Serialize + DeserializeOwned + Send,
        L: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<Loaded<V>, Box<dyn std::error::Error + Send + Sync>>>
            + Send,
    {
        self.get_with(key, Some(ttl), deadline, &BincodeCodec, &loader)
            .await
    }

    /// Full form: a pluggable codec and an explicit TTL override. This is
    /// the method the convenience wrappers above delegate to. `deadline`
    /// races the whole operation against `tokio::time::sleep`, per this
    /// crate's cancellation contract: every public operation accepts a
    /// deadline, and an elapsed one surfaces as [`CacheError::Cancelled`]
    /// rather than blocking forever.
    #[instrument(skip(self, codec, loader), fields(key_len = key.len()))]
    pub async fn get_with<V, C, L>(
        &self,
        key: &[u8],
        ttl: Option<Duration>,
        deadline: Option<Duration>,
        codec: &C,
        loader: &L,
    ) -> Result<V>
    where
        C: Codec<V>,
        L: Loader<V>,
    {
        with_deadline(deadline, self.get_with_inner(key, ttl, codec, loader)).await
    }

    async fn get_with_inner<V, C, L>(
        &self,
        key: &[u8],
        ttl: Option<Duration>,
        codec: &C,
        loader: &L,
    ) -> Result<V>
    where
        C: Codec<V>,
        L: Loader<V>,
    {
        self.ensure_open()?;
        validate_key(key)?;

        // Captured before `lookup()` runs, since a hit there evicts an
        // expired entry in place — by the time a gateway failure below
        // would want to fall back to it, `lookup()` would already have
        // popped it.
        let stale_candidate = self.inner.config.serve_stale_on_error.then(|| {
            self.inner.local_store.peek_stale(key)
        });

        if let Lookup::Hit(local) = self.inner.local_store.lookup(key) {
            self.inner.counters.record_local_hit();
            return codec.decode(&local.value);
        }
        self.inner.counters.record_local_miss();

        match self.inner.gateway.read(key).await {
            Ok(Some(entry)) => {
                if let Some(bytes) = entry.value {
                    self.install_local(key, bytes.clone(), entry.version, entry.expires_at);
                    return codec.decode(&bytes);
                }
            }
            Ok(None) => {}
            Err(err) => {
                if let Some(Some(stale)) = stale_candidate {
                    warn!(%err, "backend unavailable, serving stale local entry");
                    return codec.decode(&stale.value);
                }
                return Err(err);
            }
        }

        let effective_ttl = ttl.or(self.inner.config.default_ttl);

        loop {
            match self.inner.coordinator.reserve(key) {
                Reservation::Initiator(guard) => {
                    let outcome = loader.load().await;
                    return match outcome {
                        Ok(Loaded::Value(value)) => {
                            let bytes = match codec.encode(&value) {
                                Ok(bytes) => bytes,
                                Err(err) => {
                                    guard.complete(Err(rehydrate_error(&err)));
                                    return Err(err);
                                }
                            };
                            match self
                                .inner
                                .gateway
                                .upsert(key, Some(&bytes), effective_ttl)
                                .await
                            {
                                Ok(version) => {
                                    let expires_at = effective_ttl
                                        .and_then(|d| chrono::Duration::from_std(d).ok())
                                        .map(|d| Utc::now() + d);
                                    self.install_local(key, bytes.clone(), version, expires_at);
                                    guard.complete(Ok(LoadOutcome {
                                        bytes,
                                        version: Some(version),
                                        expires_at,
                                    }));
                                    Ok(value)
                                }
                                Err(err) => {
                                    guard.complete(Err(rehydrate_error(&err)));
                                    Err(err)
                                }
                            }
                        }
                        Ok(Loaded::DoNotCache(value)) => {
                            let bytes = match codec.encode(&value) {
                                Ok(bytes) => bytes,
                                Err(err) => {
                                    guard.complete(Err(rehydrate_error(&err)));
                                    return Err(err);
                                }
                            };
                            guard.complete(Ok(LoadOutcome {
                                bytes,
                                version: None,
                                expires_at: None,
                            }));
                            Ok(value)
                        }
                        Err(source) => {
                            let err = CacheError::LoaderError(source);
                            guard.complete(Err(rehydrate_error(&err)));
                            Err(err)
                        }
                    };
                }
                Reservation::Waiter(mut rx) => match Coordinator::wait(&mut rx).await {
                    Some(Ok(outcome)) => return codec.decode(&outcome.bytes),
                    Some(Err(err)) => return Err(rehydrate_error(&err)),
                    None => continue,
                },
            }
        }
    }

    /// Encode `value`, upsert it, and install it locally with the version
    /// the backend assigned. Overlapping `set` calls on the same key in
    /// this process are serialized so upserts never race. `deadline`, if
    /// set, cancels the call once it elapses.
    pub async fn set<V>(
        &self,
        key: &[u8],
        value: &V,
        ttl: Option<Duration>,
        deadline: Option<Duration>,
    ) -> Result<()>
    where
        V: Serialize,
    {
        self.set_with(key, value, ttl, deadline, &BincodeCodec).await
    }

    /// [`Cache::set`] with a pluggable codec.
    #[instrument(skip(self, value, codec), fields(key_len = key.len()))]
    pub async fn set_with<V, C>(
        &self,
        key: &[u8],
        value: &V,
        ttl: Option<Duration>,
        deadline: Option<Duration>,
        codec: &C,
    ) -> Result<()>
    where
        C: Codec<V>,
    {
        with_deadline(deadline, self.set_with_inner(key, value, ttl, codec)).await
    }

    async fn set_with_inner<V, C>(
        &self,
        key: &[u8],
        value: &V,
        ttl: Option<Duration>,
        codec: &C,
    ) -> Result<()>
    where
        C: Codec<V>,
    {
        self.ensure_open()?;
        validate_key(key)?;

        let lock = self.inner.write_locks.lock_for(key);
        let _guard = lock.lock().await;

        let bytes = codec.encode(value)?;
        let effective_ttl = ttl.or(self.inner.config.default_ttl);
        let version = self
            .inner
            .gateway
            .upsert(key, Some(&bytes), effective_ttl)
            .await?;
        let expires_at = effective_ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        self.install_local(key, bytes, version, expires_at);
        Ok(())
    }

    /// Delete a key from the backend and remove its local entry
    /// unconditionally. Safe on absent keys. `deadline`, if set, cancels
    /// the call once it elapses.
    #[instrument(skip(self), fields(key_len = key.len()))]
    pub async fn delete(&self, key: &[u8], deadline: Option<Duration>) -> Result<()> {
        with_deadline(deadline, self.delete_inner(key)).await
    }

    async fn delete_inner(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        validate_key(key)?;

        let lock = self.inner.write_locks.lock_for(key);
        let _guard = lock.lock().await;

        self.inner.gateway.delete(key).await?;
        self.inner.local_store.invalidate(key);
        Ok(())
    }

    /// Remove only the local entry for a key. Never touches the backend;
    /// this is the listener's primitive, exposed for callers who want to
    /// force a local refresh.
    pub fn invalidate(&self, key: &[u8]) {
        self.inner.local_store.invalidate(key);
    }

    /// A point-in-time snapshot of the observable counters.
    pub fn stats(&self) -> Stats {
        self.inner
            .counters
            .snapshot(&self.inner.gateway, &self.inner.coordinator)
    }

    /// Best-effort shutdown: stops the reaper and listener tasks, waits
    /// (up to a bounded deadline) for in-flight loader tickets to drain,
    /// and closes the connection pool. Operations after `close()` fail
    /// with [`CacheError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.inner.listener.lock().await.take() {
            handle.shutdown().await;
        }
        if let Some(task) = self.inner.reaper.lock().await.take() {
            task.abort();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.inner.coordinator.in_flight_count() > 0 && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        self.inner.gateway.pool().close().await;
    }

    fn install_local(
        &self,
        key: &[u8],
        value: Vec<u8>,
        version: i64,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) {
        self.inner.local_store.install(
            key.to_vec(),
            LocalEntry {
                value,
                version,
                expires_at,
                inserted_at: Utc::now(),
            },
        );
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

/// Race `fut` against `deadline`, the way SPEC_FULL's cancellation
/// contract prescribes: a passed-in `Duration` raced with
/// `tokio::time::sleep` via `tokio::select!`. `None` means no deadline.
async fn with_deadline<Fut, T>(deadline: Option<Duration>, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match deadline {
        None => fut.await,
        Some(d) => {
            tokio::select! {
                result = fut => result,
                _ = tokio::time::sleep(d) => Err(CacheError::Cancelled),
            }
        }
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::EncodingError("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CacheError::EncodingError(format!(
            "key length {} exceeds the {MAX_KEY_LEN}-byte bound",
            key.len()
        )));
    }
    Ok(())
}

/// A ticket result holds an `Arc<CacheError>` shared across waiters, and
/// `CacheError` is not `Clone` (its `LoaderError` variant wraps a boxed
/// trait object). Waiters get a structurally equivalent error instead of
/// the original source.
fn rehydrate_error(err: &CacheError) -> CacheError {
    match err {
        CacheError::BackendUnavailable(s) => CacheError::BackendUnavailable(s.clone()),
        CacheError::EncodingError(s) => CacheError::EncodingError(s.clone()),
        CacheError::LoaderError(e) => CacheError::LoaderError(e.to_string().into()),
        CacheError::Cancelled => CacheError::Cancelled,
        CacheError::Closed => CacheError::Closed,
        CacheError::ConfigError(s) => CacheError::ConfigError(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        let err = validate_key(b"").unwrap_err();
        assert!(matches!(err, CacheError::EncodingError(_)));
    }

    #[test]
    fn oversized_key_is_rejected() {
        let key = vec![0u8; MAX_KEY_LEN + 1];
        let err = validate_key(&key).unwrap_err();
        assert!(matches!(err, CacheError::EncodingError(_)));
    }

    #[test]
    fn ordinary_key_is_accepted() {
        assert!(validate_key(b"tenant:42").is_ok());
    }

    #[test]
    fn rehydrated_loader_error_preserves_message() {
        let original = CacheError::LoaderError("upstream exploded".into());
        let copy = rehydrate_error(&original);
        assert_eq!(original.to_string(), copy.to_string());
    }

    #[tokio::test]
    async fn elapsed_deadline_cancels_a_slow_operation() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        };
        let err = with_deadline(Some(Duration::from_millis(10)), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
    }

    #[tokio::test]
    async fn no_deadline_lets_the_operation_finish() {
        let fast = async { Ok::<_, CacheError>(42) };
        let value = with_deadline(None, fast).await.unwrap();
        assert_eq!(value, 42);
    }
}
