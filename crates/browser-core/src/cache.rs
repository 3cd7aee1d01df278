//! External cache discipline for the at-most-once request pipeline.
//!
//! Grounded on `original_source/backend-server/app/model/memcached.py`:
//! `hashed_key` (sha256 over `cbor2.dumps(parts)`), the 900 KB size
//! cutoff, and the "silently unavailable" fallback. Generalised per
//! spec.md §4.4 into a `CacheDriver` trait so the real KV client and a
//! fake for tests share one call surface, plus an explicit periodic
//! availability probe (the original checks availability once at
//! construction only).
//!
//! The probe loop's shape — a `tokio::select!` over an interval tick and
//! a shutdown signal — follows the teacher's `requiem::server` watchdog
//! task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ciborium::value::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::fingerprint::Fingerprint;

/// How often [`Bump::current`] re-reads the salt from the external cache.
pub const BUMP_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Payloads at or above this size are never written to the cache.
pub const MAX_CACHED_PAYLOAD_BYTES: usize = 900 * 1024;

/// How often [`Cache::run_probe_loop`] re-checks backend availability
/// during the first five minutes after startup.
pub const PROBE_INTERVAL_WARMUP: Duration = Duration::from_secs(1);
/// Steady-state probe interval after the warmup window elapses.
pub const PROBE_INTERVAL_STEADY: Duration = Duration::from_secs(5 * 60);
/// Length of the warmup window itself.
pub const PROBE_WARMUP_WINDOW: Duration = Duration::from_secs(5 * 60);

/// The external KV operations a concrete backend (memcached, redis, ...)
/// implements. `probe` is a cheap liveness check, separate from
/// `get`/`set` so the probe loop doesn't need a real key round-trip.
#[async_trait]
pub trait CacheDriver: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: Vec<u8>);
    async fn probe(&self) -> bool;
}

/// A `CacheDriver` that is always unavailable; the zero-configuration
/// default so the pipeline degrades to fully uncached rather than
/// failing to boot.
pub struct NullCacheDriver;

#[async_trait]
impl CacheDriver for NullCacheDriver {
    async fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }
    async fn set(&self, _key: &str, _value: Vec<u8>) {}
    async fn probe(&self) -> bool {
        false
    }
}

/// Wraps a [`CacheDriver`] with availability tracking and the
/// size/fingerprint discipline spec.md §4.4 specifies.
pub struct Cache {
    driver: Arc<dyn CacheDriver>,
    available: AtomicBool,
}

impl Cache {
    pub fn new(driver: Arc<dyn CacheDriver>) -> Self {
        Self {
            driver,
            available: AtomicBool::new(false),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Fetch a previously stored response payload, keyed by fingerprint.
    /// Returns `None` both on a genuine miss and whenever the backend is
    /// unavailable — callers cannot and should not distinguish the two.
    pub async fn get_data(&self, key: &Fingerprint) -> Option<Vec<u8>> {
        if !self.is_available() {
            return None;
        }
        self.driver.get(&key.to_hex()).await
    }

    /// Store a response payload under its fingerprint, unless it exceeds
    /// [`MAX_CACHED_PAYLOAD_BYTES`] or the backend is unavailable.
    pub async fn store_data(&self, key: &Fingerprint, payload: Vec<u8>) {
        if !self.is_available() || payload.len() >= MAX_CACHED_PAYLOAD_BYTES {
            return;
        }
        self.driver.set(&key.to_hex(), payload).await;
    }

    /// A raw key/value round-trip for callers (the bump salt) that don't
    /// address the cache by fingerprint.
    pub async fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        if !self.is_available() {
            return None;
        }
        self.driver.get(key).await
    }

    /// Jump entries are addressed by name, not fingerprint — a small,
    /// version-scoped table, not a per-request cache.
    pub async fn get_jump(&self, name: &str, version_egs: u32) -> Option<JumpEntry> {
        if !self.is_available() {
            return None;
        }
        let bytes = self.driver.get(&jump_key(name, version_egs)).await?;
        JumpEntry::decode(&bytes).ok()
    }

    pub async fn set_jump(&self, name: &str, version_egs: u32, entry: &JumpEntry) {
        if !self.is_available() {
            return;
        }
        self.driver
            .set(&jump_key(name, version_egs), entry.encode())
            .await;
    }

    /// Runs until `shutdown` fires, re-probing the driver on the warmup/
    /// steady-state cadence from spec.md §4.4.
    pub async fn run_probe_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let start = tokio::time::Instant::now();
        let mut interval = tokio::time::interval(PROBE_INTERVAL_WARMUP);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let ok = self.driver.probe().await;
                    self.available.store(ok, Ordering::Relaxed);
                    if start.elapsed() >= PROBE_WARMUP_WINDOW && interval.period() != PROBE_INTERVAL_STEADY {
                        interval = tokio::time::interval(PROBE_INTERVAL_STEADY);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

fn jump_key(name: &str, version_egs: u32) -> String {
    format!("jump:{version_egs}:{name}")
}

#[cfg(test)]
impl Cache {
    /// Force availability for a test without needing a real probe loop
    /// tick. Only compiled for tests; other crates' test modules reach
    /// it via `crate::cache::Cache::mark_available_for_test`.
    pub fn mark_available_for_test(&self) {
        self.available.store(true, Ordering::Relaxed);
    }
}

/// An in-memory, always-available `CacheDriver`, shared by other
/// modules' tests (e.g. [`crate::data_router`]'s cache-hit test) so each
/// doesn't need its own fake.
#[cfg(test)]
pub mod tests_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct AvailableDriver {
        store: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl CacheDriver for AvailableDriver {
        async fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.store.lock().unwrap().get(key).cloned()
        }
        async fn set(&self, key: &str, value: Vec<u8>) {
            self.store.lock().unwrap().insert(key.to_string(), value);
        }
        async fn probe(&self) -> bool {
            true
        }
    }
}

/// `[stick, left, right]`, the canonical jump-entry encoding spec.md
/// §4.4 specifies, grounded on
/// `original_source/backend-server/app/data/focusjump.py`'s jump-lookup
/// triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpEntry {
    pub stick: String,
    pub left: u64,
    pub right: u64,
}

impl JumpEntry {
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Text(self.stick.clone()),
            Value::Integer(self.left.into()),
            Value::Integer(self.right.into()),
        ])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.to_value(), &mut buf).expect("jump entry always encodes");
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let value: Value = ciborium::de::from_reader(bytes).map_err(|_| CacheError::MalformedJumpEntry)?;
        let Value::Array(items) = value else {
            return Err(CacheError::MalformedJumpEntry);
        };
        let [stick, left, right] = <[Value; 3]>::try_from(items).map_err(|_| CacheError::MalformedJumpEntry)?;
        let stick = stick.into_text().map_err(|_| CacheError::MalformedJumpEntry)?;
        let left = left
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or(CacheError::MalformedJumpEntry)?;
        let right = right
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or(CacheError::MalformedJumpEntry)?;
        Ok(Self { stick, left, right })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("malformed jump entry")]
    MalformedJumpEntry,
}

struct BumpState {
    value: String,
    fetched_at: Option<Instant>,
}

/// The global invalidation salt folded into every data fingerprint
/// (spec.md §4.3, §4.4). Read from the external cache under
/// `{prefix}:bump`, at most every [`BUMP_REFRESH_INTERVAL`]; an optional
/// `bump-on-restart` suffix makes every process start invalidate the
/// whole cache by construction, without touching the shared key.
pub struct Bump {
    prefix: String,
    state: AsyncMutex<BumpState>,
}

impl Bump {
    /// `restart_token` is only consulted when `bump_on_restart` is set;
    /// pass e.g. the process start time formatted by the caller.
    pub fn new(prefix: impl Into<String>, bump_on_restart: bool, restart_token: &str) -> Self {
        let mut prefix = prefix.into();
        if bump_on_restart {
            prefix = format!("{prefix}-{restart_token}");
        }
        Self {
            prefix,
            state: AsyncMutex::new(BumpState { value: String::new(), fetched_at: None }),
        }
    }

    /// The (possibly restart-suffixed) prefix this bump was configured
    /// with — also the fingerprint's `prefix` component.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The current salt value, refreshing from `cache` first if the last
    /// read is older than [`BUMP_REFRESH_INTERVAL`] (or there has been no
    /// read yet). A cache miss or unavailable backend leaves the salt at
    /// whatever it was last (`""` before the first successful read).
    pub async fn current(&self, cache: &Cache) -> String {
        let mut state = self.state.lock().await;
        let stale = state.fetched_at.map(|t| t.elapsed() >= BUMP_REFRESH_INTERVAL).unwrap_or(true);
        if stale {
            let key = format!("{}:bump", self.prefix);
            if let Some(bytes) = cache.get_raw(&key).await {
                state.value = String::from_utf8_lossy(&bytes).into_owned();
            }
            state.fetched_at = Some(Instant::now());
        }
        state.value.clone()
    }
}
