//! # Host-Command Cache
//!
//! Bursts of identical, argument-less read commands to a host process (the UI
//! asking every host for its version at once, say) are collapsed onto one
//! round-trip. Callers arriving while that round-trip is still running wait
//! for its answer instead of starting their own. Answers live for
//! [`CACHE_TTL`]; a sweeper started on first insert evicts stale entries every
//! [`SWEEP_INTERVAL`] and stops itself when the cache runs empty.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GatewayError;

pub const CACHE_TTL: Duration = Duration::from_millis(500);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Read-only host commands whose answers may be shared.
pub const CACHEABLE_COMMANDS: &[&str] = &[
    "getRepository",
    "getInstalled",
    "getInstalledAdapter",
    "getVersion",
    "getDiagData",
    "getLocationOnDisk",
    "getDevList",
    "getLogs",
    "getHostInfo",
];

#[derive(Debug)]
struct CacheEntry {
    stored_at: Instant,
    payload: String,
}

type CacheKey = (String, String);

/// What a running round-trip hands to its waiters: the serialized answer or
/// the error text.
type Shared = Option<Result<String, String>>;

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, watch::Receiver<Shared>>,
    sweeping: bool,
}

enum Lookup {
    Hit(String),
    Wait(watch::Receiver<Shared>),
    Lead(watch::Sender<Shared>),
}

/// Clears the in-flight slot even when the leading call is dropped midway.
struct InFlightGuard {
    inner: Arc<Mutex<CacheInner>>,
    key: CacheKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.lock().in_flight.remove(&self.key);
    }
}

#[derive(Debug, Clone)]
pub struct HostCommandCache {
    inner: Arc<Mutex<CacheInner>>,
    shutdown: CancellationToken,
}

fn has_arguments(message: Option<&Value>) -> bool {
    !matches!(message, None | Some(Value::Null))
}

impl HostCommandCache {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            shutdown,
        }
    }

    pub fn is_cacheable(command: &str, message: Option<&Value>) -> bool {
        !has_arguments(message) && CACHEABLE_COMMANDS.contains(&command)
    }

    /// Serves a fresh cached answer or runs `fetch` and caches its success.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        host: &str,
        command: &str,
        message: Option<&Value>,
        fetch: F,
    ) -> Result<Value, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, GatewayError>>,
    {
        if !Self::is_cacheable(command, message) {
            return fetch().await;
        }
        let key = (host.to_string(), command.to_string());

        let lookup = {
            let mut inner = self.inner.lock();
            let fresh = inner
                .entries
                .get(&key)
                .filter(|entry| entry.stored_at.elapsed() < CACHE_TTL)
                .map(|entry| entry.payload.clone());
            match (fresh, inner.in_flight.get(&key)) {
                (Some(payload), _) => Lookup::Hit(payload),
                (None, Some(rx)) => Lookup::Wait(rx.clone()),
                (None, None) => {
                    let (tx, rx) = watch::channel(None);
                    inner.in_flight.insert(key.clone(), rx);
                    Lookup::Lead(tx)
                }
            }
        };

        match lookup {
            Lookup::Hit(payload) => {
                // answer asynchronously even on a hit
                tokio::task::yield_now().await;
                Ok(serde_json::from_str(&payload)?)
            }
            Lookup::Wait(mut rx) => {
                let shared = rx.wait_for(Option::is_some).await.map(|answer| (*answer).clone());
                match shared {
                    Ok(Some(Ok(payload))) => Ok(serde_json::from_str(&payload)?),
                    Ok(Some(Err(message))) => Err(GatewayError::UpstreamFailure(message)),
                    // the leading call was dropped before answering
                    _ => fetch().await,
                }
            }
            Lookup::Lead(tx) => {
                let _guard = InFlightGuard {
                    inner: Arc::clone(&self.inner),
                    key: key.clone(),
                };
                let result = fetch().await;
                let shared = match &result {
                    Ok(value) => serde_json::to_string(value).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Ok(payload) = &shared {
                    self.store(key, payload.clone());
                }
                tx.send_replace(Some(shared));
                result
            }
        }
    }

    fn store(&self, key: CacheKey, payload: String) {
        let start_sweeper = {
            let mut inner = self.inner.lock();
            inner.entries.insert(
                key,
                CacheEntry {
                    stored_at: Instant::now(),
                    payload,
                },
            );
            !std::mem::replace(&mut inner.sweeping, true)
        };
        if start_sweeper {
            self.spawn_sweeper();
        }
    }

    fn spawn_sweeper(&self) {
        debug!("Host cache sweeper started");
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        inner.lock().sweeping = false;
                        return;
                    }
                    _ = interval.tick() => {
                        let mut guard = inner.lock();
                        sweep_entries(&mut guard.entries, Instant::now());
                        if guard.entries.is_empty() {
                            guard.sweeping = false;
                            debug!("Host cache sweeper stopped");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Drops entries older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_entries(&mut self.inner.lock().entries, Instant::now())
    }

    /// Drops every cached answer to `command`, whatever the host.
    pub fn invalidate(&self, command: &str) {
        self.inner.lock().entries.retain(|(_, cmd), _| cmd != command);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sweeping(&self) -> bool {
        self.inner.lock().sweeping
    }
}

fn sweep_entries(entries: &mut HashMap<CacheKey, CacheEntry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| now.saturating_duration_since(entry.stored_at) < CACHE_TTL);
    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn call(cache: &HostCommandCache, calls: &AtomicUsize, command: &str, message: Option<&Value>) -> Value {
        cache
            .get_or_fetch("system.host.pi", command, message, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"version": "5.0.1", "call": n}))
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_ttl_shares_one_round_trip() {
        let cache = HostCommandCache::new(CancellationToken::new());
        let calls = AtomicUsize::new(0);

        let first = call(&cache, &calls, "getVersion", None).await;
        tokio::time::advance(Duration::from_millis(400)).await;
        let second = call(&cache, &calls, "getVersion", None).await;
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        let third = call(&cache, &calls, "getVersion", None).await;
        assert_eq!(third["call"], 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    async fn slow_call(cache: &HostCommandCache, calls: &AtomicUsize, fail: bool) -> Result<Value, GatewayError> {
        cache
            .get_or_fetch("system.host.pi", "getHostInfo", None, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                if fail {
                    Err(GatewayError::UpstreamFailure("host down".into()))
                } else {
                    Ok(json!({"Platform": "linux"}))
                }
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_wait_for_the_running_round_trip() {
        let cache = HostCommandCache::new(CancellationToken::new());
        let calls = AtomicUsize::new(0);

        let answers = futures_util::future::join_all((0..5).map(|_| slow_call(&cache, &calls, false))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for answer in answers {
            assert_eq!(answer.unwrap(), json!({"Platform": "linux"}));
        }
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_share_the_leading_failure() {
        let cache = HostCommandCache::new(CancellationToken::new());
        let calls = AtomicUsize::new(0);

        let (a, b) = tokio::join!(slow_call(&cache, &calls, true), slow_call(&cache, &calls, true));
        assert_eq!(a.unwrap_err().to_string(), "host down");
        assert_eq!(b.unwrap_err().to_string(), "host down");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn arguments_and_unlisted_commands_bypass_cache() {
        let cache = HostCommandCache::new(CancellationToken::new());
        let calls = AtomicUsize::new(0);
        let message = json!({"adapter": "admin"});

        call(&cache, &calls, "getVersion", Some(&message)).await;
        call(&cache, &calls, "getVersion", Some(&message)).await;
        call(&cache, &calls, "upgrade", None).await;
        call(&cache, &calls, "upgrade", None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let cache = HostCommandCache::new(CancellationToken::new());
        let err = cache
            .get_or_fetch("h", "getHostInfo", None, || async {
                Err(GatewayError::UpstreamFailure("host down".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "host down");
        assert!(cache.is_empty());
        assert!(!cache.is_sweeping());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_empties_cache_and_stops() {
        let cache = HostCommandCache::new(CancellationToken::new());
        let calls = AtomicUsize::new(0);
        call(&cache, &calls, "getInstalled", None).await;
        assert!(cache.is_sweeping());
        assert_eq!(cache.len(), 1);

        tokio::time::advance(SWEEP_INTERVAL + Duration::from_millis(10)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(cache.is_empty());
        assert!(!cache.is_sweeping());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_drops_one_command() {
        let cache = HostCommandCache::new(CancellationToken::new());
        let calls = AtomicUsize::new(0);
        call(&cache, &calls, "getRepository", None).await;
        call(&cache, &calls, "getVersion", None).await;
        cache.invalidate("getRepository");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep(), 0);
    }
}
