//! Fixture state cache.
//!
//! A fixture is a reusable sequence of setup steps (typically a login). Running
//! it against a real browser is expensive, so the resulting browser state is
//! captured once, encrypted, stored with a TTL, and injected into later runs.
//!
//! Concurrent misses on the same `(fixture, browser)` key share a single
//! capture: the first caller spawns it, later callers await the same shared
//! future. The in-flight entry is removed when the capture task ends, on every
//! exit path, so a failed capture never locks the key. Forced recaptures are
//! keyed apart from ordinary fills so they never join one that may answer
//! from the cache.

pub mod crypto;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use self::crypto::StateCipher;
use crate::executor::{Browser, FixtureCapturer};
use crate::storage::{self, Pool, StorageError};

/// Failure to fill a cache miss. Cloneable so every waiter receives it.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("fixture {fixture_id} capture failed: {message}")]
    Failed { fixture_id: i64, message: String },
    #[error("fixture {fixture_id} capture timed out after {after:?}")]
    Timeout { fixture_id: i64, after: Duration },
    #[error("fixture {fixture_id} capture aborted: {message}")]
    Aborted { fixture_id: i64, message: String },
    #[error("fixture {0} not found")]
    UnknownFixture(i64),
    #[error("fixture storage unavailable: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureScope {
    /// Reuse captured state until its TTL expires.
    Cached,
    /// Recapture for every use; never read or written to the cache.
    Fresh,
}

impl FixtureScope {
    pub fn as_str(self) -> &'static str {
        match self {
            FixtureScope::Cached => "cached",
            FixtureScope::Fresh => "fresh",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cached" => Some(FixtureScope::Cached),
            // "test" is the legacy name for per-test setup
            "fresh" | "test" => Some(FixtureScope::Fresh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub setup_steps: Vec<serde_json::Value>,
    pub scope: FixtureScope,
    pub cache_ttl_seconds: i64,
}

/// Captured browser state: the page URL plus a storage snapshot (cookies, origins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserState {
    pub url: Option<String>,
    pub storage_state: serde_json::Value,
}

/// A fixture's state ready to inject into an execution.
#[derive(Debug, Clone)]
pub struct ResolvedFixture {
    pub fixture_id: i64,
    pub state: Arc<BrowserState>,
    pub captured_at: DateTime<Utc>,
    /// `None` for fresh-scope fixtures, which are never stored.
    pub expires_at: Option<DateTime<Utc>>,
    pub from_cache: bool,
}

type CaptureResult = Result<ResolvedFixture, CaptureError>;
/// `(fixture, browser, forced)`
type InflightKey = (i64, Browser, bool);
type InflightMap = HashMap<InflightKey, Shared<BoxFuture<'static, CaptureResult>>>;

/// Removes an in-flight entry when the capture task finishes, however it finishes.
struct InflightGuard {
    inflight: Arc<Mutex<InflightMap>>,
    key: InflightKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.key);
    }
}

#[derive(Clone)]
pub struct FixtureCache {
    pool: Pool,
    capturer: Arc<dyn FixtureCapturer>,
    cipher: Arc<dyn StateCipher>,
    capture_timeout: Duration,
    inflight: Arc<Mutex<InflightMap>>,
}

impl FixtureCache {
    pub fn new(
        pool: Pool,
        capturer: Arc<dyn FixtureCapturer>,
        cipher: Arc<dyn StateCipher>,
        capture_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            capturer,
            cipher,
            capture_timeout,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve a fixture's state for `browser`, capturing it on a miss.
    ///
    /// With `force_recapture` the live entry is ignored and replaced.
    pub async fn resolve(
        &self,
        fixture_id: i64,
        browser: &Browser,
        force_recapture: bool,
    ) -> Result<ResolvedFixture, CacheError> {
        let fixture = storage::catalog::get_fixture(&self.pool, fixture_id)
            .await?
            .ok_or(CaptureError::UnknownFixture(fixture_id))?;

        if fixture.scope == FixtureScope::Fresh {
            debug!(fixture_id, %browser, "fresh-scope fixture, capturing without cache");
            return Ok(self.capture(&fixture, browser).await?);
        }

        if !force_recapture {
            if let Some(hit) = self.lookup_live(fixture_id, browser, Utc::now()).await? {
                debug!(fixture_id, %browser, "fixture cache hit");
                return Ok(hit);
            }
        }

        Ok(self.fill_shared(fixture, browser.clone(), force_recapture).await?)
    }

    /// Resolve every fixture a test case needs, in order.
    pub async fn resolve_all(
        &self,
        fixture_ids: &[i64],
        browser: &Browser,
        force_recapture: bool,
    ) -> Result<Vec<ResolvedFixture>, CacheError> {
        let mut resolved = Vec::with_capacity(fixture_ids.len());
        for &id in fixture_ids {
            resolved.push(self.resolve(id, browser, force_recapture).await?);
        }
        Ok(resolved)
    }

    /// Drop cached states for a fixture (all browsers when `browser` is `None`).
    pub async fn invalidate(&self, fixture_id: i64, browser: Option<&Browser>) -> Result<usize, StorageError> {
        let browser = browser.map(|b| b.as_str().to_string());
        let removed = storage::with_conn(&self.pool, move |conn| {
            let n = match browser {
                Some(b) => conn.execute(
                    "DELETE FROM fixture_states WHERE fixture_id = ?1 AND browser = ?2",
                    params![fixture_id, b],
                )?,
                None => conn.execute(
                    "DELETE FROM fixture_states WHERE fixture_id = ?1",
                    params![fixture_id],
                )?,
            };
            Ok(n)
        })
        .await?;
        info!(fixture_id, removed, "fixture cache invalidated");
        Ok(removed)
    }

    /// Delete every state whose TTL has passed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        storage::with_conn(&self.pool, move |conn| {
            Ok(conn.execute(
                "DELETE FROM fixture_states WHERE expires_at <= ?1",
                params![storage::ts(now)],
            )?)
        })
        .await
    }

    async fn lookup_live(
        &self,
        fixture_id: i64,
        browser: &Browser,
        now: DateTime<Utc>,
    ) -> Result<Option<ResolvedFixture>, StorageError> {
        let key = browser.as_str().to_string();
        let row = storage::with_conn(&self.pool, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT encrypted_state, captured_at, expires_at FROM fixture_states
                     WHERE fixture_id = ?1 AND browser = ?2 AND expires_at > ?3",
                    params![fixture_id, key, storage::ts(now)],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?)
        })
        .await?;

        let Some((sealed, captured_at, expires_at)) = row else {
            return Ok(None);
        };

        let state = match self
            .cipher
            .decrypt(&sealed)
            .map_err(|e| e.to_string())
            .and_then(|plain| serde_json::from_slice::<BrowserState>(&plain).map_err(|e| e.to_string()))
        {
            Ok(state) => state,
            Err(reason) => {
                warn!(fixture_id, %browser, %reason, "cached fixture state unreadable, treating as miss");
                return Ok(None);
            }
        };

        Ok(Some(ResolvedFixture {
            fixture_id,
            state: Arc::new(state),
            captured_at: storage::parse_ts("captured_at", &captured_at)?,
            expires_at: Some(storage::parse_ts("expires_at", &expires_at)?),
            from_cache: true,
        }))
    }

    /// Join the in-flight capture for this key, or start one.
    async fn fill_shared(&self, fixture: Fixture, browser: Browser, force_recapture: bool) -> CaptureResult {
        let key = (fixture.id, browser.clone(), force_recapture);
        let shared = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                debug!(fixture_id = fixture.id, %browser, "joining in-flight fixture capture");
                existing.clone()
            } else {
                let fixture_id = fixture.id;
                let guard = InflightGuard {
                    inflight: Arc::clone(&self.inflight),
                    key: key.clone(),
                };
                let this = self.clone();
                let task = tokio::spawn(async move {
                    let _guard = guard;
                    this.fill(fixture, browser, force_recapture).await
                });
                let shared = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(CaptureError::Aborted {
                            fixture_id,
                            message: e.to_string(),
                        })
                    })
                }
                .boxed()
                .shared();
                inflight.insert(key, shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Leader path: re-check, capture, seal, store.
    async fn fill(&self, fixture: Fixture, browser: Browser, force_recapture: bool) -> CaptureResult {
        if !force_recapture {
            // Another leader may have stored a state between our miss and taking the key.
            match self.lookup_live(fixture.id, &browser, Utc::now()).await {
                Ok(Some(hit)) => return Ok(hit),
                Ok(None) => {}
                Err(e) => return Err(CaptureError::Storage(e.to_string())),
            }
        }

        let mut resolved = self.capture(&fixture, &browser).await?;
        let expires_at = resolved.captured_at + chrono::Duration::seconds(fixture.cache_ttl_seconds.max(0));
        resolved.expires_at = Some(expires_at);

        if let Err(e) = self.store(&fixture, &browser, &resolved, expires_at).await {
            error!(fixture_id = fixture.id, %browser, error = %e, "failed to store captured fixture state");
        }
        Ok(resolved)
    }

    async fn capture(&self, fixture: &Fixture, browser: &Browser) -> CaptureResult {
        info!(fixture_id = fixture.id, fixture = %fixture.name, %browser, "capturing fixture state");
        let captured = tokio::time::timeout(self.capture_timeout, self.capturer.capture(fixture, browser)).await;
        let state = match captured {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                warn!(fixture_id = fixture.id, %browser, error = %e, "fixture capture failed");
                return Err(CaptureError::Failed {
                    fixture_id: fixture.id,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(fixture_id = fixture.id, %browser, "fixture capture timed out");
                return Err(CaptureError::Timeout {
                    fixture_id: fixture.id,
                    after: self.capture_timeout,
                });
            }
        };
        Ok(ResolvedFixture {
            fixture_id: fixture.id,
            state: Arc::new(state),
            captured_at: Utc::now(),
            expires_at: None,
            from_cache: false,
        })
    }

    async fn store(
        &self,
        fixture: &Fixture,
        browser: &Browser,
        resolved: &ResolvedFixture,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let plain = serde_json::to_vec(resolved.state.as_ref())?;
        let sealed = self.cipher.encrypt(&plain).map_err(|e| StorageError::Corrupt {
            column: "encrypted_state",
            value: e.to_string(),
        })?;
        let fixture_id = fixture.id;
        let project_id = fixture.project_id;
        let browser = browser.as_str().to_string();
        let url = resolved.state.url.clone();
        let captured_at = storage::ts(resolved.captured_at);
        let expires_at = storage::ts(expires_at);
        storage::with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO fixture_states (fixture_id, project_id, browser, url, encrypted_state, captured_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (fixture_id, browser) DO UPDATE SET
                    url = excluded.url,
                    encrypted_state = excluded.encrypted_state,
                    captured_at = excluded.captured_at,
                    expires_at = excluded.expires_at",
                params![fixture_id, project_id, browser, url, sealed, captured_at, expires_at],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::crypto::AesGcmCipher;
    use super::*;
    use crate::executor::ExecutorError;
    use crate::storage::testing::temp_pool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts captures; sleeps to hold the key open; optionally fails.
    struct CountingCapturer {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingCapturer {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl FixtureCapturer for CountingCapturer {
        async fn capture(&self, fixture: &Fixture, _browser: &Browser) -> Result<BrowserState, ExecutorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ExecutorError::Failed("login form missing".into()));
            }
            Ok(BrowserState {
                url: Some(format!("https://app.test/home?f={}", fixture.id)),
                storage_state: serde_json::json!({ "cookies": [{ "name": "sid", "value": format!("s{n}") }] }),
            })
        }
    }

    fn seed_fixture(pool: &Pool, id: i64, scope: &str, ttl: i64) {
        let conn = pool.get().unwrap();
        conn.execute("INSERT OR IGNORE INTO projects (id, name) VALUES (1, 'shop')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO fixtures (id, project_id, name, scope, cache_ttl_seconds) VALUES (?1, 1, 'login', ?2, ?3)",
            params![id, scope, ttl],
        )
        .unwrap();
    }

    fn cache(pool: &Pool, capturer: Arc<CountingCapturer>) -> FixtureCache {
        FixtureCache::new(
            pool.clone(),
            capturer,
            Arc::new(AesGcmCipher::from_secret("test-key").unwrap()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_capture_once() {
        let (_dir, pool) = temp_pool();
        seed_fixture(&pool, 1, "cached", 3600);
        let capturer = CountingCapturer::new(Duration::from_millis(300), false);
        let cache = cache(&pool, capturer.clone());
        let browser = Browser::default();

        let calls = (0..8).map(|_| {
            let cache = cache.clone();
            let browser = browser.clone();
            tokio::spawn(async move { cache.resolve(1, &browser, false).await })
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(capturer.calls(), 1);
        let states: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap().state)
            .collect();
        assert_eq!(states.len(), 8);
        assert!(states.iter().all(|s| **s == *states[0]));
        assert!(cache.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_hit_after_capture_is_served_from_cache() {
        let (_dir, pool) = temp_pool();
        seed_fixture(&pool, 1, "cached", 3600);
        let capturer = CountingCapturer::new(Duration::ZERO, false);
        let cache = cache(&pool, capturer.clone());
        let browser = Browser::default();

        let first = cache.resolve(1, &browser, false).await.unwrap();
        let second = cache.resolve(1, &browser, false).await.unwrap();

        assert_eq!(capturer.calls(), 1);
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.state, second.state);
        assert_eq!(
            second.expires_at.unwrap(),
            first.captured_at + chrono::Duration::seconds(3600)
        );
    }

    #[tokio::test]
    async fn test_expired_state_triggers_one_recapture() {
        let (_dir, pool) = temp_pool();
        seed_fixture(&pool, 1, "cached", 3600);
        let capturer = CountingCapturer::new(Duration::ZERO, false);
        let cache = cache(&pool, capturer.clone());
        let browser = Browser::default();

        cache.resolve(1, &browser, false).await.unwrap();
        pool.get()
            .unwrap()
            .execute(
                "UPDATE fixture_states SET expires_at = ?1",
                params![storage::ts(Utc::now() - chrono::Duration::seconds(1))],
            )
            .unwrap();

        let refreshed = cache.resolve(1, &browser, false).await.unwrap();
        assert!(!refreshed.from_cache);
        assert_eq!(capturer.calls(), 2);

        cache.resolve(1, &browser, false).await.unwrap();
        assert_eq!(capturer.calls(), 2);

        let rows: i64 = pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM fixture_states", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1, "stale state is superseded, not accumulated");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capture_failure_reaches_all_waiters_and_releases_key() {
        let (_dir, pool) = temp_pool();
        seed_fixture(&pool, 1, "cached", 3600);
        let capturer = CountingCapturer::new(Duration::from_millis(200), true);
        let cache = cache(&pool, capturer.clone());
        let browser = Browser::default();

        let calls = (0..4).map(|_| {
            let cache = cache.clone();
            let browser = browser.clone();
            tokio::spawn(async move { cache.resolve(1, &browser, false).await })
        });
        for result in futures::future::join_all(calls).await {
            let err = result.unwrap().unwrap_err();
            assert!(matches!(err, CacheError::Capture(CaptureError::Failed { fixture_id: 1, .. })));
        }
        assert_eq!(capturer.calls(), 1);
        assert!(cache.inflight.lock().is_empty());

        let rows: i64 = pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM fixture_states", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);

        // The key is free again: the next caller starts a new capture.
        let _ = cache.resolve(1, &browser, false).await;
        assert_eq!(capturer.calls(), 2);
    }

    #[tokio::test]
    async fn test_fresh_scope_bypasses_cache() {
        let (_dir, pool) = temp_pool();
        seed_fixture(&pool, 2, "fresh", 3600);
        let capturer = CountingCapturer::new(Duration::ZERO, false);
        let cache = cache(&pool, capturer.clone());
        let browser = Browser::default();

        let first = cache.resolve(2, &browser, false).await.unwrap();
        cache.resolve(2, &browser, false).await.unwrap();

        assert_eq!(capturer.calls(), 2);
        assert!(first.expires_at.is_none());
        let rows: i64 = pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM fixture_states", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_tampered_state_is_a_miss() {
        let (_dir, pool) = temp_pool();
        seed_fixture(&pool, 1, "cached", 3600);
        let capturer = CountingCapturer::new(Duration::ZERO, false);
        let cache = cache(&pool, capturer.clone());
        let browser = Browser::default();

        cache.resolve(1, &browser, false).await.unwrap();
        pool.get()
            .unwrap()
            .execute("UPDATE fixture_states SET encrypted_state = 'AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA'", [])
            .unwrap();

        let resolved = cache.resolve(1, &browser, false).await.unwrap();
        assert!(!resolved.from_cache);
        assert_eq!(capturer.calls(), 2);
    }

    #[tokio::test]
    async fn test_forced_recapture_replaces_live_state() {
        let (_dir, pool) = temp_pool();
        seed_fixture(&pool, 1, "cached", 3600);
        let capturer = CountingCapturer::new(Duration::ZERO, false);
        let cache = cache(&pool, capturer.clone());
        let browser = Browser::default();

        let first = cache.resolve(1, &browser, false).await.unwrap();
        let forced = cache.resolve(1, &browser, true).await.unwrap();
        assert_eq!(capturer.calls(), 2);
        assert_ne!(first.state, forced.state);

        let cached = cache.resolve(1, &browser, false).await.unwrap();
        assert_eq!(cached.state, forced.state);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_forced_caller_does_not_join_ordinary_fill() {
        let (_dir, pool) = temp_pool();
        seed_fixture(&pool, 1, "cached", 3600);
        let capturer = CountingCapturer::new(Duration::from_millis(300), false);
        let cache = cache(&pool, capturer.clone());
        let browser = Browser::default();

        let ordinary = {
            let cache = cache.clone();
            let browser = browser.clone();
            tokio::spawn(async move { cache.resolve(1, &browser, false).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.inflight.lock().len(), 1);

        let forced = cache.resolve(1, &browser, true).await.unwrap();
        let ordinary = ordinary.await.unwrap().unwrap();
        assert_eq!(capturer.calls(), 2);
        assert!(!forced.from_cache);
        assert_ne!(forced.state, ordinary.state);
        assert!(cache.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_and_unknown_fixture() {
        let (_dir, pool) = temp_pool();
        seed_fixture(&pool, 1, "cached", 3600);
        let capturer = CountingCapturer::new(Duration::ZERO, false);
        let cache = cache(&pool, capturer.clone());
        let browser = Browser::default();

        cache.resolve(1, &browser, false).await.unwrap();
        assert_eq!(cache.invalidate(1, None).await.unwrap(), 1);
        cache.resolve(1, &browser, false).await.unwrap();
        assert_eq!(capturer.calls(), 2);

        let err = cache.resolve(99, &browser, false).await.unwrap_err();
        assert!(matches!(err, CacheError::Capture(CaptureError::UnknownFixture(99))));
    }
}
