//! Local cache over a [`RemoteApi`] with the store subscription contract.
//!
//! ```text
//!   read(scope, path)     ──► entries[key]              (never touches network)
//!   preload(scope, path)  ──► cached? done
//!                             in flight? await the same Shared future
//!                             else get() ──► insert only if still uncached
//!   write(scope, path, v) ──► entries[key] = v, notify  (optimistic)
//!                             set() ok  ──► invalidate overlapping listings
//!                             set() err ──► restore previous, notify, Err
//!   poll_due()            ──► refetch due keys ──► merge if different
//! ```
//!
//! Every mutation funnels through the cache's [`ChangeNotifier`], so
//! versions, batching and scheduling behave exactly as in the value store.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures_util::future::{join_all, LocalBoxFuture, Shared};
use futures_util::FutureExt;
use rustc_hash::FxHashMap;
use tidepool_core::schedule::sleep_until;
use tidepool_core::{
    Blob, ChangeNotifier, Clock, DeadlineQueue, Listener, MonotonicClock, Observable, Scheduler,
    Subscription, TaskId,
};
use tokio::sync::Notify;

use crate::api::{with_timeout, RemoteApi, RemoteConfig, RemoteError};
use crate::key::{CacheKey, RemotePath};

type FetchResult = Result<Option<Blob>, RemoteError>;
type SharedFetch = Shared<LocalBoxFuture<'static, FetchResult>>;

struct PendingFetch {
    id: u64,
    future: SharedFetch,
}

struct PollObserver {
    scope: String,
    path: RemotePath,
    interval: Duration,
    task: TaskId,
}

struct CachedQuery {
    scope: String,
    path: Option<RemotePath>,
    keys: Vec<String>,
}

struct CacheInner<A> {
    api: Rc<A>,
    config: RemoteConfig,
    clock: Rc<dyn Clock>,
    entries: RefCell<FxHashMap<CacheKey, Blob>>,
    queries: RefCell<FxHashMap<CacheKey, CachedQuery>>,
    pending: RefCell<FxHashMap<CacheKey, PendingFetch>>,
    polls: RefCell<DeadlineQueue<CacheKey>>,
    observers: RefCell<FxHashMap<CacheKey, PollObserver>>,
    notifier: Rc<ChangeNotifier>,
    /// Bumped by `destroy`; results from older generations are dropped
    generation: Cell<u64>,
    next_fetch_id: Cell<u64>,
    wake: Notify,
}

impl<A> CacheInner<A> {
    fn notify(&self, key: &CacheKey) {
        self.notifier.notify_changed(key.as_str());
    }

    /// Completion of a fetch started by this cache.
    fn complete_fetch(&self, key: &CacheKey, fetch_id: u64, generation: u64, result: &FetchResult) {
        if generation != self.generation.get() {
            log::debug!("discarding fetch of {key} from a destroyed cache");
            return;
        }

        {
            let mut pending = self.pending.borrow_mut();
            if pending.get(key).is_some_and(|p| p.id == fetch_id) {
                pending.remove(key);
            }
        }

        if let Ok(Some(blob)) = result {
            let inserted = {
                let mut entries = self.entries.borrow_mut();
                if entries.contains_key(key) {
                    false
                } else {
                    entries.insert(key.clone(), blob.clone());
                    true
                }
            };
            if inserted {
                self.notify(key);
            }
        }
    }

    /// Replace the cached value with `value` if it differs.
    fn merge(&self, key: &CacheKey, value: Option<Blob>) -> bool {
        let changed = {
            let mut entries = self.entries.borrow_mut();
            match value {
                Some(blob) => {
                    if entries.get(key) == Some(&blob) {
                        false
                    } else {
                        entries.insert(key.clone(), blob);
                        true
                    }
                }
                None => entries.remove(key).is_some(),
            }
        };
        if changed {
            self.notify(key);
        }
        changed
    }
}

/// Remote-backed cache. Cheap to clone; clones share one cache.
pub struct RemoteCache<A> {
    inner: Rc<CacheInner<A>>,
}

impl<A> Clone for RemoteCache<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: RemoteApi + 'static> RemoteCache<A> {
    pub fn new(api: Rc<A>, config: RemoteConfig) -> Self {
        Self::with_clock(api, config, Rc::new(MonotonicClock::new()))
    }

    /// Use `clock` for poll scheduling.
    pub fn with_clock(api: Rc<A>, config: RemoteConfig, clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                api,
                config,
                clock,
                entries: RefCell::default(),
                queries: RefCell::default(),
                pending: RefCell::default(),
                polls: RefCell::default(),
                observers: RefCell::default(),
                notifier: ChangeNotifier::new(),
                generation: Cell::new(0),
                next_fetch_id: Cell::new(0),
                wake: Notify::new(),
            }),
        }
    }

    /// Subscription key for `(scope, path)`.
    pub fn cache_key(scope: &str, path: &RemotePath) -> CacheKey {
        CacheKey::new(scope, path)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Cached value, without any network I/O.
    pub fn read(&self, scope: &str, path: &RemotePath) -> Option<Blob> {
        self.inner
            .entries
            .borrow()
            .get(&CacheKey::new(scope, path))
            .cloned()
    }

    pub fn contains(&self, scope: &str, path: &RemotePath) -> bool {
        self.inner
            .entries
            .borrow()
            .contains_key(&CacheKey::new(scope, path))
    }

    /// Make sure `(scope, path)` is cached, sharing any fetch already in
    /// flight for the same key.
    pub async fn preload(&self, scope: &str, path: &RemotePath) -> Result<(), RemoteError> {
        let key = CacheKey::new(scope, path);
        if self.inner.entries.borrow().contains_key(&key) {
            return Ok(());
        }
        self.fetch(scope, path, key).await.map(|_| ())
    }

    /// The in-flight fetch for `key`, or a new one.
    fn fetch(&self, scope: &str, path: &RemotePath, key: CacheKey) -> SharedFetch {
        if let Some(existing) = self.inner.pending.borrow().get(&key) {
            log::trace!("joining in-flight fetch of {key}");
            return existing.future.clone();
        }

        let fetch_id = self.inner.next_fetch_id.get();
        self.inner.next_fetch_id.set(fetch_id + 1);
        let generation = self.inner.generation.get();

        let weak: Weak<CacheInner<A>> = Rc::downgrade(&self.inner);
        let api = self.inner.api.clone();
        let auth = self.inner.config.auth_token.clone();
        let limit = self.inner.config.request_timeout;
        let scope = scope.to_owned();
        let path = path.clone();
        let fetch_key = key.clone();

        let future = async move {
            let result = with_timeout(limit, api.get(&scope, &path, &auth)).await;
            if let Err(e) = &result {
                log::debug!("fetch of {fetch_key} failed: {e}");
            }
            if let Some(inner) = weak.upgrade() {
                inner.complete_fetch(&fetch_key, fetch_id, generation, &result);
            }
            result
        }
        .boxed_local()
        .shared();

        self.inner.pending.borrow_mut().insert(
            key,
            PendingFetch {
                id: fetch_id,
                future: future.clone(),
            },
        );
        future
    }

    pub fn is_fetching(&self, scope: &str, path: &RemotePath) -> bool {
        self.inner
            .pending
            .borrow()
            .contains_key(&CacheKey::new(scope, path))
    }

    pub fn pending_fetch_count(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Optimistically cache `value`, then mutate the remote.
    ///
    /// On failure the previous cached state is restored, subscribers are
    /// notified a second time and the error is returned. The restore is
    /// skipped when the key changed again while the call was in flight, so
    /// a later write or merge is never clobbered.
    pub async fn write(
        &self,
        scope: &str,
        path: &RemotePath,
        value: Blob,
    ) -> Result<(), RemoteError> {
        let key = CacheKey::new(scope, path);
        let previous = self
            .inner
            .entries
            .borrow_mut()
            .insert(key.clone(), value.clone());
        self.inner.notify(&key);
        let written_version = self.inner.notifier.key_version(key.as_str());

        let generation = self.inner.generation.get();
        let api = self.inner.api.clone();
        let result = with_timeout(
            self.inner.config.request_timeout,
            api.set(scope, path, &value, &self.inner.config.auth_token),
        )
        .await;

        match result {
            Ok(()) => {
                self.invalidate_queries(scope, path);
                Ok(())
            }
            Err(e) => {
                let superseded = self.inner.notifier.key_version(key.as_str()) != written_version;
                if superseded {
                    log::warn!("write of {key} failed, newer value kept: {e}");
                } else if generation == self.inner.generation.get() {
                    log::warn!("write of {key} failed, rolling back: {e}");
                    {
                        let mut entries = self.inner.entries.borrow_mut();
                        match previous {
                            Some(blob) => {
                                entries.insert(key.clone(), blob);
                            }
                            None => {
                                entries.remove(&key);
                            }
                        }
                    }
                    self.inner.notify(&key);
                }
                Err(e)
            }
        }
    }

    // ─── Listings ─────────────────────────────────────────────────────

    /// Fetch and cache the keys below `path`.
    pub async fn list(
        &self,
        scope: &str,
        path: Option<&RemotePath>,
    ) -> Result<Vec<String>, RemoteError> {
        let generation = self.inner.generation.get();
        let api = self.inner.api.clone();
        let keys = with_timeout(
            self.inner.config.request_timeout,
            api.list(scope, path, &self.inner.config.auth_token),
        )
        .await?;

        if generation == self.inner.generation.get() {
            let query_key = CacheKey::query(scope, path);
            let changed = {
                let mut queries = self.inner.queries.borrow_mut();
                let changed = queries.get(&query_key).is_none_or(|q| q.keys != keys);
                queries.insert(
                    query_key.clone(),
                    CachedQuery {
                        scope: scope.to_owned(),
                        path: path.cloned(),
                        keys: keys.clone(),
                    },
                );
                changed
            };
            if changed {
                self.inner.notify(&query_key);
            }
        }
        Ok(keys)
    }

    /// Cached result of an earlier [`list`](Self::list).
    pub fn cached_list(&self, scope: &str, path: Option<&RemotePath>) -> Option<Vec<String>> {
        self.inner
            .queries
            .borrow()
            .get(&CacheKey::query(scope, path))
            .map(|q| q.keys.clone())
    }

    /// Drop every cached listing of `scope` that overlaps `path`.
    fn invalidate_queries(&self, scope: &str, path: &RemotePath) {
        let stale: Vec<CacheKey> = {
            let mut queries = self.inner.queries.borrow_mut();
            let stale: Vec<CacheKey> = queries
                .iter()
                .filter(|(_, q)| {
                    q.scope == scope && q.path.as_ref().is_none_or(|p| p.overlaps(path))
                })
                .map(|(k, _)| k.clone())
                .collect();
            for key in &stale {
                queries.remove(key);
            }
            stale
        };
        if stale.is_empty() {
            return;
        }
        log::debug!("invalidated {} listing(s) after write to {scope}/{path}", stale.len());
        self.inner.notifier.batch(|| {
            for key in &stale {
                self.inner.notify(key);
            }
        });
    }

    // ─── Polling ──────────────────────────────────────────────────────

    /// Refetch `(scope, path)` every `interval`, replacing any previous
    /// observer of that key. A zero interval only removes the observer.
    pub fn set_refetch_interval(&self, scope: &str, path: &RemotePath, interval: Duration) {
        let key = CacheKey::new(scope, path);
        self.clear_observer(&key);
        if interval.is_zero() {
            return;
        }

        let deadline = self.inner.clock.now() + interval;
        let task = self.inner.polls.borrow_mut().schedule(deadline, key.clone());
        self.inner.observers.borrow_mut().insert(
            key,
            PollObserver {
                scope: scope.to_owned(),
                path: path.clone(),
                interval,
                task,
            },
        );
        self.inner.wake.notify_one();
    }

    pub fn clear_refetch_interval(&self, scope: &str, path: &RemotePath) {
        self.clear_observer(&CacheKey::new(scope, path));
    }

    fn clear_observer(&self, key: &CacheKey) {
        let removed = self.inner.observers.borrow_mut().remove(key);
        if let Some(observer) = removed {
            self.inner.polls.borrow_mut().cancel(observer.task);
        }
    }

    pub fn is_polling(&self, scope: &str, path: &RemotePath) -> bool {
        self.inner
            .observers
            .borrow()
            .contains_key(&CacheKey::new(scope, path))
    }

    pub fn next_poll_deadline(&self) -> Option<Duration> {
        self.inner.polls.borrow().next_deadline()
    }

    /// Refetch every key whose poll deadline has passed and merge the
    /// results. Returns the number of refetches performed.
    pub async fn poll_due(&self) -> usize {
        let now = self.inner.clock.now();
        let due = self.inner.polls.borrow_mut().pop_due(now);

        let mut fetches = Vec::with_capacity(due.len());
        for (_, key) in due {
            let target = {
                let mut observers = self.inner.observers.borrow_mut();
                observers.get_mut(&key).map(|observer| {
                    observer.task = self
                        .inner
                        .polls
                        .borrow_mut()
                        .schedule(now + observer.interval, key.clone());
                    (observer.scope.clone(), observer.path.clone())
                })
            };
            if let Some((scope, path)) = target {
                let issued_version = self.inner.notifier.key_version(key.as_str());
                let fetch = self.fetch(&scope, &path, key.clone());
                fetches.push(async move { (key, issued_version, fetch.await) });
            }
        }
        if fetches.is_empty() {
            return 0;
        }

        let generation = self.inner.generation.get();
        let results = join_all(fetches).await;
        let count = results.len();
        if generation != self.inner.generation.get() {
            return count;
        }

        for (key, issued_version, result) in results {
            match result {
                Ok(value) => {
                    // Anything written since the refetch started is newer
                    if self.inner.notifier.key_version(key.as_str()) == issued_version {
                        self.inner.merge(&key, value);
                    } else {
                        log::trace!("poll of {key} superseded by a newer value");
                    }
                }
                Err(e) => log::warn!("poll of {key} failed: {e}"),
            }
        }
        count
    }

    /// Drive poll observers forever.
    pub async fn run(&self) {
        loop {
            let deadline = self.next_poll_deadline();
            sleep_until(self.inner.clock.as_ref(), deadline, &self.inner.wake).await;
            self.poll_due().await;
        }
    }

    // ─── Teardown ─────────────────────────────────────────────────────

    /// Cancel every poll observer and drop all cached data, listings,
    /// subscribers and pending fetches. Results of fetches still in flight
    /// are discarded when they arrive.
    pub fn destroy(&self) {
        self.inner.generation.set(self.inner.generation.get() + 1);
        self.inner.polls.borrow_mut().clear();
        self.inner.observers.borrow_mut().clear();
        self.inner.pending.borrow_mut().clear();
        self.inner.entries.borrow_mut().clear();
        self.inner.queries.borrow_mut().clear();
        self.inner.notifier.clear();
        log::info!("remote cache destroyed");
    }

    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.borrow().is_empty()
    }

    pub fn notifier(&self) -> &Rc<ChangeNotifier> {
        &self.inner.notifier
    }
}

impl<A: RemoteApi + 'static> Observable for RemoteCache<A> {
    fn subscribe(&self, listener: Listener) -> Subscription {
        self.inner.notifier.subscribe(listener)
    }

    /// `key` is a [`CacheKey`] string, see [`RemoteCache::cache_key`].
    fn subscribe_key(&self, key: &str, listener: Listener) -> Subscription {
        self.inner.notifier.subscribe_key(key, listener)
    }

    fn snapshot_version(&self) -> u64 {
        self.inner.notifier.snapshot_version()
    }

    fn key_version(&self, key: &str) -> u64 {
        self.inner.notifier.key_version(key)
    }

    fn set_scheduler(&self, scheduler: Option<Scheduler>) {
        self.inner.notifier.set_scheduler(scheduler)
    }

    fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.notifier.batch(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AuthToken;
    use tidepool_core::ManualClock;

    /// In-process remote with call counters, latency and failure switches.
    #[derive(Default)]
    struct MockRemote {
        data: RefCell<FxHashMap<(String, RemotePath), Blob>>,
        gets: Cell<usize>,
        sets: Cell<usize>,
        lists: Cell<usize>,
        fail_sets: Cell<bool>,
        /// Sets of exactly this value are rejected
        reject_value: RefCell<Option<Blob>>,
        latency: Cell<Duration>,
    }

    impl MockRemote {
        fn put(&self, scope: &str, path: &str, value: &[u8]) {
            self.data
                .borrow_mut()
                .insert((scope.into(), RemotePath::parse(path)), value.to_vec());
        }

        fn remove(&self, scope: &str, path: &str) {
            self.data
                .borrow_mut()
                .remove(&(scope.into(), RemotePath::parse(path)));
        }

        async fn delay(&self) {
            let latency = self.latency.get();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
        }
    }

    impl RemoteApi for MockRemote {
        async fn get(
            &self,
            scope: &str,
            path: &RemotePath,
            _auth: &AuthToken,
        ) -> Result<Option<Blob>, RemoteError> {
            self.gets.set(self.gets.get() + 1);
            let value = self
                .data
                .borrow()
                .get(&(scope.to_owned(), path.clone()))
                .cloned();
            self.delay().await;
            Ok(value)
        }

        async fn set(
            &self,
            scope: &str,
            path: &RemotePath,
            value: &[u8],
            _auth: &AuthToken,
        ) -> Result<(), RemoteError> {
            self.sets.set(self.sets.get() + 1);
            self.delay().await;
            if self.fail_sets.get() || self.reject_value.borrow().as_deref() == Some(value) {
                return Err(RemoteError::Rejected("read-only".into()));
            }
            self.data
                .borrow_mut()
                .insert((scope.to_owned(), path.clone()), value.to_vec());
            Ok(())
        }

        async fn list(
            &self,
            scope: &str,
            path: Option<&RemotePath>,
            _auth: &AuthToken,
        ) -> Result<Vec<String>, RemoteError> {
            self.lists.set(self.lists.get() + 1);
            self.delay().await;
            let mut keys: Vec<String> = self
                .data
                .borrow()
                .keys()
                .filter(|(s, p)| s == scope && path.is_none_or(|prefix| p.starts_with(prefix)))
                .map(|(_, p)| p.to_string())
                .collect();
            keys.sort();
            Ok(keys)
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn setup() -> (RemoteCache<MockRemote>, Rc<MockRemote>, ManualClock) {
        let remote = Rc::new(MockRemote::default());
        let clock = ManualClock::new();
        let cache = RemoteCache::with_clock(
            remote.clone(),
            RemoteConfig::for_testing(),
            Rc::new(clock.clone()),
        );
        (cache, remote, clock)
    }

    fn count_key(cache: &RemoteCache<MockRemote>, scope: &str, path: &RemotePath) -> Rc<Cell<usize>> {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let key = RemoteCache::<MockRemote>::cache_key(scope, path);
        let _sub = cache.subscribe_key(key.as_str(), Rc::new(move || c.set(c.get() + 1)));
        count
    }

    #[tokio::test]
    async fn test_read_never_fetches() {
        let (cache, remote, _clock) = setup();
        remote.put("s", "a", b"1");
        assert_eq!(cache.read("s", &RemotePath::parse("a")), None);
        assert_eq!(remote.gets.get(), 0);
    }

    #[tokio::test]
    async fn test_preload_populates_and_notifies() {
        let (cache, remote, _clock) = setup();
        remote.put("s", "a", b"1");
        let path = RemotePath::parse("a");
        let notified = count_key(&cache, "s", &path);

        cache.preload("s", &path).await.unwrap();
        assert_eq!(cache.read("s", &path), Some(b"1".to_vec()));
        assert_eq!(notified.get(), 1);
        assert_eq!(cache.pending_fetch_count(), 0);

        // Cached: no second request
        cache.preload("s", &path).await.unwrap();
        assert_eq!(remote.gets.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_preloads_share_one_fetch() {
        let (cache, remote, _clock) = setup();
        remote.put("s", "a", b"1");
        remote.latency.set(ms(20));
        let path = RemotePath::parse("a");

        let (first, second) = tokio::join!(cache.preload("s", &path), cache.preload("s", &path));
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(remote.gets.get(), 1);
        assert_eq!(cache.read("s", &path), Some(b"1".to_vec()));
        assert!(!cache.is_fetching("s", &path));
    }

    #[tokio::test]
    async fn test_absent_remote_value_stays_uncached() {
        let (cache, _remote, _clock) = setup();
        let path = RemotePath::parse("missing");
        cache.preload("s", &path).await.unwrap();
        assert!(!cache.contains("s", &path));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preload_does_not_clobber_concurrent_write() {
        let (cache, remote, _clock) = setup();
        remote.put("s", "a", b"old");
        remote.latency.set(ms(20));
        let path = RemotePath::parse("a");

        let preload = cache.preload("s", &path);
        let write = async {
            tokio::time::sleep(ms(1)).await;
            cache.write("s", &path, b"new".to_vec()).await
        };
        let (preloaded, written) = tokio::join!(preload, write);
        preloaded.unwrap();
        written.unwrap();
        assert_eq!(cache.read("s", &path), Some(b"new".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_clears_pending_entry() {
        let (cache, remote, _clock) = setup();
        remote.latency.set(Duration::from_secs(5));
        let path = RemotePath::parse("slow");

        let err = cache.preload("s", &path).await.unwrap_err();
        assert_eq!(err, RemoteError::Timeout(Duration::from_secs(1)));
        assert_eq!(cache.pending_fetch_count(), 0);

        remote.latency.set(Duration::ZERO);
        remote.put("s", "slow", b"ok");
        cache.preload("s", &path).await.unwrap();
        assert_eq!(remote.gets.get(), 2);
    }

    #[tokio::test]
    async fn test_write_success_updates_remote() {
        let (cache, remote, _clock) = setup();
        let path = RemotePath::parse("a");
        let notified = count_key(&cache, "s", &path);

        cache.write("s", &path, b"v".to_vec()).await.unwrap();
        assert_eq!(cache.read("s", &path), Some(b"v".to_vec()));
        assert_eq!(notified.get(), 1);
        assert_eq!(remote.sets.get(), 1);
        assert_eq!(
            remote.data.borrow().get(&("s".to_string(), path.clone())),
            Some(&b"v".to_vec())
        );
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_to_previous_value() {
        let (cache, remote, _clock) = setup();
        remote.put("s", "a", b"v1");
        let path = RemotePath::parse("a");
        cache.preload("s", &path).await.unwrap();

        let notified = count_key(&cache, "s", &path);
        remote.fail_sets.set(true);
        let err = cache.write("s", &path, b"v2".to_vec()).await.unwrap_err();

        assert_eq!(err, RemoteError::Rejected("read-only".into()));
        assert_eq!(cache.read("s", &path), Some(b"v1".to_vec()));
        assert_eq!(notified.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_rolls_back_to_absent() {
        let (cache, remote, _clock) = setup();
        remote.fail_sets.set(true);
        remote.latency.set(ms(10));
        let path = RemotePath::parse("new");

        let write = cache.write("s", &path, b"v".to_vec());
        let observe = async {
            tokio::time::sleep(ms(5)).await;
            cache.read("s", &path)
        };
        let (result, during) = tokio::join!(write, observe);

        assert!(result.is_err());
        assert_eq!(during, Some(b"v".to_vec()));
        assert_eq!(cache.read("s", &path), None);
    }

    #[tokio::test]
    async fn test_list_cached_and_invalidated_by_overlapping_write() {
        let (cache, remote, _clock) = setup();
        remote.put("s", "users/1", b"a");
        remote.put("s", "posts/1", b"b");
        let users = RemotePath::parse("users");
        let posts = RemotePath::parse("posts");

        assert_eq!(cache.list("s", Some(&users)).await.unwrap(), vec!["users/1"]);
        cache.list("s", Some(&posts)).await.unwrap();
        assert!(cache.cached_list("s", Some(&users)).is_some());

        cache
            .write("s", &RemotePath::parse("users/2"), b"c".to_vec())
            .await
            .unwrap();
        assert_eq!(cache.cached_list("s", Some(&users)), None);
        assert!(cache.cached_list("s", Some(&posts)).is_some());

        assert_eq!(
            cache.list("s", Some(&users)).await.unwrap(),
            vec!["users/1", "users/2"]
        );
        assert_eq!(remote.lists.get(), 3);
    }

    #[tokio::test]
    async fn test_poll_merges_only_changes() {
        let (cache, remote, clock) = setup();
        remote.put("s", "a", b"1");
        let path = RemotePath::parse("a");
        let notified = count_key(&cache, "s", &path);

        cache.set_refetch_interval("s", &path, ms(100));
        assert!(cache.is_polling("s", &path));
        assert_eq!(cache.poll_due().await, 0);

        clock.advance(ms(100));
        assert_eq!(cache.poll_due().await, 1);
        assert_eq!(cache.read("s", &path), Some(b"1".to_vec()));
        assert_eq!(notified.get(), 1);

        // Same value: refetched but no notification
        clock.advance(ms(100));
        assert_eq!(cache.poll_due().await, 1);
        assert_eq!(notified.get(), 1);

        remote.put("s", "a", b"2");
        clock.advance(ms(100));
        cache.poll_due().await;
        assert_eq!(cache.read("s", &path), Some(b"2".to_vec()));
        assert_eq!(notified.get(), 2);

        // Gone remotely: evicted locally
        remote.remove("s", "a");
        clock.advance(ms(100));
        cache.poll_due().await;
        assert_eq!(cache.read("s", &path), None);
        assert_eq!(notified.get(), 3);
        assert_eq!(remote.gets.get(), 4);
    }

    #[tokio::test]
    async fn test_new_interval_replaces_observer() {
        let (cache, remote, clock) = setup();
        remote.put("s", "a", b"1");
        let path = RemotePath::parse("a");

        cache.set_refetch_interval("s", &path, ms(100));
        cache.set_refetch_interval("s", &path, ms(300));
        assert_eq!(cache.next_poll_deadline(), Some(ms(300)));

        clock.advance(ms(100));
        assert_eq!(cache.poll_due().await, 0);

        cache.set_refetch_interval("s", &path, Duration::ZERO);
        assert!(!cache.is_polling("s", &path));
        assert_eq!(cache.next_poll_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_joins_in_flight_preload() {
        let (cache, remote, clock) = setup();
        remote.put("s", "a", b"1");
        remote.latency.set(ms(20));
        let path = RemotePath::parse("a");
        cache.set_refetch_interval("s", &path, ms(10));
        clock.advance(ms(10));

        let (preloaded, polled) = tokio::join!(cache.preload("s", &path), cache.poll_due());
        preloaded.unwrap();
        assert_eq!(polled, 1);
        assert_eq!(remote.gets.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_discards_in_flight_results() {
        let (cache, remote, _clock) = setup();
        remote.put("s", "a", b"1");
        remote.latency.set(ms(20));
        let path = RemotePath::parse("a");
        cache.set_refetch_interval("s", &path, ms(50));
        let notified = count_key(&cache, "s", &path);

        let preload = cache.preload("s", &path);
        let teardown = async {
            tokio::time::sleep(ms(5)).await;
            cache.destroy();
        };
        let (result, ()) = tokio::join!(preload, teardown);

        assert!(result.is_ok());
        assert!(cache.is_empty());
        assert_eq!(cache.pending_fetch_count(), 0);
        assert!(!cache.is_polling("s", &path));
        assert_eq!(notified.get(), 0);
        assert_eq!(cache.notifier().watched_key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_polls_on_schedule() {
        let remote = Rc::new(MockRemote::default());
        remote.put("s", "a", b"1");
        let cache = RemoteCache::new(remote.clone(), RemoteConfig::for_testing());
        let path = RemotePath::parse("a");
        cache.set_refetch_interval("s", &path, ms(100));

        tokio::select! {
            _ = cache.run() => unreachable!("run never returns"),
            _ = tokio::time::sleep(ms(350)) => {}
        }
        assert_eq!(remote.gets.get(), 3);
        assert_eq!(cache.read("s", &path), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_invalidation_is_one_flush() {
        let (cache, remote, _clock) = setup();
        remote.put("s", "users/1", b"a");
        let users = RemotePath::parse("users");
        cache.list("s", None).await.unwrap();
        cache.list("s", Some(&users)).await.unwrap();

        let flushes = Rc::new(Cell::new(0));
        let f = flushes.clone();
        let _sub = cache.subscribe(Rc::new(move || f.set(f.get() + 1)));
        let before = cache.snapshot_version();

        cache
            .write("s", &RemotePath::parse("users/2"), b"b".to_vec())
            .await
            .unwrap();

        // Optimistic update, then both listings dropped together
        assert_eq!(flushes.get(), 2);
        assert_eq!(cache.snapshot_version(), before + 2);
        assert_eq!(cache.cached_list("s", None), None);
        assert_eq!(cache.cached_list("s", Some(&users)), None);
        let listing = CacheKey::query("s", Some(&users));
        assert_eq!(cache.key_version(listing.as_str()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_does_not_overwrite_newer_write() {
        let (cache, remote, clock) = setup();
        remote.put("s", "a", b"old");
        let path = RemotePath::parse("a");
        cache.preload("s", &path).await.unwrap();

        remote.latency.set(ms(20));
        cache.set_refetch_interval("s", &path, ms(10));
        clock.advance(ms(10));

        let write = async {
            tokio::time::sleep(ms(5)).await;
            cache.write("s", &path, b"new".to_vec()).await
        };
        let (polled, written) = tokio::join!(cache.poll_due(), write);
        assert_eq!(polled, 1);
        written.unwrap();
        assert_eq!(cache.read("s", &path), Some(b"new".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_keeps_overlapping_later_write() {
        let (cache, remote, _clock) = setup();
        remote.put("s", "a", b"v0");
        let path = RemotePath::parse("a");
        cache.preload("s", &path).await.unwrap();
        let notified = count_key(&cache, "s", &path);

        remote.latency.set(ms(20));
        *remote.reject_value.borrow_mut() = Some(b"v1".to_vec());
        let first = cache.write("s", &path, b"v1".to_vec());
        let second = async {
            tokio::time::sleep(ms(5)).await;
            cache.write("s", &path, b"v2".to_vec()).await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first, Err(RemoteError::Rejected("read-only".into())));
        assert!(second.is_ok());
        assert_eq!(cache.read("s", &path), Some(b"v2".to_vec()));
        // Two optimistic applies, no rollback
        assert_eq!(notified.get(), 2);
    }
}
