//! Cached, single-flight query execution.
//!
//! A cache entry is either `Pending` (a shared in-flight fetch that every
//! concurrent caller for the key attaches to) or `Resolved`. A failed fetch
//! evicts its entry as soon as it settles: every caller that was attached
//! receives the same error, and the next `query` starts a fresh attempt.
//! Settling does not depend on callers; an entry whose callers all dropped
//! out still resolves or is evicted when its fetch finishes.
//! Entries carry a generation so that a fetch settling after its entry was
//! invalidated cannot resurrect it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::error::{QueryError, TaskError};
use crate::scheduler::Scheduler;
use crate::subscription::EventHub;
use crate::task::{TaskContext, TaskHandle, TaskJoin, TaskOrigin};

/// Identifies a query result in the cache.
///
/// # Examples
///
/// ```
/// use taskfold::QueryDescriptor;
/// use serde_json::json;
///
/// let d = QueryDescriptor::new("X").with_part(json!("a"));
/// assert_eq!(d.cache_key(), "X:a");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// Query type, the key prefix.
    #[serde(rename = "type")]
    pub query_type: String,
    /// Ordered key parts.
    pub cache_key_parts: Vec<Value>,
}

impl QueryDescriptor {
    /// Descriptor with no key parts.
    pub fn new(query_type: impl Into<String>) -> Self {
        Self {
            query_type: query_type.into(),
            cache_key_parts: Vec::new(),
        }
    }

    /// Append a key part.
    pub fn with_part(mut self, part: Value) -> Self {
        self.cache_key_parts.push(part);
        self
    }

    /// Deterministic cache key: the type and each part joined by `:`.
    ///
    /// String parts are used verbatim except that `\` and `:` are escaped
    /// with a backslash, so `["a:b"]` and `["a", "b"]` never share a key.
    /// Other parts are rendered as JSON with object keys sorted, so the key
    /// never depends on insertion order.
    pub fn cache_key(&self) -> String {
        let mut key = self.query_type.clone();
        for part in &self.cache_key_parts {
            key.push(':');
            match part {
                Value::String(s) => {
                    for c in s.chars() {
                        if matches!(c, '\\' | ':') {
                            key.push('\\');
                        }
                        key.push(c);
                    }
                }
                other => key.push_str(&other.to_string()),
            }
        }
        key
    }
}

/// A read-only async operation whose result can be cached.
#[async_trait]
pub trait Query: Send + Sync + 'static {
    /// Result type. Cloned out of the cache for every caller.
    type Output: Clone + Send + Sync + 'static;

    /// Descriptor that determines the cache key.
    fn descriptor(&self) -> QueryDescriptor;

    /// Perform the fetch. Runs as a task on the scheduler; suspend through
    /// `cx` so that service shutdown can cancel it.
    async fn fetch(&self, cx: &TaskContext) -> Result<Self::Output, TaskError>;
}

/// Observable state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// A fetch is in flight.
    Pending,
    /// A value is cached.
    Resolved,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryStats {
    /// Served from a resolved entry.
    pub hits: u64,
    /// Attached to an in-flight fetch.
    pub joins: u64,
    /// Started a new fetch.
    pub fetches: u64,
}

type ErasedValue = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<ErasedValue, QueryError>>>;

enum EntryState {
    Pending { fetch: SharedFetch, task: TaskHandle },
    Resolved(ErasedValue),
}

struct CacheEntry {
    generation: u64,
    state: EntryState,
}

/// Single-flight query cache. Cheap to clone.
#[derive(Clone)]
pub struct QueryService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    root: TaskHandle,
    scheduler: Scheduler,
    hub: EventHub,
    entries: Mutex<HashMap<String, CacheEntry>>,
    next_generation: AtomicU64,
    hits: AtomicU64,
    joins: AtomicU64,
    fetches: AtomicU64,
}

impl fmt::Debug for QueryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryService")
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl QueryService {
    /// Create a service whose fetches run on `scheduler`.
    pub fn new(scheduler: Scheduler, hub: EventHub) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                root: TaskHandle::root("query-service", TaskOrigin::Service),
                scheduler,
                hub,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                hits: AtomicU64::new(0),
                joins: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    /// Run `query`, reusing a cached value or an in-flight fetch for its key.
    ///
    /// # Errors
    ///
    /// * [`QueryError::Fetch`] - the fetch failed; shared by every attached caller.
    /// * [`QueryError::TypeMismatch`] - the key holds a value of another type.
    /// * [`QueryError::Closed`] - the service was shut down.
    pub async fn query<Q: Query>(&self, query: Q) -> Result<Q::Output, QueryError> {
        if self.inner.root.is_cancelled() {
            return Err(QueryError::Closed);
        }
        let key = query.descriptor().cache_key();

        let fetch = {
            let mut entries = self.inner.entries.lock();
            match entries.get(&key).map(|entry| &entry.state) {
                Some(EntryState::Resolved(value)) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(%key, "query cache hit");
                    return downcast::<Q::Output>(&key, value);
                }
                Some(EntryState::Pending { fetch, .. }) => {
                    self.inner.joins.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(%key, "query attached to in-flight fetch");
                    fetch.clone()
                }
                None => {
                    let (generation, fetch, task) = self.start_fetch(key.clone(), query);
                    entries.insert(
                        key.clone(),
                        CacheEntry {
                            generation,
                            state: EntryState::Pending {
                                fetch: fetch.clone(),
                                task,
                            },
                        },
                    );
                    fetch
                }
            }
        };

        let value = fetch.await?;
        downcast::<Q::Output>(&key, &value)
    }

    fn start_fetch<Q: Query>(&self, key: String, query: Q) -> (u64, SharedFetch, TaskHandle) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.fetches.fetch_add(1, Ordering::Relaxed);

        let handle = self
            .inner
            .root
            .child_with_origin(format!("query {key}"), TaskOrigin::Query(key.clone()));
        let cx = TaskContext::new(
            handle.clone(),
            self.inner.scheduler.clone(),
            self.inner.hub.clone(),
        );
        let span = tracing::debug_span!("query", key = %key, generation);
        let join: TaskJoin<ErasedValue> = TaskJoin::start(
            &self.inner.scheduler,
            handle.clone(),
            async move {
                let value = query.fetch(&cx).await?;
                Ok(Arc::new(value) as ErasedValue)
            }
            .instrument(span),
        );

        let service = Arc::downgrade(&self.inner);
        let fetch = async move {
            let result = join.await.map_err(|e| QueryError::Fetch(Box::new(e)));
            settle(&service, &key, generation, &result);
            result
        }
        .boxed()
        .shared();
        // Drives the entry to its settled state even if every caller goes away.
        self.inner.scheduler.spawn(fetch.clone().map(|_| ()));

        (generation, fetch, handle)
    }

    /// Evict every entry whose key satisfies `predicate`.
    ///
    /// In-flight fetches for evicted keys are not cancelled; callers already
    /// attached still receive their outcome, but it will not be cached.
    ///
    /// # Returns
    ///
    /// The number of evicted entries.
    pub fn invalidate(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, "query cache invalidated");
        }
        evicted
    }

    /// Evict everything.
    pub fn invalidate_all(&self) -> usize {
        self.invalidate(|_| true)
    }

    /// Status of the entry for `key`, if any.
    pub fn status(&self, key: &str) -> Option<CacheStatus> {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|entry| match entry.state {
                EntryState::Pending { .. } => CacheStatus::Pending,
                EntryState::Resolved(_) => CacheStatus::Resolved,
            })
    }

    /// Handle of the in-flight fetch for `key`, if one is pending.
    pub fn inflight(&self, key: &str) -> Option<TaskHandle> {
        match &self.inner.entries.lock().get(key)?.state {
            EntryState::Pending { task, .. } => Some(task.clone()),
            EntryState::Resolved(_) => None,
        }
    }

    /// Number of cache entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// `true` when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters since creation.
    pub fn stats(&self) -> QueryStats {
        QueryStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            joins: self.inner.joins.load(Ordering::Relaxed),
            fetches: self.inner.fetches.load(Ordering::Relaxed),
        }
    }

    /// Cancel every in-flight fetch and refuse new queries.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.entries.lock().clear();
    }
}

/// Transition the entry a fetch belongs to, unless it was evicted meanwhile.
fn settle(
    service: &Weak<ServiceInner>,
    key: &str,
    generation: u64,
    result: &Result<ErasedValue, QueryError>,
) {
    let Some(inner) = service.upgrade() else {
        return;
    };
    let mut entries = inner.entries.lock();
    let Some(entry) = entries.get_mut(key) else {
        return;
    };
    if entry.generation != generation || !matches!(entry.state, EntryState::Pending { .. }) {
        return;
    }
    match result {
        Ok(value) => {
            entry.state = EntryState::Resolved(Arc::clone(value));
            tracing::debug!(%key, "query resolved");
        }
        Err(err) => {
            entries.remove(key);
            tracing::debug!(%key, error = %err, "query rejected; entry evicted");
        }
    }
}

fn downcast<T: Clone + Send + Sync + 'static>(
    key: &str,
    value: &ErasedValue,
) -> Result<T, QueryError> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| QueryError::TypeMismatch {
            key: key.to_owned(),
        })
}
