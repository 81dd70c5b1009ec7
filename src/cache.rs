use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use bytes::Bytes;
use dashmap::DashMap;
use hickory_proto::rr::RecordType;
use moka::sync::Cache;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::proto;

/// Composite cache key. Tenants (one per forwarder instance) never collide
/// because the tenant participates in hashing/equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant: Arc<str>,
    pub qtype: RecordType,
    /// Lowercased, trailing dot stripped.
    pub name: Arc<str>,
}

impl CacheKey {
    pub fn new(tenant: Arc<str>, qtype: RecordType, name: &str) -> Self {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        Self {
            tenant,
            qtype,
            name: Arc::from(name),
        }
    }

    /// Deterministic diagnostic form: `<tenant>:<qtype-mnemonic>:<name>`.
    pub fn render(&self) -> String {
        format!("{}:{}:{}", self.tenant, self.qtype, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: Bytes,
    /// Absolute expiry, unix seconds.
    pub expiry: u64,
}

#[derive(Debug)]
pub enum Lookup {
    Fresh(Bytes, u64),
    Stale(Bytes),
    Miss,
}

type Produced = anyhow::Result<(Bytes, Arc<str>)>;
type Served = anyhow::Result<(Bytes, u64, Arc<str>)>;
type Waiters = Vec<oneshot::Sender<Served>>;

/// Tenant-shared response cache. moka provides the cost ceiling with a
/// TinyLFU admission filter (frequency sketch sized well past 10^7 touches);
/// entries cost 1 each. Expiry is carried inside the entry rather than via
/// the store's TTL so expired entries stay observable for
/// stale-while-revalidate.
#[derive(Clone)]
pub struct SharedCache {
    store: Cache<CacheKey, CacheEntry>,
    inflight: Arc<DashMap<CacheKey, Waiters>>,
}

impl SharedCache {
    /// `max_cost` is the configured capacity in MB shifted to a raw cost
    /// ceiling, matching the original deployment's sizing.
    pub fn new(max_cost: u64) -> Self {
        let store = Cache::builder().max_capacity(max_cost).build();
        Self {
            store,
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Lookup {
        match self.store.get(key) {
            Some(entry) => {
                let now = unix_now();
                if entry.expiry > now {
                    Lookup::Fresh(entry.response, entry.expiry - now)
                } else {
                    Lookup::Stale(entry.response)
                }
            }
            None => Lookup::Miss,
        }
    }

    /// Replaces any previous entry. A zero TTL means uncacheable; ignored.
    pub fn set(&self, key: CacheKey, response: Bytes, ttl: u64) {
        if ttl == 0 {
            return;
        }
        self.store.insert(
            key,
            CacheEntry {
                response,
                expiry: unix_now() + ttl,
            },
        );
    }

    /// Serve `key` from cache, falling back to `produce`:
    ///
    /// * fresh hit  -> `(bytes, expiry - now, <tenant>)`, no upstream call;
    /// * stale hit  -> `(bytes, 0, "<tenant>_expired")` immediately, plus a
    ///   coalesced background refresh that only touches the cache;
    /// * miss       -> single-flight: one caller runs `produce`, concurrent
    ///   callers for the same key await its outcome.
    ///
    /// On a produced response, the cache TTL is the first Answer RR's TTL
    /// (0 = not stored).
    pub async fn get_or_update<F, Fut>(&self, key: CacheKey, produce: F) -> Served
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Produced> + Send + 'static,
    {
        match self.get(&key) {
            Lookup::Fresh(bytes, remaining) => {
                let tenant = Arc::clone(&key.tenant);
                Ok((bytes, remaining, tenant))
            }
            Lookup::Stale(bytes) => {
                let tag: Arc<str> = Arc::from(format!("{}_expired", key.tenant));
                self.spawn_refresh(key, produce);
                Ok((bytes, 0, tag))
            }
            Lookup::Miss => match self.claim(&key) {
                Claim::Leader => self.lead(key, produce()).await,
                Claim::Follower(rx) => match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("in-flight upstream query was dropped")),
                },
            },
        }
    }

    /// Background stale refresh. The task captures the cache handle and the
    /// producer only; request-scoped state (client address, transaction ID)
    /// must not reach here.
    fn spawn_refresh<F, Fut>(&self, key: CacheKey, produce: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Produced> + Send + 'static,
    {
        if !self.try_claim(&key) {
            // refresh already in flight for this key
            return;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            let rendered = key.render();
            if let Err(err) = cache.lead(key, produce()).await {
                warn!(key = %rendered, error = %err, "stale refresh failed");
            } else {
                debug!(key = %rendered, "stale entry refreshed");
            }
        });
    }

    fn claim(&self, key: &CacheKey) -> Claim {
        use dashmap::mapref::entry::Entry;
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let (tx, rx) = oneshot::channel();
                occupied.get_mut().push(tx);
                Claim::Follower(rx)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Vec::new());
                Claim::Leader
            }
        }
    }

    /// Claim leadership without registering a waiter; false when another
    /// caller already owns the key.
    fn try_claim(&self, key: &CacheKey) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Vec::new());
                true
            }
        }
    }

    /// Run the producer as the in-flight leader: store the result, then fan
    /// it out to every follower that queued up meanwhile.
    async fn lead<Fut>(&self, key: CacheKey, fut: Fut) -> Served
    where
        Fut: Future<Output = Produced>,
    {
        let mut guard = InflightCleanupGuard::new(Arc::clone(&self.inflight), key.clone());

        let outcome = match fut.await {
            Ok((bytes, source)) => {
                let ttl = proto::first_answer_ttl(&bytes);
                if ttl > 0 {
                    self.set(key.clone(), bytes.clone(), ttl);
                }
                Ok((bytes, ttl, source))
            }
            Err(err) => Err(err),
        };

        let waiters = self
            .inflight
            .remove(&key)
            .map(|(_, waiters)| waiters)
            .unwrap_or_default();
        guard.defuse();

        match &outcome {
            Ok((bytes, ttl, source)) => {
                for tx in waiters {
                    let _ = tx.send(Ok((bytes.clone(), *ttl, Arc::clone(source))));
                }
            }
            Err(err) => {
                let msg = err.to_string();
                for tx in waiters {
                    let _ = tx.send(Err(anyhow!(msg.clone())));
                }
            }
        }

        outcome
    }

    #[cfg(test)]
    fn insert_with_expiry(&self, key: CacheKey, response: Bytes, expiry: u64) {
        self.store.insert(key, CacheEntry { response, expiry });
    }

    #[cfg(test)]
    fn sync(&self) {
        self.store.run_pending_tasks();
    }
}

enum Claim {
    Leader,
    Follower(oneshot::Receiver<Served>),
}

/// Removes the in-flight entry if the leader future is dropped before it can
/// notify its followers, so a cancelled leader never wedges the key.
struct InflightCleanupGuard {
    inflight: Arc<DashMap<CacheKey, Waiters>>,
    key: CacheKey,
    active: bool,
}

impl InflightCleanupGuard {
    fn new(inflight: Arc<DashMap<CacheKey, Waiters>>, key: CacheKey) -> Self {
        Self {
            inflight,
            key,
            active: true,
        }
    }

    fn defuse(&mut self) {
        self.active = false;
    }
}

impl Drop for InflightCleanupGuard {
    fn drop(&mut self) {
        if self.active {
            self.inflight.remove(&self.key);
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
