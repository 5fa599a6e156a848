//! Entry cache with generation-based deferred forget.
//!
//! Maps `(parent id, child name)` to the remote object's identity and
//! attributes. Capacity is enforced by pure LRU eviction. An evicted item is
//! not reported to the remote side (via a FORGET message) until two things
//! hold: no in-flight operation still references it, and every generation
//! that overlaps its last-used time has been fully dereferenced. The second
//! condition prevents a forget from racing ahead of an operation that is
//! still relying on the old identity remaining valid remotely.
//!
//! All table and list mutations happen under one mutex. Lookups that must
//! allocate do so outside the lock and re-validate after reacquiring it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use hashlink::LinkedHashMap;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::proto::Attr;

/// Monotonic engine time, in nanoseconds. Callers supply it explicitly so
/// expiration behavior is deterministic under test.
pub type Ticks = u64;

/// Generation reuse granularity: references taken within the same window
/// share one generation record instead of allocating a new one.
const GEN_WINDOW: Ticks = 10_000_000; // 10ms

/// Default capacity: one 4 KiB page worth of pointer-sized buckets.
const DEFAULT_CAPACITY: usize = 4096 / std::mem::size_of::<usize>();

/// Snapshot of a remote object's identity and attributes, as produced by
/// lookup/create/mkdir responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Remote object id (inode number).
    pub ino: u64,
    /// Remote generation counter for `ino` reuse detection.
    pub generation: u64,
    /// POSIX attributes.
    pub attr: Attr,
    /// How long the name→ino binding stays valid, in nanoseconds.
    pub entry_valid: Ticks,
    /// How long the attributes stay valid, in nanoseconds.
    pub attr_valid: Ticks,
}

impl Entry {
    /// Build an [`Entry`] from a wire-level lookup/create response.
    #[must_use]
    pub fn from_entry_out(out: &crate::proto::EntryOut) -> Self {
        Self {
            ino: out.nodeid,
            generation: out.generation,
            attr: out.attr,
            entry_valid: out
                .entry_valid
                .saturating_mul(1_000_000_000)
                .saturating_add(u64::from(out.entry_valid_nsec)),
            attr_valid: out
                .attr_valid
                .saturating_mul(1_000_000_000)
                .saturating_add(u64::from(out.attr_valid_nsec)),
        }
    }
}

/// Opaque handle to a cache slot. Stale handles (for items already freed)
/// are tolerated by every operation as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemHandle(u64);

/// Opaque handle to a referenced generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenHandle(u64);

/// Receives batched forget notifications from [`EntryCache::expire`].
///
/// The sink drains what it accepts from the front of `batch`; records left
/// behind (sink refused, e.g. the session is shutting down) are prepended
/// back onto the forget-ready list and retried on the next sweep.
pub trait ForgetSink {
    fn notify_forget(&self, batch: &mut VecDeque<(u64, u64)>);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    parent: u64,
    /// Child name, case-folded at construction when the volume is
    /// case-insensitive.
    name: Box<str>,
}

#[derive(Debug)]
struct CacheItem {
    key: EntryKey,
    entry: Entry,
    /// In-flight operations currently relying on this identity.
    refs: u32,
    expires_at: Ticks,
    last_used: Ticks,
    /// Next lookup must treat this item as expired (set after a local
    /// mutation invalidates remote attributes). Does not evict eagerly: an
    /// in-flight reader may legitimately see the stale value once more.
    quick_expire: bool,
    /// Never emit a FORGET for this item (the synthetic root entry, which
    /// was never actually looked up remotely).
    no_forget: bool,
    /// Times this identity was vended by a remote lookup; reported back in
    /// the FORGET payload.
    nlookup: u64,
    /// Still reachable from the hash table and LRU list.
    live: bool,
}

#[derive(Debug, Clone, Copy)]
struct GenRecord {
    id: u64,
    started: Ticks,
    refs: u32,
}

#[derive(Debug, Clone, Copy)]
struct ForgetRecord {
    ino: u64,
    nlookup: u64,
    last_used: Ticks,
}

#[derive(Debug, Default)]
struct CacheInner {
    /// Insertion/touch order: front = least recently used.
    lru: LinkedHashMap<EntryKey, u64>,
    /// All items still owned by the cache: live ones plus evicted ones
    /// whose refcount has not yet dropped to zero.
    items: FxHashMap<u64, CacheItem>,
    /// Evicted, refcount-zero items awaiting generation clearance and the
    /// forget notification. Front = oldest.
    forget_ready: VecDeque<ForgetRecord>,
    /// Referenced generations, oldest first. Ids increase monotonically.
    gens: VecDeque<GenRecord>,
}

impl CacheInner {
    /// Earliest start time of any still-referenced generation. Items
    /// last used before this point are clear to forget.
    fn forget_barrier(&self) -> Ticks {
        self.gens
            .iter()
            .find(|g| g.refs > 0)
            .map_or(Ticks::MAX, |g| g.started)
    }

    /// Remove an item from the hash table and LRU list. If nothing still
    /// references it, it transitions straight to forget-ready (or is freed
    /// when flagged no-forget).
    fn evict(&mut self, handle: u64) {
        let Some(item) = self.items.get_mut(&handle) else {
            return;
        };
        if item.live {
            self.lru.remove(&item.key);
            item.live = false;
        }
        if item.refs == 0 {
            self.retire(handle);
        }
    }

    /// Free an evicted, refcount-zero item, queueing its forget record
    /// unless it is flagged no-forget.
    fn retire(&mut self, handle: u64) {
        if let Some(item) = self.items.remove(&handle) {
            debug_assert!(!item.live && item.refs == 0);
            if !item.no_forget {
                self.forget_ready.push_back(ForgetRecord {
                    ino: item.entry.ino,
                    nlookup: item.nlookup,
                    last_used: item.last_used,
                });
            }
        }
    }
}

/// The entry cache. See the module docs for the lifecycle rules.
pub struct EntryCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    case_insensitive: bool,
    next_handle: AtomicU64,
    next_gen: AtomicU64,
}

impl EntryCache {
    /// Create a cache. `capacity` defaults to one page worth of buckets.
    #[must_use]
    pub fn new(capacity: Option<usize>, case_insensitive: bool) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.unwrap_or(DEFAULT_CAPACITY).max(1),
            case_insensitive,
            next_handle: AtomicU64::new(1),
            next_gen: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, parent: u64, name: &str) -> EntryKey {
        let name = if self.case_insensitive {
            name.to_uppercase().into_boxed_str()
        } else {
            Box::from(name)
        };
        EntryKey { parent, name }
    }

    /// Look up a cached entry, touching LRU order on a hit.
    ///
    /// Expired or quick-expired items are evicted on the spot and reported
    /// as a miss, forcing the caller back to the remote side.
    #[must_use]
    pub fn get_entry(&self, parent: u64, name: &str, now: Ticks) -> Option<(Entry, ItemHandle)> {
        let key = self.key(parent, name);
        let mut inner = self.lock();
        let handle = *inner.lru.get(&key)?;
        let item = inner.items.get_mut(&handle)?;
        if item.quick_expire || item.expires_at <= now {
            inner.evict(handle);
            return None;
        }
        item.last_used = now;
        let entry = item.entry;
        inner.lru.to_back(&key);
        Some((entry, ItemHandle(handle)))
    }

    /// Insert or refresh the entry for `(parent, name)`.
    ///
    /// A same-identity refresh updates attributes and expiry in place and
    /// bumps the lookup count; an identity change (or a quick-expired
    /// slot) evicts the old item first. Under capacity pressure the
    /// least-recently-touched item is evicted, regardless of expiry.
    pub fn set_entry(&self, parent: u64, name: &str, entry: Entry, now: Ticks) -> ItemHandle {
        // Build the candidate before taking the lock; re-check afterwards.
        let key = self.key(parent, name);
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let candidate = CacheItem {
            key: key.clone(),
            entry,
            refs: 0,
            // Served only while both the binding and the attributes hold.
            expires_at: now.saturating_add(entry.entry_valid.min(entry.attr_valid)),
            last_used: now,
            quick_expire: false,
            no_forget: false,
            nlookup: 1,
            live: true,
        };

        let mut inner = self.lock();
        if let Some(&existing) = inner.lru.get(&key) {
            let item = inner
                .items
                .get_mut(&existing)
                .expect("live LRU entry must have a backing item");
            if item.entry.ino == entry.ino && !item.quick_expire {
                item.entry = entry;
                item.expires_at = now.saturating_add(entry.entry_valid.min(entry.attr_valid));
                item.last_used = now;
                item.nlookup += 1;
                inner.lru.to_back(&key);
                return ItemHandle(existing);
            }
            inner.evict(existing);
        }

        while inner.lru.len() >= self.capacity {
            let Some((_, oldest)) = inner.lru.front() else {
                break;
            };
            let oldest = *oldest;
            inner.evict(oldest);
        }

        inner.lru.insert(key, handle);
        inner.items.insert(handle, candidate);
        ItemHandle(handle)
    }

    /// Unconditionally evict the entry for `(parent, name)`.
    pub fn remove_entry(&self, parent: u64, name: &str) {
        let key = self.key(parent, name);
        let mut inner = self.lock();
        if let Some(&handle) = inner.lru.get(&key) {
            inner.evict(handle);
        }
    }

    /// Pin an item: its backing slot survives eviction until released.
    pub fn reference_item(&self, handle: ItemHandle) {
        let mut inner = self.lock();
        if let Some(item) = inner.items.get_mut(&handle.0) {
            item.refs += 1;
        }
    }

    /// Release a pin. Dropping the last reference on an already-evicted
    /// item retires it to the forget-ready list (or frees it outright when
    /// flagged no-forget).
    pub fn dereference_item(&self, handle: ItemHandle) {
        let mut inner = self.lock();
        let Some(item) = inner.items.get_mut(&handle.0) else {
            return;
        };
        debug_assert!(item.refs > 0, "unbalanced dereference");
        item.refs = item.refs.saturating_sub(1);
        if item.refs == 0 && !item.live {
            inner.retire(handle.0);
        }
    }

    /// Force the next lookup of this item to treat it as expired.
    pub fn quick_expire_item(&self, handle: ItemHandle) {
        let mut inner = self.lock();
        if let Some(item) = inner.items.get_mut(&handle.0) {
            item.quick_expire = true;
        }
    }

    /// Exempt this item from forget reporting. Applied to the synthetic
    /// root entry, which the remote side never vended.
    pub fn set_no_forget(&self, handle: ItemHandle) {
        let mut inner = self.lock();
        if let Some(item) = inner.items.get_mut(&handle.0) {
            item.no_forget = true;
        }
    }

    /// Take a reference on the current generation, allocating a new record
    /// only when the time window has advanced.
    pub fn reference_gen(&self, now: Ticks) -> GenHandle {
        {
            let mut inner = self.lock();
            if let Some(gen) = inner.gens.back_mut() {
                if now < gen.started.saturating_add(GEN_WINDOW) {
                    gen.refs += 1;
                    return GenHandle(gen.id);
                }
            }
        }
        // The window advanced: allocate off-lock, then re-check, since
        // another caller may have installed a fresh generation meanwhile.
        let record = GenRecord {
            id: self.next_gen.fetch_add(1, Ordering::Relaxed),
            started: now,
            refs: 1,
        };
        let mut inner = self.lock();
        if let Some(gen) = inner.gens.back_mut() {
            if now < gen.started.saturating_add(GEN_WINDOW) {
                gen.refs += 1;
                return GenHandle(gen.id);
            }
        }
        inner.gens.push_back(record);
        GenHandle(record.id)
    }

    /// Release a generation reference. Fully-released generations are
    /// discarded once they reach the front of the list, advancing the
    /// forget barrier.
    pub fn dereference_gen(&self, handle: GenHandle) {
        let mut inner = self.lock();
        if let Some(gen) = inner.gens.iter_mut().find(|g| g.id == handle.0) {
            debug_assert!(gen.refs > 0, "unbalanced generation dereference");
            gen.refs = gen.refs.saturating_sub(1);
        }
        while inner.gens.front().is_some_and(|g| g.refs == 0) {
            inner.gens.pop_front();
        }
    }

    /// Periodic sweep.
    ///
    /// First evicts the LRU-oldest item for as long as it is expired or
    /// quick-expired (cost bounded by how many consecutive oldest items
    /// qualify — this is not a time-sorted scan). Then batches every
    /// forget-ready record whose last-used time precedes the forget
    /// barrier into one notification. Records the sink does not accept
    /// are prepended back and retried on the next sweep.
    pub fn expire(&self, now: Ticks, sink: &dyn ForgetSink) {
        let mut batch = {
            let mut inner = self.lock();
            loop {
                let Some((_, &handle)) = inner.lru.front() else {
                    break;
                };
                let expired = inner
                    .items
                    .get(&handle)
                    .is_some_and(|item| item.quick_expire || item.expires_at <= now);
                if !expired {
                    break;
                }
                inner.evict(handle);
            }

            let barrier = inner.forget_barrier();
            let mut batch = VecDeque::new();
            while inner
                .forget_ready
                .front()
                .is_some_and(|r| r.last_used < barrier)
            {
                let record = inner
                    .forget_ready
                    .pop_front()
                    .expect("front was just observed");
                batch.push_back((record.ino, record.nlookup));
            }
            batch
        };
        if batch.is_empty() {
            return;
        }

        let total = batch.len();
        sink.notify_forget(&mut batch);
        if !batch.is_empty() {
            debug!(
                rejected = batch.len(),
                total, "forget notification not fully accepted; requeueing"
            );
            let mut inner = self.lock();
            for &(ino, nlookup) in batch.iter().rev() {
                inner.forget_ready.push_front(ForgetRecord {
                    ino,
                    nlookup,
                    // Already cleared the barrier once; stays clear.
                    last_used: 0,
                });
            }
        }
    }

    /// Pop one forget-ready record that has cleared the generation
    /// barrier, returning the remote id and the cumulative lookup count
    /// to report.
    #[must_use]
    pub fn forget_one(&self) -> Option<(u64, u64)> {
        let mut inner = self.lock();
        let barrier = inner.forget_barrier();
        if inner
            .forget_ready
            .front()
            .is_some_and(|r| r.last_used < barrier)
        {
            let record = inner
                .forget_ready
                .pop_front()
                .expect("front was just observed");
            Some((record.ino, record.nlookup))
        } else {
            None
        }
    }

    /// Number of live (table-reachable) entries. Test aid.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.lock().lru.len()
    }
}
