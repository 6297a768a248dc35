//! Keyed store of reference-counted entries with idle-time reclamation.
//!
//! ## Per-entry protocol
//!
//! Each key maps to a heap-allocated [`Slot`] carrying a lease count, a
//! touch version, and a lifecycle flag:
//!
//! ```text
//! Initializing ──▶ Ready ──▶ Deleting ──▶ Deleted
//!                    ▲           │
//!                    └───────────┘  (revert when touched mid-delete)
//! ```
//!
//! `Deleted` is terminal for a slot instance; the key may later be
//! repopulated with a fresh instance.  Acquire paths bump the count
//! first, wait out `Initializing`/`Deleting` with cooperative yields,
//! then bump the version.  Release paths bump the version **before**
//! decrementing the count, so a reaper that observes count zero with a
//! stale version knows the entry came back to life.
//!
//! ## Reclamation
//!
//! A release that drives the count to zero reports the slot to a reaper
//! thread over an unbuffered channel.  The reaper batches reports into a
//! `to_check` epoch; on each timer tick it deletes last epoch's
//! still-untouched survivors and promotes this epoch's untouched entries.
//! An idle entry therefore stays resident for at least one TTL and at
//! most two.  With a TTL of zero the reaper does not exist and deletion
//! is attempted inline on the releasing thread (fast-delete mode).
//!
//! [`try_delete`](Shared::try_delete) is the only place values die: it
//! re-checks untouchedness *after* winning the `Ready → Deleting` race,
//! which lets a concurrent acquirer that already bumped the count wake
//! back up into `Ready` without losing the value.

use std::hash::Hash;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, Once, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::BoxError;
use crate::finalize::Finalize;
use crate::signal::Signal;
use crate::stats::{Metrics, StatsCounter};
use crate::store::Shards;
use crate::timer::IdleTimer;

const NUM_SHARDS: usize = 16;

// ---------------------------------------------------------------------------
// Slot — per-entry state machine
// ---------------------------------------------------------------------------

const INITIALIZING: u32 = 0;
const READY: u32 = 1;
const DELETING: u32 = 2;
const DELETED: u32 = 3;

pub(crate) struct Slot<V> {
    /// Live lease count.  Never negative at any observable moment.
    cnt: AtomicI32,
    /// Touch version, bumped on every acquire and release.
    ver: AtomicU32,
    flag: AtomicU32,
    /// Present iff the flag is `Ready` or `Deleting` and the value has not
    /// been finalized yet.
    value: RwLock<Option<Arc<V>>>,
}

impl<V> Slot<V> {
    /// A fresh instance, born holding the inserting caller's lease.
    fn initializing() -> Self {
        Slot {
            cnt: AtomicI32::new(1),
            ver: AtomicU32::new(0),
            flag: AtomicU32::new(INITIALIZING),
            value: RwLock::new(None),
        }
    }

    fn untouched_since(&self, ver: u32) -> bool {
        self.cnt.load(SeqCst) == 0 && self.ver.load(SeqCst) == ver
    }

    /// Waits out transient states.  Returns `false` when this instance is
    /// already dead and the caller must retry against a fresh insertion.
    fn settle(&self) -> bool {
        loop {
            match self.flag.load(SeqCst) {
                READY => return true,
                DELETED => return false,
                INITIALIZING | DELETING => thread::yield_now(),
                other => panic!("corrupt slot flag {other}"),
            }
        }
    }

    /// Takes one lease on this instance.  Returns `false` if the instance
    /// is dead (the count bump is then inert — the slot is unreachable).
    fn acquire(&self) -> bool {
        self.cnt.fetch_add(1, SeqCst);
        if !self.settle() {
            return false;
        }
        self.ver.fetch_add(1, SeqCst);
        true
    }

    fn value(&self) -> Arc<V> {
        match &*self.value.read() {
            Some(value) => Arc::clone(value),
            None => panic!("ready slot has no value"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reaper events
// ---------------------------------------------------------------------------

struct IdlePayload<K, V> {
    key: K,
    slot: Arc<Slot<V>>,
    /// Slot version observed by the release that hit zero.
    ver: u32,
}

enum ReaperEvent<K, V> {
    Idle(IdlePayload<K, V>),
    /// Synthesized when the reaper's timer fires; never travels the
    /// channel.
    Tick,
    Quit,
}

// ---------------------------------------------------------------------------
// Lease & EntryRef
// ---------------------------------------------------------------------------

/// The reference a caller holds on a map entry.
///
/// Dropping the lease releases the reference; [`release`](Lease::release)
/// does the same eagerly.  Each lease decrements its entry's count exactly
/// once.
pub struct Lease {
    inner: Option<Box<dyn FnOnce() + Send>>,
}

impl Lease {
    pub(crate) fn noop() -> Self {
        Lease { inner: None }
    }

    pub(crate) fn on_release(f: impl FnOnce() + Send + 'static) -> Self {
        Lease {
            inner: Some(Box::new(f)),
        }
    }

    /// Gives the reference back now instead of at drop time.
    pub fn release(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(f) = self.inner.take() {
            f();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Back-reference handed to `create` inside
/// [`LeaseMap::acquire_or_store`]: lets the creator take and give back
/// leases on the entry being built without going through the map, which
/// would deadlock on the in-flight insertion.
pub struct EntryRef<K, V> {
    shared: Arc<Shared<K, V>>,
    key: K,
    slot: Arc<Slot<V>>,
}

impl<K, V> EntryRef<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Takes an extra lease on the entry.  Returns `false` if the entry
    /// instance has already died.
    pub fn acquire(&self) -> bool {
        self.slot.acquire()
    }

    pub fn release(&self) {
        self.shared.release_slot(&self.key, &self.slot);
    }
}

impl<K: Clone, V> Clone for EntryRef<K, V> {
    fn clone(&self) -> Self {
        EntryRef {
            shared: Arc::clone(&self.shared),
            key: self.key.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

// ---------------------------------------------------------------------------
// Map interior
// ---------------------------------------------------------------------------

type Finalizer<V> = Box<dyn Fn(&V) -> Result<(), BoxError> + Send + Sync>;

struct Shared<K, V> {
    table: Shards<K, Arc<Slot<V>>>,
    ttl: Duration,
    fast_delete: bool,
    tx: Sender<ReaperEvent<K, V>>,
    /// Taken by the reaper thread on first start.
    reaper_rx: Mutex<Option<Receiver<ReaperEvent<K, V>>>>,
    died: Signal,
    start: Once,
    finalizer: Option<Finalizer<V>>,
    stats: StatsCounter,
}

impl<K, V> Shared<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn lease(this: &Arc<Self>, key: &K, slot: &Arc<Slot<V>>) -> Lease {
        let shared = Arc::clone(this);
        let key = key.clone();
        let slot = Arc::clone(slot);
        Lease::on_release(move || shared.release_slot(&key, &slot))
    }

    fn release_slot(&self, key: &K, slot: &Arc<Slot<V>>) {
        // The version bump is ordered before the decrement so that a zero
        // observation is always paired with a fresh version.
        let ver = slot.ver.fetch_add(1, SeqCst).wrapping_add(1);
        let cnt = slot.cnt.fetch_sub(1, SeqCst) - 1;
        if cnt < 0 {
            panic!("lease count went negative ({cnt})");
        }
        if cnt != 0 {
            return;
        }

        if self.fast_delete {
            self.try_delete(key, slot, slot.ver.load(SeqCst));
            return;
        }

        select! {
            recv(self.died.listen()) -> _ => {
                // Reaper already quit: reclaim inline.
                self.try_delete(key, slot, slot.ver.load(SeqCst));
            }
            send(self.tx, ReaperEvent::Idle(IdlePayload {
                key: key.clone(),
                slot: Arc::clone(slot),
                ver,
            })) -> res => {
                if res.is_err() {
                    self.try_delete(key, slot, slot.ver.load(SeqCst));
                }
            }
        }
    }

    /// The only place values are destroyed.  Deletes the entry iff it has
    /// stayed untouched since `ver`.
    fn try_delete(&self, key: &K, slot: &Arc<Slot<V>>, ver: u32) {
        if !slot.untouched_since(ver) {
            return;
        }
        if slot
            .flag
            .compare_exchange(READY, DELETING, SeqCst, SeqCst)
            .is_err()
        {
            return;
        }

        // An acquire may have slipped in between the first check and the
        // CAS; re-check before tearing the value down.  A toucher spinning
        // on `Deleting` wakes back into `Ready` when this fails.
        let mut deleted = false;
        if slot.untouched_since(ver) {
            if let Some(value) = slot.value.write().take() {
                if let Some(finalize) = &self.finalizer {
                    if finalize(&value).is_err() {
                        self.stats.record_finalize_error();
                    }
                }
            }
            self.table.remove(key);
            self.stats.record_reclamation();
            deleted = true;
        }
        slot.flag
            .store(if deleted { DELETED } else { READY }, SeqCst);
    }
}

// ---------------------------------------------------------------------------
// LeaseMap
// ---------------------------------------------------------------------------

/// A concurrent keyed container that retains values while any caller
/// holds a live [`Lease`] and reclaims them after one idle TTL.
///
/// # Example
/// ```
/// use linger::LeaseMap;
/// use std::time::Duration;
///
/// let map: LeaseMap<u32, String> = LeaseMap::new(Duration::from_millis(50));
/// let (value, created, lease) = map.acquire_or_store(1, |_| "expensive".to_string());
/// assert!(created);
/// assert_eq!(*value, "expensive");
/// lease.release();
/// // After roughly one to two TTLs of idleness the entry is gone.
/// std::thread::sleep(Duration::from_millis(200));
/// assert!(map.acquire(&1).is_none());
/// ```
pub struct LeaseMap<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for LeaseMap<K, V> {
    fn clone(&self) -> Self {
        LeaseMap {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> LeaseMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// A map whose idle entries are reclaimed after `ttl`.
    ///
    /// A zero `ttl` selects fast-delete mode: no reaper thread runs and an
    /// entry is torn down synchronously when its last lease is released.
    pub fn new(ttl: Duration) -> Self {
        Self::build(ttl, None)
    }

    fn build(ttl: Duration, finalizer: Option<Finalizer<V>>) -> Self {
        let (tx, rx) = bounded(0);
        LeaseMap {
            shared: Arc::new(Shared {
                table: Shards::new(NUM_SHARDS),
                ttl,
                fast_delete: ttl.is_zero(),
                tx,
                reaper_rx: Mutex::new(Some(rx)),
                died: Signal::new(),
                start: Once::new(),
                finalizer,
                stats: StatsCounter::new(),
            }),
        }
    }

    /// Idempotently spawns the reaper thread.  A no-op in fast-delete
    /// mode.  Called implicitly by every public operation.
    pub fn start(&self) {
        if self.shared.fast_delete {
            return;
        }
        self.shared.start.call_once(|| {
            let rx = self
                .shared
                .reaper_rx
                .lock()
                .take()
                .expect("reaper channel taken exactly once");
            let weak = Arc::downgrade(&self.shared);
            let ttl = self.shared.ttl;
            thread::Builder::new()
                .name("linger-reaper".into())
                .spawn(move || reaper(weak, rx, ttl))
                .expect("failed to spawn reaper thread");
        });
    }

    fn ensure_alive(&self) {
        self.start();
        if self.shared.died.is_fired() {
            panic!("lease map used after quit");
        }
    }

    /// Terminates the reaper, synchronously reclaiming every idle entry it
    /// was tracking.  Any later operation on the map panics.  Idempotent.
    pub fn quit(&self) {
        if self.shared.fast_delete {
            self.shared.died.fire();
            return;
        }
        self.start();
        select! {
            recv(self.shared.died.listen()) -> _ => {}
            send(self.shared.tx, ReaperEvent::Quit) -> res => { let _ = res; }
        }
    }

    /// Returns the value for `key`, building it via `create` if no live
    /// entry exists.
    ///
    /// `create` runs while every other caller for the same key spins, and
    /// receives an [`EntryRef`] through which it may take leases on the
    /// very entry being built.  The returned flag is `true` iff `create`
    /// ran; the caller holds one lease either way.
    pub fn acquire_or_store<F>(&self, key: K, create: F) -> (Arc<V>, bool, Lease)
    where
        F: FnOnce(EntryRef<K, V>) -> V,
    {
        self.ensure_alive();
        let mut create = Some(create);
        loop {
            let (slot, loaded) = self
                .shared
                .table
                .load_or_store(key.clone(), || Arc::new(Slot::initializing()));

            let created;
            if loaded {
                slot.cnt.fetch_add(1, SeqCst);
                if !slot.settle() {
                    // This instance was reaped under us; retry with a
                    // fresh insertion.
                    continue;
                }
                created = false;
            } else {
                let create = create.take().expect("creator runs at most once");
                let entry = EntryRef {
                    shared: Arc::clone(&self.shared),
                    key: key.clone(),
                    slot: Arc::clone(&slot),
                };
                let value = Arc::new(create(entry));
                *slot.value.write() = Some(value);
                slot.flag.store(READY, SeqCst);
                self.shared.stats.record_creation();
                created = true;
            }

            slot.ver.fetch_add(1, SeqCst);
            let value = slot.value();
            let lease = Shared::lease(&self.shared, &key, &slot);
            return (value, created, lease);
        }
    }

    /// Returns the value for `key` if a live entry exists, together with
    /// the lease now held on it.  Never builds.
    pub fn acquire(&self, key: &K) -> Option<(Arc<V>, Lease)> {
        self.ensure_alive();
        let slot = self.shared.table.load(key)?;
        if !slot.acquire() {
            return None;
        }
        Some((slot.value(), Shared::lease(&self.shared, key, &slot)))
    }

    /// Drops one lease on `key`.  A no-op if the key is absent.
    pub fn release(&self, key: &K) {
        if let Some(slot) = self.shared.table.load(key) {
            self.shared.release_slot(key, &slot);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.shared.table.len()
    }

    pub fn stats(&self) -> Metrics {
        self.shared.stats.snapshot()
    }
}

impl<K, V> LeaseMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Finalize + Send + Sync + 'static,
{
    /// Like [`new`](LeaseMap::new), but each entry instance is finalized
    /// exactly once when it is torn down, strictly after its last lease
    /// has been released.  Finalizer errors are counted in [`Metrics`] and
    /// otherwise dropped so destruction always proceeds.
    pub fn with_finalizer(ttl: Duration) -> Self {
        Self::build(ttl, Some(Box::new(|value: &V| value.finalize())))
    }
}

// ---------------------------------------------------------------------------
// Reaper loop
// ---------------------------------------------------------------------------

fn reaper<K, V>(shared: Weak<Shared<K, V>>, rx: Receiver<ReaperEvent<K, V>>, ttl: Duration)
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let mut timer = IdleTimer::new(ttl);
    let mut to_check: Vec<IdlePayload<K, V>> = Vec::new();
    let mut to_delete: Vec<IdlePayload<K, V>> = Vec::new();

    loop {
        let event = select! {
            recv(rx) -> msg => match msg {
                Ok(event) => event,
                // Every handle and lease is gone; nothing left to reap.
                Err(_) => ReaperEvent::Quit,
            },
            recv(timer.tick()) -> _ => ReaperEvent::Tick,
        };

        match event {
            ReaperEvent::Idle(payload) => {
                to_check.push(payload);
                timer.arm();
            }
            ReaperEvent::Tick => {
                if to_check.is_empty() && to_delete.is_empty() {
                    timer.disarm();
                    continue;
                }
                let Some(shared) = shared.upgrade() else { return };
                // Last epoch's survivors have now been idle for a full
                // TTL; delete whatever is still untouched.
                for payload in to_delete.drain(..) {
                    shared.try_delete(&payload.key, &payload.slot, payload.ver);
                }
                for payload in to_check.drain(..) {
                    if payload.slot.untouched_since(payload.ver) {
                        to_delete.push(payload);
                    }
                }
                timer.rearm();
            }
            ReaperEvent::Quit => {
                let Some(shared) = shared.upgrade() else { return };
                shared.died.fire();
                for payload in to_delete.drain(..).chain(to_check.drain(..)) {
                    shared.try_delete(&payload.key, &payload.slot, payload.ver);
                }
                // Releases raced against quit may already sit in the
                // channel; reclaim them without blocking.
                loop {
                    match rx.try_recv() {
                        Ok(ReaperEvent::Idle(payload)) => {
                            shared.try_delete(&payload.key, &payload.slot, payload.ver);
                        }
                        Ok(_) => {}
                        Err(_) => return,
                    }
                }
            }
        }
    }
}
