//! Single-flight construction layered on [`LeaseMap`].
//!
//! A [`FlightMap`] stores one [`FlightSlot`] per key inside an ordinary
//! [`LeaseMap`]; the slot serializes construction among racing callers:
//!
//! ```text
//! Uninit ──▶ Initializing ──▶ CallReady ──▶ Ready ──▶ Revoking ──▶ Uninit
//!   ▲                                         │
//!   └────────────── (creator errored) ◀───────┘
//! ```
//!
//! Exactly one caller wins the `Uninit → Initializing` race and runs the
//! creator; everyone else waits on the winner's call record.  A failed
//! construction returns the slot to `Uninit` so a later caller retries,
//! and costs no live reference on the key.  Revocation invalidates the
//! cached value while outer leases stay live; version snapshots taken at
//! call start let both revokers and waiters detect that they raced.

use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{BoxError, PanicError};
use crate::map::{Lease, LeaseMap};
use crate::signal::Signal;
use crate::stats::Metrics;

/// Construction error as observed by every waiter of the failed call.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

const UNINIT: u32 = 0;
const INITIALIZING: u32 = 1;
const CALL_READY: u32 = 2;
const READY: u32 = 3;
const REVOKING: u32 = 4;

// ---------------------------------------------------------------------------
// Call record
// ---------------------------------------------------------------------------

/// One construction attempt; shared by the builder and all subscribers.
struct Call<V> {
    done: Signal,
    /// Slot-version snapshot taken when the call began; a mismatch after
    /// the wait means a revoke advanced the slot underneath us.
    ver: u32,
    outcome: OnceLock<Result<Arc<V>, SharedError>>,
}

impl<V> Call<V> {
    fn failed(&self) -> bool {
        matches!(self.outcome.get(), Some(Err(_)))
    }
}

// ---------------------------------------------------------------------------
// FlightSlot
// ---------------------------------------------------------------------------

pub(crate) struct FlightSlot<V> {
    state: AtomicU32,
    /// Bumped on every revoke.
    ver: AtomicU32,
    call: RwLock<Option<Arc<Call<V>>>>,
}

impl<V> FlightSlot<V> {
    fn new() -> Self {
        FlightSlot {
            state: AtomicU32::new(UNINIT),
            ver: AtomicU32::new(0),
            call: RwLock::new(None),
        }
    }

    /// Attempts to become the builder.  The winner runs `create` to
    /// completion (panics included) and returns the finished call record;
    /// losers get `None` and must re-observe the state.
    fn begin(&self, create: &mut dyn FnMut() -> Result<V, BoxError>) -> Option<Arc<Call<V>>> {
        if self
            .state
            .compare_exchange(UNINIT, INITIALIZING, SeqCst, SeqCst)
            .is_err()
        {
            return None;
        }

        let call = Arc::new(Call {
            done: Signal::new(),
            ver: self.ver.load(SeqCst),
            outcome: OnceLock::new(),
        });
        *self.call.write() = Some(Arc::clone(&call));
        self.state.store(CALL_READY, SeqCst);

        let result = match catch_unwind(AssertUnwindSafe(|| create())) {
            Ok(result) => result,
            Err(payload) => Err(Box::new(PanicError::new(payload)) as BoxError),
        };
        let next = match result {
            Ok(value) => {
                let _ = call.outcome.set(Ok(Arc::new(value)));
                READY
            }
            Err(err) => {
                // A failed call leaves the slot eligible for retry.
                let _ = call.outcome.set(Err(Arc::from(err)));
                UNINIT
            }
        };
        self.state.store(next, SeqCst);
        call.done.fire();
        Some(call)
    }

    /// Invalidates the cached value built by the call whose version
    /// snapshot was `ver`.  A mismatch means another revoke already
    /// advanced past that call; the slot is left as-is.
    fn revoke(&self, ver: u32) {
        if self
            .state
            .compare_exchange(READY, REVOKING, SeqCst, SeqCst)
            .is_err()
        {
            return;
        }
        if ver != self.ver.load(SeqCst) {
            self.state.store(READY, SeqCst);
            return;
        }
        self.ver.fetch_add(1, SeqCst);
        *self.call.write() = None;
        self.state.store(UNINIT, SeqCst);
    }
}

// ---------------------------------------------------------------------------
// FlightResult
// ---------------------------------------------------------------------------

/// The outcome of a [`FlightMap`] lookup: the constructed value, or the
/// error every subscriber of the failed call observes.
pub struct FlightResult<V> {
    call: Arc<Call<V>>,
    slot: Option<Arc<FlightSlot<V>>>,
}

impl<V> FlightResult<V> {
    /// The constructed value.
    ///
    /// # Panics
    /// Panics if the construction failed; check [`is_err`] first.
    ///
    /// [`is_err`]: FlightResult::is_err
    pub fn value(&self) -> Arc<V> {
        match self.call.outcome.get() {
            Some(Ok(value)) => Arc::clone(value),
            _ => panic!("value() called on an errored construction"),
        }
    }

    pub fn is_err(&self) -> bool {
        self.call.failed()
    }

    pub fn err(&self) -> Option<SharedError> {
        match self.call.outcome.get() {
            Some(Err(err)) => Some(Arc::clone(err)),
            _ => None,
        }
    }

    /// Invalidates the cached value so the next
    /// [`acquire_or_store`](FlightMap::acquire_or_store) constructs
    /// afresh.  Outer leases stay live.  Idempotent; a no-op on errored
    /// results.
    pub fn revoke(&self) {
        if let Some(slot) = &self.slot {
            if !self.is_err() {
                slot.revoke(self.call.ver);
            }
        }
    }

    /// Whether a revoke has invalidated this result since it was produced.
    pub fn is_revoked(&self) -> bool {
        match &self.slot {
            Some(slot) => self.call.ver != slot.ver.load(SeqCst),
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// FlightMap
// ---------------------------------------------------------------------------

/// A [`LeaseMap`] with deduplicated, fallible, revocable construction.
///
/// # Example
/// ```
/// use linger::FlightMap;
/// use std::time::Duration;
///
/// let map: FlightMap<u32, String> = FlightMap::new(Duration::from_millis(50));
/// let (result, created, lease) = map.acquire_or_store(1, || Ok("built".to_string()));
/// assert!(created);
/// assert_eq!(*result.value(), "built");
/// lease.release();
/// ```
pub struct FlightMap<K, V> {
    inner: LeaseMap<K, FlightSlot<V>>,
}

impl<K, V> Clone for FlightMap<K, V> {
    fn clone(&self) -> Self {
        FlightMap {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> FlightMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// A map whose idle keys are reclaimed after `ttl`; zero selects
    /// fast-delete mode, as for [`LeaseMap::new`].
    pub fn new(ttl: Duration) -> Self {
        FlightMap {
            inner: LeaseMap::new(ttl),
        }
    }

    /// Returns the value for `key`, running `create` iff no usable call
    /// is cached.  Concurrent callers for the same key coalesce onto one
    /// construction; `create` may legitimately run more than once for one
    /// caller when a revocation races it, hence `FnMut`.
    ///
    /// The returned flag is `true` iff this caller built the entry or its
    /// call record.  On error the result carries the error, the flag is
    /// `false`, and no lease is held — a failed call must not keep the
    /// key alive.
    pub fn acquire_or_store<F>(&self, key: K, mut create: F) -> (FlightResult<V>, bool, Lease)
    where
        F: FnMut() -> Result<V, BoxError>,
    {
        let (slot, mut created, lease) = self.inner.acquire_or_store(key, |_| FlightSlot::new());
        loop {
            let call = match slot.state.load(SeqCst) {
                UNINIT => match slot.begin(&mut create) {
                    Some(call) => {
                        created = true;
                        Some(call)
                    }
                    None => None,
                },
                CALL_READY | READY => slot.call.read().clone(),
                INITIALIZING | REVOKING => None,
                other => panic!("corrupt flight state {other}"),
            };
            let Some(call) = call else {
                thread::yield_now();
                continue;
            };

            call.done.wait();
            // A revoke may have advanced the slot between wait-start and
            // completion; a stale call must not escape.
            if call.ver != slot.ver.load(SeqCst) {
                thread::yield_now();
                continue;
            }

            if call.failed() {
                lease.release();
                return (FlightResult { call, slot: None }, false, Lease::noop());
            }
            return (
                FlightResult {
                    call,
                    slot: Some(Arc::clone(&slot)),
                },
                created,
                lease,
            );
        }
    }

    /// Returns the cached value for `key` if one is usable.  Never
    /// constructs: an unbuilt or revoked slot reads as absent, and the
    /// inner lease taken during the lookup is given back.
    pub fn acquire(&self, key: &K) -> Option<(FlightResult<V>, Lease)> {
        let (slot, lease) = self.inner.acquire(key)?;
        loop {
            let call = match slot.state.load(SeqCst) {
                UNINIT | REVOKING => {
                    lease.release();
                    return None;
                }
                CALL_READY | READY => slot.call.read().clone(),
                INITIALIZING => None,
                other => panic!("corrupt flight state {other}"),
            };
            let Some(call) = call else {
                thread::yield_now();
                continue;
            };

            call.done.wait();
            if call.ver != slot.ver.load(SeqCst) {
                thread::yield_now();
                continue;
            }

            if call.failed() {
                lease.release();
                return None;
            }
            return Some((
                FlightResult {
                    call,
                    slot: Some(slot),
                },
                lease,
            ));
        }
    }

    /// Drops one lease on `key`.  A no-op if the key is absent.
    pub fn release(&self, key: &K) {
        self.inner.release(key);
    }

    /// Idempotently spawns the reaper thread.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Terminates the reaper; any later operation panics.  Idempotent.
    pub fn quit(&self) {
        self.inner.quit();
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entry_count()
    }

    pub fn stats(&self) -> Metrics {
        self.inner.stats()
    }
}
