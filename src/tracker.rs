//! Single-value idle tracker.
//!
//! An [`IdleTracker`] watches one reference count and invokes a
//! user-supplied notifier once the count has sat at zero for a full,
//! undisturbed TTL window.  Every externally visible mutation flows
//! through an unbuffered rendezvous channel into a dedicated loop thread,
//! which is the sole owner of the count, the touch version, and the
//! timer — the notifier is therefore serialized with all count changes,
//! and events take effect in channel-arrival order.

use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

use crate::signal::Signal;
use crate::timer::IdleTimer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Event {
    Acquire,
    Release,
    /// Synthesized inside the loop when the armed timer fires; never
    /// travels the channel.
    Tick,
    Quit,
}

type Notifier = Box<dyn FnMut() -> bool + Send + 'static>;

/// State handed to the loop thread on first start.
struct LoopSeed {
    rx: Receiver<Event>,
    notifier: Notifier,
}

/// Watches a single reference count and fires a notifier after one quiet
/// TTL at count zero.
///
/// The notifier returns `true` to let the tracker die (no further events
/// are accepted; submissions return `false`) or `false` to keep watching.
///
/// # Example
/// ```
/// use linger::IdleTracker;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::time::Duration;
///
/// let idle = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&idle);
/// let tracker = IdleTracker::new(Duration::from_millis(50), move || {
///     flag.store(true, Ordering::SeqCst);
///     true
/// });
/// tracker.start();
/// tracker.acquire();
/// tracker.release();
/// std::thread::sleep(Duration::from_millis(120));
/// assert!(idle.load(Ordering::SeqCst));
/// ```
pub struct IdleTracker {
    tx: Sender<Event>,
    died: Arc<Signal>,
    start: Once,
    ttl: Duration,
    seed: Mutex<Option<LoopSeed>>,
}

impl IdleTracker {
    pub fn new(ttl: Duration, notifier: impl FnMut() -> bool + Send + 'static) -> Self {
        let (tx, rx) = bounded(0);
        IdleTracker {
            tx,
            died: Arc::new(Signal::new()),
            start: Once::new(),
            ttl,
            seed: Mutex::new(Some(LoopSeed {
                rx,
                notifier: Box::new(notifier),
            })),
        }
    }

    /// Records one reference taken.  Returns `false` if the tracker has
    /// already died.
    pub fn acquire(&self) -> bool {
        self.submit(Event::Acquire)
    }

    /// Records one reference given back.  Returns `false` if the tracker
    /// has already died.
    pub fn release(&self) -> bool {
        self.submit(Event::Release)
    }

    /// Terminates the loop without consulting the notifier.
    pub fn quit(&self) {
        self.submit(Event::Quit);
    }

    /// Idempotently starts the loop thread.  Called implicitly by every
    /// submission.
    pub fn start(&self) {
        self.start.call_once(|| {
            let seed = self.seed.lock().take().expect("loop seeded exactly once");
            let ttl = self.ttl;
            let died = Arc::clone(&self.died);
            thread::Builder::new()
                .name("linger-idle-tracker".into())
                .spawn(move || run(ttl, seed, died))
                .expect("failed to spawn idle tracker thread");
        });
    }

    fn submit(&self, event: Event) -> bool {
        self.start();
        select! {
            recv(self.died.listen()) -> _ => false,
            send(self.tx, event) -> res => res.is_ok(),
        }
    }
}

fn run(ttl: Duration, seed: LoopSeed, died: Arc<Signal>) {
    let LoopSeed { rx, mut notifier } = seed;

    let mut counter: i32 = 1;
    let mut ver: u32 = 0;
    let mut prev_ver: u32 = 0;
    let mut timer = IdleTimer::new(ttl);

    // Seeded with one phantom reference that the loop releases up front:
    // the tracker opens an idle window immediately, and the first real
    // acquire must land within one TTL of start.
    let mut event = Event::Release;

    loop {
        match event {
            Event::Acquire => {
                counter += 1;
                ver = ver.wrapping_add(1);
                timer.disarm();
            }
            Event::Release => {
                counter -= 1;
                ver = ver.wrapping_add(1);
                if counter == 0 {
                    prev_ver = ver;
                    timer.rearm();
                }
            }
            Event::Quit => break,
            Event::Tick => {
                // `ver != prev_ver` means the window was disturbed: skip
                // the tick without re-arming; the next release-to-zero
                // starts a fresh window.
                if ver == prev_ver {
                    if notifier() {
                        break;
                    }
                    prev_ver = ver;
                    timer.disarm();
                }
            }
        }

        event = select! {
            recv(rx) -> msg => match msg {
                Ok(event) => event,
                // Tracker handle dropped: nothing can submit anymore.
                Err(_) => Event::Quit,
            },
            recv(timer.tick()) -> _ => Event::Tick,
        };
    }

    died.fire();
}
