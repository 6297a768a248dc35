//! Fire-once broadcast flag built on channel disconnection.
//!
//! No payload ever travels over the underlying channel.  Firing drops the
//! sole sender, after which every receive operation completes immediately
//! and forever — observers may block on [`wait`], poll [`is_fired`], or
//! feed [`listen`] into a `select!` arm alongside other channels.
//!
//! [`wait`]: Signal::wait
//! [`is_fired`]: Signal::is_fired
//! [`listen`]: Signal::listen

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

/// A one-shot, many-observer flag.
pub(crate) struct Signal {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Signal {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Raises the flag.  Idempotent.
    pub fn fire(&self) {
        self.tx.lock().take();
    }

    pub fn is_fired(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// A receiver that becomes ready exactly when the flag is raised.
    /// Intended for `select!`; the channel never carries a message, so a
    /// completed receive always yields a disconnection error.
    pub fn listen(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Blocks until the flag is raised.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_unfired() {
        let s = Signal::new();
        assert!(!s.is_fired());
    }

    #[test]
    fn fire_is_observable_and_idempotent() {
        let s = Signal::new();
        s.fire();
        assert!(s.is_fired());
        s.fire();
        assert!(s.is_fired());
    }

    #[test]
    fn wait_unblocks_on_fire() {
        let s = Arc::new(Signal::new());
        let s2 = Arc::clone(&s);
        let waiter = std::thread::spawn(move || s2.wait());
        std::thread::sleep(std::time::Duration::from_millis(20));
        s.fire();
        waiter.join().expect("waiter must return after fire");
    }
}
