//! One-shot idle timer surfaced as a selectable channel.
//!
//! While armed, [`tick`] is a `crossbeam_channel::after` receiver that
//! delivers exactly one message at the deadline; while disarmed it is a
//! `never` receiver, so event loops can unconditionally `select!` on it.
//! Disarming drops the armed receiver outright, which means a tick from a
//! cancelled arming can never be observed later.
//!
//! The armed receiver is consumed by the tick it delivers.  Every loop
//! that receives a tick must follow up with [`disarm`] or [`rearm`]
//! before selecting again.
//!
//! [`tick`]: IdleTimer::tick
//! [`disarm`]: IdleTimer::disarm
//! [`rearm`]: IdleTimer::rearm

use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, Receiver};

pub(crate) struct IdleTimer {
    interval: Duration,
    armed: Option<Receiver<Instant>>,
    /// Never-ready stand-in returned by [`tick`](IdleTimer::tick) while
    /// disarmed.
    parked: Receiver<Instant>,
}

impl IdleTimer {
    pub fn new(interval: Duration) -> Self {
        IdleTimer {
            interval,
            armed: None,
            parked: never(),
        }
    }

    /// Starts the interval if not already running.  Idempotent.
    pub fn arm(&mut self) {
        if self.armed.is_none() {
            self.armed = Some(after(self.interval));
        }
    }

    /// Cancels the interval if running.  Idempotent.
    pub fn disarm(&mut self) {
        self.armed = None;
    }

    /// Unconditionally restarts the interval from now.
    pub fn rearm(&mut self) {
        self.armed = Some(after(self.interval));
    }

    pub fn tick(&self) -> &Receiver<Instant> {
        self.armed.as_ref().unwrap_or(&self.parked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(40);

    #[test]
    fn disarmed_timer_never_ticks() {
        let timer = IdleTimer::new(INTERVAL);
        assert!(
            timer.tick().recv_timeout(Duration::from_millis(80)).is_err(),
            "a disarmed timer must not deliver ticks"
        );
    }

    #[test]
    fn armed_timer_ticks_once_after_interval() {
        let mut timer = IdleTimer::new(INTERVAL);
        timer.arm();
        assert!(
            timer.tick().recv_timeout(Duration::from_millis(200)).is_ok(),
            "armed timer must tick"
        );
        // The single message is consumed; nothing further arrives.
        assert!(timer
            .tick()
            .recv_timeout(Duration::from_millis(80))
            .is_err());
    }

    #[test]
    fn arm_while_armed_keeps_original_deadline() {
        let mut timer = IdleTimer::new(INTERVAL);
        let start = Instant::now();
        timer.arm();
        std::thread::sleep(Duration::from_millis(20));
        timer.arm(); // no-op
        timer
            .tick()
            .recv_timeout(Duration::from_millis(200))
            .expect("tick expected");
        assert!(
            start.elapsed() < Duration::from_millis(55),
            "re-arming while armed must not extend the deadline"
        );
    }

    #[test]
    fn disarm_then_arm_resets_deadline() {
        let mut timer = IdleTimer::new(INTERVAL);
        timer.arm();
        std::thread::sleep(Duration::from_millis(20));
        timer.rearm();
        let start = Instant::now();
        timer
            .tick()
            .recv_timeout(Duration::from_millis(200))
            .expect("tick expected");
        assert!(
            start.elapsed() >= Duration::from_millis(30),
            "rearm must restart the full interval"
        );
    }
}
