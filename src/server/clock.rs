//! Shared clock collaborator driving packet pacing across all streams
//! (spec §4.9).
//!
//! Modeled as a `Mutex<u64>` sequence counter plus a `Condvar`, matching
//! the mutex+condition-variable contract spec §4.9/§5 describes, rather
//! than as a raw OS condition variable ported mechanically: each stream
//! holds a cheap `ClockHandle` clone and tracks its own last-observed
//! sequence, so the dispatcher tolerates the clock disappearing (handle
//! dropped) between ticks without any unsafe null-handle sentinel.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Inner {
    sequence: Mutex<u64>,
    condvar: Condvar,
}

/// The clock source: advanced once per tick by whatever drives real time
/// forward (a timer thread in the binary, or a test advancing it
/// manually).
#[derive(Clone, Default)]
pub struct ClockSource {
    inner: Arc<Inner>,
}

impl ClockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the sequence by one tick and wakes any waiters.
    pub fn tick(&self) {
        let mut seq = self.inner.sequence.lock().unwrap();
        *seq += 1;
        self.inner.condvar.notify_all();
    }

    pub fn handle(&self) -> ClockHandle {
        ClockHandle {
            inner: self.inner.clone(),
            last_observed: 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        *self.inner.sequence.lock().unwrap()
    }
}

/// Per-stream view of the clock: remembers the last sequence this
/// consumer observed, so `ticks_elapsed` yields the catch-up delta.
#[derive(Clone)]
pub struct ClockHandle {
    inner: Arc<Inner>,
    last_observed: u64,
}

impl std::fmt::Debug for ClockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockHandle")
            .field("last_observed", &self.last_observed)
            .finish()
    }
}

impl ClockHandle {
    /// Returns the number of ticks that have elapsed since this handle
    /// last observed the clock, advancing the observed watermark.
    pub fn ticks_elapsed(&mut self) -> u64 {
        let current = *self.inner.sequence.lock().unwrap();
        let delta = current.saturating_sub(self.last_observed);
        self.last_observed = current;
        delta
    }

    /// Blocks until the sequence advances past `self.last_observed`, or
    /// `timeout` elapses, then returns the tick delta (0 on timeout).
    /// Used by a worker loop that wants to wait rather than poll.
    pub fn wait_for_tick(&mut self, timeout: Duration) -> u64 {
        let guard = self.inner.sequence.lock().unwrap();
        let (guard, _) = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |seq| *seq <= self.last_observed)
            .unwrap();
        let delta = guard.saturating_sub(self.last_observed);
        self.last_observed = *guard;
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handle_observes_no_elapsed_ticks() {
        let source = ClockSource::new();
        let mut handle = source.handle();
        assert_eq!(handle.ticks_elapsed(), 0);
    }

    #[test]
    fn ticks_accumulate_until_observed() {
        let source = ClockSource::new();
        let mut handle = source.handle();

        source.tick();
        source.tick();
        source.tick();

        assert_eq!(handle.ticks_elapsed(), 3);
        assert_eq!(handle.ticks_elapsed(), 0);
    }

    #[test]
    fn independent_handles_track_their_own_watermark() {
        let source = ClockSource::new();
        let mut early = source.handle();
        source.tick();
        let mut late = source.handle();
        source.tick();

        assert_eq!(early.ticks_elapsed(), 2);
        assert_eq!(late.ticks_elapsed(), 1);
    }

    #[test]
    fn wait_for_tick_times_out_with_zero_delta() {
        let source = ClockSource::new();
        let mut handle = source.handle();
        let delta = handle.wait_for_tick(Duration::from_millis(5));
        assert_eq!(delta, 0);
    }

    #[test]
    fn wait_for_tick_observes_concurrent_tick() {
        let source = ClockSource::new();
        let mut handle = source.handle();

        let ticker = source.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            ticker.tick();
        });

        let delta = handle.wait_for_tick(Duration::from_secs(1));
        thread.join().unwrap();
        assert_eq!(delta, 1);
    }

    #[test]
    fn sequence_reflects_tick_count() {
        let source = ClockSource::new();
        source.tick();
        source.tick();
        assert_eq!(source.sequence(), 2);
    }
}
