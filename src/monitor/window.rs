//! Time-pruned event counting over a trailing window.
//!
//! One parameterized [`WindowedCounter`] backs every windowed limit in the
//! engine: the per-key restart guard, the per-key circuit breaker, the alert
//! rate limiter, and the occurrence dedup window. [`KeyedWindows`] lifts the
//! counter over an arbitrary key space with a single shared `(window, max)`.
//!
//! Pruning compares absolute timestamps and never assumes calls arrive in
//! increasing order, so a clock step backwards neither panics nor silently
//! drops recent events.

use std::collections::BTreeMap;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::core::clock::{Timestamp, secs};

// ──────────────────── counter ────────────────────

/// Events recorded within `window` of "now", capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowedCounter {
    window: TimeDelta,
    max: usize,
    events: Vec<Timestamp>,
}

impl WindowedCounter {
    /// Empty counter admitting at most `max` events per `window_s` seconds.
    #[must_use]
    pub fn new(window_s: u64, max: usize) -> Self {
        Self::from_events(window_s, max, Vec::new())
    }

    /// Rebuild a counter from persisted event timestamps.
    #[must_use]
    pub fn from_events(window_s: u64, max: usize, events: Vec<Timestamp>) -> Self {
        Self {
            window: secs(window_s),
            max,
            events,
        }
    }

    /// Prune, then record `now` if fewer than `max` events remain.
    ///
    /// Returns `false` without recording when the window is full.
    pub fn allow(&mut self, now: Timestamp) -> bool {
        self.prune(now);
        if self.events.len() < self.max {
            self.events.push(now);
            true
        } else {
            false
        }
    }

    /// Number of events inside the window ending at `now`.
    ///
    /// Prunes the same way [`allow`](Self::allow) does but never records.
    pub fn count(&mut self, now: Timestamp) -> usize {
        self.prune(now);
        self.events.len()
    }

    /// Record an event unconditionally (after pruning).
    pub fn record(&mut self, now: Timestamp) {
        self.prune(now);
        self.events.push(now);
    }

    /// Whether the window is full at `now`.
    pub fn is_saturated(&mut self, now: Timestamp) -> bool {
        self.count(now) >= self.max
    }

    /// Earliest instant at which the count drops below `max`, if saturated.
    ///
    /// This is when the oldest event that keeps the window full ages out.
    pub fn reopens_at(&mut self, now: Timestamp) -> Option<Timestamp> {
        if !self.is_saturated(now) {
            return None;
        }
        let mut sorted = self.events.clone();
        sorted.sort_unstable();
        // Dropping the first (len - max + 1) events brings us under the cap.
        let idx = sorted.len() + 1 - self.max.max(1);
        sorted
            .get(idx.saturating_sub(1))
            .map(|ts| *ts + self.window + TimeDelta::milliseconds(1))
    }

    /// Whether `ts` is already recorded.
    #[must_use]
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.events.contains(&ts)
    }

    /// Recorded events, in insertion order.
    #[must_use]
    pub fn events(&self) -> &[Timestamp] {
        &self.events
    }

    /// Consume the counter, returning its events for persistence.
    #[must_use]
    pub fn into_events(self) -> Vec<Timestamp> {
        self.events
    }

    fn prune(&mut self, now: Timestamp) {
        let cutoff = now - self.window;
        self.events.retain(|ts| *ts >= cutoff);
    }
}

// ──────────────────── keyed windows ────────────────────

/// Independent [`WindowedCounter`]s per key, all sharing one `(window, max)`.
///
/// Serialized as a plain `key -> [timestamps]` map so it can live inside a
/// persisted document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyedWindows {
    entries: BTreeMap<String, Vec<Timestamp>>,
}

impl KeyedWindows {
    /// Try to record an event for `key`; `false` when that key's window is full.
    pub fn allow(&mut self, key: &str, now: Timestamp, window_s: u64, max: usize) -> bool {
        let events = self.entries.remove(key).unwrap_or_default();
        let mut counter = WindowedCounter::from_events(window_s, max, events);
        let allowed = counter.allow(now);
        let events = counter.into_events();
        if !events.is_empty() {
            self.entries.insert(key.to_string(), events);
        }
        allowed
    }

    /// Events currently in `key`'s window, without recording.
    pub fn count(&mut self, key: &str, now: Timestamp, window_s: u64) -> usize {
        let Some(events) = self.entries.get_mut(key) else {
            return 0;
        };
        let mut counter =
            WindowedCounter::from_events(window_s, usize::MAX, std::mem::take(events));
        let n = counter.count(now);
        *events = counter.into_events();
        n
    }

    /// Drop every event older than the window and forget keys left empty.
    pub fn prune_all(&mut self, now: Timestamp, window_s: u64) {
        let cutoff = now - secs(window_s);
        self.entries.retain(|_, events| {
            events.retain(|ts| *ts >= cutoff);
            !events.is_empty()
        });
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::parse_utc;
    use proptest::prelude::*;

    fn t0() -> Timestamp {
        parse_utc("2026-05-01T12:00:00Z").unwrap()
    }

    fn at(offset_s: i64) -> Timestamp {
        t0() + TimeDelta::seconds(offset_s)
    }

    #[test]
    fn allow_admits_up_to_max_then_refuses() {
        let mut c = WindowedCounter::new(1800, 2);
        assert!(c.allow(at(0)));
        assert!(c.allow(at(60)));
        assert!(!c.allow(at(120)));
        assert_eq!(c.events().len(), 2, "refusal must not record");
    }

    #[test]
    fn events_age_out_of_window() {
        let mut c = WindowedCounter::new(1800, 2);
        assert!(c.allow(at(0)));
        assert!(c.allow(at(60)));
        // t0 is older than now - window; t0+60 sits exactly on the cutoff and stays.
        assert_eq!(c.count(at(1860)), 1);
        assert!(c.allow(at(1860)));
    }

    #[test]
    fn count_has_no_side_effects_beyond_pruning() {
        let mut c = WindowedCounter::new(60, 5);
        c.record(at(0));
        assert_eq!(c.count(at(10)), 1);
        assert_eq!(c.count(at(10)), 1);
        assert_eq!(c.count(at(61)), 0);
    }

    #[test]
    fn tolerates_clock_stepping_backwards() {
        let mut c = WindowedCounter::new(600, 3);
        assert!(c.allow(at(500)));
        // Clock stepped back 400s: the t0+500 event is "in the future" and still counts.
        assert!(c.allow(at(100)));
        assert_eq!(c.count(at(100)), 2);
        assert!(c.allow(at(200)));
        assert!(!c.allow(at(300)));
    }

    #[test]
    fn reopens_when_oldest_blocking_event_ages_out() {
        let mut c = WindowedCounter::new(1800, 3);
        c.record(at(0));
        c.record(at(10));
        c.record(at(20));
        let reopen = c.reopens_at(at(30)).unwrap();
        assert!(reopen > at(1800));
        assert!(!c.is_saturated(reopen));
        assert!(c.is_saturated(at(1800)));
    }

    #[test]
    fn reopens_at_is_none_below_cap() {
        let mut c = WindowedCounter::new(60, 2);
        c.record(at(0));
        assert!(c.reopens_at(at(1)).is_none());
    }

    #[test]
    fn keyed_windows_isolate_keys() {
        let mut w = KeyedWindows::default();
        assert!(w.allow("a", at(0), 600, 1));
        assert!(!w.allow("a", at(1), 600, 1));
        assert!(w.allow("b", at(1), 600, 1));
        assert_eq!(w.count("a", at(2), 600), 1);
        assert_eq!(w.count("missing", at(2), 600), 0);
    }

    #[test]
    fn keyed_windows_prune_forgets_empty_keys() {
        let mut w = KeyedWindows::default();
        w.allow("a", at(0), 600, 1);
        w.allow("b", at(500), 600, 1);
        w.prune_all(at(700), 600);
        assert_eq!(w.len(), 1);
        assert_eq!(w.count("b", at(700), 600), 1);
    }

    #[test]
    fn keyed_windows_serialize_as_plain_map() {
        let mut w = KeyedWindows::default();
        w.allow("inc-1", at(0), 600, 1);
        let json = serde_json::to_value(&w).unwrap();
        assert!(json.get("inc-1").unwrap().is_array());
        let back: KeyedWindows = serde_json::from_value(json).unwrap();
        assert_eq!(back, w);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// No trailing window ever contains more than `max` admitted events,
        /// whatever order the calls arrive in.
        #[test]
        fn admitted_events_never_exceed_max_per_window(
            offsets in prop::collection::vec(0i64..7200, 1..60),
            max in 1usize..5,
            window_s in 1u64..3600,
        ) {
            let mut c = WindowedCounter::new(window_s, max);
            let mut admitted: Vec<Timestamp> = Vec::new();
            for off in &offsets {
                let now = at(*off);
                if c.allow(now) {
                    admitted.push(now);
                }
                let cutoff = now - secs(window_s);
                let live = c.events().iter().filter(|ts| **ts >= cutoff).count();
                prop_assert!(live <= max);
            }
            // For monotonic input the stronger sliding-window bound holds too.
            let mut sorted_offsets = offsets.clone();
            sorted_offsets.sort_unstable();
            let mut mono = WindowedCounter::new(window_s, max);
            let mut taken: Vec<Timestamp> = Vec::new();
            for off in sorted_offsets {
                let now = at(off);
                if mono.allow(now) {
                    taken.push(now);
                }
            }
            for (i, start) in taken.iter().enumerate() {
                let end = *start + secs(window_s);
                let in_window = taken[i..].iter().filter(|ts| **ts <= end).count();
                prop_assert!(in_window <= max, "{} events within one window", in_window);
            }
        }
    }
}
