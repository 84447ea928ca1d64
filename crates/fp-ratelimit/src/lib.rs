// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-class rate buckets and request deduplication.
//!
//! One small struct behind a mutex, swept by a one-minute tick.  Both the
//! router and every agent carry their own instance; the maps are
//! per-process state, not shared infrastructure.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fp_core::ActionClass;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// How long a `request_id` is remembered for deduplication.
pub const DEDUPE_WINDOW_MS: i64 = 10 * 60 * 1000;

/// Width of one rate window.
pub const RATE_WINDOW_MS: i64 = 60 * 1000;

/// Per-minute cap for a capability class.
pub fn class_cap(class: ActionClass) -> u32 {
    match class {
        ActionClass::Panic => 5,
        ActionClass::Snapshot => 30,
        ActionClass::Maint => 20,
        ActionClass::Scan => 6,
        ActionClass::Build => 3,
        _ => 20,
    }
}

#[derive(Default)]
struct GateState {
    /// `request_id` → expiry (producer clock ms).
    seen: HashMap<String, i64>,
    /// class → (window start ms, count in window).
    windows: HashMap<ActionClass, (i64, u32)>,
}

/// Outcome of admitting one request through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted; the id is now remembered and the window bumped.
    Admitted,
    /// Same `request_id` seen within [`DEDUPE_WINDOW_MS`].
    Duplicate,
    /// The class window is exhausted.
    RateLimited {
        /// The cap that was hit.
        cap_per_min: u32,
    },
}

/// Dedupe map plus per-class fixed windows behind one mutex.
pub struct DispatchGate {
    inner: Mutex<GateState>,
}

impl Default for DispatchGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchGate {
    /// A fresh, empty gate.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateState::default()),
        }
    }

    /// Check dedupe alone, recording the id on first sight.
    ///
    /// Used where dedupe and rate limiting happen at different pipeline
    /// stages; [`DispatchGate::admit`] does both at once.
    pub fn check_duplicate(&self, request_id: &str, now_ms: i64) -> bool {
        let mut state = self.inner.lock().expect("gate poisoned");
        match state.seen.get(request_id) {
            Some(expiry) if *expiry > now_ms => true,
            _ => {
                state
                    .seen
                    .insert(request_id.to_string(), now_ms + DEDUPE_WINDOW_MS);
                false
            }
        }
    }

    /// Check the per-class window, counting this request when admitted.
    pub fn check_rate(&self, class: ActionClass, now_ms: i64) -> Result<(), u32> {
        let cap = class_cap(class);
        let mut state = self.inner.lock().expect("gate poisoned");
        let window = state.windows.entry(class).or_insert((now_ms, 0));
        if now_ms - window.0 >= RATE_WINDOW_MS {
            *window = (now_ms, 0);
        }
        if window.1 >= cap {
            return Err(cap);
        }
        window.1 += 1;
        Ok(())
    }

    /// Dedupe then rate-check in one call.
    pub fn admit(&self, request_id: &str, class: ActionClass, now_ms: i64) -> Admission {
        if self.check_duplicate(request_id, now_ms) {
            return Admission::Duplicate;
        }
        match self.check_rate(class, now_ms) {
            Ok(()) => Admission::Admitted,
            Err(cap) => Admission::RateLimited { cap_per_min: cap },
        }
    }

    /// Drop expired dedupe entries and stale windows.
    pub fn sweep(&self, now_ms: i64) {
        let mut state = self.inner.lock().expect("gate poisoned");
        let before = state.seen.len();
        state.seen.retain(|_, expiry| *expiry > now_ms);
        state
            .windows
            .retain(|_, (start, _)| now_ms - *start < RATE_WINDOW_MS);
        if state.seen.len() != before {
            debug!(
                dropped = before - state.seen.len(),
                "swept dedupe entries"
            );
        }
    }
}

/// Spawn the one-minute GC tick for a shared gate.
pub fn spawn_sweeper(gate: Arc<DispatchGate>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            gate.sweep(fp_core::now_ms());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sight_is_not_duplicate() {
        let gate = DispatchGate::new();
        assert!(!gate.check_duplicate("abc", 0));
        assert!(gate.check_duplicate("abc", 1));
    }

    #[test]
    fn duplicate_expires_after_window() {
        let gate = DispatchGate::new();
        assert!(!gate.check_duplicate("abc", 0));
        assert!(gate.check_duplicate("abc", DEDUPE_WINDOW_MS - 1));
        assert!(!gate.check_duplicate("abc", DEDUPE_WINDOW_MS + 1));
    }

    #[test]
    fn build_cap_is_three_per_minute() {
        let gate = DispatchGate::new();
        for _ in 0..3 {
            gate.check_rate(ActionClass::Build, 0).unwrap();
        }
        assert_eq!(gate.check_rate(ActionClass::Build, 59_000), Err(3));
        // New window.
        gate.check_rate(ActionClass::Build, 61_000).unwrap();
    }

    #[test]
    fn classes_have_independent_windows() {
        let gate = DispatchGate::new();
        for _ in 0..5 {
            gate.check_rate(ActionClass::Panic, 0).unwrap();
        }
        assert!(gate.check_rate(ActionClass::Panic, 0).is_err());
        assert!(gate.check_rate(ActionClass::Snapshot, 0).is_ok());
    }

    #[test]
    fn admit_combines_both_checks() {
        let gate = DispatchGate::new();
        assert_eq!(
            gate.admit("r1", ActionClass::Build, 0),
            Admission::Admitted
        );
        assert_eq!(
            gate.admit("r1", ActionClass::Build, 1),
            Admission::Duplicate
        );
        assert_eq!(gate.admit("r2", ActionClass::Build, 2), Admission::Admitted);
        assert_eq!(gate.admit("r3", ActionClass::Build, 3), Admission::Admitted);
        assert_eq!(
            gate.admit("r4", ActionClass::Build, 4),
            Admission::RateLimited { cap_per_min: 3 }
        );
    }

    #[test]
    fn sweep_drops_expired() {
        let gate = DispatchGate::new();
        gate.check_duplicate("old", 0);
        gate.sweep(DEDUPE_WINDOW_MS + 1);
        // After the sweep the id is admissible again.
        assert!(!gate.check_duplicate("old", DEDUPE_WINDOW_MS + 2));
    }
}
