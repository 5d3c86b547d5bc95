//! Periodic alarms and the monotonic alarm monitor.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::ident::next_generation;
use crate::spec::AlarmDef;

const NS_PER_SEC: i64 = 1_000_000_000;
const MS_PER_SEC: i64 = 1_000;

/// Registry of absolute wake instants. The service loop sleeps until the
/// earliest registered instant; owners reschedule their token as their next
/// fire time moves.
#[derive(Debug, Default)]
pub struct AlarmMonitor {
    next_token: u64,
    alarms: BTreeMap<u64, i64>,
}

impl AlarmMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fire_sec: i64) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.alarms.insert(token, fire_sec);
        token
    }

    pub fn reschedule(&mut self, token: u64, fire_sec: i64) {
        self.alarms.insert(token, fire_sec);
    }

    pub fn unregister(&mut self, token: u64) {
        self.alarms.remove(&token);
    }

    /// Earliest registered instant, seconds on the monotonic clock.
    pub fn next_fire_sec(&self) -> Option<i64> {
        self.alarms.values().copied().min()
    }

    pub fn has_due(&self, now_sec: i64) -> bool {
        self.next_fire_sec().is_some_and(|sec| sec <= now_sec)
    }
}

/// One periodic alarm: fires every `period` past `offset` from engine
/// start, independent of any metric.
#[derive(Debug, Clone)]
pub struct AlarmTracker {
    pub id: i64,
    pub generation: u64,
    offset_sec: i64,
    period_sec: i64,
    next_fire_sec: i64,
    fired_count: u64,
}

impl AlarmTracker {
    /// Computes the next fire strictly after `current_ns`: the offset
    /// itself if it has not yet elapsed, otherwise `offset + k·period` for
    /// the smallest such `k`.
    pub fn new(def: &AlarmDef, time_base_ns: i64, current_ns: i64) -> Self {
        let offset_sec = time_base_ns / NS_PER_SEC + def.offset_millis / MS_PER_SEC;
        let period_sec = (def.period_millis / MS_PER_SEC).max(1);
        let current_sec = current_ns / NS_PER_SEC;

        let next_fire_sec = if offset_sec > current_sec {
            offset_sec
        } else {
            let elapsed = current_sec - offset_sec;
            let k = elapsed / period_sec + 1;
            offset_sec + k * period_sec
        };

        Self {
            id: def.id,
            generation: next_generation(),
            offset_sec,
            period_sec,
            next_fire_sec,
            fired_count: 0,
        }
    }

    pub fn next_fire_sec(&self) -> i64 {
        self.next_fire_sec
    }

    pub fn fired_count(&self) -> u64 {
        self.fired_count
    }

    /// Advances past `now_sec`, returning how many periods fired.
    pub fn on_alarm_fired(&mut self, now_sec: i64) -> u64 {
        let mut fired = 0;
        while self.next_fire_sec <= now_sec {
            self.next_fire_sec += self.period_sec;
            fired += 1;
        }
        if fired > 0 {
            self.fired_count += fired;
            info!(alarm_id = self.id, fired, next_sec = self.next_fire_sec, "periodic alarm fired");
        } else {
            debug!(alarm_id = self.id, now_sec, "alarm tick before next fire");
        }
        fired
    }
}
