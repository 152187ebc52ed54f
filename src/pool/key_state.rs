//! Key State — per-key rate counters, backoff timer, success/fail tallies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};

use crate::db::models::{GlobalLimits, KeyRecord};
use crate::types::{abbrev_key, KeyId};

const MINUTE: i64 = 60;
const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;
const BACKOFF_FLOOR_SECS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 600;

struct Window {
    requests_minute: VecDeque<DateTime<Utc>>,
    requests_hour: VecDeque<DateTime<Utc>>,
    requests_day: VecDeque<DateTime<Utc>>,
    usage_day_baseline: i64,
    last_day_bucket: NaiveDate,
    backoff_seconds: u64,
    banned_until: DateTime<Utc>,
}

impl Window {
    fn new(usage_day_baseline: i64, now: DateTime<Utc>) -> Self {
        Self {
            requests_minute: VecDeque::new(),
            requests_hour: VecDeque::new(),
            requests_day: VecDeque::new(),
            usage_day_baseline,
            last_day_bucket: now.date_naive(),
            backoff_seconds: 0,
            banned_until: now,
        }
    }

    fn prune(buf: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window_secs: i64) {
        while let Some(front) = buf.front() {
            if (now - *front).num_seconds() >= window_secs {
                buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn roll_day_bucket_if_needed(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.last_day_bucket {
            self.usage_day_baseline = 0;
            self.last_day_bucket = today;
        }
    }

    fn is_available(&mut self, now: DateTime<Utc>, limits: GlobalLimits) -> bool {
        if now < self.banned_until {
            return false;
        }
        self.roll_day_bucket_if_needed(now);

        Self::prune(&mut self.requests_minute, now, MINUTE);
        if self.requests_minute.len() as u32 >= limits.rpm {
            return false;
        }
        Self::prune(&mut self.requests_hour, now, HOUR);
        if self.requests_hour.len() as u32 >= limits.rph {
            return false;
        }
        Self::prune(&mut self.requests_day, now, DAY);
        if self.requests_day.len() as i64 + self.usage_day_baseline >= limits.rpd as i64 {
            return false;
        }
        true
    }

    fn mark_picked(&mut self, now: DateTime<Utc>) {
        self.requests_minute.push_back(now);
        self.requests_hour.push_back(now);
        self.requests_day.push_back(now);
    }

    fn mark_success(&mut self, now: DateTime<Utc>) -> i64 {
        self.backoff_seconds = 0;
        self.banned_until = now;
        self.requests_day.len() as i64 + self.usage_day_baseline
    }

    fn mark_failure(&mut self, now: DateTime<Utc>) {
        self.backoff_seconds = if self.backoff_seconds == 0 {
            BACKOFF_FLOOR_SECS
        } else {
            (self.backoff_seconds * 2).min(BACKOFF_CAP_SECS)
        };
        self.banned_until = now + chrono::Duration::seconds(self.backoff_seconds as i64);
    }
}

/// One entry in the Key Pool: the mutable rate/backoff state plus lifetime counters for
/// a single provisioned credential.
pub struct KeyState {
    pub id: KeyId,
    pub key: String,
    pub provider: String,
    pub model: String,
    window: Mutex<Window>,
    success_count: AtomicU64,
    failure_count: AtomicU64,
}

impl KeyState {
    pub fn from_record(record: &KeyRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            key: record.api.clone(),
            provider: record.provider.clone(),
            model: record.model.clone(),
            window: Mutex::new(Window::new(record.usage_today, now)),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    pub fn key_preview(&self) -> String {
        abbrev_key(&self.key)
    }

    /// Availability predicate. Must be called with external synchronization guaranteeing
    /// no other acquisition attempt can observe the same key as available before this
    /// caller's `mark_picked` runs (the Key Pool's cursor mutex provides this).
    pub fn is_available(&self, now: DateTime<Utc>, limits: GlobalLimits) -> bool {
        self.window.lock().unwrap().is_available(now, limits)
    }

    pub fn mark_picked(&self, now: DateTime<Utc>) {
        self.window.lock().unwrap().mark_picked(now);
    }

    /// Clears backoff, increments the success tally, and returns the current day count
    /// for the caller to hand off to Usage Sync.
    pub fn mark_success(&self, now: DateTime<Utc>) -> i64 {
        let day_count = self.window.lock().unwrap().mark_success(now);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        day_count
    }

    pub fn mark_failure(&self, now: DateTime<Utc>) {
        self.window.lock().unwrap().mark_failure(now);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn banned_until(&self) -> DateTime<Utc> {
        self.window.lock().unwrap().banned_until
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for KeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyState")
            .field("id", &self.id)
            .field("key_preview", &self.key_preview())
            .field("success_count", &self.success_count())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn limits(rpm: u32, rph: u32, rpd: u32) -> GlobalLimits {
        GlobalLimits { rpm, rph, rpd }
    }

    fn record(usage_today: i64) -> KeyRecord {
        KeyRecord {
            id: Uuid::new_v4(),
            provider: "google-gemini".into(),
            model: "gemini-2.5-flash".into(),
            api: "sk-test-0123456789".into(),
            status: "active".into(),
            usage_today,
            last_used_at: None,
        }
    }

    #[test]
    fn available_by_default() {
        let now = Utc::now();
        let state = KeyState::from_record(&record(0), now);
        assert!(state.is_available(now, limits(60, 1000, 10000)));
    }

    #[test]
    fn rpm_limit_blocks_after_quota_consumed() {
        let now = Utc::now();
        let state = KeyState::from_record(&record(0), now);
        let lim = limits(2, 1000, 10000);
        assert!(state.is_available(now, lim));
        state.mark_picked(now);
        assert!(state.is_available(now, lim));
        state.mark_picked(now);
        assert!(!state.is_available(now, lim));
    }

    #[test]
    fn daily_baseline_blocks_when_close_to_cap() {
        let now = Utc::now();
        let state = KeyState::from_record(&record(19), now);
        let lim = limits(60, 1000, 20);
        assert!(state.is_available(now, lim));
        state.mark_picked(now);
        assert!(!state.is_available(now, lim));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let now = Utc::now();
        let state = KeyState::from_record(&record(0), now);
        state.mark_failure(now);
        assert_eq!(state.window.lock().unwrap().backoff_seconds, 5);
        state.mark_failure(now);
        assert_eq!(state.window.lock().unwrap().backoff_seconds, 10);
        state.mark_failure(now);
        assert_eq!(state.window.lock().unwrap().backoff_seconds, 20);
        for _ in 0..20 {
            state.mark_failure(now);
        }
        assert_eq!(state.window.lock().unwrap().backoff_seconds, 600);
    }

    #[test]
    fn success_clears_backoff() {
        let now = Utc::now();
        let state = KeyState::from_record(&record(0), now);
        state.mark_failure(now);
        assert!(state.banned_until() > now);
        state.mark_success(now);
        assert!(state.banned_until() <= now);
        assert_eq!(state.window.lock().unwrap().backoff_seconds, 0);
    }

    #[test]
    fn failed_acquisition_still_consumes_rate_budget() {
        let now = Utc::now();
        let state = KeyState::from_record(&record(0), now);
        let lim = limits(1, 1000, 10000);
        state.mark_picked(now);
        state.mark_failure(now);
        // the minute-window entry from the failed attempt is not rolled back
        assert!(!state.is_available(now, lim));
    }

    #[test]
    fn day_bucket_rollover_resets_baseline() {
        let now = Utc::now();
        let state = KeyState::from_record(&record(19), now);
        let lim = limits(60, 1000, 20);
        state.mark_picked(now);
        assert!(!state.is_available(now, lim));
        let tomorrow = now + chrono::Duration::days(1);
        assert!(state.is_available(tomorrow, lim));
    }
}
