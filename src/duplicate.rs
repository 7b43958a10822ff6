//! Per-user rolling-window duplicate-message counter. Entirely in-memory —
//! restart loses history, which is fine given the short windows involved.
//! Modeled on the teacher's in-process tracking idiom (cf. `antispam::spam_names`)
//! generalized with an LRU-bounded per-user cache the way
//! `chrysanthemum`'s `SpamHistory` bounds its rolling `VecDeque` per user.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::Mutex,
    time::Duration as StdDuration,
};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;

const MAX_ENTRIES_PER_USER: usize = 200;
const MAX_USERS: usize = 10_000;
const CLEANUP_INTERVAL: StdDuration = StdDuration::from_secs(600);

#[derive(Debug, Clone)]
struct Entry {
    hash: String,
    time: DateTime<Utc>,
    message_id: i32,
}

#[derive(Debug, Clone)]
struct Tracker {
    count: u32,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    message_ids: Vec<i32>,
}

#[derive(Debug, Clone)]
struct UserState {
    entries: Vec<Entry>,
    trackers: HashMap<String, Tracker>,
    /// Last time this user's entry was touched by `check`; used to evict the
    /// whole per-user history once it's older than `2 * window`, independent
    /// of the LRU cache's capacity-based eviction.
    last_touched: DateTime<Utc>,
}

impl UserState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            entries: Vec::new(),
            trackers: HashMap::new(),
            last_touched: now,
        }
    }
}

pub struct DuplicateResult {
    pub spam: bool,
    pub extra_delete_ids: Vec<i32>,
    pub details: String,
}

struct Inner {
    cache: LruCache<String, UserState>,
    last_global_cleanup: DateTime<Utc>,
}

pub struct DuplicateDetector {
    threshold: u32,
    window: Duration,
    inner: Mutex<Inner>,
}

impl DuplicateDetector {
    /// `threshold < 2` disables the detector: every check reports ham.
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            inner: Mutex::new(Inner {
                cache: LruCache::new(NonZeroUsize::new(MAX_USERS).unwrap()),
                last_global_cleanup: Utc::now(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold >= 2
    }

    /// Full Get-Modify-Set for one message, holding the detector's mutex for
    /// the duration so the check-and-update stays atomic per user.
    pub fn check(&self, user_id: &str, hash: &str, message_id: i32) -> DuplicateResult {
        if !self.is_enabled() {
            return DuplicateResult {
                spam: false,
                extra_delete_ids: Vec::new(),
                details: String::new(),
            };
        }

        let now = Utc::now();
        let mut inner = self.inner.lock().expect("duplicate detector mutex poisoned");

        if now - inner.last_global_cleanup
            >= Duration::from_std(CLEANUP_INTERVAL).expect("cleanup interval fits chrono::Duration")
        {
            self.global_cleanup(&mut inner, now);
            inner.last_global_cleanup = now;
        }

        let window = self.window;
        let cache_ttl =
            Duration::from_std(window.to_std().unwrap_or(StdDuration::ZERO) * 2).unwrap_or(window);
        let mut state = match inner.cache.pop(user_id) {
            Some(s) if now - s.last_touched < cache_ttl => s,
            _ => UserState::fresh(now),
        };

        // Rebuild from scratch using only non-expired entries, mirroring the
        // spec's "fetch then rebuild filtered" step rather than trimming in place.
        let cutoff = now - window;
        let retained: Vec<Entry> = state.entries.into_iter().filter(|e| e.time >= cutoff).collect();
        let mut trackers: HashMap<String, Tracker> = HashMap::new();
        for e in &retained {
            let t = trackers.entry(e.hash.clone()).or_insert_with(|| Tracker {
                count: 0,
                first_seen: e.time,
                last_seen: e.time,
                message_ids: Vec::new(),
            });
            t.count += 1;
            t.first_seen = t.first_seen.min(e.time);
            t.last_seen = t.last_seen.max(e.time);
            t.message_ids.push(e.message_id);
        }
        state.entries = retained;
        state.trackers = trackers;

        let is_edit = state.entries.iter().any(|e| e.message_id == message_id);
        let result = if is_edit {
            let existing = state
                .entries
                .iter()
                .find(|e| e.message_id == message_id)
                .cloned()
                .expect("is_edit implies presence");
            if existing.hash != hash {
                // content-changing edit: drop the old entry and its tracker slot,
                // then fall through and treat this message as new content.
                state.entries.retain(|e| e.message_id != message_id);
                if let Some(t) = state.trackers.get_mut(&existing.hash) {
                    t.count = t.count.saturating_sub(1);
                    t.message_ids.retain(|id| *id != message_id);
                    if t.count == 0 {
                        state.trackers.remove(&existing.hash);
                    }
                }
                self.record_and_evaluate(&mut state, hash, message_id, now, false)
            } else {
                // same-hash edit: no increment, never spam on its own.
                DuplicateResult {
                    spam: false,
                    extra_delete_ids: Vec::new(),
                    details: String::new(),
                }
            }
        } else {
            self.record_and_evaluate(&mut state, hash, message_id, now, true)
        };

        if state.entries.len() > MAX_ENTRIES_PER_USER {
            let overflow = state.entries.len() - MAX_ENTRIES_PER_USER;
            let removed: Vec<Entry> = state.entries.drain(0..overflow).collect();
            for e in removed {
                if let Some(t) = state.trackers.get_mut(&e.hash) {
                    t.count = t.count.saturating_sub(1);
                    t.message_ids.retain(|id| *id != e.message_id);
                    if t.count == 0 {
                        state.trackers.remove(&e.hash);
                    } else if let Some(new_first) = state
                        .entries
                        .iter()
                        .filter(|e2| e2.hash == e.hash)
                        .map(|e2| e2.time)
                        .min()
                    {
                        t.first_seen = new_first;
                    }
                }
            }
        }

        state.last_touched = now;
        inner.cache.put(user_id.to_string(), state);
        result
    }

    fn record_and_evaluate(
        &self,
        state: &mut UserState,
        hash: &str,
        message_id: i32,
        now: DateTime<Utc>,
        append: bool,
    ) -> DuplicateResult {
        if append {
            state.entries.push(Entry {
                hash: hash.to_string(),
                time: now,
                message_id,
            });
        }
        let tracker = state.trackers.entry(hash.to_string()).or_insert_with(|| Tracker {
            count: 0,
            first_seen: now,
            last_seen: now,
            message_ids: Vec::new(),
        });
        tracker.count += 1;
        tracker.last_seen = now;
        tracker.message_ids.push(message_id);

        if tracker.count >= self.threshold {
            let extra_delete_ids: Vec<i32> = tracker
                .message_ids
                .iter()
                .copied()
                .filter(|id| *id != message_id)
                .collect();
            let span = tracker.last_seen - tracker.first_seen;
            let details = if span <= Duration::zero() {
                "duplicate message sent instantly".to_string()
            } else {
                format!("duplicate message sent within {}s", span.num_seconds())
            };
            DuplicateResult {
                spam: true,
                extra_delete_ids,
                details,
            }
        } else {
            DuplicateResult {
                spam: false,
                extra_delete_ids: Vec::new(),
                details: String::new(),
            }
        }
    }

    /// Sweeps every cached user, dropping entries older than `window`, then
    /// evicts any user whose last touch is older than `2 * window` entirely —
    /// the same TTL applied on access in `check`, just run proactively so
    /// users who never send another message still get reclaimed.
    fn global_cleanup(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        let cache_ttl = Duration::from_std(self.window.to_std().unwrap_or(StdDuration::ZERO) * 2)
            .unwrap_or(self.window);
        let keys: Vec<String> = inner.cache.iter().map(|(k, _)| k.clone()).collect();
        for key in keys {
            if let Some(state) = inner.cache.peek_mut(&key) {
                state.entries.retain(|e| e.time >= cutoff);
                if state.entries.is_empty() {
                    state.trackers.clear();
                }
            }
        }
        let expired: Vec<String> = inner
            .cache
            .iter()
            .filter(|(_, s)| s.entries.is_empty() || now - s.last_touched >= cache_ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.cache.pop(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_below_threshold_of_two() {
        let d = DuplicateDetector::new(1, Duration::hours(1));
        assert!(!d.is_enabled());
        let r = d.check("u1", "h1", 1);
        assert!(!r.spam);
    }

    #[test]
    fn triggers_at_threshold_with_extra_delete_ids() {
        let d = DuplicateDetector::new(3, Duration::hours(1));
        assert!(!d.check("u1", "abc", 1).spam);
        assert!(!d.check("u1", "abc", 2).spam);
        let r = d.check("u1", "abc", 3);
        assert!(r.spam);
        assert_eq!(r.extra_delete_ids, vec![1, 2]);
    }

    #[test]
    fn same_hash_edit_does_not_increment() {
        let d = DuplicateDetector::new(2, Duration::hours(1));
        assert!(!d.check("u1", "abc", 1).spam);
        // re-check the same message id with the same hash: no increment.
        let r = d.check("u1", "abc", 1);
        assert!(!r.spam);
    }

    #[test]
    fn different_hash_edit_replaces_tracker_slot() {
        let d = DuplicateDetector::new(2, Duration::hours(1));
        assert!(!d.check("u1", "abc", 1).spam);
        // editing message 1's content to a brand-new hash should not itself
        // count as a duplicate of "abc".
        let r = d.check("u1", "xyz", 1);
        assert!(!r.spam);
    }

    #[test]
    fn per_user_isolation() {
        let d = DuplicateDetector::new(2, Duration::hours(1));
        assert!(!d.check("u1", "abc", 1).spam);
        assert!(!d.check("u2", "abc", 1).spam);
    }

    #[test]
    fn stale_user_state_is_evicted_after_ttl() {
        // window is short enough that 2 * window comfortably elapses within
        // a single test's real-time sleep.
        let d = DuplicateDetector::new(2, Duration::milliseconds(20));
        assert!(!d.check("u1", "abc", 1).spam);
        std::thread::sleep(StdDuration::from_millis(60));
        // past the 2 * window TTL: the old entry must not survive to count
        // towards a fresh threshold check.
        let r = d.check("u1", "abc", 2);
        assert!(!r.spam);
    }
}
