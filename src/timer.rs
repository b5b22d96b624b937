//! Cooperative timers, polled by their owner
//!
//! Nothing fires by itself: the owner calls [`TimerList::poll_expired`] from its periodic
//! tick and handles the returned keys. An expired timer leaves the list; re-arming it
//! is an explicit [`TimerList::init`] by the owner.

use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Exponential reconnection backoff
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(3600),
            factor: 2,
        }
    }
}

impl BackoffPolicy {
    /// Expiry to use after another failed attempt, never above `max`
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(self.factor).min(self.max)
    }
}

/// Deadline used when `start + expire` can't be represented
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug)]
struct Timer<K> {
    key: K,
    expire: Duration,
    start: Instant,
}

impl<K> Timer<K> {
    fn deadline(&self) -> Instant {
        self.start
            .checked_add(self.expire)
            .or_else(|| self.start.checked_add(FAR_FUTURE))
            .unwrap_or(self.start)
    }
}

/// Active timers of one owner, identified by key
#[derive(Debug)]
pub struct TimerList<K> {
    timers: Vec<Timer<K>>,
}

impl<K> Default for TimerList<K> {
    fn default() -> Self {
        Self { timers: Vec::new() }
    }
}

impl<K> TimerList<K>
where
    K: Eq + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &K) -> Option<usize> {
        self.timers.iter().position(|t| &t.key == key)
    }

    /// Arms a timer, or restarts it with the new expiry if the key is already armed
    pub fn init(&mut self, key: K, expire: Duration, now: Instant) {
        trace!("Arming timer {:?} for {:?}", key, expire);
        match self.position(&key) {
            Some(i) => {
                self.timers[i].expire = expire;
                self.timers[i].start = now;
            }
            None => self.timers.push(Timer {
                key,
                expire,
                start: now,
            }),
        }
    }

    /// Restarts an armed timer from `now`. Returns false if the key isn't armed.
    pub fn reset(&mut self, key: &K, now: Instant) -> bool {
        match self.position(key) {
            Some(i) => {
                self.timers[i].start = now;
                true
            }
            None => false,
        }
    }

    /// Disarms a timer. Returns false if the key wasn't armed.
    pub fn destroy(&mut self, key: &K) -> bool {
        match self.position(key) {
            Some(i) => {
                trace!("Destroying timer {:?}", key);
                self.timers.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.position(key).is_some()
    }

    pub fn expire(&self, key: &K) -> Option<Duration> {
        self.position(key).map(|i| self.timers[i].expire)
    }

    /// Earliest deadline among armed timers
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(Timer::deadline).min()
    }

    /// Removes every timer whose deadline has passed, returning their keys and expiry
    /// in deadline order
    pub fn poll_expired(&mut self, now: Instant) -> Vec<(K, Duration)> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].deadline() <= now {
                expired.push(self.timers.remove(i));
            } else {
                i += 1;
            }
        }
        expired.sort_by_key(Timer::deadline);
        expired.into_iter().map(|t| (t.key, t.expire)).collect()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}
