//! Core rate limiter implementation.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::entry::{RateLimitDecision, RateLimitEntry};
use super::identity::ClientIdentity;
use super::rules::RateLimiterConfig;

type EntryMap = HashMap<String, RateLimitEntry>;

/// A fixed-window request counter keyed by client identity.
///
/// Every key gets `max_requests` admissions per window; the window opens on
/// the key's first request and the count starts over once it has passed.
/// A key can therefore see up to twice its quota in quick succession around
/// a window boundary.
///
/// The check-then-increment runs under one lock shared with the sweep, so
/// the limiter can be shared across threads behind an `Arc`. Instances are
/// fully independent of each other.
pub struct RateLimiter {
    config: RateLimiterConfig,
    /// Counter state indexed by derived key
    entries: Arc<Mutex<EntryMap>>,
    clock: Arc<dyn Clock>,
    /// Background sweep, if one could be started
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    ///
    /// When called inside a Tokio runtime this also starts the periodic sweep
    /// of expired entries.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter that reads time from `clock`.
    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let limiter = Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
            sweeper: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        };

        let handle = limiter.spawn_sweeper();
        *limiter.sweeper.lock() = handle;
        limiter
    }

    /// Count a request from `identity` and decide whether it may proceed.
    ///
    /// Rejections leave the stored count untouched.
    pub fn is_allowed(&self, identity: &ClientIdentity) -> RateLimitDecision {
        let key = self.config.key_for(identity);
        let now = self.clock.now_millis();
        let max_requests = self.config.max_requests();

        trace!(key = %key, "Checking rate limit");

        let mut entries = self.entries.lock();
        let slot = entries.entry(key);
        match slot {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let reset_time = occupied.get().reset_time;
                if occupied.get().count >= max_requests {
                    debug!(
                        key = %occupied.key(),
                        limit = max_requests,
                        reset_time,
                        "Rate limit exceeded"
                    );
                    RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_time,
                    }
                } else {
                    let entry = occupied.get_mut();
                    entry.count += 1;
                    RateLimitDecision {
                        allowed: true,
                        remaining: max_requests - entry.count,
                        reset_time: entry.reset_time,
                    }
                }
            }
            Entry::Occupied(mut occupied) => {
                debug!(key = %occupied.key(), "Window elapsed, starting a new one");
                let entry = RateLimitEntry::open(now, self.config.window_ms());
                occupied.insert(entry);
                self.fresh_window(entry)
            }
            Entry::Vacant(vacant) => {
                debug!(key = %vacant.key(), limit = max_requests, "Creating new rate limit entry");
                let entry = *vacant.insert(RateLimitEntry::open(now, self.config.window_ms()));
                self.fresh_window(entry)
            }
        }
    }

    fn fresh_window(&self, entry: RateLimitEntry) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            remaining: self.config.max_requests() - entry.count,
            reset_time: entry.reset_time,
        }
    }

    /// Drop every entry whose window has ended.
    ///
    /// Returns the number of entries removed. The background sweep calls
    /// this on its own schedule; calling it directly is always safe.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        purge_expired(&mut self.entries.lock(), now)
    }

    /// Stop the background sweep and forget all entries.
    ///
    /// Idempotent. Once this returns the sweep will never run again; the
    /// limiter itself keeps answering `is_allowed` from an empty state.
    pub fn destroy(&self) {
        let first = !self.stopped.swap(true, Ordering::SeqCst);

        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        let cleared = {
            let mut entries = self.entries.lock();
            let cleared = entries.len();
            entries.clear();
            cleared
        };

        if first {
            info!(cleared, "Rate limiter destroyed");
        }
    }

    /// Whether `destroy` has been called.
    pub fn is_destroyed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether a background sweep task is currently scheduled.
    pub fn has_sweeper(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// The stored entry for an identity, expired or not.
    pub fn get_entry(&self, identity: &ClientIdentity) -> Option<RateLimitEntry> {
        let key = self.config.key_for(identity);
        self.entries.lock().get(&key).copied()
    }

    /// Get the number of stored entries, including expired ones not yet swept.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let period = self.config.cleanup_interval();
        if period.is_zero() {
            debug!("Cleanup interval is zero, background sweep disabled");
            return None;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No Tokio runtime available, expired entries will only be removed by cleanup()");
                return None;
            }
        };

        let entries = Arc::downgrade(&self.entries);
        let stopped = Arc::clone(&self.stopped);
        let clock = Arc::clone(&self.clock);

        Some(runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !sweep(&entries, &stopped, clock.as_ref()) {
                    break;
                }
            }
        }))
    }
}

/// One scheduled sweep. Returns `false` once the limiter is gone or destroyed.
fn sweep(entries: &Weak<Mutex<EntryMap>>, stopped: &AtomicBool, clock: &dyn Clock) -> bool {
    let Some(entries) = entries.upgrade() else {
        return false;
    };

    let mut entries = entries.lock();
    // Checked under the lock so a sweep can't interleave with destroy().
    if stopped.load(Ordering::SeqCst) {
        return false;
    }

    let removed = purge_expired(&mut entries, clock.now_millis());
    if removed > 0 {
        info!(removed, remaining = entries.len(), "Swept expired rate limit entries");
    } else {
        trace!(live = entries.len(), "Sweep found nothing to remove");
    }
    true
}

fn purge_expired(entries: &mut EntryMap, now: i64) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
}

impl RateLimiterBackend for RateLimiter {
    fn is_allowed(&self, identity: &ClientIdentity) -> RateLimitDecision {
        RateLimiter::is_allowed(self, identity)
    }

    fn max_requests(&self) -> u32 {
        self.config.max_requests()
    }

    fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
