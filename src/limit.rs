//! Per-client fixed-window request throttle.
//!
//! State is local to one `RateLimiter` instance; separate processes do not
//! share counts, so this only holds for a single-instance deployment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::config::RateLimitSettings;

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    pub fn retry_after(&self) -> Duration {
        (self.reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    limit: u32,
    window: chrono::Duration,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(settings.limit, settings.window)
    }

    pub fn admit(&self, client_id: &str) -> RateLimitDecision {
        self.admit_at(client_id, Utc::now())
    }

    pub fn admit_at(&self, client_id: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let mut entries = self.lock();

        match entries.get_mut(client_id) {
            Some(entry) if now <= entry.reset_at => {
                if entry.count >= self.limit {
                    warn!("Rate limit exceeded for client {}", client_id);
                    return RateLimitDecision {
                        allowed: false,
                        limit: self.limit,
                        remaining: 0,
                        reset_at: entry.reset_at,
                    };
                }
                entry.count += 1;
                RateLimitDecision {
                    allowed: true,
                    limit: self.limit,
                    remaining: self.limit - entry.count,
                    reset_at: entry.reset_at,
                }
            }
            // First request, or the previous window has run out.
            _ => {
                let entry = RateLimitEntry {
                    count: 1,
                    reset_at: now + self.window,
                };
                entries.insert(client_id.to_string(), entry);
                RateLimitDecision {
                    allowed: self.limit > 0,
                    limit: self.limit,
                    remaining: self.limit.saturating_sub(1),
                    reset_at: entry.reset_at,
                }
            }
        }
    }

    /// Drops every entry whose window has expired. Returns how many went.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.reset_at);
        before - entries.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }

    /// Periodically sweeps expired entries until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(MIN_SWEEP_PERIOD));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.sweep_at(Utc::now());
                if removed > 0 {
                    debug!("Rate limiter swept {} expired entries", removed);
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateLimitEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
