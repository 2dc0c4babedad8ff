// Clima Agent -- Per-caller rate limiter
//
// Fixed window counter per caller. Once `count` reaches the limit the caller
// spends burst tokens; those are replenished on window rollover only.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Who is calling. Falls back to a single shared bucket when nothing is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerKey(String);

impl CallerKey {
    pub const GLOBAL: &'static str = "global";

    pub fn agent(id: &str) -> Self {
        Self(format!("agent:{}", id.trim()))
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self(format!("ip:{addr}"))
    }

    pub fn global() -> Self {
        Self(Self::GLOBAL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub burst: u32,
    #[serde(rename = "window_seconds", serialize_with = "serialize_secs")]
    pub window: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded, retry in {}s", retry_after_secs(.retry_after))]
pub struct RateLimited {
    pub retry_after: Duration,
}

impl RateLimited {
    pub fn retry_after_secs(&self) -> u64 {
        retry_after_secs(&self.retry_after)
    }
}

/// Whole seconds, rounded up. Shared by every retry hint that reaches the wire.
pub fn retry_after_secs(d: &Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    count: u32,
    burst_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub policy: RateLimitPolicy,
    pub tracked_callers: usize,
    pub rejections: u64,
}

pub struct RateLimiter {
    policy: RateLimitPolicy,
    windows: Mutex<HashMap<CallerKey, RateWindow>>,
    rejections: AtomicU64,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            windows: Mutex::new(HashMap::new()),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub fn check(&self, caller: &CallerKey) -> Result<(), RateLimited> {
        self.check_at(caller, Instant::now())
    }

    pub(crate) fn check_at(&self, caller: &CallerKey, now: Instant) -> Result<(), RateLimited> {
        let policy = self.policy;
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let window = windows.entry(caller.clone()).or_insert(RateWindow {
            window_start: now,
            count: 0,
            burst_tokens: policy.burst,
        });

        if now.duration_since(window.window_start) >= policy.window {
            *window = RateWindow {
                window_start: now,
                count: 0,
                burst_tokens: policy.burst,
            };
        }

        if window.count < policy.limit {
            window.count += 1;
            return Ok(());
        }
        if window.burst_tokens > 0 {
            window.burst_tokens -= 1;
            window.count += 1;
            return Ok(());
        }

        let retry_after = (window.window_start + policy.window).saturating_duration_since(now);
        drop(windows);
        self.rejections.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(caller = %caller, retry_after_ms = retry_after.as_millis() as u64, "rate limiter: rejected");
        Err(RateLimited { retry_after })
    }

    /// Forget callers whose window started more than two window lengths ago.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    pub(crate) fn prune_idle_at(&self, now: Instant) -> usize {
        let horizon = self.policy.window * 2;
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.window_start) < horizon);
        before - windows.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        let tracked_callers = self.windows.lock().unwrap_or_else(|p| p.into_inner()).len();
        RateLimiterStats {
            policy: self.policy,
            tracked_callers,
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}
