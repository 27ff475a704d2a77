//! Rate Limiter (C1): a single token bucket shared across all fetchers in one
//! session, with adaptive multiplicative backoff on error signals.
//!
//! Grounded on `crawl_engine/rate_limiter.rs`'s lock-free packed-`AtomicU128`
//! token bucket (CAS retry loop, fixed-point token arithmetic), narrowed from a
//! `DashMap` of per-domain buckets to a single shared bucket per spec.md §4.1's last
//! sentence ("the limiter is shared across all fetchers in one session").

use std::sync::atomic::{AtomicU128, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::FailureKind;

const TOKEN_SCALE: u64 = 1000;
const RATE_SCALE: u64 = 1_000_000;
const ADAPTIVE_CEILING_NANOS: u64 = 10_000_000_000; // 10s

#[inline(always)]
fn pack_state(tokens: u64, last_refill_nanos: u64) -> u128 {
    ((tokens as u128) << 64) | (last_refill_nanos as u128)
}

#[inline(always)]
fn unpack_state(packed: u128) -> (u64, u64) {
    let tokens = (packed >> 64) as u64;
    let last_refill_nanos = (packed & 0xFFFF_FFFF_FFFF_FFFF) as u64;
    (tokens, last_refill_nanos)
}

/// Outcome of `Acquire()` once a token is available; callers propagate `Cancelled`
/// themselves by racing the acquire future against the session cancellation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit;

pub struct RateLimiter {
    state: AtomicU128,
    rate_per_nano: u64,
    max_tokens: u64,
    /// Adaptive extra delay (nanoseconds) layered on top of the steady-state bucket,
    /// driven by `ReportSuccess`/`ReportError`.
    adaptive_delay_nanos: AtomicU64,
    consecutive_errors: AtomicU64,
    base_time: Instant,
}

impl RateLimiter {
    #[must_use]
    pub fn new(rate_rps: f64, burst: u32) -> Self {
        let max_tokens = (f64::from(burst).max(1.0) * TOKEN_SCALE as f64) as u64;
        let rate_per_nano =
            ((rate_rps * TOKEN_SCALE as f64 * RATE_SCALE as f64) / 1_000_000_000.0) as u64;
        let base_time = Instant::now();
        Self {
            state: AtomicU128::new(pack_state(max_tokens, 0)),
            rate_per_nano,
            max_tokens,
            adaptive_delay_nanos: AtomicU64::new((1_000_000_000.0 / rate_rps.max(0.01)) as u64),
            consecutive_errors: AtomicU64::new(0),
            base_time,
        }
    }

    /// Blocks (cooperatively, via `tokio::time::sleep`) until a token is available.
    /// Callers race this against session cancellation; this function never returns
    /// `Cancelled` itself.
    pub async fn acquire(&self) {
        loop {
            if let Some(wait) = self.try_consume() {
                if wait.is_zero() {
                    return;
                }
                tokio::time::sleep(wait).await;
            } else {
                return;
            }
        }
    }

    /// Returns `None` if a token was consumed, `Some(wait)` otherwise.
    fn try_consume(&self) -> Option<Duration> {
        let now_nanos = self.base_time.elapsed().as_nanos() as u64;
        self.refill(now_nanos);

        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let (tokens, last_refill) = unpack_state(current);
            if tokens < TOKEN_SCALE {
                let needed = TOKEN_SCALE.saturating_sub(tokens);
                let nanos_needed = if self.rate_per_nano > 0 {
                    (needed.saturating_mul(RATE_SCALE)) / self.rate_per_nano
                } else {
                    1_000_000
                };
                let adaptive = self.adaptive_delay_nanos.load(Ordering::Relaxed);
                return Some(Duration::from_nanos(nanos_needed.max(adaptive)));
            }
            let new_state = pack_state(tokens - TOKEN_SCALE, last_refill);
            match self.state.compare_exchange_weak(
                current,
                new_state,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return None,
                Err(actual) => {
                    current = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn refill(&self, now_nanos: u64) {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let (tokens, last_refill) = unpack_state(current);
            if now_nanos <= last_refill {
                return;
            }
            let elapsed = now_nanos.saturating_sub(last_refill);
            let to_add = (elapsed.saturating_mul(self.rate_per_nano)) / RATE_SCALE;
            let time_credited = if self.rate_per_nano > 0 {
                (to_add.saturating_mul(RATE_SCALE)) / self.rate_per_nano
            } else {
                0
            };
            let new_last_refill = last_refill.saturating_add(time_credited);
            let new_tokens = if to_add > 0 {
                tokens.saturating_add(to_add).min(self.max_tokens)
            } else {
                tokens
            };
            let new_state = pack_state(new_tokens, new_last_refill);
            match self.state.compare_exchange_weak(
                current,
                new_state,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    current = actual;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// `delay ← max(1/R, delay × 0.9)` (spec.md §4.1).
    pub fn report_success(&self, steady_state_floor: Duration) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
        let floor_nanos = steady_state_floor.as_nanos() as u64;
        let mut current = self.adaptive_delay_nanos.load(Ordering::Relaxed);
        loop {
            let next = ((current as f64) * 0.9) as u64;
            let next = next.max(floor_nanos);
            match self.adaptive_delay_nanos.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    log::debug!("rate limiter decayed adaptive delay to {next}ns");
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// `delay ← min(ceiling, delay × (1.5 + 0.1·k))` where `k` is the consecutive
    /// error count (spec.md §4.1). `kind` currently only affects logging context;
    /// the formula itself is kind-agnostic per spec.
    pub fn report_error(&self, kind: FailureKind) {
        let k = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        let multiplier = 1.5 + 0.1 * (k as f64);
        let mut current = self.adaptive_delay_nanos.load(Ordering::Relaxed);
        loop {
            let next = ((current as f64) * multiplier) as u64;
            let next = next.min(ADAPTIVE_CEILING_NANOS).max(1);
            match self.adaptive_delay_nanos.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    log::warn!(
                        "rate limiter backed off to {next}ns after {k} consecutive {kind:?} errors"
                    );
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_acquire_does_not_block() {
        let limiter = RateLimiter::new(2.0, 3);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn report_error_grows_adaptive_delay() {
        let limiter = RateLimiter::new(2.0, 3);
        let before = limiter.adaptive_delay_nanos.load(Ordering::Relaxed);
        limiter.report_error(FailureKind::Network);
        let after = limiter.adaptive_delay_nanos.load(Ordering::Relaxed);
        assert!(after > before);
    }

    #[test]
    fn report_success_decays_toward_floor() {
        let limiter = RateLimiter::new(2.0, 3);
        limiter.report_error(FailureKind::Network);
        limiter.report_error(FailureKind::Network);
        let floor = Duration::from_millis(500);
        for _ in 0..50 {
            limiter.report_success(floor);
        }
        let final_delay = limiter.adaptive_delay_nanos.load(Ordering::Relaxed);
        assert_eq!(final_delay, floor.as_nanos() as u64);
    }
}
