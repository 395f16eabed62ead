use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Deterministic ceiling of the requeue delay for the `attempt`-th
/// consecutive failure: `min(cap, base * 2^attempt)`, never zero.
pub fn backoff_upper_bound(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let shift = attempt.min(63) as u32;
    let exp_ms = (base.as_millis() as u64).saturating_mul(1u64 << shift);
    Duration::from_millis(exp_ms.min(cap.as_millis() as u64).max(1))
}

/// Requeue delay with "full jitter": uniform in `[0, backoff_upper_bound]`.
/// Spreading the whole window keeps a burst of failing resources from
/// requeueing in lockstep against the API server.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let upper_ms = backoff_upper_bound(base, cap, attempt).as_millis() as u64;
    Duration::from_millis(rand::random_range(0..=upper_ms))
}

/// Token bucket refilled at `qps`, holding at most `burst` tokens. Callers
/// that outrun the bucket are told how long to wait for the next token.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available; otherwise the duration until one is.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.qps))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_bound_grows_then_saturates() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_upper_bound(base, cap, 0), Duration::from_millis(500));
        assert_eq!(backoff_upper_bound(base, cap, 1), Duration::from_secs(1));
        assert_eq!(backoff_upper_bound(base, cap, 10), cap);
        assert_eq!(backoff_upper_bound(base, cap, 200), cap);
    }

    #[test]
    fn upper_bound_is_never_zero() {
        assert!(
            backoff_upper_bound(Duration::ZERO, Duration::ZERO, 0) >= Duration::from_millis(1)
        );
    }

    #[test]
    fn jitter_stays_within_the_attempt_window() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(2);
        for attempt in 0..20 {
            let delay = backoff_full_jitter(base, cap, attempt);
            assert!(
                delay <= backoff_upper_bound(base, cap, attempt),
                "attempt {attempt} produced {delay:?}"
            );
        }
    }

    #[test]
    fn bucket_allows_burst_then_blocks() {
        let bucket = TokenBucket::new(10.0, 3);
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        let wait = bucket.try_acquire().expect_err("bucket should be empty");
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(150));
    }

    #[test]
    fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(1000.0, 1);
        assert!(bucket.try_acquire().is_ok());
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.try_acquire().is_ok());
    }
}
