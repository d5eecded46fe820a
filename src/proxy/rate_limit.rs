// src/proxy/rate_limit.rs
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Sustained rate and burst size for one backend's admission limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub per_second: u32,
    pub burst: u32,
}

impl RateLimit {
    /// Returns `None` for a zero rate: zero means "no limiter", never a
    /// zero-capacity bucket.
    pub fn new(per_second: u32, burst: Option<u32>) -> Option<Self> {
        if per_second == 0 {
            return None;
        }
        Some(Self {
            per_second,
            burst: burst.filter(|b| *b > 0).unwrap_or(per_second),
        })
    }

    /// An explicit per-backend rate overrides the pool default.
    pub fn resolve(explicit: Option<RateLimit>, default: Option<RateLimit>) -> Option<RateLimit> {
        explicit.or(default)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Non-blocking token bucket. Callers that find it empty are rejected,
/// never queued.
#[derive(Debug)]
pub struct TokenBucket {
    limit: RateLimit,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new(BucketState {
                tokens: limit.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let capacity = self.limit.burst as f64;

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.limit.per_second as f64).min(capacity);
        if now > state.last_refill {
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_zero_rate_builds_no_limiter() {
        assert_eq!(RateLimit::new(0, Some(10)), None);
    }

    #[test]
    fn test_burst_defaults_to_rate() {
        let limit = RateLimit::new(25, None).unwrap();
        assert_eq!(limit.burst, 25);
        let limit = RateLimit::new(25, Some(0)).unwrap();
        assert_eq!(limit.burst, 25);
        let limit = RateLimit::new(25, Some(50)).unwrap();
        assert_eq!(limit.burst, 50);
    }

    #[test]
    fn test_resolve_prefers_explicit() {
        let explicit = RateLimit::new(5, None);
        let default = RateLimit::new(100, None);
        assert_eq!(RateLimit::resolve(explicit, default), explicit);
        assert_eq!(RateLimit::resolve(None, default), default);
        assert_eq!(RateLimit::resolve(None, None), None);
    }

    #[test]
    fn test_one_per_second_rejects_second_request() {
        let bucket = TokenBucket::new(RateLimit::new(1, Some(1)).unwrap());
        let now = Instant::now();
        assert!(bucket.try_acquire_at(now));
        assert!(!bucket.try_acquire_at(now));
        assert!(!bucket.try_acquire_at(now + Duration::from_millis(500)));
    }

    #[test]
    fn test_refills_over_time() {
        let bucket = TokenBucket::new(RateLimit::new(1, Some(1)).unwrap());
        let now = Instant::now();
        assert!(bucket.try_acquire_at(now));
        assert!(!bucket.try_acquire_at(now));
        assert!(bucket.try_acquire_at(now + Duration::from_millis(1100)));
    }

    #[test]
    fn test_burst_allows_back_to_back() {
        let bucket = TokenBucket::new(RateLimit::new(10, Some(3)).unwrap());
        let now = Instant::now();
        let allowed = (0..10).filter(|_| bucket.try_acquire_at(now)).count();
        assert_eq!(allowed, 3);
    }

    #[test]
    fn test_refill_is_capped_at_burst() {
        let bucket = TokenBucket::new(RateLimit::new(100, Some(2)).unwrap());
        let later = Instant::now() + Duration::from_secs(60);
        let allowed = (0..10).filter(|_| bucket.try_acquire_at(later)).count();
        assert_eq!(allowed, 2);
    }
}
