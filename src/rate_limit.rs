use std::time::Instant;

/// Token bucket sized for `orders_per_minute`: starts full, refills continuously.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_update: Instant,
}

impl TokenBucket {
    pub fn per_minute(orders_per_minute: u32) -> Self {
        Self::new(orders_per_minute, f64::from(orders_per_minute) / 60.0)
    }

    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: f64::from(capacity),
            refill_rate,
            last_update: Instant::now(),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = f64::min(
            f64::from(self.capacity),
            self.tokens + elapsed * self.refill_rate,
        );
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
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
    fn burst_up_to_capacity_then_refuse() {
        let mut bucket = TokenBucket::per_minute(3);
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(t0));
        assert!(bucket.try_acquire_at(t0));
        assert!(bucket.try_acquire_at(t0));
        assert!(!bucket.try_acquire_at(t0));
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::per_minute(60);
        let t0 = Instant::now();
        for _ in 0..60 {
            assert!(bucket.try_acquire_at(t0));
        }
        assert!(!bucket.try_acquire_at(t0));
        assert!(bucket.try_acquire_at(t0 + Duration::from_millis(1_100)));
    }
}
