//! Global outbound request limiter.
//!
//! A token bucket holding up to `requests_per_minute` tokens that refills
//! continuously at the same rate per minute. Every HTTP attempt, retries
//! included, takes one token. Counts are kept in thousandths of a token so
//! slow refill rates still accrue between checks.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const MILLIS_PER_TOKEN: u64 = 1000;
const MILLIS_PER_MINUTE: u64 = 60_000;
/// Nanoseconds per minute divided by millitokens per token.
const NANOS_PER_MINUTE_PER_MILLI: u128 = 60_000_000;

#[derive(Debug)]
struct BucketState {
    millitokens: u64,
    last_refill: Instant,
}

/// Token bucket shared by every analysis worker.
#[derive(Debug)]
pub struct TokenBucket {
    per_minute: u64,
    capacity: u64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket allowing `requests_per_minute` requests (at least 1).
    pub fn new(requests_per_minute: u32) -> Self {
        let per_minute = u64::from(requests_per_minute.max(1));
        let capacity = per_minute.saturating_mul(MILLIS_PER_TOKEN);
        Self {
            per_minute,
            capacity,
            state: Mutex::new(BucketState {
                millitokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token, waiting for one to accrue if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if let Some(rest) = state.millitokens.checked_sub(MILLIS_PER_TOKEN) {
                    state.millitokens = rest;
                    return;
                }
                self.time_until_token(state.millitokens)
            };
            debug!(wait_ms = wait.as_millis(), "rate limit reached, waiting for token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        match state.millitokens.checked_sub(MILLIS_PER_TOKEN) {
            Some(rest) => {
                state.millitokens = rest;
                true
            }
            None => false,
        }
    }

    /// Whole tokens currently available.
    pub async fn available(&self) -> u64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.millitokens.checked_div(MILLIS_PER_TOKEN).unwrap_or(0)
    }

    /// Credit whole millitokens for the time since the last refill. The
    /// clock only advances by the time those millitokens cover, so the
    /// fractional remainder carries over to the next call.
    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let per_minute = u128::from(self.per_minute);
        let elapsed_ns = now.duration_since(state.last_refill).as_nanos();
        let added = elapsed_ns
            .saturating_mul(per_minute)
            .checked_div(NANOS_PER_MINUTE_PER_MILLI)
            .unwrap_or(0);
        if added == 0 {
            return;
        }

        let total = u128::from(state.millitokens).saturating_add(added);
        match u64::try_from(total) {
            Ok(total) if total < self.capacity => {
                state.millitokens = total;
                let covered_ns = added
                    .saturating_mul(NANOS_PER_MINUTE_PER_MILLI)
                    .checked_div(per_minute)
                    .unwrap_or(elapsed_ns);
                let covered = Duration::from_nanos(u64::try_from(covered_ns).unwrap_or(u64::MAX));
                state.last_refill = state.last_refill.checked_add(covered).unwrap_or(now);
            }
            // Full bucket: nothing to carry.
            _ => {
                state.millitokens = self.capacity;
                state.last_refill = now;
            }
        }
    }

    fn time_until_token(&self, millitokens: u64) -> Duration {
        let missing = MILLIS_PER_TOKEN.saturating_sub(millitokens);
        // Round up so the next refill is guaranteed to cover the gap.
        let ms = missing
            .saturating_mul(60)
            .saturating_add(self.per_minute.saturating_sub(1))
            .checked_div(self.per_minute)
            .unwrap_or(MILLIS_PER_MINUTE);
        Duration::from_millis(ms.max(1))
    }
}
