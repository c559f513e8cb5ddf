use crate::metrics_defs::{UPSTREAM_RATELIMIT_LOW, UPSTREAM_RATELIMIT_REMAINING};
use http::HeaderMap;
use shared::{counter, gauge};

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

// Remaining quota below limit / LOW_QUOTA_DIVISOR raises the low quota signal.
const LOW_QUOTA_DIVISOR: u64 = 5;

/// Quota reported by the upstream on a single response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub remaining: u64,
    /// Unix time in seconds at which the quota resets.
    pub reset: Option<i64>,
}

impl RateLimit {
    /// Reads the rate limit headers. Missing or unparsable limit/remaining
    /// headers yield None; the reset header is optional.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let limit = header_value::<u64>(headers, LIMIT_HEADER)?;
        let remaining = header_value::<u64>(headers, REMAINING_HEADER)?;
        let reset = header_value::<i64>(headers, RESET_HEADER);

        Some(RateLimit {
            limit,
            remaining,
            reset,
        })
    }

    pub fn is_low(&self) -> bool {
        self.limit > 0 && self.remaining.saturating_mul(LOW_QUOTA_DIVISOR) < self.limit
    }

    /// Emits the quota signals. Never fails the call it was read from.
    pub fn observe(&self) {
        gauge!(UPSTREAM_RATELIMIT_REMAINING).set(self.remaining as f64);

        if self.is_low() {
            counter!(UPSTREAM_RATELIMIT_LOW).increment(1);
            tracing::warn!(
                limit = self.limit,
                remaining = self.remaining,
                reset = ?self.reset,
                "upstream rate limit quota is running low"
            );
        }
    }
}

fn header_value<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}
