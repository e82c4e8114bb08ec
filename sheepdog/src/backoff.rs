//! Relaunch delay schedule: base-3 exponential growth, truncated to whole
//! seconds so early attempts are effectively immediate.

use std::time::Duration;

/// Delay before attempt number `attempt` (which is also the exponent).
/// With the default 1ms base this yields 0,0,0,0,0,0,0,2,6,19 seconds for
/// the first ten attempts.
pub(crate) fn delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 3u64.checked_pow(attempt).unwrap_or(u64::MAX);
    let millis = base_ms.saturating_mul(factor);
    Duration::from_secs(millis / 1000)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_schedule() {
        let seconds: Vec<u64> = (0..10).map(|i| delay(1, i).as_secs()).collect();
        assert_eq!(seconds, vec![0, 0, 0, 0, 0, 0, 0, 2, 6, 19]);
    }

    #[test]
    fn larger_base_scales_schedule() {
        assert_eq!(delay(1000, 0), Duration::from_secs(1));
        assert_eq!(delay(1000, 2), Duration::from_secs(9));
    }

    #[test]
    fn huge_exponents_saturate_instead_of_panicking() {
        assert_eq!(delay(1, 1000).as_secs(), u64::MAX / 1000);
    }
}
