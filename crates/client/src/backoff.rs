use std::time::Duration;

use rand::Rng;

const BACKOFF_FACTOR: f64 = 2.0;
const MAX_EXPONENT: u64 = 16;

/// Exponential delay with ±10% jitter for the `attempt`-th consecutive failure, capped at `max`.
pub fn backoff(attempt: u64, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT) as i32;
    let base = initial.as_millis() as f64 * BACKOFF_FACTOR.powi(exponent);
    let jitter = rand::rng().random_range(0.9..1.1);
    Duration::from_millis((base * jitter) as u64).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(5);

        let first = backoff(1, initial, max);
        assert!(first >= Duration::from_millis(90) && first <= Duration::from_millis(110));

        let third = backoff(3, initial, max);
        assert!(third >= Duration::from_millis(360) && third <= Duration::from_millis(440));

        assert_eq!(backoff(40, initial, max), max);
    }
}
