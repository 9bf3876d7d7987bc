//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::ReconnectConfig;

/// Backoff for broker reconnects.
///
/// Never gives up; once growth stops, retries continue at the capped delay.
pub fn reconnect_backoff(config: &ReconnectConfig) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(config.min_delay())
        .with_max_delay(config.max_delay())
        .with_factor(config.factor)
        .with_max_times(usize::MAX);

    if config.jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

/// Delay before the next reconnect attempt.
///
/// Falls back to the cap if the iterator is exhausted.
pub fn next_delay(backoff: &mut impl Iterator<Item = Duration>, config: &ReconnectConfig) -> Duration {
    backoff.next().unwrap_or_else(|| config.max_delay())
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            min_delay_ms: 100,
            max_delay_ms: 1_000,
            factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_reconnect_backoff_grows_then_caps() {
        let config = config();
        let mut backoff = reconnect_backoff(&config).build();
        let delays: Vec<Duration> = (0..6).map(|_| next_delay(&mut backoff, &config)).collect();

        // factor is f32, so compare at millisecond precision
        let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_reconnect_backoff_never_exhausts() {
        let config = config();
        let mut backoff = reconnect_backoff(&config).build();
        for _ in 0..1_000 {
            assert!(backoff.next().is_some());
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = ReconnectConfig {
            jitter: true,
            ..config()
        };
        let mut backoff = reconnect_backoff(&config).build();
        let first = next_delay(&mut backoff, &config);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(200));
    }
}
