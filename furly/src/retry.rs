use std::sync::Arc;
use std::time::Duration;

use furly_conf::RetryConfig;

use crate::MqttError;

/// Decides whether, and after how long, a failed connection attempt is retried.
///
/// `attempt` counts the failed attempts so far, starting at 1. Returning
/// `None` gives up and leaves the partition faulted.
pub trait RetryPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32, err: &MqttError) -> Option<Duration>;
}

pub type RetryPolicyRef = Arc<dyn RetryPolicy>;

impl<F> RetryPolicy for F
where
    F: Fn(u32, &MqttError) -> Option<Duration> + Send + Sync,
{
    #[inline]
    fn next_delay(&self, attempt: u32, err: &MqttError) -> Option<Duration> {
        self(attempt, err)
    }
}

#[derive(Debug, Clone)]
pub struct FixedInterval {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy for FixedInterval {
    #[inline]
    fn next_delay(&self, attempt: u32, _err: &MqttError) -> Option<Duration> {
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            return None;
        }
        Some(self.interval)
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub max_attempts: u32,
}

impl ExponentialBackoff {
    /// Delay before jitter is applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, _err: &MqttError) -> Option<Duration> {
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            return None;
        }
        let delay = self.base_delay(attempt);
        if self.jitter {
            //keep at least half of the delay
            let factor = 0.5 + rand::random::<f64>() * 0.5;
            Some(delay.mul_f64(factor))
        } else {
            Some(delay)
        }
    }
}

pub fn from_config(cfg: &RetryConfig) -> RetryPolicyRef {
    match cfg {
        RetryConfig::Fixed { interval, max_attempts } => {
            Arc::new(FixedInterval { interval: *interval, max_attempts: *max_attempts })
        }
        RetryConfig::Exponential { initial, max, multiplier, jitter, max_attempts } => Arc::new(ExponentialBackoff {
            initial: *initial,
            max: *max,
            multiplier: *multiplier,
            jitter: *jitter,
            max_attempts: *max_attempts,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed() {
        let p = FixedInterval { interval: Duration::from_millis(50), max_attempts: 3 };
        let e = MqttError::ConnectTimeout;
        assert_eq!(p.next_delay(1, &e), Some(Duration::from_millis(50)));
        assert_eq!(p.next_delay(2, &e), Some(Duration::from_millis(50)));
        assert_eq!(p.next_delay(3, &e), None);

        let forever = FixedInterval { interval: Duration::from_millis(50), max_attempts: 0 };
        assert!(forever.next_delay(10_000, &e).is_some());
    }

    #[test]
    fn test_exponential() {
        let p = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
            max_attempts: 0,
        };
        let e = MqttError::ConnectingFailed("refused".into());
        assert_eq!(p.next_delay(1, &e), Some(Duration::from_millis(100)));
        assert_eq!(p.next_delay(2, &e), Some(Duration::from_millis(200)));
        assert_eq!(p.next_delay(4, &e), Some(Duration::from_millis(800)));
        assert_eq!(p.next_delay(5, &e), Some(Duration::from_secs(1)));
        assert_eq!(p.next_delay(u32::MAX, &e), Some(Duration::from_secs(1)));

        let jittered = ExponentialBackoff { jitter: true, ..p };
        for attempt in 1..8 {
            let base = jittered.base_delay(attempt);
            let d = jittered.next_delay(attempt, &e).unwrap();
            let slack = Duration::from_micros(1);
            assert!(d <= base + slack && d + slack >= base / 2, "{:?} vs {:?}", d, base);
        }
    }

    #[test]
    fn test_from_config() {
        let p = from_config(&RetryConfig::Fixed { interval: Duration::from_secs(2), max_attempts: 1 });
        assert_eq!(p.next_delay(1, &MqttError::ConnectTimeout), None);

        let closure = |attempt: u32, _: &MqttError| (attempt < 2).then(|| Duration::from_millis(1));
        assert!(closure.next_delay(1, &MqttError::ConnectTimeout).is_some());
        assert!(closure.next_delay(2, &MqttError::ConnectTimeout).is_none());
    }
}
