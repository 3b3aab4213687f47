//! Backoff reconnection logic for the session event channel.
//!
//! When the channel drops, the session runs [`reconnect_loop`] to retry
//! with increasing delays until the connection is restored, the attempt
//! budget is exhausted, or the [`CancellationToken`] is triggered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// How the delay between attempts grows.
#[derive(Clone)]
pub enum BackoffStrategy {
    /// `min(base * 2^(n-1), max)` for attempt `n`.
    Exponential,
    /// `min(base * n, max)` for attempt `n`.
    Linear,
    /// Caller-provided delay function of the 1-based attempt number.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Exponential => write!(f, "Exponential"),
            BackoffStrategy::Linear => write!(f, "Linear"),
            BackoffStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Tunable parameters for the reconnect controller.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Attempts before giving up with a terminal failure.
    pub max_attempts: u32,
    /// Delay for the first attempt.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Delay growth curve.
    pub strategy: BackoffStrategy,
    /// Noise amplitude: each delay is perturbed by up to
    /// `±(jitter_percent / 100) * delay / 2`.
    pub jitter_percent: u8,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter_percent: 30,
        }
    }
}

/// Why a [`reconnect_loop`] run ended.
#[derive(Debug)]
pub enum ReconnectOutcome<T> {
    /// A connection attempt succeeded.
    Connected(T),
    /// All attempts failed.
    Exhausted,
    /// The cancellation token fired first.
    Cancelled,
}

/// Jitter-free delay for the given 1-based attempt number.
pub fn compute_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    debug_assert!(attempt >= 1);
    match &config.strategy {
        BackoffStrategy::Exponential => {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(1 << 16);
            config.base_delay.saturating_mul(factor).min(config.max_delay)
        }
        BackoffStrategy::Linear => config
            .base_delay
            .saturating_mul(attempt)
            .min(config.max_delay),
        BackoffStrategy::Custom(f) => f(attempt),
    }
}

/// Perturb a delay by `±(jitter_percent / 100) * delay / 2`.
pub fn apply_jitter(delay: Duration, jitter_percent: u8) -> Duration {
    if jitter_percent == 0 || delay.is_zero() {
        return delay;
    }
    let amplitude = delay.as_secs_f64() * (jitter_percent as f64 / 100.0) / 2.0;
    let noise = rand::rng().random_range(-amplitude..=amplitude);
    Duration::from_secs_f64((delay.as_secs_f64() + noise).max(0.0))
}

/// Retry `connect` with backoff until it succeeds, the budget runs out,
/// or `cancel` fires.
///
/// The pending sleep is preempted by cancellation; abort is therefore
/// effective between attempts, not only at attempt boundaries.
pub async fn reconnect_loop<F, Fut, T, E>(
    mut connect: F,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> ReconnectOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    for attempt in 1..=config.max_attempts {
        if cancel.is_cancelled() {
            return ReconnectOutcome::Cancelled;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return ReconnectOutcome::Cancelled;
            }
            result = connect() => {
                match result {
                    Ok(conn) => {
                        tracing::info!(attempt, "Reconnected");
                        return ReconnectOutcome::Connected(conn);
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    }
                }
            }
        }

        if attempt == config.max_attempts {
            break;
        }

        let delay = apply_jitter(compute_delay(config, attempt), config.jitter_percent);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting before next reconnect attempt",
        );
        tokio::select! {
            _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::warn!(
        max_attempts = config.max_attempts,
        "Reconnect attempts exhausted",
    );
    ReconnectOutcome::Exhausted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn jitter_free(strategy: BackoffStrategy) -> ReconnectConfig {
        ReconnectConfig {
            strategy,
            jitter_percent: 0,
            ..Default::default()
        }
    }

    #[test]
    fn exponential_delays_are_non_decreasing_and_clamped() {
        let config = jitter_free(BackoffStrategy::Exponential);
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];
        for (i, &secs) in expected.iter().enumerate() {
            let delay = compute_delay(&config, i as u32 + 1);
            assert_eq!(delay, Duration::from_secs(secs), "attempt {}", i + 1);
        }
    }

    #[test]
    fn linear_delays_increase_strictly_up_to_cap() {
        let config = jitter_free(BackoffStrategy::Linear);
        let mut prev = Duration::ZERO;
        for attempt in 1..=30 {
            let delay = compute_delay(&config, attempt);
            if delay < config.max_delay {
                assert!(delay > prev, "attempt {attempt} did not increase");
            } else {
                assert_eq!(delay, config.max_delay);
            }
            prev = delay;
        }
    }

    #[test]
    fn custom_strategy_receives_attempt_numbers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let config = jitter_free(BackoffStrategy::Custom(Arc::new(move |attempt| {
            seen_clone.lock().unwrap().push(attempt);
            Duration::from_millis(attempt as u64)
        })));

        for attempt in 1..=4 {
            assert_eq!(
                compute_delay(&config, attempt),
                Duration::from_millis(attempt as u64)
            );
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn zero_jitter_is_identity() {
        let delay = Duration::from_secs(10);
        assert_eq!(apply_jitter(delay, 0), delay);
    }

    #[test]
    fn jitter_stays_within_amplitude() {
        let delay = Duration::from_secs(10);
        // Amplitude for 30% of 10s is 1.5s.
        for _ in 0..100 {
            let jittered = apply_jitter(delay, 30);
            assert!(jittered >= Duration::from_millis(8_500));
            assert!(jittered <= Duration::from_millis(11_500));
        }
    }

    #[tokio::test]
    async fn cancellation_token_stops_reconnect() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = reconnect_loop(
            || async { Err::<(), _>("unreachable".to_string()) },
            &ReconnectConfig::default(),
            &cancel,
        )
        .await;

        assert!(matches!(outcome, ReconnectOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_after_max_attempts() {
        let cancel = CancellationToken::new();
        let config = ReconnectConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            jitter_percent: 0,
            ..Default::default()
        };

        let attempts = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&attempts);
        let outcome = reconnect_loop(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<(), _>("refused".to_string())
                }
            },
            &config,
            &cancel,
        )
        .await;

        assert!(matches!(outcome, ReconnectOutcome::Exhausted));
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn success_returns_connection() {
        let cancel = CancellationToken::new();
        let outcome = reconnect_loop(
            || async { Ok::<_, String>(42) },
            &ReconnectConfig::default(),
            &cancel,
        )
        .await;
        assert!(matches!(outcome, ReconnectOutcome::Connected(42)));
    }
}
