//! Failover policy.
//!
//! Consulted synchronously by the manager on every claim and every
//! failure, so implementations must be fast and thread-safe (no awaits, a
//! short mutexed critical section).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Consecutive failures before a (session, fingerprint) pair is blocked.
pub const DEFAULT_MAX_FAILURES_BEFORE_BLOCK: u32 = 2;

/// How long a blocked pair stays blocked.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Decides whether a session is temporarily unfit for a workflow.
///
/// Keys are the session id and the workflow's structural fingerprint, so
/// structurally identical workflows share blocklist state.
pub trait FailoverStrategy: Send + Sync {
    /// Whether a claim should skip this session for this workflow.
    fn should_skip_client(&self, session_id: &str, fingerprint: &str) -> bool;

    /// Record a failure. Returns true when this failure newly blocked the
    /// pair.
    fn record_failure(&self, session_id: &str, fingerprint: &str) -> bool;

    /// Record a success. Returns true when an active block was cleared.
    fn record_success(&self, session_id: &str, fingerprint: &str) -> bool;

    /// Whether the pair is currently blocked.
    fn is_workflow_blocked(&self, session_id: &str, fingerprint: &str) -> bool {
        self.should_skip_client(session_id, fingerprint)
    }

    /// Drop all state for a workflow fingerprint.
    fn reset_for_workflow(&self, fingerprint: &str);
}

// ---------------------------------------------------------------------------
// Smart strategy (default)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct PairState {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

/// Default strategy: consecutive failures per (session, fingerprint)
/// trigger a cooldown; a success clears the pair.
pub struct SmartStrategy {
    max_failures_before_block: u32,
    cooldown: Duration,
    state: Mutex<HashMap<(String, String), PairState>>,
}

impl SmartStrategy {
    pub fn new(max_failures_before_block: u32, cooldown: Duration) -> Self {
        Self {
            max_failures_before_block: max_failures_before_block.max(1),
            cooldown,
            state: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SmartStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES_BEFORE_BLOCK, DEFAULT_COOLDOWN)
    }
}

impl FailoverStrategy for SmartStrategy {
    fn should_skip_client(&self, session_id: &str, fingerprint: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .get(&(session_id.to_string(), fingerprint.to_string()))
            .and_then(|pair| pair.cooldown_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn record_failure(&self, session_id: &str, fingerprint: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let pair = state
            .entry((session_id.to_string(), fingerprint.to_string()))
            .or_default();

        let was_blocked = pair
            .cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false);

        pair.consecutive_failures += 1;
        if pair.consecutive_failures >= self.max_failures_before_block {
            pair.cooldown_until = Some(Instant::now() + self.cooldown);
        }

        let now_blocked = pair
            .cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false);

        !was_blocked && now_blocked
    }

    fn record_success(&self, session_id: &str, fingerprint: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(pair) = state.remove(&(session_id.to_string(), fingerprint.to_string())) else {
            return false;
        };
        pair.cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn reset_for_workflow(&self, fingerprint: &str) {
        let mut state = self.state.lock().unwrap();
        state.retain(|(_, fp), _| fp != fingerprint);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pair_is_not_skipped() {
        let strategy = SmartStrategy::default();
        assert!(!strategy.should_skip_client("s1", "fp"));
    }

    #[test]
    fn blocks_after_threshold() {
        let strategy = SmartStrategy::new(2, DEFAULT_COOLDOWN);

        assert!(!strategy.record_failure("s1", "fp"));
        assert!(!strategy.should_skip_client("s1", "fp"));

        // Second failure crosses the threshold.
        assert!(strategy.record_failure("s1", "fp"));
        assert!(strategy.should_skip_client("s1", "fp"));

        // Further failures do not re-report "newly blocked".
        assert!(!strategy.record_failure("s1", "fp"));
    }

    #[test]
    fn block_is_scoped_to_the_pair() {
        let strategy = SmartStrategy::new(1, DEFAULT_COOLDOWN);
        strategy.record_failure("s1", "fp_a");

        assert!(strategy.should_skip_client("s1", "fp_a"));
        assert!(!strategy.should_skip_client("s1", "fp_b"));
        assert!(!strategy.should_skip_client("s2", "fp_a"));
    }

    #[test]
    fn success_clears_the_pair() {
        let strategy = SmartStrategy::new(1, DEFAULT_COOLDOWN);
        assert!(strategy.record_failure("s1", "fp"));

        // Clearing an active block reports it.
        assert!(strategy.record_success("s1", "fp"));
        assert!(!strategy.should_skip_client("s1", "fp"));

        // Clearing a clean pair does not.
        assert!(!strategy.record_success("s1", "fp"));
    }

    #[test]
    fn reset_for_workflow_clears_all_sessions() {
        let strategy = SmartStrategy::new(1, DEFAULT_COOLDOWN);
        strategy.record_failure("s1", "fp");
        strategy.record_failure("s2", "fp");
        strategy.record_failure("s1", "other");

        strategy.reset_for_workflow("fp");

        assert!(!strategy.should_skip_client("s1", "fp"));
        assert!(!strategy.should_skip_client("s2", "fp"));
        assert!(strategy.should_skip_client("s1", "other"));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_expires() {
        let strategy = SmartStrategy::new(1, Duration::from_secs(60));
        strategy.record_failure("s1", "fp");
        assert!(strategy.should_skip_client("s1", "fp"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!strategy.should_skip_client("s1", "fp"));
    }
}
