//! Per-node delivery state machine. Pure: callers feed it the current time
//! and events, and carry out the transmissions it asks for.

use std::sync::Arc;

use rand::Rng;

use fieldsync_types::{AckMessage, AckStatus, ConfigPatch, NodeId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Unconfirmed,
    Sent,
    Acked,
    Failed,
    GivenUp,
}

impl TrackerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackerState::Acked | TrackerState::Failed | TrackerState::GivenUp)
    }
}

/// Convergence record for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTrackingEntry {
    pub node_id: NodeId,
    pub state: TrackerState,
    /// Transmissions so far, first send included.
    pub attempts: u32,
    pub last_sent_at: Option<Timestamp>,
    pub last_ack: Option<AckMessage>,
}

/// Retransmission schedule.
///
/// The wait after attempt `n` is `min(base_timeout_ms * 2^(n-1), max_backoff_ms)`
/// plus a uniform jitter in `[0, jitter_ms]`. At most `max_attempts`
/// transmissions are made before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_timeout_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    /// Policy derived from a round-trip estimate: the first timeout is four
    /// round trips, to absorb store-and-forward hops.
    pub fn from_rtt(rtt_estimate_ms: u64, max_backoff_ms: u64, max_attempts: u32) -> Self {
        RetryPolicy {
            base_timeout_ms: rtt_estimate_ms.saturating_mul(4),
            max_backoff_ms,
            max_attempts,
            jitter_ms: 0,
        }
    }

    pub fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    /// Backoff for the wait following transmission `attempt` (1-based),
    /// without jitter.
    pub fn backoff(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_timeout_ms.saturating_mul(factor).min(self.max_backoff_ms)
    }

    /// Backoff plus jitter.
    pub fn timeout(&self, attempt: u32) -> u64 {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.backoff(attempt).saturating_add(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_rtt(5_000, 120_000, 5)
    }
}

/// What the caller should do about an expired timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Deadline not reached, or nothing in flight.
    Wait,
    /// Transmit the same patch again.
    Resend,
    /// Retries exhausted; the tracker is now `GivenUp`.
    GiveUp,
}

pub struct NodeTracker {
    entry: NodeTrackingEntry,
    patch: Arc<ConfigPatch>,
    deadline: Option<Timestamp>,
}

impl NodeTracker {
    pub fn new(node_id: NodeId, patch: Arc<ConfigPatch>) -> Self {
        NodeTracker {
            entry: NodeTrackingEntry {
                node_id,
                state: TrackerState::Unconfirmed,
                attempts: 0,
                last_sent_at: None,
                last_ack: None,
            },
            patch,
            deadline: None,
        }
    }

    pub fn entry(&self) -> &NodeTrackingEntry {
        &self.entry
    }

    pub fn state(&self) -> TrackerState {
        self.entry.state
    }

    pub fn patch(&self) -> &Arc<ConfigPatch> {
        &self.patch
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn is_terminal(&self) -> bool {
        self.entry.state.is_terminal()
    }

    /// A transmission left (or was handed to) the transport at `now`.
    pub fn on_sent(&mut self, now: Timestamp, timeout_ms: u64) {
        if self.is_terminal() {
            return;
        }
        self.entry.state = TrackerState::Sent;
        self.entry.attempts += 1;
        self.entry.last_sent_at = Some(now);
        self.deadline = Some(now.saturating_add(timeout_ms));
    }

    /// Feed an ack from this tracker's node. Returns `true` when it moved the
    /// tracker; acks for another patch or after a terminal state are ignored.
    pub fn on_ack(&mut self, ack: &AckMessage) -> bool {
        if self.entry.state != TrackerState::Sent || ack.patch_id != self.patch.patch_id {
            return false;
        }
        self.entry.state = match ack.status {
            AckStatus::Success => TrackerState::Acked,
            AckStatus::Failed => TrackerState::Failed,
        };
        self.entry.last_ack = Some(ack.clone());
        self.deadline = None;
        true
    }

    pub fn on_timeout(&mut self, now: Timestamp, max_attempts: u32) -> TimeoutAction {
        match (self.entry.state, self.deadline) {
            (TrackerState::Sent, Some(deadline)) if now >= deadline => {
                if self.entry.attempts < max_attempts {
                    TimeoutAction::Resend
                } else {
                    self.entry.state = TrackerState::GivenUp;
                    self.deadline = None;
                    TimeoutAction::GiveUp
                }
            }
            _ => TimeoutAction::Wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use fieldsync_types::{ConfigValue, ValidationError, ValidationReason};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy { base_timeout_ms: 1_000, max_backoff_ms: 8_000, max_attempts: 5, jitter_ms: 0 }
    }

    fn tracker(patch_id: u64) -> NodeTracker {
        let patch = ConfigPatch::new(patch_id, 0).set("maxRetries", ConfigValue::Int(5)).issue();
        NodeTracker::new(7, patch)
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy();
        let waits: Vec<u64> = (1..=6).map(|n| p.backoff(n)).collect();
        assert_eq!(waits, vec![1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
        assert_eq!(p.backoff(200), 8_000);
    }

    #[test]
    fn from_rtt_uses_four_round_trips() {
        let p = RetryPolicy::from_rtt(250, 10_000, 3);
        assert_eq!(p.base_timeout_ms, 1_000);
        assert_eq!(p.backoff(1), 1_000);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let p = policy().with_jitter(50);
        for attempt in 1..=5 {
            for _ in 0..100 {
                let t = p.timeout(attempt);
                assert!(t >= p.backoff(attempt) && t <= p.backoff(attempt) + 50);
            }
        }
    }

    #[test]
    fn success_ack_completes_delivery() {
        let mut t = tracker(1);
        assert_eq!(t.state(), TrackerState::Unconfirmed);
        t.on_sent(100, 1_000);
        assert_eq!(t.state(), TrackerState::Sent);
        assert_eq!(t.entry().attempts, 1);
        assert_eq!(t.deadline(), Some(1_100));

        assert!(t.on_ack(&AckMessage::success(1, 150)));
        assert_eq!(t.state(), TrackerState::Acked);
        assert_eq!(t.deadline(), None);
        assert_eq!(t.on_timeout(10_000, 5), TimeoutAction::Wait);
    }

    #[test]
    fn failed_ack_is_terminal_without_retry() {
        let mut t = tracker(1);
        t.on_sent(0, 1_000);
        let nak = AckMessage::failed(
            1,
            vec![ValidationError::new("maxRetries", ValidationReason::OutOfRange)],
            5,
        );
        assert!(t.on_ack(&nak));
        assert_eq!(t.state(), TrackerState::Failed);
        assert_eq!(t.entry().last_ack.as_ref(), Some(&nak));
        assert_eq!(t.on_timeout(u64::MAX, 5), TimeoutAction::Wait);
    }

    #[test]
    fn ack_for_other_patch_is_ignored() {
        let mut t = tracker(2);
        t.on_sent(0, 1_000);
        assert!(!t.on_ack(&AckMessage::success(1, 5)));
        assert_eq!(t.state(), TrackerState::Sent);
    }

    #[test]
    fn ack_before_send_is_ignored() {
        let mut t = tracker(2);
        assert!(!t.on_ack(&AckMessage::success(2, 5)));
        assert_eq!(t.state(), TrackerState::Unconfirmed);
    }

    #[test]
    fn gives_up_after_max_attempts_transmissions() {
        let p = policy();
        let mut t = tracker(1);
        let mut now = 0;
        t.on_sent(now, p.timeout(1));

        let mut actions = Vec::new();
        loop {
            now = t.deadline().unwrap();
            assert_eq!(t.on_timeout(now - 1, p.max_attempts), TimeoutAction::Wait);
            let action = t.on_timeout(now, p.max_attempts);
            actions.push(action);
            match action {
                TimeoutAction::Resend => t.on_sent(now, p.timeout(t.entry().attempts + 1)),
                _ => break,
            }
        }

        assert_eq!(actions.iter().filter(|a| **a == TimeoutAction::Resend).count(), 4);
        assert_eq!(actions.last(), Some(&TimeoutAction::GiveUp));
        assert_eq!(t.entry().attempts, 5);
        assert_eq!(t.state(), TrackerState::GivenUp);

        // A late ack does not revive a tracker that gave up.
        assert!(!t.on_ack(&AckMessage::success(1, now)));
        t.on_sent(now, 1_000);
        assert_eq!(t.entry().attempts, 5);
    }
}
