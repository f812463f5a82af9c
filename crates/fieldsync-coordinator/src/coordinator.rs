use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fieldsync_net::{Clock, Transport, TransportError};
use fieldsync_proto::{decode, encode, encode_status, worst_case_nak, Envelope, Payload};
use fieldsync_storage::AuditLog;
use fieldsync_types::{
    error_summary, AckMessage, AuditEvent, AuditOutcome, ConfigPatch, ConfigValue,
    FieldsyncError, NodeId, Origin, PatchId, Timestamp, ValidationError,
};

use crate::tracker::{NodeTracker, NodeTrackingEntry, RetryPolicy, TimeoutAction, TrackerState};

/// Operator-facing result for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Still in flight.
    Pending { attempts: u32 },
    /// The node applied the patch.
    Acked { applied: Vec<(String, ConfigValue)> },
    /// The node rejected the patch.
    Failed { errors: Vec<ValidationError> },
    /// No ack after every allowed transmission.
    GivenUp { attempts: u32 },
}

impl Outcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, Outcome::Acked { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pending { attempts } => write!(f, "pending after {attempts} attempts"),
            Outcome::Acked { applied } => {
                f.write_str("acked:")?;
                for (key, value) in applied {
                    write!(f, " {key}={value}")?;
                }
                Ok(())
            }
            Outcome::Failed { errors } => write!(f, "failed: {}", error_summary(errors)),
            Outcome::GivenUp { attempts } => write!(f, "gave up after {attempts} attempts"),
        }
    }
}

/// Result of issuing one patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueReport {
    pub patch_id: PatchId,
    /// Trackers that were still in flight for an older patch and have been
    /// replaced.
    pub superseded: Vec<NodeTrackingEntry>,
}

/// Pushes patches to nodes and tracks each node until it acks, rejects, or
/// runs out of attempts.
///
/// Owns one `NodeTracker` per target; trackers time out independently so an
/// unreachable node never holds up the others.
pub struct Coordinator<T, A, C> {
    node_id: NodeId,
    transport: Arc<T>,
    audit: Arc<A>,
    clock: Arc<C>,
    policy: RetryPolicy,
    trackers: HashMap<NodeId, NodeTracker>,
    next_patch_id: PatchId,
}

impl<T: Transport, A: AuditLog, C: Clock> Coordinator<T, A, C> {
    pub fn new(transport: Arc<T>, audit: Arc<A>, clock: Arc<C>, policy: RetryPolicy) -> Self {
        Coordinator {
            node_id: transport.local_id(),
            transport,
            audit,
            clock,
            policy,
            trackers: HashMap::new(),
            next_patch_id: 1,
        }
    }

    /// Continue numbering after ids handed out by an earlier run.
    pub fn with_next_patch_id(mut self, next: PatchId) -> Self {
        self.next_patch_id = next.max(1);
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Empty patch with the next id, stamped now.
    pub fn new_patch(&mut self) -> ConfigPatch {
        let patch_id = self.next_patch_id;
        self.next_patch_id = self.next_patch_id.saturating_add(1);
        ConfigPatch::new(patch_id, self.clock.now_ms())
    }

    /// Send `patch` to every target and start tracking it.
    ///
    /// A target that is still waiting on an older patch has that tracker
    /// replaced; the abandoned entries come back in the report. Repeated
    /// targets are sent to once. A patch too large for a frame, or whose
    /// rejection would be, is refused before anything is sent.
    pub async fn issue(
        &mut self,
        patch: ConfigPatch,
        targets: &[NodeId],
    ) -> Result<IssueReport, FieldsyncError> {
        if targets.is_empty() {
            return Err(FieldsyncError::InvalidArgument("no target nodes".into()));
        }
        if patch.fields.is_empty() {
            return Err(FieldsyncError::InvalidArgument("patch carries no fields".into()));
        }
        let patch_id = patch.patch_id;
        let next_patch_id = patch_id
            .checked_add(1)
            .ok_or_else(|| FieldsyncError::InvalidArgument("patch id space exhausted".into()))?;
        self.check_frame_fit(&patch)?;
        self.next_patch_id = self.next_patch_id.max(next_patch_id);
        let patch = patch.issue();

        let mut seen = HashSet::with_capacity(targets.len());
        let targets: Vec<NodeId> = targets.iter().copied().filter(|id| seen.insert(*id)).collect();

        let mut superseded = Vec::new();
        for &node_id in &targets {
            let tracker = NodeTracker::new(node_id, patch.clone());
            if let Some(old) = self.trackers.insert(node_id, tracker) {
                if !old.is_terminal() {
                    tracing::warn!(
                        node_id,
                        old_patch_id = old.patch().patch_id,
                        patch_id,
                        attempts = old.entry().attempts,
                        "in-flight patch superseded"
                    );
                    self.record(node_id, old.patch().patch_id, AuditOutcome::Superseded, Vec::new())
                        .await;
                    superseded.push(old.entry().clone());
                }
            }
            self.transmit(node_id).await;
        }

        tracing::info!(patch_id, targets = targets.len(), "patch issued");
        Ok(IssueReport { patch_id, superseded })
    }

    /// Feed one inbound frame. Anything that is not a status for a tracked
    /// patch is dropped.
    pub async fn handle_frame(&mut self, from: NodeId, frame: &[u8]) {
        match self.parse_status(frame) {
            Ok(Some((node_id, ack))) => self.handle_ack(node_id, ack).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(from, error = %e, "dropping malformed frame"),
        }
    }

    /// Decode a status addressed to this coordinator. Well-formed frames of
    /// another kind, or for another node, yield `Ok(None)`.
    fn parse_status(&self, frame: &[u8]) -> Result<Option<(NodeId, AckMessage)>, FieldsyncError> {
        let envelope = decode(frame)?;
        let source = envelope.source_node;
        if envelope.target_node != self.node_id {
            tracing::debug!(source, target = envelope.target_node, "dropping frame addressed elsewhere");
            return Ok(None);
        }
        let Payload::Status(status) = envelope.data else {
            tracing::debug!(source, "ignoring non-status message");
            return Ok(None);
        };
        Ok(Some((source, AckMessage::try_from(status)?)))
    }

    /// Apply an ack from `node_id` to its tracker.
    pub async fn handle_ack(&mut self, node_id: NodeId, ack: AckMessage) {
        let Some(tracker) = self.trackers.get_mut(&node_id) else {
            tracing::debug!(node_id, patch_id = ack.patch_id, "ack from untracked node");
            return;
        };
        if !tracker.on_ack(&ack) {
            tracing::debug!(
                node_id,
                patch_id = ack.patch_id,
                tracked = tracker.patch().patch_id,
                state = ?tracker.state(),
                "stale ack ignored"
            );
            return;
        }

        let attempts = tracker.entry().attempts;
        if ack.is_success() {
            tracing::info!(node_id, patch_id = ack.patch_id, attempts, "patch acked");
            self.record(node_id, ack.patch_id, AuditOutcome::Acked, Vec::new()).await;
        } else {
            tracing::warn!(
                node_id,
                patch_id = ack.patch_id,
                errors = %error_summary(&ack.errors),
                "patch rejected by node"
            );
            self.record(node_id, ack.patch_id, AuditOutcome::Failed, ack.errors).await;
        }
    }

    /// Resend or give up on every tracker whose timer has expired. Returns
    /// the number of trackers acted on.
    pub async fn poll_timeouts(&mut self) -> usize {
        let now = self.clock.now_ms();
        let max_attempts = self.policy.max_attempts;

        let mut resend = Vec::new();
        let mut given_up = Vec::new();
        for (node_id, tracker) in self.trackers.iter_mut() {
            match tracker.on_timeout(now, max_attempts) {
                TimeoutAction::Wait => {}
                TimeoutAction::Resend => resend.push(*node_id),
                TimeoutAction::GiveUp => {
                    given_up.push((*node_id, tracker.patch().patch_id, tracker.entry().attempts))
                }
            }
        }

        for &(node_id, patch_id, attempts) in &given_up {
            let err = FieldsyncError::UnreachableNode { node_id, attempts };
            tracing::warn!(node_id, patch_id, error = %err, "giving up on node");
            self.record(node_id, patch_id, AuditOutcome::GivenUp, Vec::new()).await;
        }
        for &node_id in &resend {
            self.transmit(node_id).await;
        }
        resend.len() + given_up.len()
    }

    /// Earliest pending retransmission deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.trackers.values().filter_map(NodeTracker::deadline).min()
    }

    /// Every tracker has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.trackers.values().all(NodeTracker::is_terminal)
    }

    pub fn tracker(&self, node_id: NodeId) -> Option<&NodeTracker> {
        self.trackers.get(&node_id)
    }

    /// Snapshot of every tracker, ordered by node id.
    pub fn report(&self) -> Vec<NodeTrackingEntry> {
        let mut entries: Vec<_> = self.trackers.values().map(|t| t.entry().clone()).collect();
        entries.sort_by_key(|e| e.node_id);
        entries
    }

    pub fn outcomes(&self) -> BTreeMap<NodeId, Outcome> {
        self.trackers
            .iter()
            .map(|(node_id, tracker)| {
                let entry = tracker.entry();
                let outcome = match entry.state {
                    TrackerState::Unconfirmed | TrackerState::Sent => {
                        Outcome::Pending { attempts: entry.attempts }
                    }
                    TrackerState::Acked => Outcome::Acked { applied: tracker.patch().fields.clone() },
                    TrackerState::Failed => Outcome::Failed {
                        errors: entry.last_ack.as_ref().map(|a| a.errors.clone()).unwrap_or_default(),
                    },
                    TrackerState::GivenUp => Outcome::GivenUp { attempts: entry.attempts },
                };
                (*node_id, outcome)
            })
            .collect()
    }

    /// Drop terminal trackers. Returns how many were removed.
    pub fn forget_settled(&mut self) -> usize {
        let before = self.trackers.len();
        self.trackers.retain(|_, t| !t.is_terminal());
        before - self.trackers.len()
    }

    /// Drive receive and retransmission until every tracker is terminal or
    /// `max_wait` elapses. Returns whether everything settled.
    pub async fn run_until_settled(&mut self, max_wait: Duration) -> Result<bool, FieldsyncError> {
        let give_up_at = tokio::time::Instant::now() + max_wait;
        let transport = self.transport.clone();

        while !self.is_settled() {
            let now = self.clock.now_ms();
            let wait = match self.next_deadline() {
                Some(deadline) => Duration::from_millis(deadline.saturating_sub(now)),
                None => max_wait,
            };
            let wake = (tokio::time::Instant::now() + wait).min(give_up_at);

            tokio::select! {
                inbound = transport.recv() => match inbound {
                    Ok((from, frame)) => self.handle_frame(from, &frame).await,
                    Err(TransportError::Closed) => return Err(TransportError::Closed.into()),
                    Err(e) => tracing::warn!(error = %e, "receive failed"),
                },
                _ = tokio::time::sleep_until(wake) => {
                    if wake >= give_up_at {
                        return Ok(self.is_settled());
                    }
                    self.poll_timeouts().await;
                }
            }
        }
        Ok(true)
    }

    fn check_frame_fit(&self, patch: &ConfigPatch) -> Result<(), FieldsyncError> {
        let update = Envelope::config_update(self.node_id, NodeId::MAX, Timestamp::MAX, patch.clone());
        encode(&update).map_err(|e| {
            FieldsyncError::InvalidArgument(format!("patch {} does not fit a frame: {e}", patch.patch_id))
        })?;
        let nak = worst_case_nak(patch);
        encode_status(NodeId::MAX, self.node_id, Timestamp::MAX, &nak).map_err(|e| {
            FieldsyncError::InvalidArgument(format!(
                "rejection of patch {} would not fit a frame: {e}",
                patch.patch_id
            ))
        })?;
        Ok(())
    }

    async fn transmit(&mut self, node_id: NodeId) {
        let Some(tracker) = self.trackers.get_mut(&node_id) else { return };
        let now = self.clock.now_ms();
        let patch_id = tracker.patch().patch_id;
        let attempt = tracker.entry().attempts + 1;
        let timeout = self.policy.timeout(attempt);
        let envelope = Envelope::config_update(self.node_id, node_id, now, (**tracker.patch()).clone());

        // A failed send counts as a lost transmission; the timer still runs.
        match encode(&envelope) {
            Ok(frame) => {
                if let Err(e) = self.transport.send(node_id, frame).await {
                    tracing::warn!(node_id, patch_id, attempt, error = %e, "send failed");
                }
            }
            Err(e) => tracing::error!(node_id, patch_id, error = %e, "could not encode patch"),
        }
        tracker.on_sent(now, timeout);
        tracing::debug!(node_id, patch_id, attempt, timeout_ms = timeout, "patch sent");
        self.record(node_id, patch_id, AuditOutcome::Sent, Vec::new()).await;
    }

    async fn record(
        &self,
        node_id: NodeId,
        patch_id: PatchId,
        outcome: AuditOutcome,
        errors: Vec<ValidationError>,
    ) {
        let event = AuditEvent::new(self.clock.now_ms(), Origin::Coordinator, node_id, patch_id, outcome)
            .with_errors(errors);
        if let Err(e) = self.audit.record(event).await {
            tracing::error!(node_id, patch_id, error = %e, "audit write failed");
        }
    }
}
