use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use fieldsync_net::{Clock, Transport, TransportError};
use fieldsync_proto::{decode, encode_status, Payload};
use fieldsync_storage::{AuditLog, ConfigStorage};
use fieldsync_types::{
    AckMessage, AuditEvent, AuditOutcome, ConfigPatch, FieldsyncError, NodeConfig, NodeId,
    Origin, PatchId,
};

use crate::store::{apply, ConfigHandle, LiveConfig};
use crate::validator::validate;

/// Pause after a non-fatal receive error before polling the link again.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Acks kept for verbatim replay of redelivered patches.
const RECENT_ACKS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Validating,
    Applying,
    Acknowledging,
}

/// An encoded frame waiting to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub frame: Vec<u8>,
}

/// Per-node owner of the live configuration.
///
/// Processes one patch at a time to completion: validate, then either apply
/// and persist or reject, audit, and acknowledge. The agent is the only
/// writer of its `NodeConfig`.
///
/// Patch ids are issued in increasing order, so a patch at or below the
/// highest id already processed is either a redelivery (answered from the
/// recent-ack window) or stale and dropped.
pub struct NodeAgent<S, A, C> {
    node_id: NodeId,
    storage: Arc<S>,
    audit: Arc<A>,
    clock: Arc<C>,
    live: LiveConfig,
    state: AgentState,
    /// Answers to the most recently processed patches, newest last.
    recent_acks: VecDeque<AckMessage>,
    highest_processed: Option<PatchId>,
}

impl<S: ConfigStorage, A: AuditLog, C: Clock> NodeAgent<S, A, C> {
    /// Restore the persisted configuration, or start from defaults on first
    /// boot.
    pub async fn boot(
        node_id: NodeId,
        storage: Arc<S>,
        audit: Arc<A>,
        clock: Arc<C>,
    ) -> Result<Self, FieldsyncError> {
        let config = match storage.load().await? {
            Some(config) => {
                tracing::info!(
                    node_id,
                    last_applied = ?config.last_applied_patch_id(),
                    "restored persisted configuration"
                );
                config
            }
            None => {
                tracing::info!(node_id, "no persisted configuration; using defaults");
                NodeConfig::defaults()
            }
        };
        Ok(NodeAgent {
            node_id,
            storage,
            audit,
            clock,
            highest_processed: config.last_applied_patch_id(),
            live: LiveConfig::new(config),
            state: AgentState::Idle,
            recent_acks: VecDeque::with_capacity(RECENT_ACKS),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn config(&self) -> Arc<NodeConfig> {
        self.live.current()
    }

    pub fn handle(&self) -> ConfigHandle {
        self.live.handle()
    }

    /// Run one patch through the state machine and return the ack to send.
    ///
    /// Leaves the agent in `Acknowledging`. `Ok(None)` means the patch is
    /// older than one already processed and was dropped unanswered. An `Err`
    /// means the durable write failed: the live config is unchanged and no
    /// ack should be sent.
    pub async fn handle_patch(
        &mut self,
        patch: &ConfigPatch,
    ) -> Result<Option<AckMessage>, FieldsyncError> {
        if let Some(ack) = self.replayable(patch.patch_id) {
            tracing::debug!(node_id = self.node_id, patch_id = patch.patch_id, "replaying ack");
            self.record(
                AuditEvent::new(
                    self.clock.now_ms(),
                    Origin::Node(self.node_id),
                    self.node_id,
                    patch.patch_id,
                    AuditOutcome::Replay,
                )
                .with_errors(ack.errors.clone()),
            )
            .await;
            self.transition(AgentState::Acknowledging, patch.patch_id);
            return Ok(Some(ack));
        }

        if self.highest_processed.is_some_and(|highest| patch.patch_id <= highest) {
            tracing::warn!(
                node_id = self.node_id,
                patch_id = patch.patch_id,
                highest = ?self.highest_processed,
                "dropping stale patch"
            );
            self.record(AuditEvent::new(
                self.clock.now_ms(),
                Origin::Node(self.node_id),
                self.node_id,
                patch.patch_id,
                AuditOutcome::Replay,
            ))
            .await;
            return Ok(None);
        }

        self.transition(AgentState::Validating, patch.patch_id);
        let ack = match validate(&patch.fields) {
            Ok(validated) => {
                self.transition(AgentState::Applying, patch.patch_id);
                let next = apply(&self.live.current(), &validated, patch.patch_id);
                if let Err(e) = self.storage.persist(&next).await {
                    self.transition(AgentState::Idle, patch.patch_id);
                    return Err(e);
                }
                self.live.swap(next.clone());
                tracing::info!(
                    node_id = self.node_id,
                    patch_id = patch.patch_id,
                    fields = validated.len(),
                    "patch applied"
                );
                let now = self.clock.now_ms();
                self.record(
                    AuditEvent::new(
                        now,
                        Origin::Node(self.node_id),
                        self.node_id,
                        patch.patch_id,
                        AuditOutcome::Applied,
                    )
                    .with_values(&next),
                )
                .await;
                AckMessage::success(patch.patch_id, now)
            }
            Err(errors) => {
                tracing::warn!(
                    node_id = self.node_id,
                    patch_id = patch.patch_id,
                    violations = errors.len(),
                    "patch rejected"
                );
                let now = self.clock.now_ms();
                self.record(
                    AuditEvent::new(
                        now,
                        Origin::Node(self.node_id),
                        self.node_id,
                        patch.patch_id,
                        AuditOutcome::Rejected,
                    )
                    .with_errors(errors.clone()),
                )
                .await;
                AckMessage::failed(patch.patch_id, errors, now)
            }
        };

        self.transition(AgentState::Acknowledging, patch.patch_id);
        self.highest_processed = Some(patch.patch_id);
        if self.recent_acks.len() == RECENT_ACKS {
            self.recent_acks.pop_front();
        }
        self.recent_acks.push_back(ack.clone());
        Ok(Some(ack))
    }

    /// Decode one inbound frame and produce the encoded reply, if any.
    ///
    /// Undecodable frames, frames for another node and frames that are not
    /// config updates are dropped without a reply.
    pub async fn handle_frame(&mut self, from: NodeId, frame: &[u8]) -> Option<Outbound> {
        let envelope = match decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(node_id = self.node_id, from, error = %e, "dropping malformed frame");
                return None;
            }
        };
        if envelope.target_node != self.node_id {
            tracing::debug!(
                node_id = self.node_id,
                target = envelope.target_node,
                "dropping frame addressed to another node"
            );
            return None;
        }
        let Payload::ConfigUpdate(patch) = envelope.data else {
            tracing::debug!(node_id = self.node_id, from, "ignoring non-config message");
            return None;
        };

        let ack = match self.handle_patch(&patch).await {
            Ok(Some(ack)) => ack,
            Ok(None) => {
                self.transition(AgentState::Idle, patch.patch_id);
                return None;
            }
            Err(e) => {
                tracing::error!(
                    node_id = self.node_id,
                    patch_id = patch.patch_id,
                    error = %e,
                    "could not persist patch; withholding ack"
                );
                return None;
            }
        };

        match encode_status(self.node_id, envelope.source_node, self.clock.now_ms(), &ack) {
            Ok(frame) => Some(Outbound { to: envelope.source_node, frame }),
            Err(e) => {
                tracing::error!(node_id = self.node_id, error = %e, "could not encode ack");
                self.transition(AgentState::Idle, patch.patch_id);
                None
            }
        }
    }

    /// Serve the transport until it closes, one message at a time.
    pub async fn run<T: Transport>(mut self, transport: Arc<T>) -> Result<(), FieldsyncError> {
        tracing::info!(node_id = self.node_id, "node agent running");
        loop {
            let (from, frame) = match transport.recv().await {
                Ok(inbound) => inbound,
                Err(TransportError::Closed) => {
                    tracing::info!(node_id = self.node_id, "transport closed; agent stopping");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(node_id = self.node_id, error = %e, "receive failed");
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let Some(reply) = self.handle_frame(from, &frame).await else { continue };
            // The outcome is already durable; only the notification can be lost here.
            if let Err(e) = transport.send(reply.to, reply.frame).await {
                tracing::warn!(node_id = self.node_id, to = reply.to, error = %e, "ack send failed");
            }
            self.state = AgentState::Idle;
        }
    }

    fn replayable(&self, patch_id: PatchId) -> Option<AckMessage> {
        if let Some(ack) = self.recent_acks.iter().rev().find(|a| a.patch_id == patch_id) {
            return Some(ack.clone());
        }
        // After a reboot only the persisted id survives.
        if self.live.current().last_applied_patch_id() == Some(patch_id) {
            return Some(AckMessage::success(patch_id, self.clock.now_ms()));
        }
        None
    }

    fn transition(&mut self, next: AgentState, patch_id: PatchId) {
        tracing::trace!(node_id = self.node_id, patch_id, from = ?self.state, to = ?next, "agent state");
        self.state = next;
    }

    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(event).await {
            tracing::error!(node_id = self.node_id, error = %e, "audit write failed");
        }
    }
}
