pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use schema::{ConfigKey, Domain, FieldSpec, ValueKind};

pub type NodeId = u64;
pub type PatchId = u64;
/// Milliseconds since the Unix epoch (or since boot on nodes without RTC).
pub type Timestamp = u64;

/// Tagged value of a single tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConfigValue {
    UInt(u64),
    Int(i64),
    Bool(bool),
}

impl ConfigValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ConfigValue::UInt(_) => ValueKind::UInt,
            ConfigValue::Int(_) => ValueKind::Int,
            ConfigValue::Bool(_) => ValueKind::Bool,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::UInt(v) => write!(f, "{v}"),
            ConfigValue::Int(v) => write!(f, "{v}"),
            ConfigValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A proposed, immutable configuration update issued by the coordinator.
///
/// `fields` keeps the order in which the coordinator set them; validation
/// and error reporting follow that order. Keys stay as raw strings so that a
/// node can report keys it does not recognise.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfigPatch {
    pub patch_id: PatchId,
    pub fields: Vec<(String, ConfigValue)>,
    pub issued_at: Timestamp,
}

impl ConfigPatch {
    pub fn new(patch_id: PatchId, issued_at: Timestamp) -> Self {
        ConfigPatch { patch_id, fields: Vec::new(), issued_at }
    }

    /// Set `key`, replacing an earlier value for the same key in place.
    pub fn set(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
        self
    }

    /// Freeze the patch for sharing between trackers.
    pub fn issue(self) -> Arc<ConfigPatch> {
        Arc::new(self)
    }
}

/// The live configuration of a node. Always holds a valid value for every
/// key of the schema.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeConfig {
    values: BTreeMap<ConfigKey, ConfigValue>,
    last_applied_patch_id: Option<PatchId>,
}

impl NodeConfig {
    pub fn defaults() -> Self {
        NodeConfig {
            values: ConfigKey::ALL.iter().map(|k| (*k, k.spec().default)).collect(),
            last_applied_patch_id: None,
        }
    }

    /// Rebuild a config from stored entries. Missing keys and entries the
    /// schema does not admit fall back to defaults; the keys of discarded
    /// entries are returned alongside.
    pub fn restore(
        entries: impl IntoIterator<Item = (ConfigKey, ConfigValue)>,
        last_applied_patch_id: Option<PatchId>,
    ) -> (Self, Vec<ConfigKey>) {
        let mut config = NodeConfig::defaults();
        let mut discarded = Vec::new();
        for (key, value) in entries {
            if key.spec().admits(&value) {
                config.values.insert(key, value);
            } else {
                discarded.push(key);
            }
        }
        config.last_applied_patch_id = last_applied_patch_id;
        (config, discarded)
    }

    /// Copy of `self` with `fields` overlaid and `patch_id` recorded as the
    /// last applied patch. Callers pass fields that already passed validation.
    pub fn overlay<'a>(
        &self,
        fields: impl IntoIterator<Item = &'a (ConfigKey, ConfigValue)>,
        patch_id: PatchId,
    ) -> Self {
        let mut next = self.clone();
        for (key, value) in fields {
            next.values.insert(*key, *value);
        }
        next.last_applied_patch_id = Some(patch_id);
        next
    }

    pub fn get(&self, key: ConfigKey) -> ConfigValue {
        // `values` is populated for every key at construction.
        self.values.get(&key).copied().unwrap_or(key.spec().default)
    }

    pub fn values(&self) -> &BTreeMap<ConfigKey, ConfigValue> {
        &self.values
    }

    pub fn last_applied_patch_id(&self) -> Option<PatchId> {
        self.last_applied_patch_id
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.uint(ConfigKey::HeartbeatInterval)
    }

    pub fn coordinator_timeout_ms(&self) -> u64 {
        self.uint(ConfigKey::CoordinatorTimeout)
    }

    pub fn task_timeout_ms(&self) -> u64 {
        self.uint(ConfigKey::TaskTimeout)
    }

    pub fn max_retries(&self) -> i64 {
        match self.get(ConfigKey::MaxRetries) {
            ConfigValue::Int(v) => v,
            _ => 0,
        }
    }

    pub fn autonomous_mode(&self) -> bool {
        self.flag(ConfigKey::EnableAutonomousMode)
    }

    pub fn task_execution(&self) -> bool {
        self.flag(ConfigKey::EnableTaskExecution)
    }

    fn uint(&self, key: ConfigKey) -> u64 {
        match self.get(key) {
            ConfigValue::UInt(v) => v,
            _ => 0,
        }
    }

    fn flag(&self, key: ConfigKey) -> bool {
        matches!(self.get(key), ConfigValue::Bool(true))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ValidationReason {
    OutOfRange,
    WrongType,
    UnknownKey,
}

/// One field-level violation found while validating a patch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationError {
    pub key: String,
    pub reason: ValidationReason,
}

impl ValidationError {
    pub fn new(key: impl Into<String>, reason: ValidationReason) -> Self {
        ValidationError { key: key.into(), reason }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spec = self.key.parse::<ConfigKey>().ok().map(|k| k.spec());
        match (self.reason, spec) {
            (ValidationReason::OutOfRange, Some(spec)) => {
                write!(f, "{} out of range ({})", self.key, spec.domain)
            }
            (ValidationReason::OutOfRange, None) => write!(f, "{} out of range", self.key),
            (ValidationReason::WrongType, Some(spec)) => {
                write!(f, "{} wrong type (expected {})", self.key, spec.kind)
            }
            (ValidationReason::WrongType, None) => write!(f, "{} wrong type", self.key),
            (ValidationReason::UnknownKey, _) => write!(f, "{} unknown key", self.key),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Render violations the way they travel in a status message:
/// `"<a> out of range (..); <b> out of range (..);"`.
pub fn error_summary(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| format!("{e};")).collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AckStatus {
    Success,
    Failed,
}

/// A node's answer to a patch. `errors` is empty iff `status` is `Success`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AckMessage {
    pub patch_id: PatchId,
    pub status: AckStatus,
    pub errors: Vec<ValidationError>,
    pub node_contact_time: Timestamp,
}

impl AckMessage {
    pub fn success(patch_id: PatchId, node_contact_time: Timestamp) -> Self {
        AckMessage { patch_id, status: AckStatus::Success, errors: Vec::new(), node_contact_time }
    }

    pub fn failed(
        patch_id: PatchId,
        errors: Vec<ValidationError>,
        node_contact_time: Timestamp,
    ) -> Self {
        AckMessage { patch_id, status: AckStatus::Failed, errors, node_contact_time }
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success
    }
}

/// Who wrote an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Origin {
    Node(NodeId),
    Coordinator,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Node(id) => write!(f, "node-{id}"),
            Origin::Coordinator => f.write_str("coordinator"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuditOutcome {
    Applied,
    Rejected,
    Replay,
    Sent,
    Acked,
    Failed,
    GivenUp,
    /// A newer patch replaced this one before it reached a terminal state.
    Superseded,
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuditEvent {
    pub at: Timestamp,
    pub origin: Origin,
    /// Node the patch was addressed to.
    pub node_id: NodeId,
    pub patch_id: PatchId,
    pub outcome: AuditOutcome,
    pub errors: Vec<ValidationError>,
    /// Full value set after an `Applied` outcome.
    pub values: Option<Vec<(ConfigKey, ConfigValue)>>,
}

impl AuditEvent {
    pub fn new(
        at: Timestamp,
        origin: Origin,
        node_id: NodeId,
        patch_id: PatchId,
        outcome: AuditOutcome,
    ) -> Self {
        AuditEvent { at, origin, node_id, patch_id, outcome, errors: Vec::new(), values: None }
    }

    pub fn with_errors(mut self, errors: Vec<ValidationError>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_values(mut self, config: &NodeConfig) -> Self {
        self.values = Some(config.values().iter().map(|(k, v)| (*k, *v)).collect());
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FieldsyncError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed message: {0}")]
    Decode(String),
    #[error("node {node_id} unreachable after {attempts} attempts")]
    UnreachableNode { node_id: NodeId, attempts: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
