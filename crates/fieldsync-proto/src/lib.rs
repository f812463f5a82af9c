//! Wire envelope shared by coordinator and nodes, and its byte codec.
//!
//! Frame layout: `version(1) ++ bincode(Envelope)` using bincode's standard
//! (varint) configuration, which keeps a typical config update well under a
//! single LoRa packet.

use std::fmt;

use fieldsync_types::{
    error_summary, AckMessage, AckStatus, ConfigPatch, FieldsyncError, NodeId, PatchId, Timestamp,
    ValidationError, ValidationReason,
};

pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on an encoded frame, version byte included.
pub const MAX_FRAME_LEN: usize = 2048;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after envelope")]
    Trailing(usize),
    #[error("inconsistent status: {0}")]
    Inconsistent(&'static str),
}

impl From<CodecError> for FieldsyncError {
    fn from(e: CodecError) -> Self {
        FieldsyncError::Decode(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    ConfigUpdate,
    Status,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::ConfigUpdate => "MSG_CONFIG_UPDATE",
            MessageType::Status => "MSG_STATUS",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpdateStatus {
    Success,
    Failed,
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateStatus::Success => "success",
            UpdateStatus::Failed => "failed",
        })
    }
}

/// `MSG_STATUS` body: the acknowledgment of one patch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusData {
    pub patch_id: PatchId,
    pub config_update_status: UpdateStatus,
    pub acknowledged: bool,
    /// Human-readable concatenation of every violation, in validation order.
    /// Omitted when it would push the frame past `MAX_FRAME_LEN`; `errors`
    /// is always complete.
    pub error: Option<String>,
    pub errors: Vec<ValidationError>,
    pub node_contact_time: Timestamp,
}

impl From<&AckMessage> for StatusData {
    fn from(ack: &AckMessage) -> Self {
        match ack.status {
            AckStatus::Success => StatusData {
                patch_id: ack.patch_id,
                config_update_status: UpdateStatus::Success,
                acknowledged: true,
                error: None,
                errors: Vec::new(),
                node_contact_time: ack.node_contact_time,
            },
            AckStatus::Failed => StatusData {
                patch_id: ack.patch_id,
                config_update_status: UpdateStatus::Failed,
                acknowledged: false,
                error: Some(error_summary(&ack.errors)),
                errors: ack.errors.clone(),
                node_contact_time: ack.node_contact_time,
            },
        }
    }
}

impl TryFrom<StatusData> for AckMessage {
    type Error = CodecError;

    fn try_from(data: StatusData) -> Result<Self, Self::Error> {
        match (data.config_update_status, data.acknowledged, data.errors.is_empty()) {
            (UpdateStatus::Success, true, true) => {
                Ok(AckMessage::success(data.patch_id, data.node_contact_time))
            }
            (UpdateStatus::Failed, false, false) => {
                Ok(AckMessage::failed(data.patch_id, data.errors, data.node_contact_time))
            }
            (UpdateStatus::Success, _, _) => {
                Err(CodecError::Inconsistent("success status carrying errors or no ack"))
            }
            (UpdateStatus::Failed, _, _) => {
                Err(CodecError::Inconsistent("failed status without errors or acknowledged"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Payload {
    ConfigUpdate(ConfigPatch),
    Status(StatusData),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub timestamp: Timestamp,
    pub data: Payload,
}

impl Envelope {
    pub fn config_update(
        source_node: NodeId,
        target_node: NodeId,
        timestamp: Timestamp,
        patch: ConfigPatch,
    ) -> Self {
        Envelope { source_node, target_node, timestamp, data: Payload::ConfigUpdate(patch) }
    }

    pub fn status(
        source_node: NodeId,
        target_node: NodeId,
        timestamp: Timestamp,
        ack: &AckMessage,
    ) -> Self {
        Envelope { source_node, target_node, timestamp, data: Payload::Status(ack.into()) }
    }

    pub fn msg_type(&self) -> MessageType {
        match self.data {
            Payload::ConfigUpdate(_) => MessageType::ConfigUpdate,
            Payload::Status(_) => MessageType::Status,
        }
    }
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut frame = vec![PROTOCOL_VERSION];
    let body = bincode::serde::encode_to_vec(envelope, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    frame.extend_from_slice(&body);
    if frame.len() > MAX_FRAME_LEN {
        return Err(CodecError::TooLarge(frame.len()));
    }
    Ok(frame)
}

/// Encode the status reply for `ack`.
///
/// A rejection whose summary does not fit is sent without it.
pub fn encode_status(
    source_node: NodeId,
    target_node: NodeId,
    timestamp: Timestamp,
    ack: &AckMessage,
) -> Result<Vec<u8>, CodecError> {
    let mut envelope = Envelope::status(source_node, target_node, timestamp, ack);
    match encode(&envelope) {
        Err(CodecError::TooLarge(_)) => {
            if let Payload::Status(data) = &mut envelope.data {
                data.error = None;
            }
            encode(&envelope)
        }
        res => res,
    }
}

/// The largest rejection a node can send for `patch`: every field reported,
/// at the latest contact time.
pub fn worst_case_nak(patch: &ConfigPatch) -> AckMessage {
    let errors = patch
        .fields
        .iter()
        .map(|(key, _)| ValidationError::new(key.as_str(), ValidationReason::UnknownKey))
        .collect();
    AckMessage::failed(patch.patch_id, errors, Timestamp::MAX)
}

pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
    let (&version, body) = frame.split_first().ok_or(CodecError::Empty)?;
    if frame.len() > MAX_FRAME_LEN {
        return Err(CodecError::TooLarge(frame.len()));
    }
    if version != PROTOCOL_VERSION {
        return Err(CodecError::Version(version));
    }
    let (envelope, read): (Envelope, usize) =
        bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map_err(|e| CodecError::Decode(e.to_string()))?;
    if read != body.len() {
        return Err(CodecError::Trailing(body.len() - read));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use fieldsync_types::ConfigValue;

    use super::*;

    fn sample_patch() -> ConfigPatch {
        ConfigPatch::new(12, 1_700_000_000_000)
            .set("heartbeatInterval", ConfigValue::UInt(45_000))
            .set("maxRetries", ConfigValue::Int(5))
            .set("enableAutonomousMode", ConfigValue::Bool(true))
    }

    #[test]
    fn config_update_survives_the_wire() {
        let env = Envelope::config_update(0, 4, 99, sample_patch());
        let frame = encode(&env).unwrap();
        assert_eq!(frame[0], PROTOCOL_VERSION);
        let back = decode(&frame).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.msg_type(), MessageType::ConfigUpdate);
        assert_eq!(back.msg_type().to_string(), "MSG_CONFIG_UPDATE");
    }

    #[test]
    fn failed_status_carries_summary_and_items() {
        let ack = AckMessage::failed(
            3,
            vec![
                ValidationError::new("heartbeatInterval", ValidationReason::OutOfRange),
                ValidationError::new("maxRetries", ValidationReason::OutOfRange),
            ],
            50,
        );
        let env = Envelope::status(4, 0, 50, &ack);
        let Payload::Status(data) = &env.data else { panic!("expected status") };
        assert_eq!(data.config_update_status.to_string(), "failed");
        assert!(!data.acknowledged);
        assert_eq!(
            data.error.as_deref(),
            Some("heartbeatInterval out of range (10s-10min); maxRetries out of range (0-10);")
        );

        let Payload::Status(data) = decode(&encode(&env).unwrap()).unwrap().data else {
            panic!("expected status")
        };
        assert_eq!(AckMessage::try_from(data).unwrap(), ack);
    }

    #[test]
    fn success_status_shape() {
        let data = StatusData::from(&AckMessage::success(8, 10));
        assert_eq!(data.config_update_status, UpdateStatus::Success);
        assert!(data.acknowledged);
        assert!(data.error.is_none());
    }

    #[test]
    fn inconsistent_status_is_rejected() {
        let mut data = StatusData::from(&AckMessage::success(8, 10));
        data.acknowledged = false;
        assert!(matches!(AckMessage::try_from(data), Err(CodecError::Inconsistent(_))));
    }

    fn many_unknown_keys(count: usize) -> ConfigPatch {
        (0..count).fold(ConfigPatch::new(1, 0), |patch, i| {
            patch.set(&format!("unsupportedSensorOption{i:03}"), ConfigValue::UInt(1))
        })
    }

    #[test]
    fn oversized_nak_drops_only_the_summary() {
        let patch = many_unknown_keys(60);
        assert!(encode(&Envelope::config_update(0, 4, 0, patch.clone())).is_ok());

        let nak = worst_case_nak(&patch);
        assert!(matches!(
            encode(&Envelope::status(4, 0, Timestamp::MAX, &nak)),
            Err(CodecError::TooLarge(_))
        ));

        let frame = encode_status(4, 0, Timestamp::MAX, &nak).unwrap();
        assert!(frame.len() <= MAX_FRAME_LEN);
        let Payload::Status(data) = decode(&frame).unwrap().data else { panic!("expected status") };
        assert!(data.error.is_none());
        assert_eq!(data.errors.len(), 60);
        assert_eq!(AckMessage::try_from(data).unwrap(), nak);
    }

    #[test]
    fn small_nak_keeps_the_summary() {
        let nak = worst_case_nak(&sample_patch());
        let frame = encode_status(4, 0, 0, &nak).unwrap();
        let Payload::Status(data) = decode(&frame).unwrap().data else { panic!("expected status") };
        assert_eq!(data.error, Some(error_summary(&nak.errors)));
        assert!(nak.errors.iter().all(|e| e.reason == ValidationReason::UnknownKey));
    }

    #[test]
    fn codec_errors_surface_as_decode_errors() {
        let err: FieldsyncError = decode(&[9]).unwrap_err().into();
        assert!(matches!(&err, FieldsyncError::Decode(msg) if msg == "unsupported protocol version 9"));
    }

    #[test]
    fn malformed_frames() {
        assert_eq!(decode(&[]), Err(CodecError::Empty));
        assert_eq!(decode(&[9, 0, 0]), Err(CodecError::Version(9)));
        assert!(matches!(decode(&[PROTOCOL_VERSION, 0xff, 0xff, 0xff]), Err(CodecError::Decode(_))));

        let mut frame = encode(&Envelope::config_update(0, 1, 2, sample_patch())).unwrap();
        frame.push(0);
        assert_eq!(decode(&frame), Err(CodecError::Trailing(1)));

        let oversized = vec![PROTOCOL_VERSION; MAX_FRAME_LEN + 1];
        assert_eq!(decode(&oversized), Err(CodecError::TooLarge(MAX_FRAME_LEN + 1)));
    }
}
