//! Message type tags and the [`Protocol`] trait.

use std::fmt;

use fleet_id::PortId;
use fleet_transport::WireMessage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ProtoError, ProtoResult, ServiceError};

/// Every message type on the wire.
///
/// Tags are stable; scripts written against the positional wire format
/// depend on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    // Memory service
    Allocate = 1,
    CommitPlan = 2,
    ReleaseChunks = 3,
    ReleaseAll = 4,
    ReleaseWorker = 5,
    Transfer = 6,
    RegisterExitRelease = 7,
    Snapshot = 8,
    Capacity = 9,
    FreeRam = 10,

    // Launch service
    Launch = 20,

    // Batch phase signals
    PhaseStarted = 30,
    PhaseDone = 31,

    /// Any reply on a response port.
    Reply = 99,
}

impl MessageType {
    pub const fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> ProtoResult<Self> {
        Ok(match tag {
            1 => MessageType::Allocate,
            2 => MessageType::CommitPlan,
            3 => MessageType::ReleaseChunks,
            4 => MessageType::ReleaseAll,
            5 => MessageType::ReleaseWorker,
            6 => MessageType::Transfer,
            7 => MessageType::RegisterExitRelease,
            8 => MessageType::Snapshot,
            9 => MessageType::Capacity,
            10 => MessageType::FreeRam,
            20 => MessageType::Launch,
            30 => MessageType::PhaseStarted,
            31 => MessageType::PhaseDone,
            99 => MessageType::Reply,
            other => return Err(ProtoError::UnknownType(other)),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Allocate => "allocate",
            MessageType::CommitPlan => "commit_plan",
            MessageType::ReleaseChunks => "release_chunks",
            MessageType::ReleaseAll => "release_all",
            MessageType::ReleaseWorker => "release_worker",
            MessageType::Transfer => "transfer",
            MessageType::RegisterExitRelease => "register_exit_release",
            MessageType::Snapshot => "snapshot",
            MessageType::Capacity => "capacity",
            MessageType::FreeRam => "free_ram",
            MessageType::Launch => "launch",
            MessageType::PhaseStarted => "phase_started",
            MessageType::PhaseDone => "phase_done",
            MessageType::Reply => "reply",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A closed set of messages one endpoint understands.
///
/// Implementors match every [`MessageType`] in [`from_parts`], so adding a
/// tag fails to compile until each endpoint decides what to do with it.
///
/// [`from_parts`]: Protocol::from_parts
pub trait Protocol: Sized {
    /// Name used in errors and logs.
    const SERVICE: &'static str;

    fn message_type(&self) -> MessageType;

    fn to_payload(&self) -> ProtoResult<Value>;

    fn from_parts(message_type: MessageType, payload: Value) -> ProtoResult<Self>;

    fn to_message(&self, response_port: Option<PortId>) -> ProtoResult<WireMessage> {
        Ok(WireMessage {
            tag: self.message_type().tag(),
            response_port,
            payload: self.to_payload()?,
        })
    }

    fn from_message(message: WireMessage) -> ProtoResult<Self> {
        let message_type = MessageType::from_tag(message.tag)?;
        Self::from_parts(message_type, message.payload)
    }

    /// The error for a tag that belongs to another endpoint.
    fn unexpected(actual: MessageType) -> ProtoError {
        ProtoError::UnexpectedType {
            service: Self::SERVICE,
            actual,
        }
    }
}

pub(crate) fn payload<T: DeserializeOwned>(value: Value) -> ProtoResult<T> {
    Ok(serde_json::from_value(value)?)
}

/// Builds the reply frame for a handled request.
pub fn reply_message<R: Serialize>(result: &Result<R, ServiceError>) -> ProtoResult<WireMessage> {
    Ok(WireMessage::new(
        MessageType::Reply.tag(),
        serde_json::to_value(result)?,
    ))
}

/// Unpacks a reply frame into the service's answer.
pub fn decode_reply<R: DeserializeOwned>(message: WireMessage) -> ProtoResult<R> {
    let message_type = MessageType::from_tag(message.tag)?;
    if message_type != MessageType::Reply {
        return Err(ProtoError::UnexpectedReply(format!(
            "expected reply, got {message_type}"
        )));
    }
    let result: Result<R, ServiceError> = serde_json::from_value(message.payload)?;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tags_roundtrip() {
        for ty in [
            MessageType::Allocate,
            MessageType::FreeRam,
            MessageType::Launch,
            MessageType::PhaseDone,
            MessageType::Reply,
        ] {
            assert_eq!(MessageType::from_tag(ty.tag()).unwrap(), ty);
        }
        assert_eq!(
            MessageType::from_tag(42).unwrap_err(),
            ProtoError::UnknownType(42)
        );
    }

    #[test]
    fn test_reply_carries_error() {
        let err: Result<u64, ServiceError> = Err(ServiceError::invalid("threads must be positive"));
        let message = reply_message(&err).unwrap();
        assert_eq!(message.tag, 99);

        let decoded = decode_reply::<u64>(message).unwrap_err();
        assert_eq!(
            decoded.as_service(),
            Some(&ServiceError::invalid("threads must be positive"))
        );
    }

    #[test]
    fn test_reply_rejects_request_frames() {
        let frame = WireMessage::new(MessageType::Snapshot.tag(), json!(null));
        assert!(matches!(
            decode_reply::<u64>(frame),
            Err(ProtoError::UnexpectedReply(_))
        ));
    }
}
