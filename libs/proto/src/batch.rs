//! Phase signals sent by running batch scripts.

use std::fmt;
use std::str::FromStr;

use fleet_id::{BatchId, Pid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtoError, ProtoResult};
use crate::message::{payload, MessageType, Protocol};

/// The three operations a batch sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Hack,
    Grow,
    Weaken,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Hack => "hack",
            PhaseKind::Grow => "grow",
            PhaseKind::Weaken => "weaken",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hack" => Ok(PhaseKind::Hack),
            "grow" => Ok(PhaseKind::Grow),
            "weaken" => Ok(PhaseKind::Weaken),
            other => Err(ProtoError::Payload(format!("unknown phase: {other}"))),
        }
    }
}

/// Who is reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSignal {
    pub batch_id: BatchId,
    pub phase: PhaseKind,
    pub pid: Pid,
    pub hostname: String,
    /// Effect of the phase (money stolen, growth multiplier, or security
    /// removed); only set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<f64>,
}

/// Signals written to a batch's done port.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchSignal {
    /// The script finished its delay and started the operation.
    Started(PhaseSignal),
    /// The operation resolved.
    Done(PhaseSignal),
}

impl BatchSignal {
    pub fn signal(&self) -> &PhaseSignal {
        match self {
            BatchSignal::Started(s) | BatchSignal::Done(s) => s,
        }
    }
}

impl Protocol for BatchSignal {
    const SERVICE: &'static str = "batch done port";

    fn message_type(&self) -> MessageType {
        match self {
            BatchSignal::Started(_) => MessageType::PhaseStarted,
            BatchSignal::Done(_) => MessageType::PhaseDone,
        }
    }

    fn to_payload(&self) -> ProtoResult<Value> {
        Ok(serde_json::to_value(self.signal())?)
    }

    fn from_parts(message_type: MessageType, value: Value) -> ProtoResult<Self> {
        match message_type {
            MessageType::PhaseStarted => Ok(BatchSignal::Started(payload(value)?)),
            MessageType::PhaseDone => Ok(BatchSignal::Done(payload(value)?)),
            MessageType::Allocate
            | MessageType::CommitPlan
            | MessageType::ReleaseChunks
            | MessageType::ReleaseAll
            | MessageType::ReleaseWorker
            | MessageType::Transfer
            | MessageType::RegisterExitRelease
            | MessageType::Snapshot
            | MessageType::Capacity
            | MessageType::FreeRam
            | MessageType::Launch
            | MessageType::Reply => Err(Self::unexpected(message_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parse() {
        assert_eq!("Weaken".parse::<PhaseKind>().unwrap(), PhaseKind::Weaken);
        assert!("share".parse::<PhaseKind>().is_err());
    }

    #[test]
    fn test_signal_roundtrip_through_wire() {
        let signal = BatchSignal::Done(PhaseSignal {
            batch_id: BatchId::new(),
            phase: PhaseKind::Grow,
            pid: Pid::new(12),
            hostname: "pserv-0".into(),
            effect: Some(1.25),
        });
        let message = signal.to_message(None).unwrap();
        assert_eq!(message.tag, 31);
        assert_eq!(message.payload["phase"], "grow");
        assert_eq!(BatchSignal::from_message(message).unwrap(), signal);
    }
}
