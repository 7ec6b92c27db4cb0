//! Wire message contract for every channel direction.
//!
//! Every message is one JSON object with a `type` discriminator:
//!
//! | Direction          | Type                                                  |
//! |--------------------|-------------------------------------------------------|
//! | student → relay    | [`StudentMessage`]                                    |
//! | observer → relay   | [`ObserverMessage`]                                   |
//! | relay → student    | [`StudentCommand`]                                    |
//! | relay → observer   | [`RelayEvent`]                                        |
//! | first line on any relay connection | [`ClientHello`]                       |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::alert::AlertEvent;
use crate::models::student::{Snapshot, StudentId, StudentPatch, StudentState};
use crate::{AppError, Result};

/// A message kind that can travel over a session channel.
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Every `type` value this message family understands.
    const KINDS: &'static [&'static str];

    /// The `type` discriminator of this message.
    fn kind(&self) -> &'static str;
}

/// Student → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StudentMessage {
    /// Opens the student's channel.
    Join {
        /// Identity the student claims for this session.
        student_id: StudentId,
    },
    /// Periodic still frame.
    Frame {
        /// Encoded JPEG snapshot.
        snapshot: Snapshot,
    },
    /// One completed audio segment plus a snapshot taken at the boundary.
    AudioSegment {
        /// Encoded audio segment.
        #[serde(with = "crate::models::base64_bytes")]
        audio: Vec<u8>,
        /// Snapshot captured at the segment boundary, if it encoded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<Snapshot>,
    },
    /// Student is leaving on its own.
    Leave {
        /// Identity that is leaving.
        student_id: StudentId,
    },
}

impl WireMessage for StudentMessage {
    const KINDS: &'static [&'static str] = &["join", "frame", "audio_segment", "leave"];

    fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Frame { .. } => "frame",
            Self::AudioSegment { .. } => "audio_segment",
            Self::Leave { .. } => "leave",
        }
    }
}

/// Observer → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    /// Subscribes to every student channel.
    AdminJoin,
    /// Asks the relay to forward a removal command to one student.
    RemoveStudent {
        /// Student to remove.
        student_id: StudentId,
        /// Reason shown to the student.
        reason: String,
    },
    /// Marks a student's critical status as a false alarm.
    DismissAlert {
        /// Student whose alert is dismissed.
        student_id: StudentId,
    },
}

impl WireMessage for ObserverMessage {
    const KINDS: &'static [&'static str] = &["admin_join", "remove_student", "dismiss_alert"];

    fn kind(&self) -> &'static str {
        match self {
            Self::AdminJoin => "admin_join",
            Self::RemoveStudent { .. } => "remove_student",
            Self::DismissAlert { .. } => "dismiss_alert",
        }
    }
}

/// Relay → student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StudentCommand {
    /// Join acknowledged; capture may start.
    Joined {
        /// Identity the relay registered.
        student_id: StudentId,
    },
    /// Join refused (blank or already connected identity).
    Rejected {
        /// Why the join was refused.
        reason: String,
    },
    /// The student has been removed from the exam.
    Removal {
        /// Reason given by the operator.
        reason: String,
    },
}

impl WireMessage for StudentCommand {
    const KINDS: &'static [&'static str] = &["joined", "rejected", "removal"];

    fn kind(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::Rejected { .. } => "rejected",
            Self::Removal { .. } => "removal",
        }
    }
}

/// Relay → observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Full set of known students; replaces the observer's store.
    InitialRoster {
        /// Every currently connected student.
        students: Vec<StudentState>,
    },
    /// A student opened its channel.
    StudentJoined {
        /// Initial record.
        student: StudentState,
    },
    /// A student's channel closed (leave, drop, or confirmed removal).
    StudentLeft {
        /// Student that is gone.
        student_id: StudentId,
    },
    /// Partial state change for one student.
    StudentUpdated {
        /// Fields that changed.
        patch: StudentPatch,
    },
    /// New alert.
    Alert {
        /// The alert.
        alert: AlertEvent,
    },
    /// The relay rejected something the observer sent.
    ProtocolError {
        /// Description of the problem.
        message: String,
    },
}

impl WireMessage for RelayEvent {
    const KINDS: &'static [&'static str] = &[
        "initial_roster",
        "student_joined",
        "student_left",
        "student_updated",
        "alert",
        "protocol_error",
    ];

    fn kind(&self) -> &'static str {
        match self {
            Self::InitialRoster { .. } => "initial_roster",
            Self::StudentJoined { .. } => "student_joined",
            Self::StudentLeft { .. } => "student_left",
            Self::StudentUpdated { .. } => "student_updated",
            Self::Alert { .. } => "alert",
            Self::ProtocolError { .. } => "protocol_error",
        }
    }
}

/// First line on any relay connection; selects the connection's role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientHello {
    /// Student channel.
    Join {
        /// Identity the student claims.
        student_id: StudentId,
    },
    /// Observer subscription.
    AdminJoin,
}

impl WireMessage for ClientHello {
    const KINDS: &'static [&'static str] = &["join", "admin_join"];

    fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::AdminJoin => "admin_join",
        }
    }
}

/// Serialize `msg` as one JSON line without the trailing newline.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if serialization fails.
pub fn encode_line<T: WireMessage>(msg: &T) -> Result<String> {
    serde_json::to_string(msg)
        .map_err(|e| AppError::Protocol(format!("failed to serialise {}: {e}", msg.kind())))
}

/// Parse one JSON line into a message of family `T`.
///
/// # Return value
///
/// - `Ok(Some(msg))`: a recognized, complete message.
/// - `Ok(None)`: the line is blank or carries a `type` this family does
///   not know (logged at `DEBUG`).
/// - `Err(AppError::Protocol(..))`: not valid JSON, no `type` field, or a
///   known type with missing or mistyped fields.
///
/// # Errors
///
/// See above.
pub fn decode_line<T: WireMessage>(line: &str) -> Result<Option<T>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(line)?;

    let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(AppError::Protocol("missing required field: `type`".into()));
    };

    if !T::KINDS.contains(&kind) {
        debug!(kind, "skipping unknown message type");
        return Ok(None);
    }

    let kind = kind.to_owned();
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| AppError::Protocol(format!("invalid {kind} payload: {e}")))
}
