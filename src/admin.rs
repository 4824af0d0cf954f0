//! # Administrative Events
//!
//! Every channel owns a reserved stream, [`ADMIN_STREAM`], recording its own
//! lifecycle: channel and stream creation, rollbacks and sanitization. The
//! records are plain serde values, encoded as JSON and appended through the
//! same transactional path as ordinary events.
//!
//! ## Equality
//!
//! Records compare on their identifying fields. Two `EventSanitized` records
//! for the same stream and event are equal even if their justifications
//! differ, because they describe the same fact.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{AppendedEventMessage, EventMessage, EventSequence};

/// Name of the administrative stream in every channel.
pub const ADMIN_STREAM: &str = "canon.admin";

/// Codec name recorded on admin events.
pub const ADMIN_CODEC: &str = "canon.admin";

// =============================================================================
// Records
// =============================================================================

/// A channel was created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelCreated {
    pub channel: String,
}

/// A stream was created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamCreated {
    pub stream: String,
}

/// A channel was rolled back to a point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRolledBack {
    pub channel: String,
    pub rollback_point: EventSequence,
    pub justification: String,
}

/// A stream was rolled back to a point. Events after it are superseded, not
/// removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRolledBack {
    pub stream: String,
    pub rollback_point: EventSequence,
    pub justification: String,
}

/// Sanitization of an event was requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizeEvent {
    pub stream: String,
    pub event_id: EventSequence,
    pub justification: String,
}

/// An event's content was replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSanitized {
    pub stream: String,
    pub event_id: EventSequence,
    pub justification: String,
}

impl PartialEq for ChannelRolledBack {
    fn eq(&self, other: &Self) -> bool {
        self.channel == other.channel && self.rollback_point == other.rollback_point
    }
}
impl Eq for ChannelRolledBack {}

impl PartialEq for StreamRolledBack {
    fn eq(&self, other: &Self) -> bool {
        self.stream == other.stream && self.rollback_point == other.rollback_point
    }
}
impl Eq for StreamRolledBack {}

impl PartialEq for SanitizeEvent {
    fn eq(&self, other: &Self) -> bool {
        self.stream == other.stream && self.event_id == other.event_id
    }
}
impl Eq for SanitizeEvent {}

impl PartialEq for EventSanitized {
    fn eq(&self, other: &Self) -> bool {
        self.stream == other.stream && self.event_id == other.event_id
    }
}
impl Eq for EventSanitized {}

// =============================================================================
// AdminEvent
// =============================================================================

/// Any record of the admin stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminEvent {
    ChannelCreated(ChannelCreated),
    StreamCreated(StreamCreated),
    ChannelRolledBack(ChannelRolledBack),
    StreamRolledBack(StreamRolledBack),
    SanitizeEvent(SanitizeEvent),
    EventSanitized(EventSanitized),
}

impl AdminEvent {
    pub const CHANNEL_CREATED: &'static str = "canon.ChannelCreated";
    pub const STREAM_CREATED: &'static str = "canon.StreamCreated";
    pub const CHANNEL_ROLLED_BACK: &'static str = "canon.ChannelRolledBack";
    pub const STREAM_ROLLED_BACK: &'static str = "canon.StreamRolledBack";
    pub const SANITIZE_EVENT: &'static str = "canon.SanitizeEvent";
    pub const EVENT_SANITIZED: &'static str = "canon.EventSanitized";

    /// The event type this record is stored under.
    pub fn event_type(&self) -> &'static str {
        match self {
            AdminEvent::ChannelCreated(_) => Self::CHANNEL_CREATED,
            AdminEvent::StreamCreated(_) => Self::STREAM_CREATED,
            AdminEvent::ChannelRolledBack(_) => Self::CHANNEL_ROLLED_BACK,
            AdminEvent::StreamRolledBack(_) => Self::STREAM_ROLLED_BACK,
            AdminEvent::SanitizeEvent(_) => Self::SANITIZE_EVENT,
            AdminEvent::EventSanitized(_) => Self::EVENT_SANITIZED,
        }
    }

    /// Encodes the record as an uncommitted message.
    pub fn to_message(&self) -> Result<EventMessage> {
        let content = match self {
            AdminEvent::ChannelCreated(r) => serde_json::to_vec(r),
            AdminEvent::StreamCreated(r) => serde_json::to_vec(r),
            AdminEvent::ChannelRolledBack(r) => serde_json::to_vec(r),
            AdminEvent::StreamRolledBack(r) => serde_json::to_vec(r),
            AdminEvent::SanitizeEvent(r) => serde_json::to_vec(r),
            AdminEvent::EventSanitized(r) => serde_json::to_vec(r),
        }
        .map_err(|e| codec_error(self.event_type(), e))?;

        EventMessage::builder(self.event_type()).content(content).build()
    }

    /// Decodes a committed admin event.
    ///
    /// # Errors
    ///
    /// `Error::EventCodec` for unknown types or malformed content.
    pub fn from_appended(event: &AppendedEventMessage) -> Result<Self> {
        let body = &event.content;
        let ty = event.event_type.as_str();
        let decoded = match ty {
            Self::CHANNEL_CREATED => serde_json::from_slice(body).map(AdminEvent::ChannelCreated),
            Self::STREAM_CREATED => serde_json::from_slice(body).map(AdminEvent::StreamCreated),
            Self::CHANNEL_ROLLED_BACK => {
                serde_json::from_slice(body).map(AdminEvent::ChannelRolledBack)
            }
            Self::STREAM_ROLLED_BACK => {
                serde_json::from_slice(body).map(AdminEvent::StreamRolledBack)
            }
            Self::SANITIZE_EVENT => serde_json::from_slice(body).map(AdminEvent::SanitizeEvent),
            Self::EVENT_SANITIZED => serde_json::from_slice(body).map(AdminEvent::EventSanitized),
            other => return Err(codec_error(other, "not an administrative event type")),
        };
        decoded.map_err(|e| codec_error(ty, e))
    }
}

fn codec_error(event_type: &str, reason: impl std::fmt::Display) -> Error {
    Error::EventCodec {
        codec: ADMIN_CODEC.to_string(),
        event_type: event_type.to_string(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(event: &AdminEvent) -> AppendedEventMessage {
        AppendedEventMessage::from_message(
            event.to_message().unwrap(),
            ADMIN_STREAM.into(),
            "1".into(),
            None,
            0,
        )
    }

    #[test]
    fn test_admin_event_types_are_reserved() {
        let event = AdminEvent::StreamCreated(StreamCreated {
            stream: "orders".into(),
        });
        assert!(crate::types::is_reserved(event.event_type()));
    }

    #[test]
    fn test_decode_committed_record() {
        let event = AdminEvent::SanitizeEvent(SanitizeEvent {
            stream: "orders".into(),
            event_id: "7".into(),
            justification: "gdpr".into(),
        });
        assert_eq!(AdminEvent::from_appended(&commit(&event)).unwrap(), event);
    }

    #[test]
    fn test_equality_ignores_justification() {
        let a = EventSanitized {
            stream: "orders".into(),
            event_id: "7".into(),
            justification: "gdpr".into(),
        };
        let mut b = a.clone();
        b.justification = "typo".into();
        assert_eq!(a, b);

        b.event_id = "8".into();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let message = EventMessage::builder("Created").build().unwrap();
        let appended =
            AppendedEventMessage::from_message(message, ADMIN_STREAM.into(), "1".into(), None, 0);
        assert!(matches!(
            AdminEvent::from_appended(&appended),
            Err(Error::EventCodec { .. })
        ));
    }
}
