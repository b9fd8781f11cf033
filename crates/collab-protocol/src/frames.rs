//! Frame types for the collab protocol.
//!
//! Frames are the unit of communication between a collaborating client and
//! the broker. Each frame is serialized using MessagePack.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::version::Version;

/// Permission bits meaning "every category".
pub const ALL_PERMISSIONS: u64 = u64::MAX;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Join = 0x01,
    Joined = 0x02,
    Update = 0x03,
    Message = 0x04,
    Error = 0x05,
    Ping = 0x06,
    Pong = 0x07,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Join),
            0x02 => Ok(FrameType::Joined),
            0x03 => Ok(FrameType::Update),
            0x04 => Ok(FrameType::Message),
            0x05 => Ok(FrameType::Error),
            0x06 => Ok(FrameType::Ping),
            0x07 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Kinds of server-originated messages carried by [`Frame::Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageKind {
    /// Acknowledges an update, carrying the server-assigned `updateid`.
    AckUpdateId = 1,
    /// The server is closing this connection.
    Shutdown = 2,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::AckUpdateId),
            2 => Ok(MessageKind::Shutdown),
            _ => Err("Invalid message kind"),
        }
    }
}

/// Error codes sent in [`Frame::Error`].
pub mod error_codes {
    /// Client protocol version is not compatible.
    pub const INCOMPATIBLE_VERSION: u16 = 1001;
    /// A frame arrived that is not valid in the current connection state.
    pub const UNEXPECTED_FRAME: u16 = 1002;
    /// The uid is not registered.
    pub const UNKNOWN_USER: u16 = 1003;
    /// The server is at its connection limit.
    pub const TOO_MANY_CONNECTIONS: u16 = 1004;
    /// The client may not publish updates of this category.
    pub const PUBLISH_DENIED: u16 = 1005;
    /// The server is shutting down.
    pub const SHUTTING_DOWN: u16 = 1006;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Attach to a project. Must be the first frame a client sends.
    #[serde(rename = "join")]
    Join {
        /// Client protocol version.
        version: Version,
        /// Registered user id.
        uid: u32,
        /// Project to join.
        project: u32,
        /// Requested publish mask; all bits when absent.
        #[serde(skip_serializing_if = "Option::is_none")]
        publish: Option<u64>,
        /// Requested subscribe mask; all bits when absent.
        #[serde(skip_serializing_if = "Option::is_none")]
        subscribe: Option<u64>,
    },

    /// Join accepted.
    #[serde(rename = "joined")]
    Joined {
        /// Server-side connection identifier.
        client_id: u64,
        /// Effective publish mask.
        publish: u64,
        /// Effective subscribe mask.
        subscribe: u64,
    },

    /// A project update. Sent by clients to publish, and by the server to forward.
    #[serde(rename = "update")]
    Update {
        /// Command tag.
        cmd: String,
        /// Structured payload.
        payload: Map<String, Value>,
        /// Category bits of this update; all bits when absent.
        #[serde(skip_serializing_if = "Option::is_none")]
        permission: Option<u64>,
    },

    /// A server-originated message addressed to one client.
    #[serde(rename = "message")]
    Message {
        kind: MessageKind,
        payload: Map<String, Value>,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`error_codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Join { .. } => FrameType::Join,
            Frame::Joined { .. } => FrameType::Joined,
            Frame::Update { .. } => FrameType::Update,
            Frame::Message { .. } => FrameType::Message,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a Join frame at the current protocol version with full requested masks.
    #[must_use]
    pub fn join(uid: u32, project: u32) -> Self {
        Frame::Join {
            version: Version::default(),
            uid,
            project,
            publish: None,
            subscribe: None,
        }
    }

    /// Create a Joined frame.
    #[must_use]
    pub fn joined(client_id: u64, publish: u64, subscribe: u64) -> Self {
        Frame::Joined {
            client_id,
            publish,
            subscribe,
        }
    }

    /// Create an Update frame without a permission category.
    #[must_use]
    pub fn update(cmd: impl Into<String>, payload: Map<String, Value>) -> Self {
        Frame::Update {
            cmd: cmd.into(),
            payload,
            permission: None,
        }
    }

    /// Create a Message frame.
    #[must_use]
    pub fn message(kind: MessageKind, payload: Map<String, Value>) -> Self {
        Frame::Message { kind, payload }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::join(3, 7).frame_type(), FrameType::Join);
        assert_eq!(
            Frame::update("insert", Map::new()).frame_type(),
            FrameType::Update
        );
        assert_eq!(FrameType::try_from(0x05), Ok(FrameType::Error));
        assert!(FrameType::try_from(0x00).is_err());
    }

    #[test]
    fn test_message_kind_conversion() {
        assert_eq!(MessageKind::try_from(1), Ok(MessageKind::AckUpdateId));
        assert_eq!(MessageKind::try_from(2), Ok(MessageKind::Shutdown));
        assert!(MessageKind::try_from(3).is_err());
        assert_eq!(u8::from(MessageKind::AckUpdateId), 1);
    }

    #[test]
    fn test_join_defaults_to_current_version() {
        match Frame::join(3, 7) {
            Frame::Join {
                version,
                publish,
                subscribe,
                ..
            } => {
                assert_eq!(version, crate::PROTOCOL_VERSION);
                assert!(publish.is_none());
                assert!(subscribe.is_none());
            }
            other => panic!("Expected Join, got {:?}", other),
        }
    }
}
