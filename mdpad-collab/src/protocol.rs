//! JSON wire protocol between editor clients and the document server.
//!
//! Every frame is a WebSocket text message holding one JSON object tagged by
//! `type`:
//! ```text
//! client ─▶ server                     server ─▶ client
//! ───────────────────────────────      ─────────────────────────────────────────
//! operation      {revision, ops}       identity        {userId}
//! identity       {name, hue}           snapshot        {text, revision, language, users}
//! selectionUpdate{ranges}              ack             {revision}
//! languageChange {language}            operation       {revision, ops, userId}
//!                                      selectionUpdate {userId, ranges}
//!                                      userJoined      {userId, info}
//!                                      userLeft        {userId}
//!                                      languageChange  {language}
//! ```
//!
//! `ops` uses the compact operation encoding from `mdpad_core::operation`.
//! The server delivers document messages (`snapshot`, `ack`, `operation`)
//! in revision order over a single connection.

use mdpad_core::{Operation, SelectionRange, UserInfo, UserProfile};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A frame that could not be decoded. `kind` is the `type` tag when
    /// one could be read.
    #[error("malformed {} message: {reason}", .kind.as_deref().unwrap_or("untyped"))]
    Malformed {
        kind: Option<String>,
        reason: String,
    },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection attempt timed out")]
    Timeout,

    #[error("invalid server address: {0}")]
    InvalidUri(String),
}

impl ProtocolError {
    /// Whether a decode failure loses document state.
    ///
    /// Broken `snapshot`, `ack` or `operation` frames (or frames whose type
    /// cannot be read at all) leave the client unable to track revisions.
    /// Anything else is presence or metadata and can be dropped.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::Malformed { kind: None, .. } => true,
            ProtocolError::Malformed {
                kind: Some(kind), ..
            } => MessageKind::from_tag(kind).is_some_and(MessageKind::is_document),
            _ => true,
        }
    }
}

/// Message type tags, as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Identity,
    Snapshot,
    Ack,
    Operation,
    SelectionUpdate,
    UserJoined,
    UserLeft,
    LanguageChange,
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "identity" => MessageKind::Identity,
            "snapshot" => MessageKind::Snapshot,
            "ack" => MessageKind::Ack,
            "operation" => MessageKind::Operation,
            "selectionUpdate" => MessageKind::SelectionUpdate,
            "userJoined" => MessageKind::UserJoined,
            "userLeft" => MessageKind::UserLeft,
            "languageChange" => MessageKind::LanguageChange,
            _ => return None,
        })
    }

    /// Messages that carry revisioned document state.
    pub fn is_document(self) -> bool {
        matches!(
            self,
            MessageKind::Snapshot | MessageKind::Ack | MessageKind::Operation
        )
    }
}

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// A local edit based on `revision`.
    Operation { revision: u64, ops: Operation },
    /// The sender's display identity.
    Identity { name: String, hue: u16 },
    SelectionUpdate { ranges: Vec<SelectionRange> },
    LanguageChange { language: String },
}

impl ClientMessage {
    pub fn identity(profile: &UserProfile) -> Self {
        ClientMessage::Identity {
            name: profile.name.clone(),
            hue: profile.hue,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| malformed(text, e))
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// The id the server assigned to this connection.
    #[serde(rename_all = "camelCase")]
    Identity { user_id: u64 },
    /// Full state, sent once right after connecting.
    Snapshot {
        text: String,
        revision: u64,
        language: Option<String>,
        users: Vec<UserInfo>,
    },
    /// The sender's in-flight operation became `revision`.
    Ack { revision: u64 },
    /// Another participant's operation, already transformed by the server.
    #[serde(rename_all = "camelCase")]
    Operation {
        revision: u64,
        ops: Operation,
        user_id: u64,
    },
    #[serde(rename_all = "camelCase")]
    SelectionUpdate {
        user_id: u64,
        ranges: Vec<SelectionRange>,
    },
    /// A participant announced or changed their identity.
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: u64, info: UserProfile },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: u64 },
    LanguageChange { language: String },
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::Identity { .. } => MessageKind::Identity,
            ServerMessage::Snapshot { .. } => MessageKind::Snapshot,
            ServerMessage::Ack { .. } => MessageKind::Ack,
            ServerMessage::Operation { .. } => MessageKind::Operation,
            ServerMessage::SelectionUpdate { .. } => MessageKind::SelectionUpdate,
            ServerMessage::UserJoined { .. } => MessageKind::UserJoined,
            ServerMessage::UserLeft { .. } => MessageKind::UserLeft,
            ServerMessage::LanguageChange { .. } => MessageKind::LanguageChange,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| malformed(text, e))
    }
}

fn malformed(text: &str, err: serde_json::Error) -> ProtocolError {
    let kind = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("type")?.as_str().map(str::to_owned));
    ProtocolError::Malformed {
        kind,
        reason: err.to_string(),
    }
}
