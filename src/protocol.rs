//! Wire messages exchanged over the wizard WebSocket.
//!
//! The client sends exactly one shape:
//!
//! ```json
//! { "type": "user_message", "content": "I need an NDA" }
//! ```
//!
//! The server answers with flat JSON objects tagged by `type`, each carrying
//! the `sessionId` it refers to.
//!
//! # Example
//!
//! ```rust
//! use doc_wizard::protocol::{QuestionPayload, ServerMessage};
//!
//! let msg = ServerMessage::NextQuestion {
//!     session_id: "s-1".to_string(),
//!     question: QuestionPayload::new("q1", "Who are the parties?"),
//! };
//! let json = serde_json::to_value(&msg).unwrap();
//! assert_eq!(json["type"], "next_question");
//! assert_eq!(json["sessionId"], "s-1");
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::ConversationMessage;
use crate::error::WizardError;

/// Frames accepted from the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Free text typed by the user.
    UserMessage {
        /// The message text.
        content: String,
    },
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// Anything other than a `user_message` with non-blank `content` is a
    /// [`WizardError::Validation`].
    pub fn parse(frame: &str) -> Result<Self, WizardError> {
        let msg: Self =
            serde_json::from_str(frame).map_err(|e| WizardError::Validation(e.to_string()))?;
        match &msg {
            Self::UserMessage { content } if content.trim().is_empty() => {
                Err(WizardError::Validation("empty content".to_string()))
            }
            Self::UserMessage { .. } => Ok(msg),
        }
    }
}

/// A question as presented to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionPayload {
    pub id: String,
    pub text: String,
}

impl QuestionPayload {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Frames pushed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// A brand-new session was created for this connection.
    SessionStarted { session_id: String },

    /// An incomplete session was resumed; no new question is asked.
    SessionResumed {
        session_id: String,
        history: Vec<ConversationMessage>,
    },

    /// The next question to answer.
    NextQuestion {
        session_id: String,
        question: QuestionPayload,
    },

    /// All questions answered; the server closes the connection next.
    SessionComplete {
        session_id: String,
        document_id: String,
    },

    /// A recoverable failure of the current turn.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    /// Build an `error` frame from a wizard error.
    pub fn error(session_id: Option<&str>, err: &WizardError) -> Self {
        Self::Error {
            session_id: session_id.map(ToString::to_string),
            message: err.client_message(),
        }
    }

    /// The `type` discriminant as sent on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionResumed { .. } => "session_resumed",
            Self::NextQuestion { .. } => "next_question",
            Self::SessionComplete { .. } => "session_complete",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;

    #[test]
    fn test_parse_user_message() {
        let msg = ClientMessage::parse(r#"{"type":"user_message","content":"I need an NDA"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::UserMessage {
                content: "I need an NDA".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for frame in [
            r#"{"type":"user_message"}"#,
            r#"{"type":"ping","content":"x"}"#,
            r#"{"content":"no type"}"#,
            r#"{"type":"user_message","content":42}"#,
            r#"{"type":"user_message","content":"   "}"#,
            "not json",
        ] {
            assert!(
                matches!(ClientMessage::parse(frame), Err(WizardError::Validation(_))),
                "frame should be rejected: {frame}"
            );
        }
    }

    #[test]
    fn test_session_complete_wire_shape() {
        let msg = ServerMessage::SessionComplete {
            session_id: "s-1".into(),
            document_id: "d-1".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "session_complete");
        assert_eq!(json["documentId"], "d-1");
        assert_eq!(msg.kind(), "session_complete");
    }

    #[test]
    fn test_session_resumed_carries_history() {
        let msg = ServerMessage::SessionResumed {
            session_id: "s-1".into(),
            history: vec![ConversationMessage::assistant("Who are the parties?")],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["history"][0]["role"], Role::Assistant.as_str());
        assert_eq!(json["history"][0]["content"], "Who are the parties?");
    }

    #[test]
    fn test_error_frame_omits_missing_session() {
        let msg = ServerMessage::error(None, &WizardError::ClassificationMiss);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert!(json.get("sessionId").is_none());
    }
}
