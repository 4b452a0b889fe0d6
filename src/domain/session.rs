//! Wizard sessions and their conversation history.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::template::{Question, Template};

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user filling in the document.
    User,
    /// The wizard asking questions.
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single append-only entry of a session's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Role of the message author.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// When the message was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConversationMessage {
    /// Create a user message stamped with the current time.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }

    /// Create an assistant message stamped with the current time.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Position of a session in the wizard state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No template bound yet; the next message is classified.
    Unbound,
    /// Template bound, at least one question unanswered.
    InProgress,
    /// Terminal. A document has been generated.
    Complete,
}

/// Durable record of one user's progress through one template.
///
/// A session without a template never has answered questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub history: Vec<ConversationMessage>,
    #[serde(default)]
    pub answered_question_ids: BTreeSet<String>,
    /// Extracted answer text keyed by question id.
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
    /// Number of answered questions as of the last persisted turn.
    #[serde(default)]
    pub current_question_index: usize,
    #[serde(default)]
    pub complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh, unbound session for `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            template_id: None,
            history: Vec::new(),
            answered_question_ids: BTreeSet::new(),
            answers: BTreeMap::new(),
            current_question_index: 0,
            complete: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.complete {
            SessionState::Complete
        } else if self.template_id.is_some() {
            SessionState::InProgress
        } else {
            SessionState::Unbound
        }
    }

    /// Questions of `template` not yet answered, in declared order.
    #[must_use]
    pub fn remaining_questions<'a>(&self, template: &'a Template) -> Vec<&'a Question> {
        template
            .questions
            .iter()
            .filter(|q| !self.answered_question_ids.contains(&q.id))
            .collect()
    }

    /// Add newly answered ids and their values.
    ///
    /// Ids already present are absorbed without effect, so the answered set
    /// only ever grows. Returns how many ids were new.
    pub fn merge_answers<I>(&mut self, answered: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut added = 0;
        for (id, value) in answered {
            if self.answered_question_ids.insert(id.clone()) {
                self.answers.insert(id, value);
                added += 1;
            }
        }
        self.current_question_index = self.answered_question_ids.len();
        added
    }

    /// Append a message and bump the update timestamp.
    pub fn push_message(&mut self, message: ConversationMessage) {
        self.history.push(message);
        self.updated_at = Utc::now();
    }

    /// Whether this session is incomplete and was last touched before `cutoff`.
    #[must_use]
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        !self.complete && self.updated_at < cutoff
    }
}
