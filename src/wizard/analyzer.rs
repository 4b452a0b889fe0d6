//! Preemptive answer extraction.
//!
//! One completion call decides which of the still-unanswered questions the
//! latest message answers and what to ask next. The completion is asked for
//! a JSON object of the form:
//!
//! ```json
//! {
//!   "answered_question_ids": ["q1", "q2"],
//!   "answers": { "q1": "Acme Inc and Beta LLC", "q2": "1 March 2025" },
//!   "next_question_id": "q3",
//!   "next_question": "Which state's law should govern the agreement?"
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::domain::{ConversationMessage, Question};
use crate::error::{WizardError, with_timeout};
use crate::llm::CompletionService;
use crate::protocol::QuestionPayload;

const ANALYSIS_INSTRUCTIONS: &str = "You extract answers for a document form. \
Given the unanswered questions and the conversation so far, decide which of the \
unanswered questions the user's latest message answers. A message may answer \
several questions at once, including ones not asked yet, or none at all. \
Then write the single next question to ask, choosing among the questions that \
remain unanswered. Respond with a JSON object with keys \
\"answered_question_ids\" (array of ids), \"answers\" (object mapping each \
answered id to the value given), \"next_question_id\" (id or null) and \
\"next_question\" (text or null).";

/// Sanitised analyzer result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    /// Newly answered `(question id, answer)` pairs, in template order.
    pub answered: Vec<(String, String)>,
    /// What to ask next, or `None` when nothing remains.
    pub next_question: Option<QuestionPayload>,
}

pub struct AnswerAnalyzer {
    completion: Arc<dyn CompletionService>,
    timeout: Duration,
}

impl std::fmt::Debug for AnswerAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerAnalyzer")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AnswerAnalyzer {
    pub fn new(completion: Arc<dyn CompletionService>, timeout: Duration) -> Self {
        Self {
            completion,
            timeout,
        }
    }

    /// Analyze `message` against the `remaining` questions.
    ///
    /// `remaining` must be in template order; answered questions must not be
    /// passed in. Ids outside `remaining` are dropped from the result.
    pub async fn analyze(
        &self,
        message: &str,
        remaining: &[&Question],
        history: &[ConversationMessage],
    ) -> Result<Analysis, WizardError> {
        let context = build_context(remaining, history);
        let prompt = format!("Latest user message:\n{message}");

        let raw = with_timeout("completion", self.timeout, async {
            self.completion
                .complete_json(&prompt, Some(&context))
                .await
                .map_err(|e| WizardError::from_service("completion", e))
        })
        .await?;

        interpret(&raw, message, remaining)
    }
}

fn build_context(remaining: &[&Question], history: &[ConversationMessage]) -> String {
    let mut ctx = String::from(ANALYSIS_INSTRUCTIONS);
    ctx.push_str("\n\nUnanswered questions:");
    for q in remaining {
        let _ = write!(ctx, "\n- {}: {}", q.id, q.text);
    }
    if !history.is_empty() {
        ctx.push_str("\n\nConversation so far:");
        for m in history {
            let _ = write!(ctx, "\n{}: {}", m.role.as_str(), m.content);
        }
    }
    ctx
}

fn malformed(detail: &str) -> WizardError {
    WizardError::MalformedResponse {
        service: "completion",
        detail: detail.to_string(),
    }
}

/// Validate the completion's JSON and reduce it to known questions.
fn interpret(raw: &Value, message: &str, remaining: &[&Question]) -> Result<Analysis, WizardError> {
    let ids = raw
        .get("answered_question_ids")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing answered_question_ids array"))?;

    let mut claimed = Vec::with_capacity(ids.len());
    for id in ids {
        claimed.push(
            id.as_str()
                .ok_or_else(|| malformed("answered_question_ids must hold strings"))?,
        );
    }

    let values: BTreeMap<&str, &str> = raw
        .get("answers")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
                .collect()
        })
        .unwrap_or_default();

    let answered: Vec<(String, String)> = remaining
        .iter()
        .filter(|q| claimed.contains(&q.id.as_str()))
        .map(|q| {
            let value = values
                .get(q.id.as_str())
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .unwrap_or(message);
            (q.id.clone(), value.to_string())
        })
        .collect();

    let still_open: Vec<&Question> = remaining
        .iter()
        .copied()
        .filter(|q| !answered.iter().any(|(id, _)| *id == q.id))
        .collect();

    let proposed_text = raw
        .get("next_question")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let proposed_id = raw.get("next_question_id").and_then(Value::as_str);

    let next_question = match still_open.first() {
        None => None,
        Some(first_open) => {
            let chosen = proposed_id.and_then(|id| still_open.iter().find(|q| q.id == id));
            // A rejected id discards the text proposed with it.
            let text = match (proposed_id, chosen) {
                (Some(_), None) => None,
                _ => proposed_text,
            };
            let target = chosen.unwrap_or(first_open);
            Some(QuestionPayload::new(
                target.id.clone(),
                text.unwrap_or(&target.text),
            ))
        }
    };

    Ok(Analysis {
        answered,
        next_question,
    })
}
