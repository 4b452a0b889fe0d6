//! Token estimation and history windowing for completion prompts.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::domain::ConversationMessage;

/// Per-message framing overhead in the chat format.
const MESSAGE_OVERHEAD: usize = 3;

fn encoder() -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| cl100k_base().ok()).as_ref()
}

#[derive(Debug)]
pub struct TokenService;

impl TokenService {
    /// Estimate tokens for a string using `cl100k_base` (GPT-4/3.5 standard).
    ///
    /// Falls back to roughly four characters per token if the encoder is unavailable.
    pub fn estimate_string(content: &str) -> usize {
        match encoder() {
            Some(bpe) => bpe.encode_with_special_tokens(content).len(),
            None => content.chars().count().div_ceil(4),
        }
    }

    /// Estimate tokens for a list of conversation messages.
    pub fn estimate_messages(messages: &[ConversationMessage]) -> usize {
        messages
            .iter()
            .map(|m| Self::estimate_string(&m.content) + MESSAGE_OVERHEAD)
            .sum::<usize>()
            + MESSAGE_OVERHEAD
    }
}

/// Keep the most recent messages that fit in `token_budget`.
///
/// Order is preserved. The persisted history is never touched; this only
/// shapes what is sent to the completion service.
pub fn window_history(
    history: &[ConversationMessage],
    token_budget: usize,
) -> Vec<ConversationMessage> {
    let mut budget = token_budget;
    let mut tail = Vec::new();

    for msg in history.iter().rev() {
        let t = TokenService::estimate_string(&msg.content) + MESSAGE_OVERHEAD;
        if t <= budget {
            tail.push(msg.clone());
            budget -= t;
        } else {
            break;
        }
    }
    tail.reverse();
    tail
}
