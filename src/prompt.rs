//! Prompt templates and grounded prompt assembly.
//!
//! The document answers in first person, so the persona casts the model
//! as the document itself. Assembly is deterministic: persona, then
//! retrieved context in rank order (each excerpt labeled with its
//! position in the source), then a bounded window of recent turns, then
//! the question. When the result exceeds the character budget, the
//! oldest conversation turns go first, then the lowest-ranked excerpts.
//! The persona and the current question are never truncated.

use crate::session::{Role, Turn};
use crate::store::ScoredChunk;

/// Default first-person document persona.
pub const DOCUMENT_PERSONA: &str = "You are a document brought to life. Speak in first \
person, as the document itself: use \"I\", \"my contents\", and self-referential \
language. Ground every answer in the excerpts provided below; cite the part of \
yourself you are drawing from. If the excerpts do not contain the answer, say so \
plainly instead of inventing one. Stay in character even when declining.";

/// Returned verbatim for off-topic questions; never produced by the model.
pub const OFF_TOPIC_RESPONSE: &str = "I'm afraid I don't know much about that. I only \
contain information related to my own contents — ask me about what I cover and I'll \
gladly help.";

/// Returned verbatim for detected injection attempts; never produced by the model.
pub const INJECTION_RESPONSE: &str = "I'm here to help you understand my content. I \
can't change who I am or how I answer, but please ask me anything about what I contain.";

/// A composed prompt: system instructions plus the user payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    /// Total size in bytes, the unit of the composer's budget.
    pub fn len(&self) -> usize {
        self.system.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_empty() && self.user.is_empty()
    }
}

/// Assemble a grounded prompt within `max_chars`.
///
/// `chunks` must already be in rank order (best first); `history` in
/// chronological order. `history_window` bounds how many recent turns
/// are offered before the budget is even considered.
pub fn compose(
    persona: &str,
    chunks: &[ScoredChunk],
    history: &[Turn],
    question: &str,
    history_window: usize,
    max_chars: usize,
) -> Prompt {
    let mut excerpts: Vec<String> = chunks
        .iter()
        .map(|sc| {
            format!(
                "[excerpt {} of my contents]\n{}",
                sc.chunk.index + 1,
                sc.chunk.text
            )
        })
        .collect();

    let start = history.len().saturating_sub(history_window);
    let mut turns: Vec<String> = history[start..]
        .iter()
        .map(|turn| match turn.role {
            Role::User => format!("Reader: {}", turn.text),
            Role::Document => format!("Me: {}", turn.text),
        })
        .collect();

    let mut prompt = render(persona, &excerpts, &turns, question);

    // Trim to budget: oldest turns first, then lowest-ranked excerpts.
    while prompt.len() > max_chars && !turns.is_empty() {
        turns.remove(0);
        prompt = render(persona, &excerpts, &turns, question);
    }
    while prompt.len() > max_chars && !excerpts.is_empty() {
        excerpts.pop();
        prompt = render(persona, &excerpts, &turns, question);
    }

    prompt
}

fn render(persona: &str, excerpts: &[String], turns: &[String], question: &str) -> Prompt {
    let mut user = String::new();

    if !excerpts.is_empty() {
        user.push_str("## Relevant excerpts from my contents\n\n");
        user.push_str(&excerpts.join("\n\n"));
        user.push_str("\n\n");
    }

    if !turns.is_empty() {
        user.push_str("## Our conversation so far\n\n");
        user.push_str(&turns.join("\n"));
        user.push_str("\n\n");
    }

    user.push_str("## Current question\n\n");
    user.push_str(question);

    Prompt {
        system: persona.to_string(),
        user,
    }
}
