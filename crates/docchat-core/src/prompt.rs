//! Prompt assembly and token estimation.
//!
//! Builds the message list sent to the generation service from the system
//! prompt, retrieved passages (highest score first, cut at the context
//! budget), recent history (newest kept, cut at the history budget), and the
//! user's message. Token counts use a `ceil(chars / 4)` heuristic.

use serde::{Deserialize, Serialize};

use crate::models::{Role, Turn};

pub const CHARS_PER_TOKEN: usize = 4;

/// Note sent in place of a context block when retrieval found nothing.
pub const NO_CONTEXT_NOTE: &str = "No relevant information found in your documents.";

/// Heuristic token count: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> i64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as i64
}

/// How history is trimmed when it exceeds the history budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryTruncation {
    /// Drop single turns, oldest first.
    DropOldestTurns,
    /// Drop oldest turns, then any leading assistant turns, so the kept
    /// history always starts with a user message.
    DropOldestExchanges,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPolicy {
    pub context_token_budget: i64,
    pub history_token_budget: i64,
    pub max_completion_tokens: i64,
    pub truncation: HistoryTruncation,
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self {
            context_token_budget: 1500,
            history_token_budget: 1000,
            max_completion_tokens: 1024,
            truncation: HistoryTruncation::DropOldestTurns,
        }
    }
}

impl PromptPolicy {
    /// Conservative ceiling on a turn's cost, used for the quota
    /// reservation before context and history are known.
    pub fn reservation_estimate(&self, system_prompt: &str, user_text: &str) -> i64 {
        estimate_tokens(system_prompt)
            + estimate_tokens(user_text)
            + self.context_token_budget
            + self.history_token_budget
            + self.max_completion_tokens
    }
}

/// A retrieved chunk offered as context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPassage {
    pub chunk_id: String,
    /// Display name of the source document.
    pub source: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl From<Role> for PromptRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => PromptRole::User,
            Role::Assistant => PromptRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub messages: Vec<PromptMessage>,
    /// Chunks that made it into the context block, in prompt order.
    pub context_chunk_ids: Vec<String>,
    pub estimated_tokens: i64,
}

/// Inputs for one assembly.
pub struct PromptInput<'a> {
    pub system_prompt: &'a str,
    /// Committed turns, oldest first.
    pub history: &'a [Turn],
    pub passages: &'a [ContextPassage],
    pub user_text: &'a str,
    pub use_rag: bool,
}

pub fn assemble(policy: &PromptPolicy, input: &PromptInput<'_>) -> Prompt {
    let mut messages = Vec::new();
    if !input.system_prompt.trim().is_empty() {
        messages.push(PromptMessage {
            role: PromptRole::System,
            content: input.system_prompt.to_string(),
        });
    }

    for turn in select_history(policy, input.history) {
        messages.push(PromptMessage {
            role: turn.role.into(),
            content: turn.text.clone(),
        });
    }

    let mut context_chunk_ids = Vec::new();
    let content = if input.use_rag {
        let (block, ids) = context_block(policy.context_token_budget, input.passages);
        context_chunk_ids = ids;
        let block = if block.is_empty() {
            NO_CONTEXT_NOTE.to_string()
        } else {
            block
        };
        format!("Context: {}\n\nQuestion: {}", block, input.user_text)
    } else {
        input.user_text.to_string()
    };
    messages.push(PromptMessage {
        role: PromptRole::User,
        content,
    });

    let estimated_tokens = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
    Prompt {
        messages,
        context_chunk_ids,
        estimated_tokens,
    }
}

/// Highest-scoring passages first, stopping at the first one that would
/// exceed the budget.
fn context_block(budget: i64, passages: &[ContextPassage]) -> (String, Vec<String>) {
    let mut ordered: Vec<&ContextPassage> = passages.iter().collect();
    ordered.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut used = 0;
    let mut entries = Vec::new();
    let mut ids = Vec::new();
    for p in ordered {
        let entry = format!("From {}: {}", p.source, p.text);
        let cost = estimate_tokens(&entry);
        if used + cost > budget {
            break;
        }
        used += cost;
        entries.push(entry);
        ids.push(p.chunk_id.clone());
    }
    (entries.join("\n\n"), ids)
}

fn select_history<'a>(policy: &PromptPolicy, history: &'a [Turn]) -> &'a [Turn] {
    let mut used = 0;
    let mut start = history.len();
    for (i, turn) in history.iter().enumerate().rev() {
        let cost = estimate_tokens(&turn.text);
        if used + cost > policy.history_token_budget {
            break;
        }
        used += cost;
        start = i;
    }

    if policy.truncation == HistoryTruncation::DropOldestExchanges {
        while start < history.len() && history[start].role != Role::User {
            start += 1;
        }
    }
    &history[start..]
}
