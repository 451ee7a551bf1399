//! Conversation builder for the text generation stage.

use parley_core::config::DEFAULT_SYSTEM_PROMPT;
use parley_core::types::ChatMessage;

/// Build the single-turn conversation for a prompt.
///
/// Only the current turn is sent; no history is kept between invocations.
pub fn build_conversation(system_prompt: Option<&str>, prompt: &str) -> Vec<ChatMessage> {
    let system = system_prompt
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);

    vec![ChatMessage::system(system), ChatMessage::user(prompt.trim())]
}
