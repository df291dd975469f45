//! Heuristic token counting.
//!
//! Providers that expose exact tokenizers can override
//! [`super::Provider::count_tokens`]; this default uses the common
//! four-characters-per-token approximation plus a fixed per-message
//! framing overhead, which tracks real tokenizers closely enough for
//! accounting and pre-flight length checks.

use super::provider::ChatMessage;

/// Per-message framing overhead in tokens.
const MESSAGE_OVERHEAD: u32 = 4;

/// Estimate tokens for a piece of text.
pub fn estimate_text_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    (chars as u32).div_ceil(4).max(1)
}

/// Estimate input tokens for a message list.
pub fn estimate_message_tokens(messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|m| MESSAGE_OVERHEAD + estimate_text_tokens(&m.content))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate_text_tokens(""), 0);
    }

    #[test]
    fn short_text_rounds_up() {
        assert_eq!(estimate_text_tokens("hi"), 1);
        assert_eq!(estimate_text_tokens("12345"), 2);
    }

    #[test]
    fn messages_add_framing_overhead() {
        let messages = vec![ChatMessage::user("12345678")]; // 2 tokens of text
        assert_eq!(estimate_message_tokens(&messages), MESSAGE_OVERHEAD + 2);
    }

    #[test]
    fn multibyte_text_counts_chars_not_bytes() {
        // Four characters, twelve bytes.
        assert_eq!(estimate_text_tokens("日本語字"), 1);
    }
}
