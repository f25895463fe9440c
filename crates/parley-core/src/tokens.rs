use crate::messages::ChatMessage;

/// Per-message framing overhead added on top of the content estimate.
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Counts tokens for budget accounting. Counts are computed once, when a
/// message is written, and the stored value is authoritative afterwards.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> u32;

    fn count_message(&self, message: &ChatMessage) -> u32 {
        MESSAGE_OVERHEAD_TOKENS + self.count_text(&message.content)
    }
}

/// Character-based estimate: one token per four bytes of UTF-8, rounded up,
/// with CJK characters counted as one token each.
#[derive(Clone, Copy, Debug, Default)]
pub struct CharEstimator;

impl TokenCounter for CharEstimator {
    fn count_text(&self, text: &str) -> u32 {
        let (wide, narrow_bytes) = text.chars().fold((0u32, 0usize), |(wide, narrow), c| {
            if is_wide(c) {
                (wide + 1, narrow)
            } else {
                (wide, narrow + c.len_utf8())
            }
        });
        wide + (narrow_bytes as u32).div_ceil(4)
    }
}

fn is_wide(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF     // kana
        | 0x3400..=0x4DBF   // CJK extension A
        | 0x4E00..=0x9FFF   // CJK unified
        | 0xAC00..=0xD7AF   // hangul
        | 0xF900..=0xFAFF   // CJK compatibility
        | 0xFF00..=0xFFEF)  // full-width forms
}
