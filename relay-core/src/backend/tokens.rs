//! Token estimation fallback for providers that don't report usage.
//!
//! Per spec.md §4.2: CJK code points cost 1.5 chars/token, everything else costs
//! 4 chars/token.

use crate::response::TokenCounts;

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF     // hiragana/katakana
        | 0x3400..=0x4DBF   // CJK ext A
        | 0x4E00..=0x9FFF   // CJK unified ideographs
        | 0xAC00..=0xD7A3   // hangul syllables
        | 0x20000..=0x2A6DF // CJK ext B
    )
}

pub fn estimate_tokens(text: &str) -> u32 {
    let (mut cjk, mut other) = (0u32, 0u32);
    for ch in text.chars() {
        if is_cjk(ch) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    let tokens = (cjk as f64 / 1.5) + (other as f64 / 4.0);
    tokens.ceil() as u32
}

pub fn estimate(prompt: &str, response: &str) -> TokenCounts {
    TokenCounts::new(estimate_tokens(prompt), estimate_tokens(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_uses_four_chars_per_token() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn cjk_uses_one_point_five_chars_per_token() {
        // 3 CJK code points -> ceil(3 / 1.5) == 2
        assert_eq!(estimate_tokens("你好吗"), 2);
    }

    #[test]
    fn mixed_text_sums_both_estimates() {
        let tokens = estimate_tokens("ab你好");
        assert_eq!(tokens, (2.0f64 / 4.0 + 2.0f64 / 1.5).ceil() as u32);
    }
}
