//! UTF-16 column accounting and card decoding.
//!
//! Internally all columns are Unicode scalar positions over UTF-8 text;
//! editor consumers expect UTF-16 code units. Both derive from the same
//! ranges, so the two views can never drift apart.

/// UTF-16 length of `text`.
pub fn length_utf16(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// UTF-16 column of the `char_col`-th character of `line` (clamped).
pub fn utf16_col(line: &str, char_col: usize) -> usize {
    line.chars().take(char_col).map(char::len_utf16).sum()
}

/// Decode raw card bytes into text.
///
/// Invalid UTF-8 sequences are replaced with U+FFFD; the second component
/// reports whether any replacement happened so a diagnostic can be issued
/// once per file.
pub fn decode_card_text(bytes: &[u8]) -> (String, bool) {
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_owned(), false),
        Err(_) => (String::from_utf8_lossy(bytes).into_owned(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_is_identity() {
        assert_eq!(length_utf16("LR 1,2"), 6);
        assert_eq!(utf16_col("LR 1,2", 3), 3);
    }

    #[test]
    fn astral_characters_count_twice() {
        // U+1D11E (musical symbol) needs a surrogate pair.
        let s = "a\u{1D11E}b";
        assert_eq!(length_utf16(s), 4);
        assert_eq!(utf16_col(s, 1), 1);
        assert_eq!(utf16_col(s, 2), 3);
        assert_eq!(utf16_col(s, 3), 4);
    }

    #[test]
    fn utf16_col_clamps_past_end() {
        assert_eq!(utf16_col("ab", 10), 2);
    }

    #[test]
    fn invalid_bytes_are_replaced_and_flagged() {
        let (text, replaced) = decode_card_text(b"A \xFF B");
        assert!(replaced);
        assert!(text.contains('\u{FFFD}'));

        let (text, replaced) = decode_card_text(b"plain");
        assert!(!replaced);
        assert_eq!(text, "plain");
    }
}
