//! Text processing helpers shared by search, summarization and context assembly

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
    static ref TOKEN_REGEX: Regex = Regex::new(r"[\p{L}\p{N}]+").unwrap();
    static ref SENTENCE_END_REGEX: Regex = Regex::new(r"[.!?](\s|$)").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Lowercased alphanumeric tokens in order of appearance.
    pub fn tokenize(text: &str) -> Vec<String> {
        TOKEN_REGEX
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect()
    }

    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Lowercased, whitespace-collapsed form used for phrase comparison.
    pub fn normalize_phrase(text: &str) -> String {
        Self::normalize_whitespace(text).trim().to_lowercase()
    }

    /// Cuts `text` to at most `max_bytes`, never splitting a character, and
    /// appends an ellipsis when anything was removed.
    pub fn truncate_with_ellipsis(text: &str, max_bytes: usize) -> Cow<'_, str> {
        if text.len() <= max_bytes {
            return Cow::Borrowed(text);
        }
        if max_bytes <= 3 {
            return Cow::Borrowed("...");
        }
        let mut end = max_bytes - 3;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let mut result = String::with_capacity(end + 3);
        result.push_str(&text[..end]);
        result.push_str("...");
        Cow::Owned(result)
    }

    /// The first sentence, or the whole trimmed text if it has no terminator.
    pub fn first_sentence(text: &str) -> &str {
        let trimmed = text.trim();
        match SENTENCE_END_REGEX.find(trimmed) {
            Some(m) => trimmed[..m.start() + 1].trim(),
            None => trimmed,
        }
    }
}
