//! Keyword extraction used for implicit knowledge queries and extractive summaries

use crate::memory_db::Message;
use crate::utils::text_utils::TextUtils;
use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
        "of", "with", "by", "is", "am", "are", "was", "were", "be", "been",
        "being", "have", "has", "had", "do", "does", "did", "will", "would",
        "shall", "should", "may", "might", "must", "can", "could", "i", "you",
        "he", "she", "it", "we", "they", "me", "him", "her", "us", "them",
        "my", "your", "his", "its", "our", "their", "mine", "yours", "hers",
        "ours", "theirs", "this", "that", "these", "those", "what", "how",
        "why", "when", "where", "who", "which", "not", "no", "yes", "so",
        "if", "then", "than", "just", "also", "about", "from", "into", "as",
        "there", "here", "all", "any", "some", "please", "thanks", "ok",
    ]
    .into_iter()
    .collect();
}

/// Frequency-ranked keyword extraction.
pub struct TopicExtractor {
    max_topics: usize,
    min_word_length: usize,
}

impl Default for TopicExtractor {
    fn default() -> Self {
        Self {
            max_topics: 8,
            min_word_length: 3,
        }
    }
}

impl TopicExtractor {
    pub fn new(max_topics: usize, min_word_length: usize) -> Self {
        Self {
            max_topics,
            min_word_length,
        }
    }

    /// Most frequent significant words across `texts`. Ties keep the order
    /// of first appearance.
    pub fn keywords<'a, I>(&self, texts: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        let mut position = 0usize;
        for text in texts {
            for token in TextUtils::tokenize(text) {
                if token.chars().count() < self.min_word_length
                    || STOP_WORDS.contains(token.as_str())
                    || token.chars().all(|c| c.is_ascii_digit())
                {
                    continue;
                }
                let entry = counts.entry(token).or_insert((0, position));
                entry.0 += 1;
                position += 1;
            }
        }

        let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        ranked
            .into_iter()
            .take(self.max_topics)
            .map(|(word, _)| word)
            .collect()
    }

    /// Keywords of the `recent_count` newest messages, used as an implicit
    /// search query.
    pub fn extract_from_messages(&self, messages: &[Message], recent_count: usize) -> Vec<String> {
        let start = messages.len().saturating_sub(recent_count);
        self.keywords(messages[start..].iter().map(|m| m.content.as_str()))
    }
}
