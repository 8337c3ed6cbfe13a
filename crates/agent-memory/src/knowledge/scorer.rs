//! Lexical relevance scoring for knowledge search
use crate::config::SearchWeights;
use crate::memory_db::KnowledgeEntry;
use crate::utils::TextUtils;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;

/// A query split into the forms the scorer compares against.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    phrase: String,
    tokens: HashSet<String>,
}

impl PreparedQuery {
    pub fn new(query: &str) -> Self {
        Self {
            phrase: TextUtils::normalize_phrase(query),
            tokens: TextUtils::tokenize(query).into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.phrase.is_empty() || self.tokens.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub score: f32,
    /// The title equals the query phrase; such entries rank above all others.
    pub exact_title: bool,
}

#[derive(Debug, Clone)]
pub struct KnowledgeScorer {
    weights: SearchWeights,
}

impl KnowledgeScorer {
    pub fn new(weights: SearchWeights) -> Self {
        Self { weights }
    }

    /// Weighted sum of title phrase match, content token overlap and tag
    /// match. A title equal to the phrase earns double the title weight.
    pub fn score(&self, query: &PreparedQuery, entry: &KnowledgeEntry) -> (f32, bool) {
        if query.is_empty() {
            return (0.0, false);
        }

        let title = TextUtils::normalize_phrase(&entry.title);
        let exact_title = title == query.phrase;
        let title_score = if exact_title {
            2.0 * self.weights.title_phrase
        } else if title.contains(&query.phrase) {
            self.weights.title_phrase
        } else {
            0.0
        };

        let content_tokens: HashSet<String> = TextUtils::tokenize(&entry.content).into_iter().collect();
        let overlap = query.tokens.intersection(&content_tokens).count() as f32 / query.tokens.len() as f32;

        let entry_tags: HashSet<String> = entry.tags.iter().map(|t| t.to_lowercase()).collect();
        let tag_hits = query.tokens.iter().filter(|t| entry_tags.contains(*t)).count() as f32;
        let tag_fraction = tag_hits / query.tokens.len() as f32;

        let score = title_score
            + overlap * self.weights.content_overlap
            + tag_fraction * self.weights.tag_match;
        (score, exact_title)
    }

    /// Ranks candidates for `query`. With an empty query every candidate is
    /// kept and ordered by recency; otherwise non-matching entries are dropped.
    pub fn rank(&self, query: &str, candidates: Vec<KnowledgeEntry>, limit: usize) -> Vec<ScoredEntry> {
        let prepared = PreparedQuery::new(query);
        let mut scored: Vec<ScoredEntry> = candidates
            .into_iter()
            .map(|entry| {
                let (score, exact_title) = self.score(&prepared, &entry);
                ScoredEntry {
                    entry,
                    score,
                    exact_title,
                }
            })
            .filter(|s| prepared.is_empty() || s.score > 0.0)
            .collect();

        scored.sort_by(compare);
        scored.truncate(limit);
        scored
    }
}

fn compare(a: &ScoredEntry, b: &ScoredEntry) -> Ordering {
    b.exact_title
        .cmp(&a.exact_title)
        .then_with(|| b.score.total_cmp(&a.score))
        .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
        .then_with(|| a.entry.id.cmp(&b.entry.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::now;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn entry(id: &str, title: &str, content: &str, tags: &[&str]) -> KnowledgeEntry {
        KnowledgeEntry {
            id: id.to_string(),
            category: "general".into(),
            title: title.to_string(),
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            source_conversation_id: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn scorer() -> KnowledgeScorer {
        KnowledgeScorer::new(SearchWeights::default())
    }

    #[test]
    fn test_title_phrase_outweighs_content() {
        let results = scorer().rank(
            "release checklist",
            vec![
                entry("a", "Notes", "the release checklist lives in the wiki", &[]),
                entry("b", "Release checklist for v2", "steps", &[]),
            ],
            10,
        );
        assert_eq!(results[0].entry.id, "b");
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_exact_title_ranks_first() {
        let results = scorer().rank(
            "Deploy Steps",
            vec![
                entry("partial", "Deploy steps for staging", "deploy steps deploy steps", &["deploy", "steps"]),
                entry("exact", "deploy  steps", "unrelated", &[]),
            ],
            10,
        );
        assert_eq!(results[0].entry.id, "exact");
        assert!(results[0].exact_title);
    }

    #[test]
    fn test_tag_match_contributes() {
        let s = scorer();
        let q = PreparedQuery::new("postgres");
        let (tagged, _) = s.score(&q, &entry("t", "x", "y", &["Postgres"]));
        let (untagged, _) = s.score(&q, &entry("u", "x", "y", &[]));
        assert!(tagged > untagged);
        assert_eq!(untagged, 0.0);
    }

    #[test]
    fn test_non_matching_entries_dropped_and_empty_query_keeps_all() {
        let entries = vec![entry("a", "alpha", "one", &[]), entry("b", "beta", "two", &[])];
        assert_eq!(scorer().rank("alpha", entries.clone(), 10).len(), 1);
        assert_eq!(scorer().rank("   ", entries, 10).len(), 2);
    }

    #[test]
    fn test_ties_prefer_recent_updates() {
        let mut older = entry("older", "cache", "x", &[]);
        older.updated_at = now() - chrono::Duration::hours(1);
        let newer = entry("newer", "cache", "x", &[]);
        let results = scorer().rank("cache", vec![older, newer], 10);
        assert_eq!(results[0].entry.id, "newer");
    }

    proptest! {
        #[test]
        fn scores_are_bounded(query in "[a-z ]{0,24}", title in "[a-z ]{0,24}", content in "[a-z ]{0,64}") {
            let weights = SearchWeights::default();
            let (score, _) = scorer().score(&PreparedQuery::new(&query), &entry("p", &title, &content, &["x"]));
            let max = 2.0 * weights.title_phrase + weights.content_overlap + weights.tag_match;
            prop_assert!(score >= 0.0);
            prop_assert!(score <= max + f32::EPSILON);
        }

        #[test]
        fn ranking_is_sorted_and_limited(titles in proptest::collection::vec("[a-c]{1,3}", 0..20), limit in 1usize..10) {
            let entries = titles
                .iter()
                .enumerate()
                .map(|(i, t)| entry(&i.to_string(), t, t, &[]))
                .collect::<Vec<_>>();
            let ranked = scorer().rank("ab", entries, limit);
            prop_assert!(ranked.len() <= limit);
            for pair in ranked.windows(2) {
                prop_assert!(compare(&pair[0], &pair[1]) != Ordering::Greater);
            }
        }
    }
}
