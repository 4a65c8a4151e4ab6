//! Keyword scoring
//!
//! FTS5 query sanitization for backends with native full-text support, plus a
//! BM25-style in-memory scorer used as the lexical fallback when the record
//! store publishes no `full_text` capability.

use std::collections::HashMap;

// ============================================================================
// FTS5 SANITIZATION
// ============================================================================

/// Sanitize free text into a safe FTS5 query.
///
/// User queries must never reach FTS5 raw: bare `-`, `:`, quotes, and
/// operator words change query semantics or error out. Each token is quoted
/// (making it a phrase over the tokenizer's sub-tokens, which keeps
/// `INC-00042`-style identifiers matchable) and tokens are joined with OR.
pub fn sanitize_fts5_query(query: &str) -> String {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '_'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();
    tokens.join(" OR ")
}

// ============================================================================
// IN-MEMORY LEXICAL SCORER
// ============================================================================

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// BM25 over an in-memory candidate set.
///
/// Used when the backend cannot score full text itself: the engine scans a
/// bounded candidate set out of the record store and ranks it here.
pub struct LexicalScorer {
    docs: Vec<(String, Vec<String>)>,
    doc_freq: HashMap<String, usize>,
    avg_len: f64,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

impl LexicalScorer {
    /// Index a candidate set of `(id, content)` pairs.
    pub fn new<'a>(docs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let docs: Vec<(String, Vec<String>)> = docs
            .into_iter()
            .map(|(id, content)| (id.to_string(), tokenize(content)))
            .collect();

        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for (_, tokens) in &docs {
            let mut seen: Vec<&String> = Vec::new();
            for token in tokens {
                if !seen.contains(&token) {
                    *doc_freq.entry(token.clone()).or_default() += 1;
                    seen.push(token);
                }
            }
        }
        let total_len: usize = docs.iter().map(|(_, t)| t.len()).sum();
        let avg_len = if docs.is_empty() {
            1.0
        } else {
            total_len as f64 / docs.len() as f64
        };
        Self {
            docs,
            doc_freq,
            avg_len,
        }
    }

    /// Number of indexed candidates.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the candidate set is empty.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Score the candidates against a query, best first. Documents with no
    /// matching term are omitted.
    pub fn score(&self, query: &str, top_k: usize) -> Vec<(String, f64)> {
        if top_k == 0 || self.docs.is_empty() {
            return vec![];
        }
        let query_terms = tokenize(query);
        let n = self.docs.len() as f64;

        let mut scored: Vec<(String, f64)> = self
            .docs
            .iter()
            .filter_map(|(id, tokens)| {
                let doc_len = tokens.len() as f64;
                let mut score = 0.0;
                for term in &query_terms {
                    let tf = tokens.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / self.avg_len);
                    score += idf * (tf * (BM25_K1 + 1.0)) / denom;
                }
                (score > 0.0).then(|| (id.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);
        scored
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_quotes_tokens() {
        assert_eq!(
            sanitize_fts5_query("replication lag"),
            "\"replication\" OR \"lag\""
        );
        assert_eq!(sanitize_fts5_query("INC-00042"), "\"INC-00042\"");
    }

    #[test]
    fn sanitize_strips_operators_and_quotes() {
        let q = sanitize_fts5_query("drop\" OR * (everything:)");
        assert!(!q.contains("\"\""));
        assert!(q.contains("\"drop\""));
        assert!(q.contains("\"everything\""));
    }

    #[test]
    fn sanitize_empty_query() {
        assert_eq!(sanitize_fts5_query("  !! ?? "), "");
    }

    #[test]
    fn bm25_prefers_matching_docs() {
        let scorer = LexicalScorer::new([
            ("r1", "postgres hot spare replication lag"),
            ("r2", "hot water pipe leak under the spare sink"),
            ("r3", "replication lag alert from monitoring"),
        ]);
        let hits = scorer.score("replication lag", 10);
        assert_eq!(hits.len(), 2);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"r1"));
        assert!(ids.contains(&"r3"));
    }

    #[test]
    fn bm25_rewards_rare_terms() {
        let scorer = LexicalScorer::new([
            ("common", "the quick brown fox"),
            ("rare", "the quick zyzzyva fox"),
            ("other", "the slow brown turtle"),
        ]);
        let hits = scorer.score("zyzzyva", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "rare");
    }

    #[test]
    fn top_k_zero_is_empty() {
        let scorer = LexicalScorer::new([("a", "content")]);
        assert!(scorer.score("content", 0).is_empty());
    }
}
