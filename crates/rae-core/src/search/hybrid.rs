//! Hybrid fusion
//!
//! Combines ordered candidate lists from heterogeneous strategies using
//! Reciprocal Rank Fusion. RRF needs no score calibration across strategies:
//! `score(d) = sum over strategies of 1/(k + rank(d))`, with `k = 60` by
//! default. Tie-breaks are deterministic: importance, usage counter, recency
//! of last access, then lexicographic id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::search::cosine_similarity;

// ============================================================================
// FUSION
// ============================================================================

/// Fuse ordered candidate lists with Reciprocal Rank Fusion.
///
/// Input lists are ordered best-first; scores inside them are ignored (RRF
/// only consumes ranks). Returns the fused score per candidate id.
pub fn reciprocal_rank_fusion(lists: &[Vec<(String, f64)>], k: f64) -> HashMap<String, f64> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for list in lists {
        for (rank, (id, _)) in list.iter().enumerate() {
            *scores.entry(id.clone()).or_default() += 1.0 / (k + rank as f64 + 1.0);
        }
    }
    scores
}

/// Metadata the tie-break order consults.
#[derive(Debug, Clone, Copy)]
pub struct TieBreakMeta {
    /// Record importance
    pub importance: f64,
    /// Record usage counter
    pub usage_count: i64,
    /// Last access time
    pub last_accessed_at: DateTime<Utc>,
}

/// Sort fused `(id, score)` pairs best-first with the deterministic tie-break
/// chain: higher importance, higher usage, more recent access, id ascending.
pub fn sort_with_tie_breaks(
    mut fused: Vec<(String, f64)>,
    meta: &HashMap<String, TieBreakMeta>,
) -> Vec<(String, f64)> {
    fused.sort_by(|(a_id, a_score), (b_id, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a = meta.get(a_id);
                let b = meta.get(b_id);
                match (a, b) {
                    (Some(a), Some(b)) => b
                        .importance
                        .partial_cmp(&a.importance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.usage_count.cmp(&a.usage_count))
                        .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at)),
                    _ => std::cmp::Ordering::Equal,
                }
            })
            .then_with(|| a_id.cmp(b_id))
    });
    fused
}

// ============================================================================
// SUBSCORES
// ============================================================================

/// Recency subscore: exponential decay of the last access with a one-week
/// scale, mapped to (0, 1].
pub fn recency_score(last_accessed_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_secs = (now - last_accessed_at).num_seconds().max(0) as f64;
    let week_secs = 7.0 * 86_400.0;
    (-age_secs / week_secs).exp()
}

/// Information-density subscore: unique-token ratio damped for very short
/// content. Favors substantive records over fragments and over boilerplate
/// repetition.
pub fn density_score(content: &str) -> f64 {
    let tokens: Vec<String> = content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let unique: std::collections::HashSet<&String> = tokens.iter().collect();
    let unique_ratio = unique.len() as f64 / tokens.len() as f64;
    let length_factor = (tokens.len() as f64 / 40.0).min(1.0);
    unique_ratio * length_factor
}

/// Greedy diversity shaping over cheap-space vectors.
///
/// Walks candidates best-first; a candidate whose cosine overlap with an
/// already-selected result exceeds `tau` takes a diversity subscore of 0.0,
/// everyone else 1.0. Candidates without a vector pass through untouched.
pub fn diversity_shaped(
    ordered_ids: &[String],
    vectors: &HashMap<String, Vec<f32>>,
    tau: f64,
) -> HashMap<String, f64> {
    let mut selected: Vec<&Vec<f32>> = Vec::new();
    let mut scores: HashMap<String, f64> = HashMap::new();
    for id in ordered_ids {
        match vectors.get(id) {
            Some(vector) => {
                let redundant = selected
                    .iter()
                    .any(|s| cosine_similarity(s, vector) as f64 > tau);
                if redundant {
                    scores.insert(id.clone(), 0.0);
                } else {
                    scores.insert(id.clone(), 1.0);
                    selected.push(vector);
                }
            }
            None => {
                scores.insert(id.clone(), 1.0);
            }
        }
    }
    scores
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ids: &[&str]) -> Vec<(String, f64)> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), 1.0 - i as f64 * 0.1))
            .collect()
    }

    #[test]
    fn rrf_rewards_agreement() {
        let fused = reciprocal_rank_fusion(
            &[list(&["a", "b", "c"]), list(&["b", "a", "d"])],
            60.0,
        );
        // a and b appear in both lists; c and d only once.
        assert!(fused["a"] > fused["c"]);
        assert!(fused["b"] > fused["d"]);
    }

    #[test]
    fn rrf_rank_position_matters() {
        let fused = reciprocal_rank_fusion(&[list(&["a", "b"])], 60.0);
        assert!(fused["a"] > fused["b"]);
        assert!((fused["a"] - 1.0 / 61.0).abs() < 1e-9);
        assert!((fused["b"] - 1.0 / 62.0).abs() < 1e-9);
    }

    #[test]
    fn tie_breaks_follow_stated_order() {
        let now = Utc::now();
        let mut meta = HashMap::new();
        meta.insert(
            "low".to_string(),
            TieBreakMeta {
                importance: 0.2,
                usage_count: 9,
                last_accessed_at: now,
            },
        );
        meta.insert(
            "high".to_string(),
            TieBreakMeta {
                importance: 0.9,
                usage_count: 0,
                last_accessed_at: now,
            },
        );
        let sorted = sort_with_tie_breaks(
            vec![("low".into(), 0.5), ("high".into(), 0.5)],
            &meta,
        );
        assert_eq!(sorted[0].0, "high");

        // Equal importance falls through to usage.
        meta.insert(
            "busy".to_string(),
            TieBreakMeta {
                importance: 0.9,
                usage_count: 5,
                last_accessed_at: now,
            },
        );
        let sorted = sort_with_tie_breaks(
            vec![("high".into(), 0.5), ("busy".into(), 0.5)],
            &meta,
        );
        assert_eq!(sorted[0].0, "busy");
    }

    #[test]
    fn final_tie_break_is_lexicographic() {
        let sorted = sort_with_tie_breaks(
            vec![("zz".into(), 0.5), ("aa".into(), 0.5)],
            &HashMap::new(),
        );
        assert_eq!(sorted[0].0, "aa");
    }

    #[test]
    fn recency_decays() {
        let now = Utc::now();
        let fresh = recency_score(now, now);
        let old = recency_score(now - chrono::Duration::days(30), now);
        assert!(fresh > 0.99);
        assert!(old < fresh);
        assert!(old > 0.0);
    }

    #[test]
    fn density_penalizes_repetition() {
        let repetitive = density_score("lag lag lag lag lag lag lag lag lag lag");
        let varied = density_score(
            "replication lag spiked after the failover because the hot spare \
             was still applying WAL segments from the primary queue",
        );
        assert!(varied > repetitive);
    }

    #[test]
    fn diversity_zeroes_near_duplicates() {
        let mut vectors = HashMap::new();
        vectors.insert("a".to_string(), vec![1.0, 0.0]);
        vectors.insert("a_copy".to_string(), vec![0.999, 0.001]);
        vectors.insert("b".to_string(), vec![0.0, 1.0]);
        let order = vec!["a".to_string(), "a_copy".to_string(), "b".to_string()];

        let scores = diversity_shaped(&order, &vectors, 0.92);
        assert_eq!(scores["a"], 1.0);
        assert_eq!(scores["a_copy"], 0.0);
        assert_eq!(scores["b"], 1.0);
    }
}
