//! Injected similarity capability for widened cache lookups.
//!
//! The deterministic question-hash path is authoritative; similarity only
//! widens a miss. The scoring function itself is an external collaborator —
//! hubs accept any implementation of [`Similarity`].

use cairn_core::crypto::normalize_question;

/// Scores how close two questions are, in [0, 1].
pub trait Similarity: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Token-overlap (Jaccard) similarity over normalized questions.
///
/// A deliberately simple stand-in so the widened path is exercisable
/// without a semantic model behind it.
pub struct TokenOverlap;

impl Similarity for TokenOverlap {
    fn score(&self, a: &str, b: &str) -> f64 {
        let a = normalize_question(a);
        let b = normalize_question(b);
        let set_a: std::collections::HashSet<&str> = a.split(' ').collect();
        let set_b: std::collections::HashSet<&str> = b.split(' ').collect();
        if set_a.is_empty() || set_b.is_empty() {
            return 0.0;
        }
        let intersection = set_a.intersection(&set_b).count();
        let union = set_a.union(&set_b).count();
        intersection as f64 / union as f64
    }
}
