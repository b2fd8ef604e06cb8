use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One stored score for an unordered pair of profiles in an event.
/// `profile_id_1 < profile_id_2` always holds for rows built by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarityRecord {
    pub event_id: String,
    pub profile_id_1: String,
    pub profile_id_2: String,
    pub similarity_score: f64,
}

impl SimilarityRecord {
    pub fn new(event_id: &str, a: &str, b: &str, similarity_score: f64) -> Self {
        let (first, second) = canonical_pair(a, b);
        SimilarityRecord {
            event_id: event_id.to_string(),
            profile_id_1: first.to_string(),
            profile_id_2: second.to_string(),
            similarity_score,
        }
    }

    /// The other side of the pair, or `None` when `subject` is not part of it.
    pub fn counterpart(&self, subject: &str) -> Option<&str> {
        if self.profile_id_1 == subject {
            Some(&self.profile_id_2)
        } else if self.profile_id_2 == subject {
            Some(&self.profile_id_1)
        } else {
            None
        }
    }
}

/// Orders two identifiers so that the same unordered pair always maps to the same row.
pub fn canonical_pair<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x < y {
        (x, y)
    } else {
        (y, x)
    }
}

fn dot_product(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| *x as f64 * *y as f64)
        .sum()
}

fn magnitude(a: &[f32]) -> f64 {
    a.iter().map(|x| *x as f64 * *x as f64).sum::<f64>().sqrt()
}

/// Cosine similarity in double precision.
///
/// Empty or length-mismatched inputs and zero-norm vectors score `0.0`.
/// The result is not clamped.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mag_a = magnitude(a);
    let mag_b = magnitude(b);
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot_product(a, b) / (mag_a * mag_b)
}

#[derive(Clone, Debug)]
pub struct Scored<T> {
    pub profile_id: String,
    pub similarity_score: f64,
    pub item: T,
}

/// Highest score first, equal scores by ascending profile id.
pub fn rank<T>(scored: &mut [Scored<T>]) {
    scored.sort_by(|a, b| match b.similarity_score.total_cmp(&a.similarity_score) {
        Ordering::Equal => a.profile_id.cmp(&b.profile_id),
        other => other,
    });
}
