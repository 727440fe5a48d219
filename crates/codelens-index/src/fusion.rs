//! Score normalization and weighted fusion for hybrid search.

use std::cmp::Ordering;
use std::collections::HashMap;

/// A raw-scored hit from one retrieval source.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk_id: String,
    pub score: f32,
}

impl Candidate {
    #[must_use]
    pub fn new(chunk_id: impl Into<String>, score: f32) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            score,
        }
    }
}

/// Fused score of one chunk with the normalized components it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedScore {
    pub chunk_id: String,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub text_score: Option<f32>,
}

/// Min-max normalize raw scores to `[0, 1]`, keeping input order.
///
/// If all scores are equal, every score becomes `1.0`.
#[must_use]
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    let Some(min) = scores.iter().copied().reduce(f32::min) else {
        return Vec::new();
    };
    let max = scores.iter().copied().fold(min, f32::max);
    let range = max - min;
    scores
        .iter()
        .map(|s| {
            if range.abs() < f32::EPSILON {
                1.0
            } else {
                ((s - min) / range).clamp(0.0, 1.0)
            }
        })
        .collect()
}

fn normalized_map(candidates: &[Candidate]) -> HashMap<&str, f32> {
    let raw: Vec<f32> = candidates.iter().map(|c| c.score).collect();
    let mut map: HashMap<&str, f32> = HashMap::with_capacity(candidates.len());
    for (c, n) in candidates.iter().zip(normalize_scores(&raw)) {
        map.entry(c.chunk_id.as_str())
            .and_modify(|s| *s = s.max(n))
            .or_insert(n);
    }
    map
}

/// Fuse two candidate lists as `weight · vector + (1 − weight) · text`.
///
/// A chunk missing from one list scores 0 for that component. The result is
/// sorted by fused score, then vector score, then chunk id.
#[must_use]
pub fn fuse(vector: &[Candidate], text: &[Candidate], weight: f32) -> Vec<FusedScore> {
    let weight = weight.clamp(0.0, 1.0);
    let vector_norm = normalized_map(vector);
    let text_norm = normalized_map(text);

    let mut ids: Vec<&str> = Vec::with_capacity(vector_norm.len() + text_norm.len());
    ids.extend(vector.iter().map(|c| c.chunk_id.as_str()));
    ids.extend(text.iter().map(|c| c.chunk_id.as_str()));
    ids.sort_unstable();
    ids.dedup();

    let mut fused: Vec<FusedScore> = ids
        .into_iter()
        .map(|id| {
            let v = vector_norm.get(id).copied();
            let t = text_norm.get(id).copied();
            let score = weight * v.unwrap_or(0.0) + (1.0 - weight) * t.unwrap_or(0.0);
            FusedScore {
                chunk_id: id.to_owned(),
                score: score.clamp(0.0, 1.0),
                vector_score: v,
                text_score: t,
            }
        })
        .collect();

    fused.sort_by(compare_fused);
    fused
}

fn compare_fused(a: &FusedScore, b: &FusedScore) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| {
            b.vector_score
                .unwrap_or(0.0)
                .total_cmp(&a.vector_score.unwrap_or(0.0))
        })
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}
