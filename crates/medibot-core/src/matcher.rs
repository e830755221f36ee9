//! Nearest-neighbour identity resolution over enrolled embeddings.

use crate::types::Embedding;

/// Default distance bound for both the per-entry match flag and the
/// accepted best match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Distance bound for L2-normalized ArcFace (w600k) embeddings. Unit
/// vectors satisfy `d² = 2 - 2·cos`, so 1.10 corresponds to a cosine
/// similarity of about 0.40.
pub const ARCFACE_MATCH_THRESHOLD: f32 = 1.10;

/// One enrolled embedding and the user it belongs to.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub user_id: String,
    pub embedding: Embedding,
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Euclidean distance of the closest entry, if any entry was comparable.
    pub distance: Option<f32>,
    /// User owning the closest entry (only set on a match).
    pub user_id: Option<String>,
}

impl MatchResult {
    fn no_match(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            distance,
            user_id: None,
        }
    }
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[GalleryEntry]) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher.
///
/// Every entry within `tolerance` is flagged as a candidate. The closest
/// entry wins (first one on ties) and is accepted only when at least one
/// candidate was flagged and its distance is strictly below `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_MATCH_THRESHOLD,
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Embedding, gallery: &[GalleryEntry]) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        let mut any_within_tolerance = false;

        // Visit every entry; no early exit on a close hit.
        for (i, entry) in gallery.iter().enumerate() {
            if entry.embedding.dim() != query.dim() {
                tracing::warn!(
                    user_id = %entry.user_id,
                    expected = query.dim(),
                    actual = entry.embedding.dim(),
                    "skipping gallery entry with mismatched dimensionality"
                );
                continue;
            }

            let dist = query.euclidean_distance(&entry.embedding);
            if !dist.is_finite() {
                continue;
            }
            tracing::debug!(user_id = %entry.user_id, distance = dist, "compared");

            if dist <= self.tolerance {
                any_within_tolerance = true;
            }
            if best.map_or(true, |(_, best_dist)| dist < best_dist) {
                best = Some((i, dist));
            }
        }

        match best {
            Some((idx, dist)) if any_within_tolerance && dist < self.threshold => MatchResult {
                matched: true,
                distance: Some(dist),
                user_id: Some(gallery[idx].user_id.clone()),
            },
            Some((_, dist)) => MatchResult::no_match(Some(dist)),
            None => MatchResult::no_match(None),
        }
    }
}
