use crate::cache::IdentityCache;
use crate::types::{Embedding, IdentityId};
use serde::Serialize;
use std::sync::Arc;

/// Result of matching a probe embedding against the enrolled population.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchResult {
    /// Best match at or above the threshold.
    Identified {
        identity_id: IdentityId,
        /// Cosine similarity of the best match [-1, 1].
        similarity: f32,
    },
    /// Someone is enrolled, but nobody reached the threshold.
    Unknown,
    /// Nothing enrolled to compare against.
    Empty,
}

/// Strategy for resolving a probe embedding to an enrolled identity.
///
/// Implementations own their view of the gallery; callers only hand over
/// the probe and threshold.
pub trait Matcher {
    fn identify(&self, probe: &Embedding, threshold: f32) -> MatchResult;
}

/// Exhaustive cosine-similarity scan over an [`IdentityCache`] snapshot.
///
/// Exact ties resolve to the smallest [`IdentityId`], independent of the
/// order entries are visited in.
#[derive(Clone)]
pub struct CosineMatcher {
    cache: Arc<IdentityCache>,
}

impl CosineMatcher {
    pub fn new(cache: Arc<IdentityCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }
}

impl Matcher for CosineMatcher {
    fn identify(&self, probe: &Embedding, threshold: f32) -> MatchResult {
        let snapshot = self.cache.snapshot();
        if snapshot.is_empty() {
            return MatchResult::Empty;
        }

        best_match(snapshot.iter().map(|(id, e)| (*id, e)), probe, threshold)
    }
}

/// Pick the best candidate from any iterator of gallery entries.
pub(crate) fn best_match<'a>(
    gallery: impl Iterator<Item = (IdentityId, &'a Embedding)>,
    probe: &Embedding,
    threshold: f32,
) -> MatchResult {
    let mut best: Option<(IdentityId, f32)> = None;

    for (id, embedding) in gallery {
        let sim = match probe.cosine_similarity(embedding) {
            Ok(sim) => sim,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "skipping gallery entry");
                continue;
            }
        };

        let is_better = match best {
            None => true,
            Some((best_id, best_sim)) => sim > best_sim || (sim == best_sim && id < best_id),
        };
        if is_better {
            best = Some((id, sim));
        }
    }

    match best {
        Some((identity_id, similarity)) if similarity >= threshold => MatchResult::Identified {
            identity_id,
            similarity,
        },
        Some((identity_id, similarity)) => {
            tracing::debug!(closest = %identity_id, similarity, threshold, "no match above threshold");
            MatchResult::Unknown
        }
        None => MatchResult::Unknown,
    }
}
