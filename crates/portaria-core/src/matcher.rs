use crate::types::{FeatureVector, Identity};

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.6;

/// Best candidate found for a query descriptor.
#[derive(Debug, Clone, Copy)]
pub struct MatchResult<'a> {
    pub identity: &'a Identity,
    pub distance: f32,
}

/// Strategy for resolving a query descriptor against enrolled identities.
pub trait Matcher {
    fn best_match<'a>(&self, query: &FeatureVector, candidates: &'a [Identity]) -> Option<MatchResult<'a>>;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Scans every candidate. Identities without a descriptor, or whose
/// descriptor has a different dimensionality than the query, are skipped.
/// On equal distances the earliest candidate wins.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DISTANCE_THRESHOLD,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn best_match<'a>(&self, query: &FeatureVector, candidates: &'a [Identity]) -> Option<MatchResult<'a>> {
        let mut best: Option<MatchResult<'a>> = None;

        for identity in candidates {
            let Some(distance) = identity
                .descriptor
                .as_ref()
                .and_then(|enrolled| query.euclidean_distance(enrolled))
            else {
                continue;
            };
            let is_better = best.map_or(true, |b| distance < b.distance);
            if is_better {
                best = Some(MatchResult { identity, distance });
            }
        }

        best.filter(|b| b.distance < self.threshold)
    }
}
