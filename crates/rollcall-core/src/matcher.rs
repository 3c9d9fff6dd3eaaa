//! Query-vs-registry matching.

use crate::types::{FeatureVector, MatchResult, Registry};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Maximum Euclidean distance at which two vectors are the same person.
///
/// On unit-length vectors this equals cosine similarity ≥ 0.82, which is
/// strict for ArcFace embeddings; see `Config::match_threshold` in
/// rollcall-engine for tuning.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a query vector against the enrolled registry.
pub trait Matcher: Send + Sync {
    fn compare(&self, query: &FeatureVector, registry: &Registry, threshold: f32) -> MatchResult;
}

/// First reference within the threshold wins.
///
/// Scans identities in registry order and each identity's references in
/// enrollment order, stopping at the first qualifying reference. A closer
/// reference later in the scan does not override it.
pub struct FirstMatchMatcher;

impl Matcher for FirstMatchMatcher {
    fn compare(&self, query: &FeatureVector, registry: &Registry, threshold: f32) -> MatchResult {
        let mut closest = f32::INFINITY;

        for (name, reference) in registry.references() {
            let Some(distance) = query.distance(reference) else {
                tracing::warn!(
                    name,
                    query_dim = query.dim(),
                    reference_dim = reference.dim(),
                    "skipping reference with mismatched dimension"
                );
                continue;
            };

            if distance <= threshold {
                return MatchResult {
                    matched: true,
                    identity: Some(name.to_string()),
                    distance,
                };
            }
            closest = closest.min(distance);
        }

        MatchResult::unknown(closest)
    }
}

/// Closest reference within the threshold wins; equal distances keep the
/// earlier reference in scan order.
pub struct NearestMatcher;

impl Matcher for NearestMatcher {
    fn compare(&self, query: &FeatureVector, registry: &Registry, threshold: f32) -> MatchResult {
        let mut best: Option<(&str, f32)> = None;

        for (name, reference) in registry.references() {
            let Some(distance) = query.distance(reference) else {
                tracing::warn!(
                    name,
                    query_dim = query.dim(),
                    reference_dim = reference.dim(),
                    "skipping reference with mismatched dimension"
                );
                continue;
            };
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((name, distance));
            }
        }

        match best {
            Some((name, distance)) if distance <= threshold => MatchResult {
                matched: true,
                identity: Some(name.to_string()),
                distance,
            },
            Some((_, distance)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(f32::INFINITY),
        }
    }
}

/// Which [`Matcher`] to use, as named in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    #[default]
    First,
    Nearest,
}

impl MatchPolicy {
    pub fn matcher(self) -> Box<dyn Matcher> {
        match self {
            MatchPolicy::First => Box::new(FirstMatchMatcher),
            MatchPolicy::Nearest => Box::new(NearestMatcher),
        }
    }
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(MatchPolicy::First),
            "nearest" => Ok(MatchPolicy::Nearest),
            other => Err(format!("unknown match policy: {other} (expected first or nearest)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    fn registry(entries: &[(&str, &[f32])]) -> Registry {
        let mut registry = Registry::new();
        for (name, values) in entries {
            registry.add_reference(name, v(values));
        }
        registry
    }

    #[test]
    fn test_empty_registry_is_unknown() {
        for matcher in [MatchPolicy::First.matcher(), MatchPolicy::Nearest.matcher()] {
            let result = matcher.compare(&v(&[0.1, 0.2]), &Registry::new(), DEFAULT_MATCH_THRESHOLD);
            assert!(!result.matched);
            assert_eq!(result.label(), "Unknown");
            assert!(result.distance.is_infinite());
        }
    }

    #[test]
    fn test_query_within_threshold_matches() {
        let reg = registry(&[("Alice", &[0.0, 0.0])]);
        let result = FirstMatchMatcher.compare(&v(&[0.3, 0.4]), &reg, DEFAULT_MATCH_THRESHOLD);
        assert!(result.matched);
        assert_eq!(result.label(), "Alice");
        assert!((result.distance - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let reg = registry(&[("Alice", &[0.0, 0.0])]);
        let result = FirstMatchMatcher.compare(&v(&[0.5, 0.0]), &reg, 0.5);
        assert!(result.matched);
    }

    #[test]
    fn test_far_query_is_unknown() {
        let reg = registry(&[("Alice", &[0.0, 0.0]), ("Bob", &[5.0, 5.0])]);
        let result = FirstMatchMatcher.compare(&v(&[2.0, 2.5]), &reg, DEFAULT_MATCH_THRESHOLD);
        assert!(!result.matched);
        assert_eq!(result.identity, None);
        assert!(result.distance > DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_first_match_wins_over_closer_later_reference() {
        // Alice is within threshold but Bob is closer; Alice comes first.
        let reg = registry(&[("Alice", &[0.5, 0.0]), ("Bob", &[0.1, 0.0])]);
        let query = v(&[0.0, 0.0]);

        let first = FirstMatchMatcher.compare(&query, &reg, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(first.label(), "Alice");

        let nearest = NearestMatcher.compare(&query, &reg, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(nearest.label(), "Bob");
    }

    #[test]
    fn test_nearest_tie_keeps_registry_order() {
        let reg = registry(&[("Alice", &[0.2, 0.0]), ("Bob", &[-0.2, 0.0])]);
        let result = NearestMatcher.compare(&v(&[0.0, 0.0]), &reg, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(result.label(), "Alice");
    }

    #[test]
    fn test_any_reference_of_identity_can_match() {
        let reg = registry(&[("Alice", &[9.0, 9.0]), ("Alice", &[0.0, 0.1])]);
        let result = FirstMatchMatcher.compare(&v(&[0.0, 0.0]), &reg, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(result.label(), "Alice");
    }

    #[test]
    fn test_mismatched_dimension_is_skipped() {
        let reg = registry(&[("Odd", &[0.0, 0.0, 0.0]), ("Alice", &[0.0, 0.0])]);
        let result = FirstMatchMatcher.compare(&v(&[0.0, 0.0]), &reg, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(result.label(), "Alice");
    }

    #[test]
    fn test_result_name_always_from_registry() {
        let reg = registry(&[("Alice", &[0.0]), ("Bob", &[1.0]), ("Carol", &[2.0])]);
        for i in 0..=40 {
            let query = v(&[i as f32 * 0.1 - 1.0]);
            for matcher in [MatchPolicy::First.matcher(), MatchPolicy::Nearest.matcher()] {
                let result = matcher.compare(&query, &reg, DEFAULT_MATCH_THRESHOLD);
                match result.identity {
                    Some(name) => assert!(reg.contains(&name)),
                    None => assert!(!result.matched),
                }
            }
        }
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("first".parse::<MatchPolicy>(), Ok(MatchPolicy::First));
        assert_eq!(" Nearest ".parse::<MatchPolicy>(), Ok(MatchPolicy::Nearest));
        assert!("closest".parse::<MatchPolicy>().is_err());
    }

    #[test]
    fn test_default_threshold_on_unit_vectors() {
        let unit = |cos: f32| v(&[cos, (1.0 - cos * cos).sqrt()]);
        let reg = registry(&[("Alice", &[1.0, 0.0])]);

        assert!(FirstMatchMatcher.compare(&unit(0.83), &reg, DEFAULT_MATCH_THRESHOLD).matched);
        assert!(!FirstMatchMatcher.compare(&unit(0.80), &reg, DEFAULT_MATCH_THRESHOLD).matched);

        // A typical same-person ArcFace similarity needs a looser threshold.
        assert!(!FirstMatchMatcher.compare(&unit(0.45), &reg, DEFAULT_MATCH_THRESHOLD).matched);
        assert!(FirstMatchMatcher.compare(&unit(0.45), &reg, 1.1).matched);
    }
}
