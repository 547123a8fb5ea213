//! Per-frame nearest-neighbour classification against the gallery.

use crate::types::{ClassificationResult, Embedding, GalleryEntry, Label};

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Index of the nearest gallery entry, if the gallery is non-empty.
    pub best_index: Option<usize>,
    /// Distance to the nearest entry (`+inf` when nothing was comparable).
    pub distance: f32,
    pub label: Label,
}

/// Strategy for comparing a probe embedding against the gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], tolerance: f32) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher.
///
/// Scans every gallery entry. On equal distances the entry inserted first
/// wins. A match requires `distance < tolerance`.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], tolerance: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let dist = probe.distance(&entry.embedding);
            // Strict `<` keeps the earliest entry on ties and skips NaN.
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        let label = match best_idx {
            Some(idx) if best_dist < tolerance => Label::Known(gallery[idx].identity.clone()),
            _ => Label::Unknown,
        };

        MatchResult {
            best_index: best_idx,
            distance: best_dist,
            label,
        }
    }
}

/// Classify one detection slot. Never fails: an empty gallery yields `Unknown`.
pub fn classify(
    slot_index: usize,
    probe: &Embedding,
    gallery: &[GalleryEntry],
    tolerance: f32,
) -> ClassificationResult {
    let result = EuclideanMatcher.compare(probe, gallery, tolerance);
    ClassificationResult {
        slot_index,
        label: result.label,
        distance: result.distance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(identity: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry { identity: identity.into(), embedding: Embedding::new(values) }
    }

    #[test]
    fn test_nearest_entry_wins() {
        let gallery = vec![
            entry("decoy", vec![0.0, 1.0]),
            entry("Alice", vec![1.0, 0.0]),
        ];
        let result = classify(0, &Embedding::new(vec![0.9, 0.1]), &gallery, 0.5);
        assert_eq!(result.label, Label::Known("Alice".into()));
        assert_eq!(result.slot_index, 0);
    }

    #[test]
    fn test_tolerance_boundary_is_strict() {
        let gallery = vec![entry("Alice", vec![0.0, 0.0])];
        // Distance exactly 0.5
        let at = classify(0, &Embedding::new(vec![0.5, 0.0]), &gallery, 0.5);
        assert_eq!(at.label, Label::Unknown);
        assert!((at.distance - 0.5).abs() < 1e-6);

        let below = classify(0, &Embedding::new(vec![0.499, 0.0]), &gallery, 0.5);
        assert_eq!(below.label, Label::Known("Alice".into()));
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let result = classify(3, &Embedding::new(vec![1.0, 0.0]), &[], 0.5);
        assert_eq!(result.label, Label::Unknown);
        assert_eq!(result.distance, f32::INFINITY);
        assert_eq!(result.slot_index, 3);
    }

    #[test]
    fn test_tie_resolves_to_first_inserted() {
        let gallery = vec![
            entry("Bob", vec![1.0, 0.0]),
            entry("Alice", vec![-1.0, 0.0]),
        ];
        let result = EuclideanMatcher.compare(&Embedding::new(vec![0.0, 0.0]), &gallery, 2.0);
        assert_eq!(result.best_index, Some(0));
        assert_eq!(result.label, Label::Known("Bob".into()));
    }

    #[test]
    fn test_zero_distance_matches() {
        let gallery = vec![entry("Alice", vec![0.6, 0.8])];
        let result = classify(0, &Embedding::new(vec![0.6, 0.8]), &gallery, 0.5);
        assert_eq!(result.label, Label::Known("Alice".into()));
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_nan_probe_never_matches() {
        let gallery = vec![entry("Alice", vec![0.0, 0.0])];
        let result = classify(0, &Embedding::new(vec![f32::NAN, 0.0]), &gallery, 0.5);
        assert_eq!(result.label, Label::Unknown);
        assert_eq!(result.distance, f32::INFINITY);
    }

    #[test]
    fn test_multiple_references_per_identity() {
        let gallery = vec![
            entry("Alice", vec![1.0, 0.0]),
            entry("Alice", vec![0.0, 1.0]),
            entry("Bob", vec![-1.0, 0.0]),
        ];
        let result = classify(0, &Embedding::new(vec![0.1, 0.95]), &gallery, 0.5);
        assert_eq!(result.label, Label::Known("Alice".into()));
    }
}
