use serde::{Deserialize, Serialize};

/// Label reported for a face that matches no enrolled identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Build a box from pixel edges, as reported by most detectors.
    pub fn from_edges(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            x: left as f32,
            y: top as f32,
            width: right.saturating_sub(left) as f32,
            height: bottom.saturating_sub(top) as f32,
            confidence: 1.0,
            landmarks: None,
        }
    }

    /// Integer `(top, right, bottom, left)` edges clamped to a `width`×`height` image.
    ///
    /// Returns `None` when the box lies entirely outside the image.
    pub fn edges_within(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_x = (width - 1) as f32;
        let max_y = (height - 1) as f32;
        let left = self.x.round();
        let top = self.y.round();
        let right = (self.x + self.width).round();
        let bottom = (self.y + self.height).round();

        if right < 0.0 || bottom < 0.0 || left > max_x || top > max_y {
            return None;
        }

        Some((
            top.clamp(0.0, max_y) as u32,
            right.clamp(0.0, max_x) as u32,
            bottom.clamp(0.0, max_y) as u32,
            left.clamp(0.0, max_x) as u32,
        ))
    }
}

/// Fixed-length face feature vector produced by a [`FaceExtractor`](crate::FaceExtractor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance, or `None` when the dimensions differ.
    pub fn distance(&self, other: &FeatureVector) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// One face found in an image: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub vector: FeatureVector,
}

/// A known person and every reference vector enrolled for them.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub name: String,
    /// Never empty.
    pub references: Vec<FeatureVector>,
}

/// Ordered set of enrolled identities.
///
/// Order is the order in which names were first added; matchers scan in
/// this order, so it decides ties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    identities: Vec<Identity>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Total number of reference vectors across all identities.
    pub fn reference_count(&self) -> usize {
        self.identities.iter().map(|i| i.references.len()).sum()
    }

    /// Append a reference vector to `name`, creating the identity on first use.
    pub fn add_reference(&mut self, name: &str, vector: FeatureVector) {
        match self.identities.iter_mut().find(|i| i.name == name) {
            Some(identity) => identity.references.push(vector),
            None => self.identities.push(Identity {
                name: name.to_string(),
                references: vec![vector],
            }),
        }
    }

    /// Every `(name, reference)` pair in scan order.
    pub fn references(&self) -> impl Iterator<Item = (&str, &FeatureVector)> {
        self.identities
            .iter()
            .flat_map(|i| i.references.iter().map(move |r| (i.name.as_str(), r)))
    }
}

/// Result of matching a query vector against a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Name of the matched identity (if any).
    pub identity: Option<String>,
    /// Distance to the deciding reference, or to the closest one seen when
    /// nothing matched. Infinite when no reference was comparable.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            matched: false,
            identity: None,
            distance,
        }
    }

    /// Matched name, or [`UNKNOWN_LABEL`].
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    #[test]
    fn test_distance_identical() {
        assert_eq!(v(&[0.3, 0.4]).distance(&v(&[0.3, 0.4])), Some(0.0));
    }

    #[test]
    fn test_distance_pythagorean() {
        let d = v(&[0.0, 0.0]).distance(&v(&[3.0, 4.0])).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        assert_eq!(v(&[1.0, 0.0]).distance(&v(&[1.0, 0.0, 0.0])), None);
    }

    #[test]
    fn test_registry_groups_references_by_name() {
        let mut registry = Registry::new();
        registry.add_reference("Alice", v(&[1.0]));
        registry.add_reference("Bob", v(&[2.0]));
        registry.add_reference("Alice", v(&[3.0]));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.reference_count(), 3);
        assert_eq!(registry.get("Alice").unwrap().references.len(), 2);

        let order: Vec<&str> = registry.references().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["Alice", "Alice", "Bob"]);
    }

    #[test]
    fn test_edges_within_clamps() {
        let bbox = BoundingBox {
            x: -10.0,
            y: 5.0,
            width: 50.0,
            height: 200.0,
            confidence: 0.9,
            landmarks: None,
        };
        assert_eq!(bbox.edges_within(100, 100), Some((5, 40, 99, 0)));
    }

    #[test]
    fn test_edges_within_outside() {
        let bbox = BoundingBox::from_edges(200, 260, 250, 210);
        assert_eq!(bbox.edges_within(100, 100), None);
    }

    #[test]
    fn test_unknown_label() {
        assert_eq!(MatchResult::unknown(f32::INFINITY).label(), UNKNOWN_LABEL);
    }
}
