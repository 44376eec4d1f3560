use crate::sample::{self, FaceSample, SampleError};
use serde::{Deserialize, Serialize};

/// Cosine similarity a query face must strictly exceed to count as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.85;

/// Axis-aligned face region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect the box with a `frame_width` × `frame_height` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clip_to(&self, frame_width: u32, frame_height: u32) -> Option<BoundingBox> {
        let x0 = self.x.min(frame_width);
        let y0 = self.y.min(frame_height);
        let x1 = self.x.saturating_add(self.width).min(frame_width);
        let y1 = self.y.saturating_add(self.height).min(frame_height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(BoundingBox::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Flattened raw pixel intensities of a 128×128 RGB face patch.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceVector {
    values: Vec<f32>,
}

impl FaceVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute cosine similarity between two face vectors.
    ///
    /// Returns a value in [-1, 1]. A zero-norm operand yields 0.0.
    /// Sums are accumulated in f64: raw intensities squared over 49152
    /// elements exceed f32's exact integer range.
    pub fn similarity(&self, other: &FaceVector) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (a as f64, b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom) as f32
        } else {
            0.0
        }
    }
}

/// An enrolled person: the averaged reference patch plus the raw captures.
///
/// `face_vector` is always derived from `face_img`; there is no way to set it
/// independently.
#[derive(Debug, Clone)]
pub struct EnrolledIdentity {
    id: String,
    name: String,
    face_img: FaceSample,
    face_images: Vec<FaceSample>,
    face_vector: FaceVector,
}

impl EnrolledIdentity {
    /// Build an identity by averaging the captured samples pixel-wise.
    pub fn from_samples(
        id: impl Into<String>,
        name: impl Into<String>,
        samples: Vec<FaceSample>,
    ) -> Result<Self, SampleError> {
        let face_img = sample::average(&samples)?;
        Ok(Self::from_parts(id.into(), name.into(), face_img, samples))
    }

    /// Reassemble a stored record. The vector is recomputed from `face_img`.
    pub(crate) fn from_parts(
        id: String,
        name: String,
        face_img: FaceSample,
        face_images: Vec<FaceSample>,
    ) -> Self {
        let face_vector = face_img.to_vector();
        Self {
            id,
            name,
            face_img,
            face_images,
            face_vector,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The averaged representative patch.
    pub fn face_img(&self) -> &FaceSample {
        &self.face_img
    }

    /// The raw captures, in capture order.
    pub fn face_images(&self) -> &[FaceSample] {
        &self.face_images
    }

    pub fn face_vector(&self) -> &FaceVector {
        &self.face_vector
    }
}

/// Best candidate found for a query vector.
#[derive(Debug, Clone, Copy)]
pub struct BestMatch<'g> {
    /// Highest-scoring identity, if any scored above zero.
    pub identity: Option<&'g EnrolledIdentity>,
    /// Similarity of that identity, in [0, 1].
    pub confidence: f32,
}

impl BestMatch<'_> {
    /// Apply the decision rule: strictly above `threshold`.
    pub fn is_match(&self, threshold: f32) -> bool {
        self.identity.is_some() && self.confidence > threshold
    }
}

/// Strategy for scoring a query vector against the enrolled gallery.
pub trait Matcher {
    fn best_match<'g>(&self, query: &FaceVector, gallery: &'g [EnrolledIdentity]) -> BestMatch<'g>;
}

/// Cosine similarity matcher.
///
/// Scans the gallery in order and keeps the first candidate with the
/// strictly greatest similarity. The scan starts from a zero baseline, so
/// candidates with non-positive similarity are never selected.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match<'g>(&self, query: &FaceVector, gallery: &'g [EnrolledIdentity]) -> BestMatch<'g> {
        let mut best_sim = 0.0f32;
        let mut best: Option<&'g EnrolledIdentity> = None;

        for identity in gallery {
            let sim = query.similarity(identity.face_vector());
            if sim > best_sim {
                best_sim = sim;
                best = Some(identity);
            }
        }

        BestMatch {
            identity: best,
            confidence: best_sim.min(1.0),
        }
    }
}
