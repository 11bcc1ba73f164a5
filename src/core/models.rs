use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Canonical record of the subject, created once by the identify stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub canonical_id: u64,
    pub display_name: String,
    /// Relative image paths as returned by the metadata service.
    pub candidate_image_refs: Vec<String>,
    pub profile_image_ref: Option<String>,
    pub credit_count: usize,
    pub confirmed: bool,
    pub confirmation_rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawImageRecord {
    /// Provenance: which source produced the file (`tmdb`, `urls`, `import`).
    pub source_id: String,
    pub local_path: PathBuf,
    pub byte_size: u64,
    pub fetch_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Grow the box by `fraction` of its size on each side and clamp it to the
    /// image. Returns `(x, y, width, height)` in whole pixels, or `None` when
    /// nothing of the box lies inside the image.
    pub fn padded_crop(&self, fraction: f32, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let pad_x = self.width() * fraction;
        let pad_y = self.height() * fraction;

        let x1 = (self.x1 - pad_x).max(0.0).floor() as u32;
        let y1 = (self.y1 - pad_y).max(0.0).floor() as u32;
        let x2 = ((self.x2 + pad_x).ceil().max(0.0) as u32).min(image_width);
        let y2 = ((self.y2 + pad_y).ceil().max(0.0) as u32).min(image_height);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// One detected face, cropped and stored under `raw/<identity>/faces`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceCandidate {
    /// Stable reference, the crop's file stem (`<raw stem>_face_<n>`).
    pub id: String,
    pub source_image: PathBuf,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    /// L2-normalized; empty when the analyzer produced no embedding.
    pub embedding: Vec<f32>,
    pub crop_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub face_ref: String,
    pub similarity_score: f32,
    pub accepted: bool,
}

/// Near-duplicate cluster. Always at least two members; the representative is
/// one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub members: Vec<String>,
    pub representative: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

impl SimilarityStats {
    /// Population statistics; `None` for an empty slice.
    pub fn from_scores(scores: &[f32]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let n = scores.len() as f32;
        let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = scores.iter().sum::<f32>() / n;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
        Some(Self {
            min,
            max,
            mean,
            std: variance.sqrt(),
        })
    }
}

/// `people/<identity>/metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub identity: String,
    pub canonical_id: Option<u64>,
    pub total_images: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_stats: Option<SimilarityStats>,
}
