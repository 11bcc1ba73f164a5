use crate::core::image::encode_jpeg;
use crate::core::models::BoundingBox;
use crate::error::{PipelineError, Result};
use crate::services::fetch::HttpFetcher;
use image::DynamicImage;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Option<Vec<f32>>,
}

/// Face detection plus embedding extraction.
pub trait FaceAnalyzer: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

#[derive(Debug, Deserialize)]
struct AnalyzerResponse {
    #[serde(default)]
    faces: Vec<AnalyzerFace>,
}

#[derive(Debug, Deserialize)]
struct AnalyzerFace {
    bbox: [f32; 4],
    #[serde(default = "default_score")]
    det_score: f32,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

fn default_score() -> f32 {
    0.5
}

impl From<AnalyzerFace> for DetectedFace {
    fn from(face: AnalyzerFace) -> Self {
        let [x1, y1, x2, y2] = face.bbox;
        DetectedFace {
            bbox: BoundingBox { x1, y1, x2, y2 },
            confidence: face.det_score,
            embedding: face.embedding.filter(|e| !e.is_empty()),
        }
    }
}

/// Talks to a face-analysis service over HTTP. The image is posted as JPEG;
/// the reply is `{"faces": [{"bbox": [x1, y1, x2, y2], "det_score": f, "embedding": [..]}]}`.
pub struct HttpFaceAnalyzer {
    fetcher: Arc<HttpFetcher>,
    endpoint: String,
}

impl HttpFaceAnalyzer {
    pub fn new(fetcher: Arc<HttpFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }
}

impl FaceAnalyzer for HttpFaceAnalyzer {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let body = encode_jpeg(image, 95)?;
        let response: AnalyzerResponse = self
            .fetcher
            .post_for_json(&self.endpoint, "image/jpeg", &body)
            .map_err(|e| PipelineError::Analyzer {
                message: e.to_string(),
            })?;
        Ok(response.faces.into_iter().map(DetectedFace::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analyzer_response() {
        let body = r#"{"faces": [
            {"bbox": [10, 20, 110, 140], "det_score": 0.93, "embedding": [0.1, 0.2]},
            {"bbox": [0, 0, 5, 5]},
            {"bbox": [1, 1, 9, 9], "det_score": 0.7, "embedding": []}
        ]}"#;
        let response: AnalyzerResponse = serde_json::from_str(body).unwrap();
        let faces: Vec<DetectedFace> = response.faces.into_iter().map(Into::into).collect();

        assert_eq!(faces.len(), 3);
        assert_eq!(faces[0].bbox.x2, 110.0);
        assert_eq!(faces[0].embedding.as_deref(), Some(&[0.1f32, 0.2][..]));
        assert_eq!(faces[1].confidence, 0.5);
        assert!(faces[1].embedding.is_none());
        assert!(faces[2].embedding.is_none());
    }

    #[test]
    fn test_empty_reply_means_no_faces() {
        let response: AnalyzerResponse = serde_json::from_str("{}").unwrap();
        assert!(response.faces.is_empty());
    }
}
