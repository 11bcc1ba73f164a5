use crate::context::RunContext;
use crate::core::checkpoint::CheckpointStore;
use crate::core::image::{crop_face, load_image, save_jpeg};
use crate::core::models::{FaceCandidate, RawImageRecord};
use crate::core::pipeline::{Collaborators, write_atomic};
use crate::core::report::{Stage, StageReport, StageStatus};
use crate::core::verify::l2_normalize;
use crate::error::Result;
use crate::services::face::DetectedFace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const CROP_QUALITY: u8 = 95;

/// Per raw image sidecar in `faces/`. Written last, after every crop it
/// lists, so its presence marks the image as done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub source_image: PathBuf,
    pub faces: Vec<FaceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

pub fn sidecar_path(faces_dir: &Path, raw_image: &Path) -> PathBuf {
    let stem = raw_image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    faces_dir.join(format!("{stem}.json"))
}

/// A sidecar only counts when it parses and all of its crops exist.
pub fn load_record(path: &Path) -> Option<DetectionRecord> {
    let text = fs::read_to_string(path).ok()?;
    let record: DetectionRecord = serde_json::from_str(&text).ok()?;
    record
        .faces
        .iter()
        .all(|face| face.crop_path.is_file())
        .then_some(record)
}

#[derive(Debug, Default)]
struct DetectStats {
    analyzed: usize,
    already_detected: usize,
    unreadable: usize,
    analyzer_errors: usize,
    write_errors: usize,
    no_face: usize,
    too_many_faces: usize,
    faces: usize,
}

impl DetectStats {
    /// `processed` counts every image with a finished sidecar, resumed ones
    /// included, so it never goes down between checkpoints. `analyzed` is
    /// this run's share.
    fn pairs(&self) -> [(&'static str, usize); 8] {
        [
            ("processed", self.analyzed + self.already_detected),
            ("analyzed", self.analyzed),
            ("already_detected", self.already_detected),
            ("unreadable", self.unreadable),
            ("analyzer_errors", self.analyzer_errors),
            ("write_errors", self.write_errors),
            ("no_face", self.no_face),
            ("too_many_faces", self.too_many_faces),
        ]
    }

    fn counters(&self) -> BTreeMap<String, u64> {
        self.pairs()
            .into_iter()
            .chain([("faces_detected", self.faces)])
            .map(|(k, v)| (format!("{}.{}", Stage::Detect, k), v as u64))
            .collect()
    }
}

/// Faces above the confidence floor and minimum size, best first.
pub fn qualifying_faces(
    faces: Vec<DetectedFace>,
    confidence_threshold: f32,
    min_face_size: u32,
) -> Vec<DetectedFace> {
    let min = min_face_size as f32;
    let mut faces: Vec<DetectedFace> = faces
        .into_iter()
        .filter(|f| {
            f.confidence >= confidence_threshold && f.bbox.width() >= min && f.bbox.height() >= min
        })
        .collect();
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    faces
}

/// Detect, filter and crop faces for every raw image. Images with a valid
/// sidecar are not analysed again.
pub fn run(
    ctx: &RunContext,
    collab: &Collaborators,
    images: &[RawImageRecord],
    checkpoints: &CheckpointStore,
    base_counters: &BTreeMap<String, u64>,
) -> Result<(StageReport, Vec<FaceCandidate>)> {
    let settings = &ctx.settings.detection;
    let faces_dir = ctx.layout.faces_dir();
    fs::create_dir_all(&faces_dir)?;

    let mut stats = DetectStats::default();
    let mut candidates = Vec::new();
    let interval = settings.checkpoint_interval.max(1);
    let bar = ctx.progress_bar(images.len() as u64, "detect");

    for raw in images {
        bar.inc(1);
        let sidecar = sidecar_path(&faces_dir, &raw.local_path);
        if let Some(record) = load_record(&sidecar) {
            stats.already_detected += 1;
            stats.faces += record.faces.len();
            candidates.extend(record.faces);
            continue;
        }
        ctx.check_cancelled()?;

        let img = match load_image(&raw.local_path) {
            Ok(img) => img,
            Err(e) => {
                log::warn!("Skipping {}: {}", raw.local_path.display(), e);
                stats.unreadable += 1;
                continue;
            }
        };
        let detected = match collab.analyzer.detect(&img) {
            Ok(faces) => faces,
            Err(e) => {
                log::warn!("Face analysis failed for {}: {}", raw.local_path.display(), e);
                stats.analyzer_errors += 1;
                continue;
            }
        };

        let faces = qualifying_faces(detected, settings.confidence_threshold, settings.min_face_size);
        let mut record = DetectionRecord {
            source_image: raw.local_path.clone(),
            faces: Vec::new(),
            rejected: None,
        };
        if faces.is_empty() {
            stats.no_face += 1;
            record.rejected = Some("no qualifying face".to_string());
        } else if faces.len() > settings.max_faces_per_image {
            stats.too_many_faces += 1;
            record.rejected = Some(format!("{} faces", faces.len()));
        } else {
            let stem = raw
                .local_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut crop_failed = false;
            for (n, face) in faces.into_iter().enumerate() {
                let Some(crop) = crop_face(&img, &face.bbox, settings.crop_padding) else {
                    continue;
                };
                let id = format!("{stem}_face_{n}");
                let crop_path = faces_dir.join(format!("{id}.jpg"));
                if let Err(e) = save_jpeg(&crop, &crop_path, CROP_QUALITY, None) {
                    log::warn!("Could not write crop {}: {}", crop_path.display(), e);
                    crop_failed = true;
                    break;
                }
                record.faces.push(FaceCandidate {
                    id,
                    source_image: raw.local_path.clone(),
                    bounding_box: face.bbox,
                    confidence: face.confidence,
                    embedding: face.embedding.map(|e| l2_normalize(&e)).unwrap_or_default(),
                    crop_path,
                });
            }
            // No sidecar, so the image is analysed again next run.
            if crop_failed {
                stats.write_errors += 1;
                continue;
            }
        }

        if let Err(e) = write_atomic(&sidecar, &serde_json::to_vec_pretty(&record)?) {
            log::warn!("Could not write {}: {}", sidecar.display(), e);
            stats.write_errors += 1;
        }
        stats.analyzed += 1;
        stats.faces += record.faces.len();
        candidates.extend(record.faces);

        if stats.analyzed % interval == 0 {
            let mut counters = base_counters.clone();
            counters.extend(stats.counters());
            checkpoints.record(Stage::Detect, &counters)?;
        }
    }
    bar.finish_and_clear();

    log::info!(
        "Detected {} face(s) in {} image(s) ({} resumed, {} without faces, {} crowded)",
        candidates.len(),
        images.len(),
        stats.already_detected,
        stats.no_face,
        stats.too_many_faces
    );

    let status = if candidates.is_empty() {
        StageStatus::Failed
    } else {
        StageStatus::Success
    };
    let mut report = StageReport::new(Stage::Detect, status).counter("images", images.len());
    for (key, value) in stats.pairs() {
        report = report.counter(key, value);
    }
    report = report.counter("faces_detected", candidates.len());
    if status == StageStatus::Failed {
        report = report.detail("no faces detected");
    }
    Ok((report, candidates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::BoundingBox;
    use tempfile::TempDir;

    fn face(confidence: f32, size: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: size,
                y2: size,
            },
            confidence,
            embedding: None,
        }
    }

    #[test]
    fn test_qualifying_faces_filters_and_sorts() {
        let faces = qualifying_faces(
            vec![face(0.6, 80.0), face(0.4, 80.0), face(0.9, 60.0), face(0.95, 30.0)],
            0.5,
            50,
        );
        let confidences: Vec<f32> = faces.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.6]);
    }

    #[test]
    fn test_record_requires_crops() {
        let temp_dir = TempDir::new().unwrap();
        let crop = temp_dir.path().join("a_0001_face_0.jpg");
        let sidecar = temp_dir.path().join("a_0001.json");
        let record = DetectionRecord {
            source_image: temp_dir.path().join("a_0001.jpg"),
            faces: vec![FaceCandidate {
                id: "a_0001_face_0".to_string(),
                source_image: temp_dir.path().join("a_0001.jpg"),
                bounding_box: face(0.9, 60.0).bbox,
                confidence: 0.9,
                embedding: vec![1.0, 0.0],
                crop_path: crop.clone(),
            }],
            rejected: None,
        };
        fs::write(&sidecar, serde_json::to_vec(&record).unwrap()).unwrap();
        assert!(load_record(&sidecar).is_none());

        fs::write(&crop, b"jpeg").unwrap();
        let loaded = load_record(&sidecar).unwrap();
        assert_eq!(loaded.faces.len(), 1);
        assert_eq!(
            sidecar_path(temp_dir.path(), Path::new("/raw/a_0001.jpg")),
            sidecar
        );
    }

    #[test]
    fn test_processed_counter_includes_resumed_images() {
        let stats = DetectStats {
            analyzed: 2,
            already_detected: 3,
            faces: 4,
            ..DetectStats::default()
        };
        let counters = stats.counters();
        assert_eq!(counters.get("detection.processed"), Some(&5));
        assert_eq!(counters.get("detection.analyzed"), Some(&2));
        assert_eq!(counters.get("detection.faces_detected"), Some(&4));
    }
}
