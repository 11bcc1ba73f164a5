//! Verify and Dedupe: narrowing detected faces down to the final set.

use crate::context::RunContext;
use crate::core::duplicate::{DedupeEntry, DuplicateDetector};
use crate::core::image::decode_bytes;
use crate::core::models::{FaceCandidate, IdentityProfile};
use crate::core::pipeline::Collaborators;
use crate::core::report::{Stage, StageReport, StageStatus};
use crate::core::verify::{VerificationEngine, l2_normalize};
use crate::services::perceptual::fingerprint_all;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct VerifyOutput {
    pub accepted: Vec<FaceCandidate>,
    pub reference: Option<Vec<f32>>,
    /// Similarity per face id, empty when verification did not run.
    pub scores: HashMap<String, f32>,
}

/// Single reference embedding from the profile picture: the most confident
/// face that carries an embedding.
pub fn reference_embedding(
    collab: &Collaborators,
    profile: &IdentityProfile,
) -> std::result::Result<Vec<f32>, String> {
    let image_ref = profile
        .profile_image_ref
        .as_deref()
        .ok_or_else(|| "identity has no profile image".to_string())?;
    let url = collab.metadata.image_url(image_ref);
    let fetched = collab
        .fetcher
        .fetch_image(&url)
        .map_err(|e| format!("profile image unavailable: {e}"))?;
    let img = decode_bytes(&fetched.bytes).map_err(|e| e.to_string())?;
    let faces = collab
        .analyzer
        .detect(&img)
        .map_err(|e| format!("profile image analysis failed: {e}"))?;

    let embedding = faces
        .into_iter()
        .filter_map(|f| f.embedding.map(|e| (f.confidence, e)))
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, e)| e)
        .ok_or_else(|| "no face with an embedding in the profile image".to_string())?;
    if embedding.iter().all(|x| *x == 0.0) {
        return Err("reference embedding is all zeros".to_string());
    }
    Ok(l2_normalize(&embedding))
}

pub fn verify(
    ctx: &RunContext,
    collab: &Collaborators,
    profile: &IdentityProfile,
    candidates: Vec<FaceCandidate>,
) -> (StageReport, VerifyOutput) {
    let settings = &ctx.settings.verification;
    let total = candidates.len();

    if !settings.enabled {
        log::info!("Verification disabled, passing {} face(s) through", total);
        let report = StageReport::new(Stage::Verify, StageStatus::Skipped)
            .counter("candidates", total)
            .detail("verification disabled");
        let output = VerifyOutput {
            accepted: candidates,
            ..VerifyOutput::default()
        };
        return (report, output);
    }

    let reference = match reference_embedding(collab, profile) {
        Ok(reference) => reference,
        Err(reason) => {
            log::warn!("Skipping verification: {}", reason);
            let report = StageReport::new(Stage::Verify, StageStatus::Skipped)
                .counter("candidates", total)
                .detail(format!("no reference embedding: {reason}"));
            let output = VerifyOutput {
                accepted: candidates,
                ..VerifyOutput::default()
            };
            return (report, output);
        }
    };

    let engine = VerificationEngine::new(&reference, settings.similarity_threshold);
    let batch = engine.verify_batch(&candidates);
    let scores = batch
        .results
        .iter()
        .map(|r| (r.face_ref.clone(), r.similarity_score))
        .collect();
    let accepted = batch.accepted.len();

    let status = if accepted == 0 {
        StageStatus::Failed
    } else {
        StageStatus::Success
    };
    let mut report = StageReport::new(Stage::Verify, status)
        .counter("candidates", total)
        .counter("accepted", accepted)
        .counter("rejected", total - accepted);
    report = match (status, batch.stats()) {
        (StageStatus::Failed, _) => report.detail(format!(
            "no faces passed verification at threshold {:.2}",
            settings.similarity_threshold
        )),
        (_, Some(stats)) => report.detail(format!(
            "threshold {:.2}, similarity min {:.3} max {:.3} mean {:.3}",
            settings.similarity_threshold, stats.min, stats.max, stats.mean
        )),
        (_, None) => report,
    };

    let output = VerifyOutput {
        accepted: batch.accepted,
        reference: Some(reference),
        scores,
    };
    (report, output)
}

/// Fingerprint each crop and collapse near-duplicates. The crop file size
/// decides which member of a group survives.
pub fn dedupe(
    ctx: &RunContext,
    collab: &Collaborators,
    candidates: Vec<FaceCandidate>,
) -> (StageReport, Vec<FaceCandidate>) {
    let total = candidates.len();
    let crop_paths: Vec<PathBuf> = candidates.iter().map(|c| c.crop_path.clone()).collect();
    let fingerprints = fingerprint_all(collab.fingerprinter.as_ref(), &crop_paths);
    let unhashed = fingerprints.iter().filter(|f| f.is_none()).count();

    let entries: Vec<DedupeEntry<FaceCandidate>> = candidates
        .into_iter()
        .zip(fingerprints)
        .map(|(candidate, fingerprint)| DedupeEntry {
            key: candidate.id.clone(),
            byte_size: fs::metadata(&candidate.crop_path)
                .map(|m| m.len())
                .unwrap_or(0),
            fingerprint,
            item: candidate,
        })
        .collect();

    let detector = DuplicateDetector::new(ctx.settings.dedupe.duplicate_threshold);
    let outcome = detector.remove_duplicates(entries);

    let report = StageReport::new(Stage::Dedupe, StageStatus::Success)
        .counter("input", total)
        .counter("unique", outcome.unique.len())
        .counter("duplicates_removed", outcome.removed.len())
        .counter("groups", outcome.groups.len())
        .counter("unhashed", unhashed);
    (report, outcome.unique)
}
