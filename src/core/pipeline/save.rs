use crate::context::RunContext;
use crate::core::image::{load_image, save_jpeg};
use crate::core::layout::list_images;
use crate::core::models::{DatasetMetadata, FaceCandidate, IdentityProfile, SimilarityStats};
use crate::core::pipeline::refine::VerifyOutput;
use crate::core::pipeline::write_atomic;
use crate::core::report::{Stage, StageReport, StageStatus};
use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize)]
struct EmbeddingsFile<'a> {
    identity: &'a str,
    canonical_id: u64,
    dimension: usize,
    reference_embedding: &'a [f32],
}

/// `00001.jpg` style names written by earlier runs.
fn is_numbered_output(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
}

/// Clear numbered files from a previous run so numbering stays contiguous.
fn remove_stale_outputs(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for path in list_images(dir)? {
        if is_numbered_output(&path) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Re-encode the unique set as `00001.jpg..` and write metadata alongside.
pub fn run(
    ctx: &RunContext,
    profile: &IdentityProfile,
    unique: &[FaceCandidate],
    verified: &VerifyOutput,
) -> Result<(StageReport, usize)> {
    let output = &ctx.settings.output;
    let images_dir = ctx.layout.images_dir();
    fs::create_dir_all(&images_dir)?;
    let stale = remove_stale_outputs(&images_dir)?;
    if stale > 0 {
        log::info!("Removed {} numbered image(s) from a previous run", stale);
    }

    let mut saved = 0usize;
    let mut failed = 0usize;
    let mut saved_scores = Vec::new();
    let bar = ctx.progress_bar(unique.len() as u64, "save");

    for candidate in unique {
        bar.inc(1);
        ctx.check_cancelled()?;
        let target = images_dir.join(format!("{:05}.jpg", saved + 1));
        let result = load_image(&candidate.crop_path)
            .and_then(|img| save_jpeg(&img, &target, output.jpeg_quality, output.image_size));
        match result {
            Ok(()) => {
                saved += 1;
                if let Some(score) = verified.scores.get(&candidate.id) {
                    saved_scores.push(*score);
                }
            }
            Err(e) => {
                log::warn!("Could not save {}: {}", candidate.crop_path.display(), e);
                failed += 1;
            }
        }
    }
    bar.finish_and_clear();

    let similarity_stats = SimilarityStats::from_scores(&saved_scores);
    if output.save_metadata {
        let metadata = DatasetMetadata {
            identity: ctx.layout.identity().to_string(),
            canonical_id: Some(profile.canonical_id),
            total_images: saved,
            timestamp: Utc::now(),
            similarity_stats,
        };
        write_atomic(&ctx.layout.metadata_file(), &serde_json::to_vec_pretty(&metadata)?)?;
    }
    if output.save_embeddings {
        if let Some(reference) = verified.reference.as_deref() {
            let file = EmbeddingsFile {
                identity: ctx.layout.identity(),
                canonical_id: profile.canonical_id,
                dimension: reference.len(),
                reference_embedding: reference,
            };
            write_atomic(&ctx.layout.embeddings_file(), &serde_json::to_vec_pretty(&file)?)?;
            log::info!("Saved reference embedding to {}", ctx.layout.embeddings_file().display());
        }
    }

    log::info!("Saved {} image(s) to {}", saved, images_dir.display());
    let status = if saved == unique.len() {
        StageStatus::Success
    } else if saved > 0 {
        StageStatus::Partial
    } else {
        StageStatus::Failed
    };
    let report = StageReport::new(Stage::Save, status)
        .counter("saved", saved)
        .counter("failed", failed)
        .counter("stale_removed", stale)
        .counter("target", output.target_images)
        .detail(images_dir.display().to_string());
    Ok((report, saved))
}
