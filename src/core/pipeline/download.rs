use crate::context::RunContext;
use crate::core::image::{decode_bytes, dimensions_within};
use crate::core::models::{IdentityProfile, RawImageRecord};
use crate::core::pipeline::{Collaborators, write_atomic};
use crate::core::report::{Stage, StageReport, StageStatus};
use crate::error::{PipelineError, Result};
use crate::services::hash::ContentIndex;
use crate::services::sources::{ImageLocation, SourcedImage};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct DownloadStats {
    downloaded: usize,
    already_present: usize,
    failed: usize,
    invalid: usize,
    duplicates: usize,
    source_errors: usize,
    write_errors: usize,
}

impl DownloadStats {
    fn success_rate(&self) -> f64 {
        let attempted =
            self.downloaded + self.failed + self.invalid + self.duplicates + self.write_errors;
        if attempted == 0 {
            return 0.0;
        }
        self.downloaded as f64 / attempted as f64 * 100.0
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn local_extension(path: &Path) -> String {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "jpg".to_string());
    if ext == "jpeg" { "jpg".to_string() } else { ext }
}

/// Raw files already on disk whose header still decodes. Anything else is a
/// leftover from an interrupted write and is removed so it gets redone.
fn valid_existing(raw_images: Vec<PathBuf>) -> Vec<PathBuf> {
    raw_images
        .into_iter()
        .filter(|path| match image::image_dimensions(path) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Discarding unreadable raw image {}: {}", path.display(), e);
                if let Err(e) = fs::remove_file(path) {
                    log::warn!("Could not remove {}: {}", path.display(), e);
                }
                false
            }
        })
        .collect()
}

fn fetch_bytes(collab: &Collaborators, item: &SourcedImage) -> Result<(Vec<u8>, String)> {
    match &item.location {
        ImageLocation::Remote(url) => {
            let fetched = collab.fetcher.fetch_image(url)?;
            Ok((fetched.bytes, fetched.extension))
        }
        ImageLocation::Local(path) => {
            let bytes = fs::read(path)
                .map_err(|e| PipelineError::data_integrity(path.display().to_string(), e))?;
            Ok((bytes, local_extension(path)))
        }
    }
}

/// Rebuild records from whatever is in the raw directory.
pub fn records_on_disk(ctx: &RunContext) -> Result<Vec<RawImageRecord>> {
    let mut records = Vec::new();
    for path in ctx.layout.raw_images()? {
        let meta = fs::metadata(&path)?;
        let stem = file_stem(&path);
        let source_id = stem
            .rsplit_once('_')
            .map(|(source, _)| source.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let fetch_timestamp = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        records.push(RawImageRecord {
            source_id,
            local_path: path,
            byte_size: meta.len(),
            fetch_timestamp,
        });
    }
    Ok(records)
}

/// Pull images from every source in order until the raw target is met.
/// Files are named `<source>_<NNNN>.<ext>` by their position in the source's
/// list, so a resumed run recognises what it already has.
pub fn run(
    ctx: &RunContext,
    collab: &Collaborators,
    profile: &IdentityProfile,
) -> Result<(StageReport, Vec<RawImageRecord>)> {
    let settings = &ctx.settings.download;
    let raw_dir = ctx.layout.raw_dir();
    fs::create_dir_all(&raw_dir)?;

    let existing = valid_existing(ctx.layout.raw_images()?);
    let mut stems: HashSet<String> = existing.iter().map(|p| file_stem(p)).collect();
    let mut index = ContentIndex::from_files(&existing);
    let target = settings.min_raw_images;
    let mut stats = DownloadStats {
        already_present: existing.len(),
        ..DownloadStats::default()
    };
    let mut total = existing.len();

    if total >= target {
        log::info!("{} raw images already on disk, nothing to download", total);
    } else {
        log::info!("Downloading up to {} raw images ({} on disk)", target, total);
    }

    let bar = ctx.progress_bar(target as u64, "download");
    bar.set_position(total.min(target) as u64);

    for source in &collab.sources {
        if total >= target {
            break;
        }
        let items = match source.collect(profile, settings.max_images_per_source) {
            Ok(items) => items,
            Err(e) => {
                log::warn!("Source {} failed: {}", source.id(), e);
                stats.source_errors += 1;
                continue;
            }
        };
        log::info!("Source {} offered {} image(s)", source.id(), items.len());

        for (n, item) in items.iter().enumerate() {
            if total >= target {
                break;
            }
            ctx.check_cancelled()?;

            let stem = format!("{}_{:04}", source.id(), n + 1);
            if stems.contains(&stem) {
                continue;
            }

            let (bytes, extension) = match fetch_bytes(collab, item) {
                Ok(fetched) => fetched,
                Err(e) => {
                    log::debug!("Skipping {}: {}", stem, e);
                    stats.failed += 1;
                    continue;
                }
            };

            let valid = decode_bytes(&bytes).map(|img| {
                dimensions_within(
                    &img,
                    (settings.min_width, settings.min_height),
                    (settings.max_width, settings.max_height),
                )
            });
            match valid {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("Skipping {}: dimensions out of range", stem);
                    stats.invalid += 1;
                    continue;
                }
                Err(e) => {
                    log::debug!("Skipping {}: {}", stem, e);
                    stats.invalid += 1;
                    continue;
                }
            }

            if index.contains(&bytes) {
                log::debug!("Skipping {}: identical payload already stored", stem);
                stats.duplicates += 1;
                continue;
            }

            let path = raw_dir.join(format!("{stem}.{extension}"));
            if let Err(e) = write_atomic(&path, &bytes) {
                log::warn!("Could not store {}: {}", path.display(), e);
                stats.write_errors += 1;
                continue;
            }
            index.insert(&bytes);
            stems.insert(stem);
            stats.downloaded += 1;
            total += 1;
            bar.inc(1);
        }
    }
    bar.finish_and_clear();

    let records = records_on_disk(ctx)?;
    let fetch_stats = collab.fetcher.stats();
    let status = if records.is_empty() {
        StageStatus::Failed
    } else if records.len() >= target {
        StageStatus::Success
    } else {
        StageStatus::Partial
    };

    log::info!(
        "Downloaded {} new image(s), {} total ({} failed, {} invalid, {} duplicate, {} unwritable)",
        stats.downloaded,
        records.len(),
        stats.failed,
        stats.invalid,
        stats.duplicates,
        stats.write_errors
    );

    let mut report = StageReport::new(Stage::Download, status)
        .counter("downloaded", stats.downloaded)
        .counter("already_present", stats.already_present)
        .counter("failed", stats.failed)
        .counter("invalid", stats.invalid)
        .counter("duplicates_skipped", stats.duplicates)
        .counter("source_errors", stats.source_errors)
        .counter("write_errors", stats.write_errors)
        .counter("total", records.len())
        .counter("target", target)
        .counter("requests", fetch_stats.requests)
        .counter("retries", fetch_stats.retries);
    report = if status == StageStatus::Failed {
        report.detail("no images downloaded")
    } else {
        report.detail(format!("success rate {:.1}%", stats.success_rate()))
    };
    Ok((report, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_extension() {
        assert_eq!(local_extension(Path::new("/a/b.JPEG")), "jpg");
        assert_eq!(local_extension(Path::new("/a/b.png")), "png");
        assert_eq!(local_extension(Path::new("/a/b")), "jpg");
    }

    #[test]
    fn test_success_rate() {
        let stats = DownloadStats {
            downloaded: 3,
            failed: 1,
            ..DownloadStats::default()
        };
        assert!((stats.success_rate() - 75.0).abs() < 1e-9);
        assert_eq!(DownloadStats::default().success_rate(), 0.0);
    }
}
