//! Stage orchestration: Identify, Download, Detect, Verify, Dedupe, Save.
//!
//! Every stage ends with a checkpoint. On resume the checkpoint only tells us
//! where the last run got to; what is on disk decides what gets redone.

pub mod detect;
pub mod download;
pub mod refine;
pub mod save;

use crate::config::Settings;
use crate::context::RunContext;
use crate::core::checkpoint::CheckpointStore;
use crate::core::identify::{ConfirmationPredicate, CreditShareConfirmation, Identifier};
use crate::core::models::IdentityProfile;
use crate::core::report::{RunOutcome, RunReport, Stage, StageReport, StageStatus};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::services::face::{FaceAnalyzer, HttpFaceAnalyzer};
use crate::services::fetch::{HttpFetcher, ImageFetcher};
use crate::services::metadata::{MetadataSource, TmdbClient};
use crate::services::perceptual::{Fingerprinter, PerceptualHasher};
use crate::services::sources::{ImageSource, default_sources};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// External services the stages talk to.
pub struct Collaborators {
    pub metadata: Arc<dyn MetadataSource>,
    pub confirmation: Box<dyn ConfirmationPredicate>,
    pub sources: Vec<Box<dyn ImageSource>>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub analyzer: Box<dyn FaceAnalyzer>,
    pub fingerprinter: Box<dyn Fingerprinter>,
}

impl Collaborators {
    /// HTTP-backed collaborators sharing one fetcher.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let endpoint = settings
            .detection
            .analyzer_url
            .clone()
            .ok_or_else(|| PipelineError::configuration("face analyzer endpoint not set"))?;
        let http = Arc::new(HttpFetcher::new(&settings.fetch));
        let metadata: Arc<dyn MetadataSource> =
            Arc::new(TmdbClient::new(&settings.metadata, Arc::clone(&http))?);
        Ok(Self {
            sources: default_sources(&settings.download, Arc::clone(&metadata), Arc::clone(&http)),
            metadata,
            confirmation: Box::new(CreditShareConfirmation::from_settings(&settings.metadata)),
            analyzer: Box::new(HttpFaceAnalyzer::new(Arc::clone(&http), endpoint)),
            fetcher: http,
            fingerprinter: Box::new(PerceptualHasher::new(settings.dedupe.hash_size)),
        })
    }
}

/// Write through a sibling temp file and rename into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.part"));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn load_profile(path: &Path) -> Option<IdentityProfile> {
    let text = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(profile) => Some(profile),
        Err(e) => {
            log::warn!("Ignoring unreadable profile {}: {}", path.display(), e);
            None
        }
    }
}

pub struct Pipeline<'a> {
    ctx: &'a RunContext,
    collab: &'a Collaborators,
    checkpoints: CheckpointStore,
    counters: BTreeMap<String, u64>,
    current: Stage,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a RunContext, collab: &'a Collaborators) -> Self {
        Self {
            ctx,
            collab,
            checkpoints: CheckpointStore::new(ctx.layout.checkpoint_file()),
            counters: BTreeMap::new(),
            current: Stage::Identify,
        }
    }

    /// Run every stage and always come back with a report.
    pub fn run(mut self) -> RunReport {
        let mut report = RunReport::new(self.ctx.layout.identity());
        match self.run_stages(&mut report) {
            Ok((status, reason)) => report.finish(status, reason),
            Err(PipelineError::Interrupted) => {
                log::warn!("Interrupted during {}; progress saved", self.current);
                // Keep counters a stage already checkpointed while in flight.
                if let Some(checkpoint) = self.checkpoints.load() {
                    if checkpoint.stage == self.current {
                        self.counters.extend(checkpoint.counters);
                    }
                }
                if let Err(e) = self.checkpoints.record(self.current, &self.counters) {
                    log::error!("Could not write checkpoint: {}", e);
                }
                report.interrupted = true;
                report.finish(
                    RunOutcome::Error,
                    Some(format!("interrupted by user during {}", self.current)),
                );
            }
            Err(e) => {
                log::error!("Run aborted during {}: {}", self.current, e);
                report.finish(
                    RunOutcome::Error,
                    Some(format!("{} failed unexpectedly: {}", self.current, e)),
                );
            }
        }
        log::info!("Run finished with status {:?}", report.status);
        report
    }

    /// Merge the stage's counters into the checkpoint, persist it and add the
    /// stage to the report. `false` means the stage failed outright.
    fn complete(&mut self, report: &mut RunReport, stage: StageReport) -> Result<bool> {
        for (key, value) in &stage.counters {
            self.counters
                .insert(format!("{}.{}", stage.stage, key), *value);
        }
        self.checkpoints.record(stage.stage, &self.counters)?;
        let ok = stage.status != StageStatus::Failed;
        log::info!("Stage {} finished: {:?}", stage.stage, stage.status);
        report.push(stage);
        Ok(ok)
    }

    fn stage_failure(report: &RunReport) -> (RunOutcome, Option<String>) {
        let reason = report.stages.last().map(|s| match &s.detail {
            Some(detail) => format!("{}: {}", s.stage, detail),
            None => format!("{} failed", s.stage),
        });
        (RunOutcome::Failed, reason)
    }

    fn identify(&mut self) -> Result<(StageReport, Option<IdentityProfile>)> {
        let profile_file = self.ctx.layout.profile_file();
        if self.ctx.settings.run.resume {
            if let Some(profile) = load_profile(&profile_file) {
                log::info!(
                    "Reusing saved profile for {} (id {})",
                    profile.display_name,
                    profile.canonical_id
                );
                let report = StageReport::new(Stage::Identify, StageStatus::Success)
                    .counter("candidate_images", profile.candidate_image_refs.len())
                    .counter("credits", profile.credit_count)
                    .detail("reused saved profile");
                return Ok((report, Some(profile)));
            }
        }

        let identifier = Identifier::new(
            self.collab.metadata.as_ref(),
            self.collab.confirmation.as_ref(),
            &self.ctx.settings.metadata,
        );
        match identifier.identify(&self.ctx.display_name) {
            Ok(profile) => {
                write_atomic(&profile_file, &serde_json::to_vec_pretty(&profile)?)?;
                let report = StageReport::new(Stage::Identify, StageStatus::Success)
                    .counter("candidate_images", profile.candidate_image_refs.len())
                    .counter("credits", profile.credit_count)
                    .detail(format!(
                        "{} (id {}), {}",
                        profile.display_name, profile.canonical_id, profile.confirmation_rationale
                    ));
                Ok((report, Some(profile)))
            }
            Err(e) if matches!(e.kind(), ErrorKind::Internal | ErrorKind::Interrupted) => Err(e),
            Err(e) => {
                log::error!("Identification failed: {}", e);
                let report =
                    StageReport::new(Stage::Identify, StageStatus::Failed).detail(e.to_string());
                Ok((report, None))
            }
        }
    }

    fn run_stages(&mut self, report: &mut RunReport) -> Result<(RunOutcome, Option<String>)> {
        let ctx = self.ctx;
        let collab = self.collab;
        let layout = &ctx.layout;

        if !ctx.settings.run.resume {
            log::info!("Starting fresh: clearing {}", layout.raw_dir().display());
            layout.reset_raw()?;
        }
        layout.ensure_raw_dirs()?;
        if let Some(checkpoint) = self.checkpoints.load() {
            log::info!(
                "Resuming: last checkpoint after {} at {}",
                checkpoint.stage,
                checkpoint.timestamp.to_rfc3339()
            );
            self.counters = checkpoint.counters;
        }

        self.current = Stage::Identify;
        let (stage, profile) = self.identify()?;
        report.canonical_id = profile.as_ref().map(|p| p.canonical_id);
        let proceed = self.complete(report, stage)?;
        let Some(profile) = profile.filter(|_| proceed) else {
            return Ok(Self::stage_failure(report));
        };

        self.current = Stage::Download;
        let (stage, records) = download::run(ctx, collab, &profile)?;
        if !self.complete(report, stage)? {
            return Ok(Self::stage_failure(report));
        }

        self.current = Stage::Detect;
        let (stage, candidates) =
            detect::run(ctx, collab, &records, &self.checkpoints, &self.counters)?;
        if !self.complete(report, stage)? {
            return Ok(Self::stage_failure(report));
        }

        self.current = Stage::Verify;
        ctx.check_cancelled()?;
        let (stage, verified) = refine::verify(ctx, collab, &profile, candidates);
        if !self.complete(report, stage)? {
            let (_, reason) = Self::stage_failure(report);
            return Ok((RunOutcome::Partial, reason));
        }

        self.current = Stage::Dedupe;
        ctx.check_cancelled()?;
        let (stage, unique) = refine::dedupe(ctx, collab, verified.accepted.clone());
        self.complete(report, stage)?;

        self.current = Stage::Save;
        let (stage, saved) = save::run(ctx, &profile, &unique, &verified)?;
        self.complete(report, stage)?;

        let target = ctx.settings.output.target_images;
        let outcome = RunOutcome::from_saved(saved, target);
        let reason = match outcome {
            RunOutcome::Success => None,
            RunOutcome::Partial => Some(format!("saved {saved} of {target} target images")),
            _ => Some("no images saved".to_string()),
        };
        Ok((outcome, reason))
    }
}
