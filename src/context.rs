use crate::config::Settings;
use crate::core::layout::DatasetLayout;
use crate::error::{PipelineError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Everything a stage needs besides its collaborators.
pub struct RunContext {
    /// Name as given on the command line.
    pub display_name: String,
    pub settings: Settings,
    pub layout: DatasetLayout,
    cancel: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(settings: Settings, display_name: &str) -> Self {
        let layout = DatasetLayout::new(settings.paths.data_root.clone(), display_name);
        Self {
            display_name: display_name.trim().to_string(),
            settings,
            layout,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned flag, e.g. one set by a Ctrl-C handler.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Bar for a stage over `len` items; hidden when progress is turned off.
    pub fn progress_bar(&self, len: u64, label: &str) -> ProgressBar {
        if !self.settings.run.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} {prefix:<10} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_prefix(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    }
}
