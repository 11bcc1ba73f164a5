use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use facesetrs::{Collaborators, Pipeline, RunContext, Settings};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser, Debug)]
#[command(
    name = "facesetrs",
    version,
    about = "Build a verified, deduplicated face dataset for a public figure"
)]
struct Cli {
    /// Display name of the person, e.g. "Sai Pallavi"
    name: String,

    /// Metadata service API key
    #[arg(long, env = "TMDB_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Face analysis endpoint (POST image, JSON faces back)
    #[arg(long, env = "FACE_ANALYZER_URL", value_name = "URL")]
    face_endpoint: Option<String>,

    /// Start over instead of resuming from the last checkpoint
    #[arg(long)]
    no_resume: bool,

    /// Keep every detected face without identity verification
    #[arg(long)]
    no_verify: bool,

    /// Skip web image search; use the gallery and configured lists only
    #[arg(long)]
    no_search: bool,

    /// Number of final images to aim for
    #[arg(long, value_name = "N")]
    target: Option<usize>,

    /// Write the run report as JSON to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Settings file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding `raw/` and `people/`
    #[arg(long, value_name = "DIR")]
    data_root: Option<PathBuf>,

    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_secs()
        .init();
}

/// File settings first, then command-line and environment overrides.
fn build_settings(cli: &Cli) -> Result<Settings> {
    let mut settings =
        Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(key) = &cli.api_key {
        settings.metadata.api_key = Some(key.clone());
    }
    if let Some(endpoint) = &cli.face_endpoint {
        settings.detection.analyzer_url = Some(endpoint.clone());
    }
    if let Some(root) = &cli.data_root {
        settings.paths.data_root = root.clone();
    }
    if let Some(target) = cli.target {
        settings.output.target_images = target;
    }
    if cli.no_resume {
        settings.run.resume = false;
    }
    if cli.no_verify {
        settings.verification.enabled = false;
    }
    if cli.no_search {
        settings.download.image_search = false;
    }
    if cli.no_progress {
        settings.run.show_progress = false;
    }

    settings.validate()?;
    Ok(settings)
}

fn run(cli: &Cli) -> Result<i32> {
    if cli.name.trim().is_empty() {
        anyhow::bail!("Name must not be empty");
    }
    let settings = build_settings(cli)?;
    let collab = Collaborators::from_settings(&settings)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(3);
        }
        eprintln!("⚠️  Interrupt received; stopping after the current item (press again to quit now)");
    })
    .context("Failed to install Ctrl-C handler")?;

    let ctx = RunContext::new(settings, &cli.name).with_cancel_flag(cancel);
    println!("▶ Building dataset for {} in {}", cli.name, ctx.layout.person_dir().display());

    let report = Pipeline::new(&ctx, &collab).run();
    print!("{}", report.render());

    if let Some(path) = &cli.report {
        let json = serde_json::to_vec_pretty(&report)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        println!("✅ Report written to {}", path.display());
    }

    Ok(report.exit_code())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            2
        }
    };
    std::process::exit(code);
}
