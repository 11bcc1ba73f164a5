use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TMDB_BASE_URL: &str = "https://api.themoviedb.org/3";
pub const TMDB_IMAGE_BASE_URL: &str = "https://image.tmdb.org/t/p";

/// Full run configuration. Every section falls back to the defaults below, so
/// a config file only needs the keys it wants to change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathSettings,
    pub metadata: MetadataSettings,
    pub download: DownloadSettings,
    pub detection: DetectionSettings,
    pub verification: VerificationSettings,
    pub dedupe: DedupeSettings,
    pub fetch: FetchSettings,
    pub output: OutputSettings,
    pub run: RunSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Root holding `raw/` and `people/`.
    pub data_root: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("dataset"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub image_base_url: String,
    /// Gallery images requested per identity.
    pub max_gallery_images: usize,
    /// Refuse the identity unless the confirmation predicate accepts it.
    pub require_confirmation: bool,
    pub confirm_languages: Vec<String>,
    pub confirm_countries: Vec<String>,
    /// Fraction of credits (0..=1) that must match a language or country.
    pub confirm_min_share: f64,
    pub confirm_min_credits: usize,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: TMDB_BASE_URL.to_string(),
            image_base_url: TMDB_IMAGE_BASE_URL.to_string(),
            max_gallery_images: 50,
            require_confirmation: false,
            confirm_languages: vec!["te".to_string()],
            confirm_countries: vec!["IN".to_string()],
            confirm_min_share: 0.20,
            confirm_min_credits: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    pub min_raw_images: usize,
    pub max_images_per_source: usize,
    /// Cap for the profile gallery: `min(gallery_cap, min_raw_images / 3)`.
    pub gallery_cap: usize,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Text files with one image URL per line.
    pub url_lists: Vec<PathBuf>,
    /// Local directories whose images are imported as an extra source.
    pub import_dirs: Vec<PathBuf>,
    pub search_enhancements: Vec<String>,
    /// Web image search for `<name> <enhancements>`, after the gallery.
    pub image_search: bool,
    pub search_endpoint: String,
    pub search_region: String,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            min_raw_images: 120,
            max_images_per_source: 60,
            gallery_cap: 40,
            min_width: 150,
            min_height: 150,
            max_width: 4000,
            max_height: 4000,
            url_lists: Vec::new(),
            import_dirs: Vec::new(),
            search_enhancements: vec![
                "actor".to_string(),
                "film actor".to_string(),
                "movie star".to_string(),
            ],
            image_search: true,
            search_endpoint: "https://duckduckgo.com".to_string(),
            search_region: "us-en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Endpoint of the face analysis service.
    pub analyzer_url: Option<String>,
    pub confidence_threshold: f32,
    pub min_face_size: u32,
    pub max_faces_per_image: usize,
    /// Padding added around each face box, as a fraction of its size.
    pub crop_padding: f32,
    /// Persist a checkpoint after every N raw images.
    pub checkpoint_interval: usize,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            analyzer_url: None,
            confidence_threshold: 0.5,
            min_face_size: 50,
            max_faces_per_image: 2,
            crop_padding: 0.1,
            checkpoint_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub enabled: bool,
    pub similarity_threshold: f32,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeSettings {
    pub duplicate_threshold: f64,
    /// Side length of the perceptual hash grid (bits = size * size).
    pub hash_size: u32,
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.95,
            hash_size: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Multiplier applied to the backoff after an HTTP 429.
    pub rate_limit_backoff_factor: u32,
    pub timeout_secs: u64,
    /// Randomized pause between successive calls to the same host.
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub min_payload_bytes: usize,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
            rate_limit_backoff_factor: 4,
            timeout_secs: 30,
            min_delay_ms: 500,
            max_delay_ms: 1_500,
            min_payload_bytes: 5_000,
            user_agent: concat!("facesetrs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub target_images: usize,
    pub jpeg_quality: u8,
    /// Square edge the final images are resized to; `None` keeps the crop size.
    pub image_size: Option<u32>,
    pub save_metadata: bool,
    pub save_embeddings: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            target_images: 50,
            jpeg_quality: 95,
            image_size: Some(256),
            save_metadata: true,
            save_embeddings: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub resume: bool,
    pub show_progress: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            resume: true,
            show_progress: true,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| {
            PipelineError::configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Explicit file if given, otherwise `<config dir>/facesetrs/config.toml`
    /// when present, otherwise defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => {
                log::debug!("Loading settings from {}", path.display());
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Checks run before any stage starts.
    pub fn validate(&self) -> Result<()> {
        let has_key = self
            .metadata
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        if !has_key {
            return Err(PipelineError::configuration(
                "metadata API key not set (use --api-key or TMDB_API_KEY)",
            ));
        }
        if self.detection.analyzer_url.is_none() {
            return Err(PipelineError::configuration(
                "face analyzer endpoint not set (use --face-endpoint or FACE_ANALYZER_URL)",
            ));
        }
        self.validate_thresholds()
    }

    /// Range checks that do not depend on external credentials.
    pub fn validate_thresholds(&self) -> Result<()> {
        let similarity = self.verification.similarity_threshold;
        if !(0.0..=1.0).contains(&similarity) {
            return Err(PipelineError::configuration(format!(
                "similarity_threshold must be within [0, 1], got {similarity}"
            )));
        }
        let duplicate = self.dedupe.duplicate_threshold;
        if !(0.0..=1.0).contains(&duplicate) {
            return Err(PipelineError::configuration(format!(
                "duplicate_threshold must be within [0, 1], got {duplicate}"
            )));
        }
        if self.dedupe.hash_size == 0 {
            return Err(PipelineError::configuration("hash_size must be positive"));
        }
        if self.fetch.max_attempts == 0 {
            return Err(PipelineError::configuration("max_attempts must be at least 1"));
        }
        if self.fetch.min_delay_ms > self.fetch.max_delay_ms {
            return Err(PipelineError::configuration(
                "min_delay_ms must not exceed max_delay_ms",
            ));
        }
        if self.output.target_images == 0 {
            return Err(PipelineError::configuration("target_images must be positive"));
        }
        if self.download.image_search {
            url::Url::parse(&self.download.search_endpoint).map_err(|e| {
                PipelineError::configuration(format!(
                    "search_endpoint {:?} is not a URL: {e}",
                    self.download.search_endpoint
                ))
            })?;
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("facesetrs").join("config.toml"))
}
