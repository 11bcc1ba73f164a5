use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "webp", "tiff"];

/// Normalize a display name into a directory-safe identity key:
/// lowercase, spaces to underscores, other symbols dropped, runs collapsed.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase().replace(' ', "_");
    let mut out = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            if ch == '_' && out.ends_with('_') {
                continue;
            }
            out.push(ch);
        }
    }
    out
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// On-disk layout for one identity.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    identity: String,
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>, display_name: &str) -> Self {
        Self {
            identity: normalize_name(display_name),
            root: root.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw").join(&self.identity)
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.raw_dir().join("faces")
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.raw_dir().join("checkpoint.json")
    }

    pub fn profile_file(&self) -> PathBuf {
        self.raw_dir().join("profile.json")
    }

    pub fn person_dir(&self) -> PathBuf {
        self.root.join("people").join(&self.identity)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.person_dir().join("images")
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.person_dir().join("metadata.json")
    }

    pub fn embeddings_file(&self) -> PathBuf {
        self.person_dir().join("embeddings.json")
    }

    pub fn ensure_raw_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.faces_dir())
    }

    /// Drop everything collected for this identity under `raw/`.
    pub fn reset_raw(&self) -> io::Result<()> {
        let raw = self.raw_dir();
        if raw.exists() {
            fs::remove_dir_all(&raw)?;
        }
        Ok(())
    }

    /// Image files directly inside the raw directory, sorted by name.
    pub fn raw_images(&self) -> io::Result<Vec<PathBuf>> {
        list_images(&self.raw_dir())
    }
}

/// Non-recursive, name-sorted listing of image files in `dir`.
pub fn list_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut images = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        if entry.file_type().is_file() && is_image_file(path) {
            images.push(path.to_path_buf());
        }
    }
    images.sort();
    Ok(images)
}
