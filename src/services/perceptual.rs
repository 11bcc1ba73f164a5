use crate::core::duplicate::Fingerprint;
use crate::error::{PipelineError, Result};
use image::ImageReader;
use image_hasher::{HashAlg, Hasher, HasherConfig};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, path: &Path) -> Result<Fingerprint>;
}

/// DCT-preprocessed median hash (pHash style) of a `hash_size` x `hash_size` grid.
pub struct PerceptualHasher {
    hasher: Hasher,
}

impl PerceptualHasher {
    pub fn new(hash_size: u32) -> Self {
        let hasher = HasherConfig::new()
            .hash_size(hash_size, hash_size)
            .hash_alg(HashAlg::Median)
            .preproc_dct()
            .to_hasher();
        Self { hasher }
    }
}

impl Fingerprinter for PerceptualHasher {
    fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        let img = ImageReader::open(path)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| PipelineError::data_integrity(path.display().to_string(), e))?;
        let hash = self.hasher.hash_image(&img);
        Ok(Fingerprint::new(hash.as_bytes().to_vec()))
    }
}

/// Hash every path in parallel. Failures become `None` and are logged.
pub fn fingerprint_all(fingerprinter: &dyn Fingerprinter, paths: &[PathBuf]) -> Vec<Option<Fingerprint>> {
    paths
        .par_iter()
        .map(|path| match fingerprinter.fingerprint(path) {
            Ok(fp) => Some(fp),
            Err(e) => {
                log::warn!("Could not fingerprint {}: {}", path.display(), e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn gradient(path: &Path) {
        let img = RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]));
        img.save(path).unwrap();
    }

    fn checkerboard(path: &Path) {
        let img = RgbImage::from_fn(64, 64, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) }
        });
        img.save(path).unwrap();
    }

    #[test]
    fn test_identical_images_match_and_different_do_not() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a.png");
        let b = temp_dir.path().join("b.png");
        let c = temp_dir.path().join("c.png");
        gradient(&a);
        gradient(&b);
        checkerboard(&c);

        let hasher = PerceptualHasher::new(8);
        let fa = hasher.fingerprint(&a).unwrap();
        let fb = hasher.fingerprint(&b).unwrap();
        let fc = hasher.fingerprint(&c).unwrap();
        assert_eq!(fa.bit_len(), 64);
        assert_eq!(fa.similarity(&fb), 1.0);
        assert!(fa.similarity(&fc) < 1.0);
    }

    #[test]
    fn test_unreadable_file_yields_none() {
        let temp_dir = TempDir::new().unwrap();
        let bad = temp_dir.path().join("bad.jpg");
        std::fs::write(&bad, b"not an image").unwrap();
        let good = temp_dir.path().join("good.png");
        gradient(&good);

        let hasher = PerceptualHasher::new(8);
        let prints = fingerprint_all(&hasher, &[bad, good]);
        assert!(prints[0].is_none());
        assert!(prints[1].is_some());
    }
}
