pub mod face;
pub mod fetch;
pub mod hash;
pub mod metadata;
pub mod perceptual;
pub mod sources;
#[cfg(test)]
pub(crate) mod test_server;

pub use face::{DetectedFace, FaceAnalyzer, HttpFaceAnalyzer};
pub use fetch::{FetchedImage, HttpFetcher, ImageFetcher, RetryPolicy};
pub use metadata::{MetadataSource, TmdbClient};
pub use perceptual::{Fingerprinter, PerceptualHasher};
pub use sources::{ImageSearchSource, ImageSource, SourcedImage};
