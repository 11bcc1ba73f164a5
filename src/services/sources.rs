use crate::config::DownloadSettings;
use crate::core::layout::is_image_file;
use crate::core::models::IdentityProfile;
use crate::error::{PipelineError, Result};
use crate::services::fetch::HttpFetcher;
use crate::services::metadata::MetadataSource;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;
use walkdir::WalkDir;

/// Result pages requested per image search.
const SEARCH_PAGE_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageLocation {
    Remote(String),
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedImage {
    pub source_id: String,
    pub location: ImageLocation,
}

impl SourcedImage {
    pub fn remote(source_id: &str, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            location: ImageLocation::Remote(url.into()),
        }
    }

    pub fn local(source_id: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.to_string(),
            location: ImageLocation::Local(path.into()),
        }
    }
}

/// Produces candidate images for an identity. Sources are consulted in order
/// until the raw target is met.
pub trait ImageSource: Send + Sync {
    /// Short provenance tag, also the file-name prefix of downloads.
    fn id(&self) -> &str;

    fn collect(&self, profile: &IdentityProfile, limit: usize) -> Result<Vec<SourcedImage>>;
}

/// `<name> <term> <term> ...` using at most three enhancement terms.
pub fn build_search_query(display_name: &str, enhancements: &[String]) -> String {
    let mut parts = vec![display_name.trim().to_string()];
    parts.extend(
        enhancements
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .take(3)
            .map(str::to_string),
    );
    let query = parts.join(" ");
    log::debug!("Built search query: {}", query);
    query
}

/// The identity's gallery from the metadata service, profile picture first.
pub struct GallerySource {
    metadata: Arc<dyn MetadataSource>,
    cap: usize,
}

impl GallerySource {
    pub fn new(metadata: Arc<dyn MetadataSource>, cap: usize) -> Self {
        Self { metadata, cap }
    }
}

impl ImageSource for GallerySource {
    fn id(&self) -> &str {
        "tmdb"
    }

    fn collect(&self, profile: &IdentityProfile, limit: usize) -> Result<Vec<SourcedImage>> {
        let mut refs: Vec<&str> = Vec::new();
        if let Some(profile_ref) = profile.profile_image_ref.as_deref() {
            refs.push(profile_ref);
        }
        for image_ref in &profile.candidate_image_refs {
            if !refs.contains(&image_ref.as_str()) {
                refs.push(image_ref);
            }
        }
        Ok(refs
            .into_iter()
            .take(limit.min(self.cap))
            .map(|r| SourcedImage::remote(self.id(), self.metadata.image_url(r)))
            .collect())
    }
}

/// Plain-text URL lists, one URL per line. `#` starts a comment; a `{query}`
/// placeholder is replaced by the encoded search query for the identity.
pub struct UrlListSource {
    files: Vec<PathBuf>,
    enhancements: Vec<String>,
}

impl UrlListSource {
    pub fn new(files: Vec<PathBuf>, enhancements: Vec<String>) -> Self {
        Self {
            files,
            enhancements,
        }
    }
}

impl ImageSource for UrlListSource {
    fn id(&self) -> &str {
        "urls"
    }

    fn collect(&self, profile: &IdentityProfile, limit: usize) -> Result<Vec<SourcedImage>> {
        let query = build_search_query(&profile.display_name, &self.enhancements);
        let query = urlencoding::encode(&query);
        let mut out = Vec::new();
        for file in &self.files {
            let text = match fs::read_to_string(file) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("Skipping URL list {}: {}", file.display(), e);
                    continue;
                }
            };
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let url = line.replace("{query}", &query);
                if !out.iter().any(|s: &SourcedImage| s.location == ImageLocation::Remote(url.clone())) {
                    out.push(SourcedImage::remote(self.id(), url));
                }
                if out.len() >= limit {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }
}

/// Web image search. The regular results page hands out a request token,
/// which the JSON image endpoint then pages through.
pub struct ImageSearchSource {
    fetcher: Arc<HttpFetcher>,
    endpoint: String,
    region: String,
    enhancements: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<SearchHit>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    image: String,
}

/// The `vqd` request token embedded in a results page.
pub fn extract_vqd(html: &str) -> Option<String> {
    let re = Regex::new(r#"vqd=["']?([0-9-]+)"#).ok()?;
    re.captures(html)?
        .get(1)
        .map(|token| token.as_str().to_string())
}

/// The `s` offset of a relative next-page link.
pub fn next_offset(next: &str) -> Option<String> {
    let page = Url::parse("https://localhost/").ok()?.join(next).ok()?;
    page.query_pairs()
        .find(|(key, _)| key == "s")
        .map(|(_, value)| value.into_owned())
}

impl ImageSearchSource {
    pub fn new(
        fetcher: Arc<HttpFetcher>,
        endpoint: impl Into<String>,
        region: impl Into<String>,
        enhancements: Vec<String>,
    ) -> Self {
        let endpoint: String = endpoint.into();
        Self {
            fetcher,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            region: region.into(),
            enhancements,
        }
    }

    fn token(&self, query: &str) -> Result<String> {
        let page = self.fetcher.fetch_text(
            &self.endpoint,
            &[("q", query), ("iax", "images"), ("ia", "images")],
            &[],
        )?;
        extract_vqd(&page).ok_or_else(|| PipelineError::NotFound {
            what: format!("image search token for {query:?}"),
        })
    }
}

impl ImageSource for ImageSearchSource {
    fn id(&self) -> &str {
        "search"
    }

    fn collect(&self, profile: &IdentityProfile, limit: usize) -> Result<Vec<SourcedImage>> {
        let query = build_search_query(&profile.display_name, &self.enhancements);
        let vqd = self.token(&query)?;
        let images_url = format!("{}/i.js", self.endpoint);
        let referer = format!("{}/", self.endpoint);

        let mut urls: Vec<String> = Vec::new();
        let mut offset: Option<String> = None;
        for page_number in 0..SEARCH_PAGE_LIMIT {
            if urls.len() >= limit {
                break;
            }
            let mut params: Vec<(&str, &str)> = vec![
                ("q", query.as_str()),
                ("o", "json"),
                ("l", self.region.as_str()),
                ("vqd", vqd.as_str()),
                ("f", ",,,,,"),
                ("p", "1"),
            ];
            if let Some(offset) = offset.as_deref() {
                params.push(("s", offset));
            }
            let page: SearchPage = match self.fetcher.fetch_json_with(
                &images_url,
                &params,
                &[("Referer", referer.as_str())],
            ) {
                Ok(page) => page,
                Err(e) if page_number > 0 => {
                    log::warn!("Image search stopped after {} page(s): {}", page_number, e);
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            for hit in page.results {
                if urls.len() >= limit {
                    break;
                }
                if hit.image.starts_with("http") && !urls.contains(&hit.image) {
                    urls.push(hit.image);
                }
            }
            match page.next.as_deref().and_then(next_offset) {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        log::debug!("Image search for {:?} found {} URL(s)", query, urls.len());
        Ok(urls
            .into_iter()
            .map(|url| SourcedImage::remote(self.id(), url))
            .collect())
    }
}

/// Images already on local disk, e.g. a manually curated folder.
pub struct ImportSource {
    dirs: Vec<PathBuf>,
}

impl ImportSource {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl ImageSource for ImportSource {
    fn id(&self) -> &str {
        "import"
    }

    fn collect(&self, _profile: &IdentityProfile, limit: usize) -> Result<Vec<SourcedImage>> {
        let mut paths = Vec::new();
        for dir in &self.dirs {
            for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() && is_image_file(entry.path()) {
                    paths.push(entry.into_path());
                }
            }
        }
        paths.sort();
        paths.truncate(limit);
        Ok(paths
            .into_iter()
            .map(|p| SourcedImage::local(self.id(), p))
            .collect())
    }
}

/// Gallery first, then image search, URL lists and imports when configured.
pub fn default_sources(
    settings: &DownloadSettings,
    metadata: Arc<dyn MetadataSource>,
    fetcher: Arc<HttpFetcher>,
) -> Vec<Box<dyn ImageSource>> {
    let mut sources: Vec<Box<dyn ImageSource>> =
        vec![Box::new(GallerySource::new(metadata, settings.gallery_cap))];
    if settings.image_search {
        sources.push(Box::new(ImageSearchSource::new(
            fetcher,
            settings.search_endpoint.clone(),
            settings.search_region.clone(),
            settings.search_enhancements.clone(),
        )));
    }
    if !settings.url_lists.is_empty() {
        sources.push(Box::new(UrlListSource::new(
            settings.url_lists.clone(),
            settings.search_enhancements.clone(),
        )));
    }
    if !settings.import_dirs.is_empty() {
        sources.push(Box::new(ImportSource::new(settings.import_dirs.clone())));
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchSettings;
    use crate::services::test_server::{Reply, TestServer};
    use tempfile::TempDir;

    fn profile() -> IdentityProfile {
        IdentityProfile {
            canonical_id: 7,
            display_name: "Sai Pallavi".to_string(),
            candidate_image_refs: vec!["/a.jpg".to_string(), "/p.jpg".to_string(), "/b.jpg".to_string()],
            profile_image_ref: Some("/p.jpg".to_string()),
            credit_count: 10,
            confirmed: true,
            confirmation_rationale: String::new(),
        }
    }

    #[test]
    fn test_build_search_query() {
        let terms = vec![
            "actor".to_string(),
            " ".to_string(),
            "film actor".to_string(),
            "movie star".to_string(),
            "extra".to_string(),
        ];
        assert_eq!(
            build_search_query(" Nani ", &terms),
            "Nani actor film actor movie star"
        );
        assert_eq!(build_search_query("Nani", &[]), "Nani");
    }

    #[test]
    fn test_url_list_source_skips_comments_and_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let list = temp_dir.path().join("urls.txt");
        fs::write(
            &list,
            "# favourites\nhttps://x/1.jpg\n\nhttps://x/1.jpg\nhttps://s/?q={query}\nhttps://x/3.jpg\n",
        )
        .unwrap();
        let source = UrlListSource::new(
            vec![list, temp_dir.path().join("missing.txt")],
            vec!["actor".to_string()],
        );

        let found = source.collect(&profile(), 10).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(
            found[1].location,
            ImageLocation::Remote("https://s/?q=Sai%20Pallavi%20actor".to_string())
        );
        assert!(found.iter().all(|s| s.source_id == "urls"));

        assert_eq!(source.collect(&profile(), 2).unwrap().len(), 2);
    }

    #[test]
    fn test_import_source_walks_directories() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(temp_dir.path().join("b.jpg"), b"x").unwrap();
        fs::write(nested.join("a.png"), b"x").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();

        let source = ImportSource::new(vec![temp_dir.path().to_path_buf()]);
        let found = source.collect(&profile(), 10).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found
            .iter()
            .all(|s| matches!(s.location, ImageLocation::Local(_))));
    }

    fn search_source(server: &TestServer) -> ImageSearchSource {
        let fetcher = HttpFetcher::new(&FetchSettings {
            max_attempts: 1,
            min_delay_ms: 0,
            max_delay_ms: 0,
            ..FetchSettings::default()
        });
        ImageSearchSource::new(
            Arc::new(fetcher),
            server.url("/"),
            "us-en",
            vec!["actor".to_string()],
        )
    }

    #[test]
    fn test_extract_vqd() {
        assert_eq!(
            extract_vqd(r#"<script>DDG.deep.initialize('/d.js?q=x&vqd="4-2837461"&p=1');</script>"#)
                .as_deref(),
            Some("4-2837461")
        );
        assert_eq!(extract_vqd("vqd=4-99&kl=us").as_deref(), Some("4-99"));
        assert_eq!(extract_vqd("<html>no token</html>"), None);
    }

    #[test]
    fn test_next_offset() {
        assert_eq!(
            next_offset("i.js?q=nani&o=json&p=1&s=100&u=bing&f=,,,&l=us-en").as_deref(),
            Some("100")
        );
        assert_eq!(next_offset("i.js?q=nani"), None);
    }

    #[test]
    fn test_image_search_source_pages_through_results() {
        let server = TestServer::start(|target| {
            if !target.starts_with("/i.js") {
                return Reply::ok("text/html", r#"<script>vqd="4-1234";</script>"#);
            }
            if !target.contains("vqd=4-1234") || !target.contains("q=Sai+Pallavi+actor") {
                return Reply::status(400);
            }
            if target.contains("s=100") {
                Reply::ok(
                    "application/json",
                    r#"{"results":[{"image":"https://img/3.jpg"},{"image":"https://img/1.jpg"},{"image":"https://img/4.jpg"}]}"#,
                )
            } else {
                Reply::ok(
                    "application/json",
                    r#"{"results":[{"image":"https://img/1.jpg"},{"image":"data:image/png;base64,AA"},{"image":"https://img/2.jpg"}],"next":"i.js?q=x&o=json&s=100"}"#,
                )
            }
        });
        let source = search_source(&server);

        let found = source.collect(&profile(), 10).unwrap();
        let urls: Vec<ImageLocation> = found.iter().map(|s| s.location.clone()).collect();
        assert_eq!(
            urls,
            ["1", "2", "3", "4"]
                .iter()
                .map(|n| ImageLocation::Remote(format!("https://img/{n}.jpg")))
                .collect::<Vec<_>>()
        );
        assert!(found.iter().all(|s| s.source_id == "search"));
        assert_eq!(server.hits(), 3);

        assert_eq!(source.collect(&profile(), 2).unwrap().len(), 2);
    }

    #[test]
    fn test_image_search_keeps_results_when_a_later_page_fails() {
        let server = TestServer::start(|target| {
            if !target.starts_with("/i.js") {
                Reply::ok("text/html", "vqd='4-77'")
            } else if target.contains("s=50") {
                Reply::status(500)
            } else {
                Reply::ok(
                    "application/json",
                    r#"{"results":[{"image":"https://img/a.jpg"}],"next":"i.js?s=50"}"#,
                )
            }
        });
        let found = search_source(&server).collect(&profile(), 10).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_image_search_without_token_is_a_source_error() {
        let server = TestServer::start(|_| Reply::ok("text/html", "<html></html>"));
        assert!(matches!(
            search_source(&server).collect(&profile(), 10),
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_default_sources_order() {
        let fetcher = Arc::new(HttpFetcher::new(&FetchSettings::default()));
        let metadata_settings = crate::config::MetadataSettings {
            api_key: Some("key".to_string()),
            ..Default::default()
        };
        let metadata: Arc<dyn MetadataSource> = Arc::new(
            crate::services::metadata::TmdbClient::new(&metadata_settings, Arc::clone(&fetcher))
                .unwrap(),
        );
        let ids = |settings: &DownloadSettings| -> Vec<String> {
            default_sources(settings, Arc::clone(&metadata), Arc::clone(&fetcher))
                .iter()
                .map(|s| s.id().to_string())
                .collect()
        };

        assert_eq!(ids(&DownloadSettings::default()), vec!["tmdb", "search"]);
        let settings = DownloadSettings {
            image_search: false,
            url_lists: vec![PathBuf::from("urls.txt")],
            import_dirs: vec![PathBuf::from("curated")],
            ..DownloadSettings::default()
        };
        assert_eq!(ids(&settings), vec!["tmdb", "urls", "import"]);
    }
}
