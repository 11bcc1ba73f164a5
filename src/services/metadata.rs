use crate::config::MetadataSettings;
use crate::error::{PipelineError, Result};
use crate::services::fetch::HttpFetcher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One search hit for a display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateIdentity {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub popularity: f64,
    #[serde(default, rename = "profile_path")]
    pub profile_image_ref: Option<String>,
}

/// A single film or TV credit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub original_language: Option<String>,
    #[serde(default)]
    pub origin_country: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersonDetails {
    pub id: u64,
    pub name: String,
    pub profile_image_ref: Option<String>,
    pub credits: Vec<Credit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub file_path: String,
    #[serde(default)]
    pub vote_average: f64,
}

/// Resolves names to canonical identities. Disambiguation is left to the
/// caller.
pub trait MetadataSource: Send + Sync {
    fn search(&self, name: &str) -> Result<Vec<CandidateIdentity>>;

    fn details(&self, id: u64) -> Result<PersonDetails>;

    /// Gallery images, best rated first, at most `limit`.
    fn images(&self, id: u64, limit: usize) -> Result<Vec<ImageRef>>;

    /// Absolute URL for an image reference returned by this source.
    fn image_url(&self, image_ref: &str) -> String;
}

/// `<base>/<size><path>`, the TMDb image URL scheme.
pub fn image_url(base: &str, size: &str, image_ref: &str) -> String {
    let base = base.trim_end_matches('/');
    if image_ref.starts_with('/') {
        format!("{base}/{size}{image_ref}")
    } else {
        format!("{base}/{size}/{image_ref}")
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<CandidateIdentity>,
}

#[derive(Debug, Default, Deserialize)]
struct CombinedCredits {
    #[serde(default)]
    cast: Vec<Credit>,
}

#[derive(Debug, Deserialize)]
struct PersonResponse {
    id: u64,
    name: String,
    #[serde(default)]
    profile_path: Option<String>,
    #[serde(default)]
    combined_credits: CombinedCredits,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    profiles: Vec<ImageRef>,
}

pub struct TmdbClient {
    fetcher: Arc<HttpFetcher>,
    api_key: String,
    base_url: String,
    image_base_url: String,
}

impl TmdbClient {
    pub fn new(settings: &MetadataSettings, fetcher: Arc<HttpFetcher>) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| PipelineError::configuration("metadata API key not set"))?;
        Ok(Self {
            fetcher,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            image_base_url: settings.image_base_url.clone(),
        })
    }

    fn get<T: serde::de::DeserializeOwned>(&self, endpoint: &str, extra: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut query = vec![("api_key", self.api_key.as_str())];
        query.extend_from_slice(extra);
        Ok(self.fetcher.fetch_json(&url, &query)?)
    }
}

impl MetadataSource for TmdbClient {
    fn search(&self, name: &str) -> Result<Vec<CandidateIdentity>> {
        log::info!("Searching metadata for '{}'", name);
        let response: SearchResponse =
            self.get("search/person", &[("query", name), ("include_adult", "false")])?;
        log::info!("Found {} result(s) for '{}'", response.results.len(), name);
        Ok(response.results)
    }

    fn details(&self, id: u64) -> Result<PersonDetails> {
        let person: PersonResponse = self.get(
            &format!("person/{id}"),
            &[("append_to_response", "images,combined_credits")],
        )?;
        let credits: Vec<Credit> = person
            .combined_credits
            .cast
            .into_iter()
            .filter(|c| matches!(c.media_type.as_deref(), Some("movie") | Some("tv") | None))
            .collect();
        log::debug!("{} ({}) has {} credit(s)", person.name, person.id, credits.len());
        Ok(PersonDetails {
            id: person.id,
            name: person.name,
            profile_image_ref: person.profile_path,
            credits,
        })
    }

    fn images(&self, id: u64, limit: usize) -> Result<Vec<ImageRef>> {
        let response: ImagesResponse = self.get(&format!("person/{id}/images"), &[])?;
        let mut profiles = response.profiles;
        profiles.sort_by(|a, b| b.vote_average.total_cmp(&a.vote_average));
        profiles.truncate(limit);
        log::info!("Retrieved {} gallery image(s) for {}", profiles.len(), id);
        Ok(profiles)
    }

    fn image_url(&self, image_ref: &str) -> String {
        image_url(&self.image_base_url, "original", image_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchSettings;

    #[test]
    fn test_image_url() {
        assert_eq!(
            image_url("https://image.tmdb.org/t/p", "original", "/abc.jpg"),
            "https://image.tmdb.org/t/p/original/abc.jpg"
        );
        assert_eq!(
            image_url("https://image.tmdb.org/t/p/", "w500", "abc.jpg"),
            "https://image.tmdb.org/t/p/w500/abc.jpg"
        );
    }

    #[test]
    fn test_person_response_parses_credits() {
        let body = r#"{
            "id": 42,
            "name": "Nani",
            "profile_path": "/p.jpg",
            "combined_credits": {"cast": [
                {"title": "Eega", "media_type": "movie", "original_language": "te"},
                {"media_type": "tv", "original_language": "hi", "origin_country": ["IN"]}
            ]}
        }"#;
        let person: PersonResponse = serde_json::from_str(body).unwrap();
        assert_eq!(person.id, 42);
        assert_eq!(person.combined_credits.cast.len(), 2);
        assert_eq!(person.combined_credits.cast[1].origin_country, vec!["IN"]);
    }

    #[test]
    fn test_search_response_tolerates_missing_fields() {
        let body = r#"{"results": [{"id": 1, "name": "A"}, {"id": 2, "name": "B", "popularity": 3.5, "profile_path": "/b.jpg"}]}"#;
        let response: SearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.results[0].popularity, 0.0);
        assert_eq!(response.results[1].profile_image_ref.as_deref(), Some("/b.jpg"));
    }

    #[test]
    fn test_client_requires_api_key() {
        let fetcher = Arc::new(HttpFetcher::new(&FetchSettings::default()));
        let settings = MetadataSettings::default();
        assert!(matches!(
            TmdbClient::new(&settings, fetcher),
            Err(PipelineError::Configuration { .. })
        ));
    }
}
