use crate::config::FetchSettings;
use crate::core::layout::IMAGE_EXTENSIONS;
use crate::error::FetchError;
use rand::Rng;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use url::Url;

/// Upper bound on a single image payload.
const MAX_PAYLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Exponential backoff for retryable fetch failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra multiplier applied when the server rate-limited us.
    pub rate_limit_factor: u32,
}

impl RetryPolicy {
    pub fn from_settings(settings: &FetchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.backoff_base_ms),
            max_delay: Duration::from_millis(settings.backoff_max_ms),
            rate_limit_factor: settings.rate_limit_backoff_factor.max(1),
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// capped at `max_delay`, then scaled for rate limits.
    pub fn backoff(&self, attempt: u32, rate_limited: bool) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if rate_limited {
            delay.saturating_mul(self.rate_limit_factor)
        } else {
            delay
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are used up. The last error is returned.
    pub fn execute<T, F>(&self, label: &str, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Result<T, FetchError>,
    {
        let mut attempt = 1u32;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let rate_limited = matches!(error, FetchError::RateLimited { .. });
                    let delay = self.backoff(attempt, rate_limited);
                    log::warn!(
                        "{} attempt {}/{} failed ({}), retrying in {:?}",
                        label,
                        attempt,
                        self.max_attempts,
                        error,
                        delay
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Map an HTTP status to a fetch failure.
pub fn classify_status(url: &str, status: u16) -> FetchError {
    let url = url.to_string();
    match status {
        401 | 403 => FetchError::Unauthorized { url, status },
        404 | 410 => FetchError::NotFound { url },
        429 => FetchError::RateLimited { url },
        408 | 500..=599 => FetchError::Transient {
            url,
            reason: format!("HTTP {status}"),
        },
        _ => FetchError::Rejected { url, status },
    }
}

pub fn classify_ureq_failure(url: &str, error: ureq::Error) -> FetchError {
    match error {
        ureq::Error::Status(status, _) => classify_status(url, status),
        ureq::Error::Transport(transport) => FetchError::Transient {
            url: url.to_string(),
            reason: transport.to_string(),
        },
    }
}

/// Lowercased `host[:port]` of a parsed URL. Default ports are omitted.
fn host_key(target: &Url) -> Option<String> {
    let host = target.host_str()?;
    Some(match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Throttling key for `url`; `None` when it is not an absolute URL.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok().as_ref().and_then(host_key)
}

/// Key of the failure memo: the whole normalised URL, query included.
/// Fragments never reach the server and are dropped.
pub fn memo_key(target: &Url) -> String {
    let mut key = target.clone();
    key.set_fragment(None);
    key.into()
}

/// Extension for a downloaded payload: the URL's own image extension if it has
/// one, otherwise derived from the content type.
pub fn extension_for(url: &str, content_type: &str) -> String {
    let file_name = Url::parse(url)
        .ok()
        .and_then(|target| target.path_segments()?.next_back().map(str::to_string));
    if let Some((_, ext)) = file_name.as_deref().and_then(|name| name.rsplit_once('.')) {
        let ext = ext.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return if ext == "jpeg" { "jpg".to_string() } else { ext };
        }
    }
    match content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "jpg",
    }
    .to_string()
}

/// Minimum spacing between requests to the same host, with random jitter.
pub struct Throttle {
    min_delay: Duration,
    max_delay: Duration,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl Throttle {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            last_request: Mutex::new(HashMap::new()),
        }
    }

    fn jittered_delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Block until `host` may be contacted again, then mark it as contacted.
    pub fn wait(&self, host: &str) {
        if self.max_delay.is_zero() {
            return;
        }
        let wait = {
            let Ok(last) = self.last_request.lock() else {
                return;
            };
            last.get(host)
                .map(|at| self.jittered_delay().saturating_sub(at.elapsed()))
                .unwrap_or_default()
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        if let Ok(mut last) = self.last_request.lock() {
            last.insert(host.to_string(), Instant::now());
        }
    }
}

/// Running tally of fetch activity for the download report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchStats {
    pub requests: u64,
    pub retries: u64,
    pub succeeded: u64,
    pub skipped_memoized: u64,
    pub failures: BTreeMap<String, u64>,
}

impl FetchStats {
    pub fn failed(&self) -> u64 {
        self.failures.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub url: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub extension: String,
}

/// Anything that can hand back image bytes for a URL.
pub trait ImageFetcher: Send + Sync {
    fn fetch_image(&self, url: &str) -> Result<FetchedImage, FetchError>;

    fn stats(&self) -> FetchStats {
        FetchStats::default()
    }
}

/// Blocking HTTP client with retries, per-host throttling and a memo of
/// URLs that already failed permanently in this run.
pub struct HttpFetcher {
    agent: ureq::Agent,
    policy: RetryPolicy,
    throttle: Throttle,
    min_payload_bytes: usize,
    failed_urls: Mutex<HashSet<String>>,
    stats: Mutex<FetchStats>,
}

impl HttpFetcher {
    pub fn new(settings: &FetchSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(settings.timeout())
            .user_agent(&settings.user_agent)
            .build();
        Self {
            agent,
            policy: RetryPolicy::from_settings(settings),
            throttle: Throttle::new(
                Duration::from_millis(settings.min_delay_ms),
                Duration::from_millis(settings.max_delay_ms),
            ),
            min_payload_bytes: settings.min_payload_bytes,
            failed_urls: Mutex::new(HashSet::new()),
            stats: Mutex::new(FetchStats::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_memoized(&self, url: &str) -> bool {
        self.failed_urls
            .lock()
            .map(|failed| failed.contains(url))
            .unwrap_or(false)
    }

    fn with_stats(&self, update: impl FnOnce(&mut FetchStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    fn record_failure(&self, key: &str, error: &FetchError) {
        if error.poisons_url() {
            if let Ok(mut failed) = self.failed_urls.lock() {
                failed.insert(key.to_string());
            }
        }
        let kind = error.kind().as_str().to_string();
        self.with_stats(|s| *s.failures.entry(kind).or_default() += 1);
    }

    /// Parse `url` and append `query`. A malformed URL counts as a failed
    /// request without touching the network.
    fn target(&self, url: &str, query: &[(&str, &str)]) -> Result<Url, FetchError> {
        match Url::parse(url) {
            Ok(mut target) => {
                if !query.is_empty() {
                    target.query_pairs_mut().extend_pairs(query);
                }
                Ok(target)
            }
            Err(e) => {
                let error = FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: e.to_string(),
                };
                self.record_failure(url, &error);
                Err(error)
            }
        }
    }

    /// Retry `once` against `target` under the policy. `label` names the
    /// request in errors and logs, so query secrets such as API keys stay
    /// out of them.
    fn retrying<T>(
        &self,
        label: &str,
        target: &Url,
        mut once: impl FnMut() -> Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        let key = memo_key(target);
        if self.is_memoized(&key) {
            self.with_stats(|s| s.skipped_memoized += 1);
            return Err(FetchError::Memoized {
                url: label.to_string(),
            });
        }
        let host = host_key(target);
        let result = self.policy.execute(label, |attempt| {
            self.with_stats(|s| {
                s.requests += 1;
                if attempt > 1 {
                    s.retries += 1;
                }
            });
            if let Some(host) = &host {
                self.throttle.wait(host);
            }
            once()
        });
        match &result {
            Ok(_) => self.with_stats(|s| s.succeeded += 1),
            Err(error) => self.record_failure(&key, error),
        }
        result
    }

    fn get_decoded<T>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
        accept: &str,
        decode: impl Fn(ureq::Response) -> io::Result<T>,
    ) -> Result<T, FetchError> {
        let target = self.target(url, query)?;
        self.retrying(url, &target, || {
            let mut request = self.agent.get(target.as_str()).set("Accept", accept);
            for (name, value) in headers {
                request = request.set(name, value);
            }
            let response = request
                .call()
                .map_err(|e| classify_ureq_failure(url, e))?;
            decode(response).map_err(|e| FetchError::InvalidResponse {
                url: url.to_string(),
                reason: e.to_string(),
            })
        })
    }

    /// GET `url` with query parameters and decode a JSON body.
    pub fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        self.fetch_json_with(url, query, &[])
    }

    /// `fetch_json` with extra request headers.
    pub fn fetch_json_with<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        self.get_decoded(url, query, headers, "application/json", |response| {
            response.into_json::<T>()
        })
    }

    /// GET a page as text.
    pub fn fetch_text(
        &self,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<String, FetchError> {
        self.get_decoded(url, query, headers, "text/html,*/*", |response| {
            response.into_string()
        })
    }

    /// POST a binary body and decode a JSON reply. Retried like any other
    /// call, but never memoized: the endpoint is a service, not a payload.
    pub fn post_for_json<T: DeserializeOwned>(
        &self,
        url: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<T, FetchError> {
        self.policy.execute(url, |attempt| {
            self.with_stats(|s| {
                s.requests += 1;
                if attempt > 1 {
                    s.retries += 1;
                }
            });
            let response = self
                .agent
                .post(url)
                .set("Content-Type", content_type)
                .set("Accept", "application/json")
                .send_bytes(body)
                .map_err(|e| classify_ureq_failure(url, e))?;
            response
                .into_json::<T>()
                .map_err(|e| FetchError::InvalidResponse {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
        })
    }

    fn fetch_image_once(&self, url: &str, target: &Url) -> Result<FetchedImage, FetchError> {
        let response = self
            .agent
            .get(target.as_str())
            .call()
            .map_err(|e| classify_ureq_failure(url, e))?;

        let content_type = response.content_type().to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(FetchError::NotAnImage {
                url: url.to_string(),
                content_type,
            });
        }

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_PAYLOAD_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|e| FetchError::Transient {
                url: url.to_string(),
                reason: format!("failed to read body: {e}"),
            })?;

        if bytes.len() < self.min_payload_bytes {
            return Err(FetchError::TooSmall {
                url: url.to_string(),
                bytes: bytes.len(),
            });
        }

        Ok(FetchedImage {
            url: url.to_string(),
            extension: extension_for(url, &content_type),
            content_type,
            bytes,
        })
    }
}

impl ImageFetcher for HttpFetcher {
    fn fetch_image(&self, url: &str) -> Result<FetchedImage, FetchError> {
        let target = self.target(url, &[])?;
        self.retrying(url, &target, || self.fetch_image_once(url, &target))
    }

    fn stats(&self) -> FetchStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}
