//! Network access with conditional revalidation and cache fallback.
//!
//! [`Fetcher`] owns the HTTP clients, the run-wide concurrency limit and a
//! handle to the shared [`Caches`]. None of its operations return errors:
//! a failed request degrades to the last cached payload, an empty string or
//! `None`, and the [`FetchSource`] in the result says which.

use chrono::Utc;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, ETAG, HeaderMap, HeaderName, HeaderValue, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, REFERER, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::cache::Caches;
use crate::config::Config;
use crate::error::Result;
use crate::models::{FeedCacheEntry, ImageCacheEntry};
use crate::origin::Origin;
use crate::utils::image_cache_key;

/// How a [`Fetched`] payload was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Fresh 2xx response.
    Network,
    /// 304; the cached payload was reused.
    NotModified,
    /// The request failed and the last good payload was returned.
    Stale,
    /// The request failed and nothing was cached.
    Failed,
}

#[derive(Debug, Clone)]
pub struct FetchMeta {
    pub source: FetchSource,
    pub status: Option<u16>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub payload: Vec<u8>,
    pub meta: FetchMeta,
}

impl Fetched {
    fn failed(status: Option<u16>) -> Self {
        Self {
            payload: Vec::new(),
            meta: FetchMeta {
                source: FetchSource::Failed,
                status,
                etag: None,
                last_modified: None,
            },
        }
    }

    fn from_cache(entry: &FeedCacheEntry, source: FetchSource, status: Option<u16>) -> Option<Self> {
        let payload = entry.payload_bytes()?;
        Some(Self {
            payload,
            meta: FetchMeta {
                source,
                status,
                etag: entry.etag.clone(),
                last_modified: entry.last_modified.clone(),
            },
        })
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Image container formats recognized from leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageFormat {
    pub fn sniff(data: &[u8]) -> Option<ImageFormat> {
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormat::Png)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }
}

/// Stored file name for an image: hash of the normalized URL plus extension.
pub fn image_file_name_for(url: &str, format: ImageFormat) -> String {
    let digest = Sha256::digest(image_cache_key(url).as_bytes());
    let hash = hex::encode(digest);
    format!("{}.{}", &hash[..16], format.extension())
}

/// Hosts whose certificate chains do not validate.
fn needs_lenient_tls(url: &str) -> bool {
    url.contains("rss.cnbeta.com.tw")
}

/// Extra request headers for origins that reject default clients.
fn origin_headers(origin: Origin) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if origin == Origin::NineToFiveMac {
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/rss+xml, application/xml;q=0.9, */*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(REFERER, HeaderValue::from_static("https://9to5mac.com/"));
    }
    headers
}

/// Referer for an image request: explicit, then origin-specific, then the
/// image host's own root.
pub fn choose_referer(url: &str, explicit: Option<&str>) -> Option<String> {
    if let Some(referer) = explicit.filter(|r| !r.trim().is_empty()) {
        return Some(referer.to_string());
    }
    if let Some(referer) = Origin::from_url(url).image_referer() {
        return Some(referer.to_string());
    }
    let mut parsed = Url::parse(url).ok()?;
    parsed.set_path("/");
    parsed.set_query(None);
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

/// Shared HTTP front end for feeds, pages and images.
#[derive(Debug)]
pub struct Fetcher {
    client: Client,
    lenient: Client,
    caches: Arc<Caches>,
    permits: Arc<Semaphore>,
    user_agent: String,
    image_dir: PathBuf,
    image_timeout: Duration,
    image_ttl_secs: i64,
}

impl Fetcher {
    /// Build the clients and the concurrency limit from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(config: &Config, caches: Arc<Caches>) -> Result<Fetcher> {
        let timeout = Duration::from_secs(config.page_timeout_secs);
        let client = Client::builder().timeout(timeout).build()?;
        let lenient = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Fetcher {
            client,
            lenient,
            caches,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            user_agent: config.user_agent.clone(),
            image_dir: config.image_dir.clone(),
            image_timeout: Duration::from_secs(config.image_timeout_secs),
            image_ttl_secs: (config.image_ttl_hours * 3600.0) as i64,
        })
    }

    pub fn caches(&self) -> &Arc<Caches> {
        &self.caches
    }

    fn client_for(&self, url: &str) -> &Client {
        if needs_lenient_tls(url) {
            &self.lenient
        } else {
            &self.client
        }
    }

    /// Conditionally fetch a feed or listing URL.
    ///
    /// Cached revalidation tokens are forwarded. A 2xx response replaces the
    /// cache entry, a 304 returns the cached payload and refreshes its
    /// timestamp, and any failure returns the cached payload when there is
    /// one, else an empty result.
    ///
    /// # Arguments
    ///
    /// * `url` - Feed or listing URL; also the feed-cache key
    ///
    /// # Returns
    ///
    /// A [`Fetched`] whose [`FetchMeta`] records where the payload came from.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch(&self, url: &str) -> Fetched {
        let cached = self.caches.feeds.get(url);
        let mut request = self
            .client_for(url)
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .headers(origin_headers(Origin::from_url(url)));
        if let Some(entry) = &cached {
            if let Some(etag) = entry.etag.as_deref().filter(|s| !s.is_empty()) {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(modified) = entry.last_modified.as_deref().filter(|s| !s.is_empty()) {
                request = request.header(IF_MODIFIED_SINCE, modified);
            }
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return fall_back(url, cached.as_ref(), None, "limiter closed");
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return fall_back(url, cached.as_ref(), None, &e.to_string()),
        };
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(mut entry) = cached {
                if let Some(fetched) = Fetched::from_cache(&entry, FetchSource::NotModified, Some(304)) {
                    // Revalidated entries count as fresh for garbage collection.
                    entry.timestamp = Utc::now().timestamp();
                    self.caches.feeds.insert(url, entry);
                    debug!(%url, "Not modified; reusing cached payload");
                    return fetched;
                }
            }
            return fall_back(url, None, Some(304), "304 without a cached payload");
        }
        if !status.is_success() {
            return fall_back(url, cached.as_ref(), Some(status.as_u16()), status.as_str());
        }

        let etag = header_string(response.headers(), ETAG);
        let last_modified = header_string(response.headers(), LAST_MODIFIED);
        match response.bytes().await {
            Ok(body) => {
                let payload = body.to_vec();
                self.caches.feeds.insert(
                    url,
                    FeedCacheEntry::new(&payload, etag.clone(), last_modified.clone(), Utc::now().timestamp()),
                );
                debug!(%url, bytes = payload.len(), "Fetched");
                Fetched {
                    payload,
                    meta: FetchMeta {
                        source: FetchSource::Network,
                        status: Some(status.as_u16()),
                        etag,
                        last_modified,
                    },
                }
            }
            Err(e) => fall_back(url, cached.as_ref(), Some(status.as_u16()), &e.to_string()),
        }
    }

    /// Fetch a full article page as text, decoding invalid UTF-8 lossily.
    ///
    /// Returns an empty string on any failure.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_rendered_text(&self, url: &str) -> String {
        let Ok(_permit) = self.permits.acquire().await else {
            return String::new();
        };
        let result = async {
            let response = self
                .client_for(url)
                .get(url)
                .header(USER_AGENT, &self.user_agent)
                .send()
                .await?
                .error_for_status()?;
            response.bytes().await
        }
        .await;
        match result {
            Ok(body) => String::from_utf8_lossy(&body).into_owned(),
            Err(e) => {
                warn!(%url, error = %e, "Page fetch failed");
                String::new()
            }
        }
    }

    /// Download an image into the image directory.
    ///
    /// Reuses a cached download while it is younger than the image TTL and
    /// its file still exists. Payloads that are not JPEG, PNG, GIF or WEBP
    /// are rejected.
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute image URL
    /// * `referer` - Page the image appeared on, if known
    ///
    /// # Returns
    ///
    /// The stored file name, or `None` when the image could not be saved.
    #[instrument(level = "debug", skip(self))]
    pub async fn download_image(&self, url: &str, referer: Option<&str>) -> Option<String> {
        let url = url.trim();
        if url.is_empty() || !(url.starts_with("http://") || url.starts_with("https://")) {
            return None;
        }
        let key = image_cache_key(url).to_string();
        let now = Utc::now().timestamp();

        if let Some(entry) = self.caches.images.get(&key) {
            if !entry.path.is_empty()
                && now - entry.timestamp <= self.image_ttl_secs
                && fs::try_exists(self.image_dir.join(&entry.path)).await.unwrap_or(false)
            {
                return Some(entry.path);
            }
        }

        let mut request = self
            .client_for(url)
            .get(url)
            .timeout(self.image_timeout)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "image/*");
        if let Some(referer) = choose_referer(url, referer) {
            request = request.header(REFERER, referer);
        }
        if Origin::from_url(url) == Origin::CnBeta {
            request = request.header("Origin", "https://www.cnbeta.com.tw");
        }

        let body = {
            let _permit = self.permits.acquire().await.ok()?;
            let result = async { request.send().await?.error_for_status()?.bytes().await }.await;
            match result {
                Ok(body) => body,
                Err(e) => {
                    debug!(%url, error = %e, "Image download failed");
                    return None;
                }
            }
        };

        let Some(format) = ImageFormat::sniff(&body) else {
            debug!(%url, bytes = body.len(), "Rejected payload that is not a recognized image");
            return None;
        };
        let file_name = image_file_name_for(url, format);
        if let Err(e) = fs::create_dir_all(&self.image_dir).await {
            warn!(dir = %self.image_dir.display(), error = %e, "Cannot create image directory");
            return None;
        }
        if let Err(e) = fs::write(self.image_dir.join(&file_name), &body).await {
            warn!(file = %file_name, error = %e, "Cannot write image");
            return None;
        }
        self.caches.images.insert(
            key,
            ImageCacheEntry {
                path: file_name.clone(),
                timestamp: now,
                url: url.to_string(),
            },
        );
        Some(file_name)
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn fall_back(url: &str, cached: Option<&FeedCacheEntry>, status: Option<u16>, reason: &str) -> Fetched {
    match cached.and_then(|entry| Fetched::from_cache(entry, FetchSource::Stale, status)) {
        Some(fetched) => {
            warn!(%url, reason, "Fetch failed; serving stale cached payload");
            fetched
        }
        None => {
            warn!(%url, reason, "Fetch failed with nothing cached");
            Fetched::failed(status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F'];

    fn fetcher(image_dir: &std::path::Path) -> Fetcher {
        let config = Config {
            image_dir: image_dir.to_path_buf(),
            ..Config::default()
        };
        Fetcher::new(&config, Arc::new(Caches::default())).unwrap()
    }

    #[test]
    fn test_sniff_formats() {
        assert_eq!(ImageFormat::sniff(PNG), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::sniff(JPEG), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::sniff(b"GIF89a...."), Some(ImageFormat::Gif));
        assert_eq!(
            ImageFormat::sniff(b"RIFF\x00\x00\x00\x00WEBPVP8 "),
            Some(ImageFormat::Webp)
        );
        assert_eq!(ImageFormat::sniff(b"<html>nope</html>"), None);
        assert_eq!(ImageFormat::sniff(b""), None);
    }

    #[test]
    fn test_image_file_name_ignores_query_and_fragment() {
        let a = image_file_name_for("https://a.com/x.jpg?w=100", ImageFormat::Jpeg);
        let b = image_file_name_for("https://a.com/x.jpg#frag", ImageFormat::Jpeg);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16 + ".jpg".len());
    }

    #[test]
    fn test_choose_referer() {
        assert_eq!(
            choose_referer("https://img.on.cc/a.jpg", None).as_deref(),
            Some("https://hk.on.cc/")
        );
        assert_eq!(
            choose_referer("https://img.on.cc/a.jpg", Some("https://x.com/page")).as_deref(),
            Some("https://x.com/page")
        );
        assert_eq!(
            choose_referer("https://cdn.example.com:8443/a/b.jpg?x=1", None).as_deref(),
            Some("https://cdn.example.com:8443/")
        );
    }

    #[tokio::test]
    async fn test_fetch_caches_and_revalidates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<rss>first</rss>")
                    .insert_header("ETag", "\"v1\""),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());
        let url = format!("{}/feed", server.uri());

        let first = fetcher.fetch(&url).await;
        assert_eq!(first.meta.source, FetchSource::Network);
        assert_eq!(first.payload, b"<rss>first</rss>".to_vec());

        let second = fetcher.fetch(&url).await;
        assert_eq!(second.meta.source, FetchSource::NotModified);
        assert_eq!(second.payload, b"<rss>first</rss>".to_vec());
    }

    #[tokio::test]
    async fn test_not_modified_refreshes_cache_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());
        let url = format!("{}/feed", server.uri());
        fetcher.caches().feeds.insert(
            url.as_str(),
            FeedCacheEntry::new(b"<rss>old</rss>", Some("\"v1\"".into()), None, 1_000),
        );

        let before = Utc::now().timestamp();
        let fetched = fetcher.fetch(&url).await;
        assert_eq!(fetched.meta.source, FetchSource::NotModified);
        assert_eq!(fetched.payload, b"<rss>old</rss>".to_vec());

        let entry = fetcher.caches().feeds.get(&url).unwrap();
        assert!(entry.timestamp >= before);
        assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_stale_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());
        let url = format!("{}/down", server.uri());

        let empty = fetcher.fetch(&url).await;
        assert_eq!(empty.meta.source, FetchSource::Failed);
        assert!(empty.is_empty());

        fetcher
            .caches()
            .feeds
            .insert(url.clone(), FeedCacheEntry::new(b"<rss>old</rss>", None, None, 1));
        let stale = fetcher.fetch(&url).await;
        assert_eq!(stale.meta.source, FetchSource::Stale);
        assert_eq!(stale.meta.status, Some(500));
        assert_eq!(stale.payload, b"<rss>old</rss>".to_vec());
    }

    #[tokio::test]
    async fn test_fetch_rendered_text_is_lossy_and_empty_on_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok \xff done".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());
        let text = fetcher
            .fetch_rendered_text(&format!("{}/page", server.uri()))
            .await;
        assert!(text.starts_with("ok "));
        assert!(text.ends_with(" done"));
        assert_eq!(
            fetcher
                .fetch_rendered_text(&format!("{}/missing", server.uri()))
                .await,
            ""
        );
    }

    #[tokio::test]
    async fn test_download_image_stores_once() {
        let server = MockServer::start().await;
        let referer = format!("{}/", server.uri());
        Mock::given(method("GET"))
            .and(path("/photo.png"))
            .and(header("Referer", referer.as_str()))
            .and(header("Accept", "image/*"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());
        let first = fetcher
            .download_image(&format!("{}/photo.png?w=300", server.uri()), None)
            .await
            .unwrap();
        assert!(first.ends_with(".png"));
        assert!(dir.path().join(&first).exists());

        let second = fetcher
            .download_image(&format!("{}/photo.png#zoom", server.uri()), None)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_download_image_rejects_non_images() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fake.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>blocked</html>"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());
        assert!(
            fetcher
                .download_image(&format!("{}/fake.jpg", server.uri()), None)
                .await
                .is_none()
        );
        assert!(fetcher.download_image("", None).await.is_none());
        assert!(fetcher.caches().images.is_empty());
    }
}
