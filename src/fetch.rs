use std::collections::HashSet;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, warn};

use crate::config::FetchSettings;
use crate::error::FetchError;

const BASE_BACKOFF_MS: u64 = 2000;
pub const MAX_RETRIES: u32 = 10;

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static MD_LINK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\]\(([^)\s]+)[^)]*\)").unwrap());
static HREF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).unwrap());
static TOUR_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/(?:tour|tours|shows|live|concerts|dates|events)(?:/|\.html?|$)").unwrap()
});

/// Turns a URL into text. Conversion to markdown, if any, is the
/// implementation's business.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt)))
}

/// Retries rate-limit and server errors with exponential backoff.
async fn with_retry<F, Fut>(url: &str, max_retries: u32, mut op: F) -> Result<String, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, FetchError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let backoff = backoff(attempt);
                warn!(
                    "Fetch of {} failed (attempt {}/{}): {}, backing off {:.1}s",
                    url,
                    attempt + 1,
                    max_retries,
                    e,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

// ── spider.cloud ──

/// Fetches pages through spider.cloud, which renders them and hands back markdown.
pub struct SpiderFetcher {
    spider: Spider,
    max_retries: u32,
}

impl SpiderFetcher {
    pub fn new(api_key: String, max_retries: u32) -> Result<Self, FetchError> {
        let spider = Spider::new(Some(api_key))
            .map_err(|e| FetchError::Config(format!("failed to create Spider client: {}", e)))?;
        Ok(Self { spider, max_retries })
    }

    pub fn from_env(max_retries: u32) -> Result<Self, FetchError> {
        let api_key = std::env::var("SPIDER_API_KEY").map_err(|_| {
            FetchError::Config("SPIDER_API_KEY environment variable must be set".into())
        })?;
        Self::new(api_key, max_retries)
    }

    async fn scrape_once(&self, url: &str) -> Result<String, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Markdown)),
            ..Default::default()
        };

        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };

        let first = parsed.as_array().and_then(|arr| arr.first());

        let status = first
            .and_then(|obj| obj.get("status"))
            .and_then(|s| s.as_u64())
            .map(|s| s as u16);
        if let Some(status) = status.filter(|s| *s >= 400) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }

        first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .map(strip_images)
            .ok_or_else(|| FetchError::Empty {
                url: url.to_string(),
            })
    }
}

#[async_trait]
impl PageFetcher for SpiderFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        with_retry(url, self.max_retries, || self.scrape_once(url)).await
    }
}

// ── Plain HTTP ──

/// Fetches pages directly. Content comes back as served (usually HTML).
pub struct HttpFetcher {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Config(e.to_string()))?;
        Ok(Self {
            client,
            max_retries: settings.max_retries,
        })
    }

    async fn get_once(&self, url: &str) -> Result<String, FetchError> {
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: if e.is_timeout() {
                "request timed out".to_string()
            } else {
                e.to_string()
            },
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(transport)?;
        if body.trim().is_empty() {
            return Err(FetchError::Empty {
                url: url.to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        with_retry(url, self.max_retries, || self.get_once(url)).await
    }
}

/// Remove markdown image syntax: ![alt](url) and [![alt](url)](link)
pub fn strip_images(md: &str) -> String {
    let cleaned = IMAGE_RE.replace_all(md, "");
    BLANKS_RE.replace_all(&cleaned, "\n\n").to_string()
}

// ── Tour page discovery ──

pub fn sitemap_url(base: &str) -> Option<String> {
    Url::parse(base)
        .and_then(|u| u.join("/sitemap.xml"))
        .ok()
        .map(String::from)
}

/// Parse a urlset XML and return all <loc> URLs.
pub fn parse_urlset(xml: &str) -> Result<Vec<String>, quick_xml::Error> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut in_url = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.name().as_ref() {
                b"url" => in_url = true,
                b"loc" if in_url => in_loc = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(e)) if in_loc => {
                urls.push(e.unescape()?.trim().to_string());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e),
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}

/// Same-site pages that look like tour listings, from the sitemap first and
/// then from links on the home page. The base URL itself is excluded.
pub fn discover_tour_pages(
    base: &str,
    sitemap: &[String],
    home_content: &str,
    limit: usize,
) -> Vec<String> {
    let Ok(base_url) = Url::parse(base) else {
        return Vec::new();
    };

    let linked = MD_LINK_RE
        .captures_iter(home_content)
        .chain(HREF_RE.captures_iter(home_content))
        .map(|c| c[1].to_string());

    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(normalize(&base_url));

    let mut pages = Vec::new();
    for href in sitemap.iter().cloned().chain(linked) {
        if pages.len() >= limit {
            break;
        }
        let Ok(mut url) = base_url.join(&href) else {
            continue;
        };
        url.set_fragment(None);
        if url.host_str() != base_url.host_str() || !TOUR_PATH_RE.is_match(url.path()) {
            continue;
        }
        if seen.insert(normalize(&url)) {
            pages.push(url.to_string());
        }
    }
    debug!(base = %base, found = pages.len(), "tour pages discovered");
    pages
}

fn normalize(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn strips_images_and_blank_runs() {
        let md = "# Tour\n![poster](https://x.com/p.png)\n\n\n\nMay 3 Paris";
        assert_eq!(strip_images(md), "# Tour\n\nMay 3 Paris");
    }

    #[test]
    fn urlset_locs() {
        let xml = r#"<?xml version="1.0"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://menitrust.com/</loc></url>
              <url><loc>https://menitrust.com/tour</loc><lastmod>2024-05-01</lastmod></url>
            </urlset>"#;
        assert_eq!(
            parse_urlset(xml).unwrap(),
            vec!["https://menitrust.com/", "https://menitrust.com/tour"]
        );
    }

    #[test]
    fn discovery_keeps_same_site_tour_pages() {
        let sitemap = vec![
            "https://menitrust.com/".to_string(),
            "https://menitrust.com/tour".to_string(),
            "https://menitrust.com/shop".to_string(),
        ];
        let home = "[Live](/live) [Tickets](https://www.songkick.com/tour) \
                    <a href=\"/tour/\">again</a> [News](/news)";
        let pages = discover_tour_pages("https://menitrust.com/", &sitemap, home, 5);
        assert_eq!(
            pages,
            vec!["https://menitrust.com/tour", "https://menitrust.com/live"]
        );
    }

    #[test]
    fn discovery_respects_limit() {
        let home = "[a](/tour) [b](/shows) [c](/live)";
        assert_eq!(discover_tour_pages("https://x.com", &[], home, 2).len(), 2);
        assert!(discover_tour_pages("not a url", &[], home, 2).is_empty());
    }

    #[test]
    fn sitemap_location() {
        assert_eq!(
            sitemap_url("https://menitrust.com/en/home").as_deref(),
            Some("https://menitrust.com/sitemap.xml")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backs_off_then_gives_up() {
        let calls = AtomicU32::new(0);
        let result = with_retry("https://x.com", 2, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Status {
                url: "https://x.com".into(),
                status: 503,
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        assert_eq!(backoff(0), Duration::from_millis(2000));
        assert_eq!(backoff(3), Duration::from_millis(16000));
        assert_eq!(backoff(200), Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn no_retry_on_client_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry("https://x.com", 3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Status {
                url: "https://x.com".into(),
                status: 404,
            })
        })
        .await;
        assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
