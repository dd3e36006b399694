//! Page fetching with an SSRF guard.
//!
//! [`PageFetcher`] is the seam the assembler fetches through; [`HttpFetcher`]
//! is the plain-HTTP implementation. Headless rendering is not provided.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use eventcatalog_shared::{CatalogError, Result};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};
use url::Url;

/// User-Agent string for page requests.
const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (compatible; EventCatalog/",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Default per-request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Maximum response size we read (5 MB).
const MAX_RESPONSE_SIZE: u64 = 5 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Per-call fetch settings.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// A successfully fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub html: String,
    /// URL after redirects.
    pub final_url: String,
    pub status_code: u16,
}

/// Typed fetch failure.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// Refused before sending, or the site rejected the crawler.
    #[error("blocked {url}: {reason}")]
    Blocked { url: String, reason: String },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            Self::Timeout { url }
            | Self::Http { url, .. }
            | Self::Blocked { url, .. }
            | Self::Network { url, .. } => url,
        }
    }
}

impl From<FetchError> for CatalogError {
    fn from(err: FetchError) -> Self {
        CatalogError::content_unavailable(err.url().to_string(), err.to_string())
    }
}

/// Fetches rendered page content.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        opts: &FetchOptions,
    ) -> std::result::Result<FetchedPage, FetchError>;
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// Plain HTTP fetcher.
pub struct HttpFetcher {
    client: Client,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| CatalogError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs (for integration tests).
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    #[instrument(skip_all, fields(url = %url))]
    async fn fetch(
        &self,
        url: &str,
        opts: &FetchOptions,
    ) -> std::result::Result<FetchedPage, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::Blocked {
            url: url.to_string(),
            reason: format!("invalid URL: {e}"),
        })?;

        if !self.allow_localhost && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return Err(FetchError::Blocked {
                url: url.to_string(),
                reason: "private or non-http target".into(),
            });
        }

        debug!("fetching page");
        let response = self
            .client
            .get(parsed.as_str())
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9")
            .header("Accept-Language", "en-US,en;q=0.9")
            .timeout(opts.timeout)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        let final_url = response.url().to_string();

        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > MAX_RESPONSE_SIZE {
                return Err(FetchError::Blocked {
                    url: url.to_string(),
                    reason: format!("response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"),
                });
            }
        }

        let html = read_capped(url, response, MAX_RESPONSE_SIZE).await?;

        Ok(FetchedPage {
            html,
            final_url,
            status_code: status.as_u16(),
        })
    }
}

/// Read the body chunk by chunk, giving up once it passes `max` bytes.
/// Bodies without a declared length are bounded here.
async fn read_capped(
    url: &str,
    mut response: reqwest::Response,
    max: u64,
) -> std::result::Result<String, FetchError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| classify(url, e))? {
        if (body.len() + chunk.len()) as u64 > max {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                reason: format!("response too large (over {max} bytes)"),
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn classify(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            let host = host.to_ascii_lowercase();
            host == "localhost"
                || host.ends_with(".localhost")
                || host.ends_with(".local")
                || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
