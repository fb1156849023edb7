//! HTTP access for the web based connectors.
//!
//! [`HttpClient`] wraps a `reqwest` client with the harvester user agent,
//! optional basic-auth credentials and optional robots.txt rules. URLs the
//! rules disallow fail before any request is made, and a robots.txt
//! `Crawl-delay` spaces out consecutive requests to the same host.

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, LAST_MODIFIED};
use reqwest::Url;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::definition::{BotsSettings, Credentials};
use crate::error::{HarvestError, Result};
use crate::robots::{Bots, BotsMode, Rules};

/// Client-wide settings taken from the `[http]` and `[robots]` config
/// sections.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout: Duration,
    pub robots_agent: String,
    pub robots_enabled: bool,
    pub robots_mode: BotsMode,
}

impl HttpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_agent: config.http.user_agent.clone(),
            timeout: Duration::from_secs(config.http.timeout_secs),
            robots_agent: config.robots_agent().to_string(),
            robots_enabled: config.robots.enabled,
            robots_mode: config.robots.mode,
        }
    }

    pub fn client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .build()
            .map_err(|e| HarvestError::processor("failed to build HTTP client").with_source(e))
    }

    /// Whether robots.txt must be read for a broker with `bots` settings
    /// running a task with the given `ignoreRobotsTxt` flag. A broker mode
    /// other than `inherit` wins over the configured one.
    pub fn robots_apply(&self, bots: &BotsSettings, ignore_robots_txt: bool) -> bool {
        let mode = match bots.mode {
            BotsMode::Inherit => self.robots_mode,
            explicit => explicit,
        };
        self.robots_enabled && bots.enabled && mode.applies(ignore_robots_txt)
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self::from_config(&Config::minimal())
    }
}

/// A fetched resource.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<crate::mime::MimeType>,
    pub body: Vec<u8>,
}

impl Fetched {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct HttpClient {
    client: reqwest::Client,
    /// Broker label used in errors.
    label: String,
    credentials: Option<Credentials>,
    robots: Option<Rules>,
    crawl_delay: Option<Duration>,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl HttpClient {
    pub fn new(client: reqwest::Client, label: impl Into<String>) -> Self {
        Self {
            client,
            label: label.into(),
            credentials: None,
            robots: None,
            crawl_delay: None,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Apply robots.txt rules; the crawl delay is ignored when
    /// `override_delay` is set.
    pub fn with_robots(mut self, rules: Option<Rules>, override_delay: bool) -> Self {
        self.crawl_delay = match (&rules, override_delay) {
            (Some(r), false) => r.crawl_delay,
            _ => None,
        };
        self.robots = rules;
        self
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET `url`. Disallowed URLs and HTTP statuses ≥ 400 are input errors.
    pub async fn fetch(&self, url: &Url) -> Result<Fetched> {
        if let Some(rules) = &self.robots {
            if !rules.is_url_allowed(url) {
                return Err(HarvestError::input(
                    &self.label,
                    format!("access to {} disallowed by robots.txt", url),
                ));
            }
        }
        self.throttle(url).await;

        let mut request = self.client.get(url.clone());
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        debug!(url = %url, "GET");
        let response = request.send().await.map_err(|e| {
            HarvestError::input(&self.label, format!("error reading {}", url)).with_source(e)
        })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(HarvestError::input(
                &self.label,
                format!("HTTP {} reading {}", status.as_u16(), url),
            ));
        }

        let final_url = response.url().clone();
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(crate::mime::MimeType::parse);
        let body = response.bytes().await.map_err(|e| {
            HarvestError::input(&self.label, format!("error reading body of {}", url))
                .with_source(e)
        })?;

        Ok(Fetched {
            url: final_url,
            status: status.as_u16(),
            last_modified,
            content_type,
            body: body.to_vec(),
        })
    }

    async fn throttle(&self, url: &Url) {
        let Some(delay) = self.crawl_delay else {
            return;
        };
        let host = url.host_str().unwrap_or_default().to_string();
        let mut last = self.last_request.lock().await;
        if let Some(previous) = last.get(&host) {
            let elapsed = previous.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
        last.insert(host, Instant::now());
    }
}

/// Parse an HTTP date (RFC 1123, e.g. `Wed, 21 Oct 2015 07:28:00 GMT`).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Fetch and parse `/robots.txt` of the server hosting `url`. Any failure
/// means no rules.
pub async fn read_robots(client: &reqwest::Client, url: &Url) -> Option<Bots> {
    let robots_url = url.join("/robots.txt").ok()?;
    let response = match client.get(robots_url.clone()).send().await {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            debug!(url = %robots_url, status = r.status().as_u16(), "no robots.txt");
            return None;
        }
        Err(e) => {
            warn!(url = %robots_url, error = %e, "error reading robots.txt");
            return None;
        }
    };
    let text = response.text().await.ok()?;
    Some(Bots::parse(&text))
}
