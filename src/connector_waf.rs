//! WAF (Web Accessible Folder) input connector.
//!
//! Crawls an HTTP directory listing: every folder page is scanned for
//! `href` attributes, links are resolved against the folder's final URL
//! (after redirects) and only strict descendants of that folder are kept.
//! Links ending in `.xml` are records, anything else is a sub-folder to
//! crawl. Each folder is read at most once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Url;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::definition::DefinitionAdaptor;
use crate::error::{HarvestError, Result};
use crate::http::{read_robots, HttpClient, HttpSettings};
use crate::mime::MimeType;
use crate::models::{DataReference, EntityDefinition};
use crate::template::{http_arguments, Argument, UiTemplate};
use crate::traits::{
    BrokerIterator, Descriptor, InitContext, InputBroker, InputConnector, IteratorContext,
};

pub const TYPE: &str = "WAF";
pub const P_HOST_URL: &str = "waf-host-url";

fn href_regex() -> &'static Regex {
    static HREF: OnceLock<Regex> = OnceLock::new();
    HREF.get_or_init(|| {
        Regex::new(r#"(?i)href\s*=\s*["']([^"']*)["']"#).expect("href pattern is valid")
    })
}

pub struct WafConnector {
    settings: HttpSettings,
}

impl WafConnector {
    pub fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }
}

impl Descriptor for WafConnector {
    fn entity_type(&self) -> &str {
        TYPE
    }

    fn template(&self) -> UiTemplate {
        let mut arguments = vec![Argument::string(P_HOST_URL, "URL").required()];
        arguments.extend(http_arguments());
        UiTemplate::new(TYPE, "Web Accessible Folder (WAF)", arguments)
    }
}

impl InputConnector for WafConnector {
    fn create_broker(&self, def: &EntityDefinition) -> Result<Box<dyn InputBroker>> {
        let adaptor = DefinitionAdaptor::new(def, TYPE)?;
        host_url(&adaptor)?;
        Ok(Box::new(WafBroker {
            adaptor,
            settings: self.settings.clone(),
            client: None,
        }))
    }
}

/// The configured host URL, with a trailing `/`.
fn host_url(adaptor: &DefinitionAdaptor) -> Result<Url> {
    let raw = adaptor.require(P_HOST_URL)?;
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    let url = Url::parse(&with_slash)
        .map_err(|e| HarvestError::invalid(format!("invalid {} '{}': {}", P_HOST_URL, raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(HarvestError::invalid(format!(
            "unsupported {} scheme '{}'",
            P_HOST_URL, other
        ))),
    }
}

pub struct WafBroker {
    adaptor: DefinitionAdaptor,
    settings: HttpSettings,
    client: Option<Arc<HttpClient>>,
}

#[async_trait]
impl InputBroker for WafBroker {
    fn entity_definition(&self) -> &EntityDefinition {
        self.adaptor.entity_definition()
    }

    fn broker_uri(&self) -> String {
        let host = self.adaptor.get(P_HOST_URL).unwrap_or_default();
        format!("{}:{}", TYPE, host)
    }

    async fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.adaptor.consume(&ctx.params);
        let url = host_url(&self.adaptor)?;
        let client = self.settings.client()?;

        let bots = self.adaptor.bots();
        let rules = if self.settings.robots_apply(&bots, ctx.task.ignore_robots_txt) {
            let agent = bots.agent.as_deref().unwrap_or(&self.settings.robots_agent);
            read_robots(&client, &url)
                .await
                .and_then(|robots| robots.select(agent))
        } else {
            None
        };

        let http = HttpClient::new(client, self.broker_uri())
            .with_credentials(self.adaptor.credentials())
            .with_robots(rules, bots.override_delay);
        self.client = Some(Arc::new(http));
        Ok(())
    }

    async fn iterator(&self, ctx: &IteratorContext) -> Result<Box<dyn BrokerIterator>> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| HarvestError::processor("WAF broker used before initialization"))?;
        let root = host_url(&self.adaptor)?;
        Ok(Box::new(WafIterator {
            client,
            broker_uri: self.broker_uri(),
            broker_name: self.entity_definition().label.clone(),
            since: ctx.last_harvest,
            visited: HashSet::from([root.to_string()]),
            folders: VecDeque::from([root]),
            files: VecDeque::new(),
            pending: None,
            root_read: false,
        }))
    }

    async fn terminate(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

struct WafIterator {
    client: Arc<HttpClient>,
    broker_uri: String,
    broker_name: Option<String>,
    since: Option<DateTime<Utc>>,
    visited: HashSet<String>,
    folders: VecDeque<Url>,
    files: VecDeque<Url>,
    pending: Option<Result<DataReference>>,
    root_read: bool,
}

impl WafIterator {
    async fn read_folder(&mut self, folder: &Url) -> Result<()> {
        let page = self.client.fetch(folder).await?;
        let base = page.url.clone();
        self.visited.insert(base.to_string());
        let html = page.text();

        let mut files = 0usize;
        let mut folders = 0usize;
        for link in extract_links(&base, &html) {
            if is_xml(&link) {
                files += 1;
                self.files.push_back(link);
            } else {
                let link = with_trailing_slash(link);
                if self.visited.insert(link.to_string()) {
                    folders += 1;
                    self.folders.push_back(link);
                }
            }
        }
        debug!(folder = %base, files, folders, "read WAF folder");
        Ok(())
    }

    async fn read_file(&self, url: &Url) -> Result<DataReference> {
        let fetched = self.client.fetch(url).await?;
        let mut data = DataReference::new(
            url.as_str(),
            url.clone(),
            self.broker_uri.clone(),
            fetched.body,
        );
        data.last_modified = fetched.last_modified;
        data.broker_name = self.broker_name.clone();
        data.content_type = fetched
            .content_type
            .filter(|ct| ct.as_str() != "application/octet-stream")
            .or_else(|| MimeType::from_path(url.path()));
        Ok(data)
    }
}

#[async_trait]
impl BrokerIterator for WafIterator {
    async fn has_next(&mut self) -> Result<bool> {
        loop {
            if self.pending.is_some() {
                return Ok(true);
            }

            if let Some(file) = self.files.pop_front() {
                let result = self.read_file(&file).await;
                if let (Ok(data), Some(since)) = (&result, self.since) {
                    if matches!(data.last_modified, Some(lm) if lm < since) {
                        debug!(url = %file, "unchanged since last harvest");
                        continue;
                    }
                }
                self.pending = Some(result);
                continue;
            }

            let Some(folder) = self.folders.pop_front() else {
                return Ok(false);
            };
            let is_root = !std::mem::replace(&mut self.root_read, true);
            if let Err(e) = self.read_folder(&folder).await {
                if is_root {
                    return Err(e);
                }
                warn!(folder = %folder, error = %e, "skipping unreadable folder");
            }
        }
    }

    async fn next(&mut self) -> Result<DataReference> {
        if self.pending.is_none() && !self.has_next().await? {
            return Err(HarvestError::input(&self.broker_uri, "no more records"));
        }
        self.pending
            .take()
            .unwrap_or_else(|| Err(HarvestError::input(&self.broker_uri, "no more records")))
    }
}

/// Links found in `html`, resolved against `base`, restricted to strict
/// descendants of `base`. Query links (listing sort orders) are dropped.
pub fn extract_links(base: &Url, html: &str) -> Vec<Url> {
    let prefix = base.as_str();
    let mut seen = HashSet::new();
    href_regex()
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .filter_map(|m| base.join(m.as_str().trim()).ok())
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .filter(|url| url.query().is_none())
        .filter(|url| url.as_str().len() > prefix.len() && url.as_str().starts_with(prefix))
        .filter(|url| seen.insert(url.to_string()))
        .collect()
}

fn is_xml(url: &Url) -> bool {
    url.path().to_ascii_lowercase().ends_with(".xml")
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
