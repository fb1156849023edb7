//! GPT output connector: publishes records to a Geoportal Server catalog
//! through its REST API.
//!
//! Each record becomes one JSON item carrying provenance fields (`src_*`),
//! the title and, for XML records, the metadata document itself. A record
//! already published from the same source URL is updated in place; anything
//! else is added as a new item.
//!
//! With cleanup enabled, items published earlier from the same input broker
//! that a full, error free run did not publish again are deleted at the end.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::definition::{Credentials, DefinitionAdaptor};
use crate::error::{HarvestError, Result};
use crate::http::HttpSettings;
use crate::models::{DataReference, EntityDefinition, PublishingStatus};
use crate::process::ErrorFlag;
use crate::template::{Argument, UiTemplate};
use crate::traits::{Descriptor, InitContext, OutputBroker, OutputConnector};

pub const TYPE: &str = "GPT";
pub const P_HOST_URL: &str = "gpt-host-url";
pub const P_INDEX: &str = "gpt-index";
pub const P_FORCE_ADD: &str = "gpt-force-add";
pub const P_CLEANUP: &str = "gpt-cleanup";

pub const DEFAULT_INDEX: &str = "metadata";

const REST_ITEM_PATH: &str = "rest/metadata/item";
const TOKEN_PATH: &str = "oauth/token";
const SCROLL_PATH: &str = "elastic/_search/scroll";
const SCROLL_PAGE_SIZE: usize = 200;
const SCROLL_KEEP_ALIVE: &str = "1m";
const CLIENT_ID: &str = "geoportal-client";
/// Owner attribute copied to `sys_owner_s`.
const OWNER_ATTRIBUTE: &str = "owner";

pub struct GptConnector {
    settings: HttpSettings,
}

impl GptConnector {
    pub fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }
}

impl Descriptor for GptConnector {
    fn entity_type(&self) -> &str {
        TYPE
    }

    fn template(&self) -> UiTemplate {
        UiTemplate::new(
            TYPE,
            "Geoportal Server New Generation",
            vec![
                Argument::string(P_HOST_URL, "URL").required(),
                Argument::string(crate::definition::P_CRED_USERNAME, "User name"),
                Argument::new(
                    crate::definition::P_CRED_PASSWORD,
                    "User password",
                    crate::template::ArgumentKind::Password,
                ),
                Argument::string(P_INDEX, "Index name").with_default(DEFAULT_INDEX),
                Argument::bool(P_FORCE_ADD, "Force add", false),
                Argument::bool(P_CLEANUP, "Perform cleanup", false),
            ],
        )
    }
}

impl OutputConnector for GptConnector {
    fn create_broker(&self, def: &EntityDefinition) -> Result<Box<dyn OutputBroker>> {
        let adaptor = DefinitionAdaptor::new(def, TYPE)?;
        host_url(&adaptor)?;
        Ok(Box::new(GptBroker {
            adaptor,
            settings: self.settings.clone(),
            client: None,
            existing: HashSet::new(),
            cleanup: false,
            failed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// The configured host URL, with a trailing `/` so relative API paths
/// resolve below it.
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

pub struct GptBroker {
    adaptor: DefinitionAdaptor,
    settings: HttpSettings,
    client: Option<GptClient>,
    /// Catalog ids published earlier from the same input broker and not yet
    /// seen in this run.
    existing: HashSet<String>,
    cleanup: bool,
    failed: Arc<AtomicBool>,
}

#[async_trait]
impl OutputBroker for GptBroker {
    fn entity_definition(&self) -> &EntityDefinition {
        self.adaptor.entity_definition()
    }

    async fn initialize(&mut self, ctx: &InitContext) -> Result<()> {
        self.adaptor.consume(&ctx.params);
        let host = host_url(&self.adaptor)?;
        let index = self
            .adaptor
            .get(P_INDEX)
            .unwrap_or(DEFAULT_INDEX)
            .to_string();
        let mut client = GptClient {
            http: self.settings.client()?,
            host,
            index,
            credentials: self.adaptor.credentials(),
            token: None,
        };

        self.existing.clear();
        self.failed.store(false, Ordering::SeqCst);
        self.cleanup = self.adaptor.get_bool(P_CLEANUP, false) && ctx.can_cleanup();
        if self.cleanup {
            ctx.add_listener(Arc::new(ErrorFlag(Arc::clone(&self.failed))));
            let ids = client
                .query_by_source(&ctx.source_broker_uri)
                .await
                .map_err(|e| {
                    HarvestError::processor(format!(
                        "error getting records published from {} to {}",
                        ctx.source_broker_uri, client.host
                    ))
                    .with_source(e)
                })?;
            debug!(source = %ctx.source_broker_uri, count = ids.len(), "records already in the catalog");
            self.existing = ids.into_iter().collect();
        }
        self.client = Some(client);
        Ok(())
    }

    async fn publish(&mut self, data: &DataReference) -> Result<PublishingStatus> {
        let force_add = self.adaptor.get_bool(P_FORCE_ADD, false);
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| HarvestError::processor("GPT broker used before initialization"))?;
        let label = format!("{}:{}", TYPE, client.host);
        let body = publish_request(data);

        let result = client.publish(&body, data.source_uri.as_str(), force_add).await;
        let response = result.map_err(|e| {
            HarvestError::output(&label, &data.id, "error publishing data").with_source(e)
        })?;
        if let Some(error) = response.error {
            return Err(HarvestError::output(
                &label,
                &data.id,
                format!("error publishing data: {}", error),
            ));
        }
        debug!(id = %data.id, item = ?response.id, status = ?response.status, "published to GPT");
        if let Some(item) = &response.id {
            self.existing.remove(item);
        }
        Ok(if response.status.as_deref() == Some("created") {
            PublishingStatus::CREATED
        } else {
            PublishingStatus::UPDATED
        })
    }

    async fn terminate(&mut self) -> Result<()> {
        let Some(mut client) = self.client.take() else {
            return Ok(());
        };
        if !self.cleanup {
            return Ok(());
        }
        if self.failed.load(Ordering::SeqCst) {
            info!(host = %client.host, "errors during harvest; cleanup skipped");
            return Ok(());
        }
        let mut removed = 0usize;
        for id in std::mem::take(&mut self.existing) {
            match client.delete(&id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(host = %client.host, item = %id, error = %e, "error deleting item"),
            }
        }
        info!(host = %client.host, removed, "records removed during cleanup");
        Ok(())
    }
}

/// JSON item published for `data`.
pub fn publish_request(data: &DataReference) -> Value {
    let source_type = data
        .broker_uri
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .unwrap_or(&data.broker_uri);

    let mut item = Map::new();
    item.insert("src_source_type_s".into(), json!(source_type));
    item.insert("src_source_uri_s".into(), json!(data.broker_uri));
    if let Some(name) = &data.broker_name {
        item.insert("src_source_name_s".into(), json!(name));
    }
    item.insert("src_uri_s".into(), json!(data.source_uri.as_str()));
    if let Some(ts) = data.last_modified {
        item.insert("src_lastupdate_dt".into(), json!(ts.to_rfc3339()));
    }
    if let Some(Value::String(owner)) = data.attributes.get(OWNER_ATTRIBUTE) {
        item.insert("sys_owner_s".into(), json!(owner));
    }
    let title = data.title();
    if !title.is_empty() {
        item.insert("title".into(), json!(title));
    }

    let text = String::from_utf8_lossy(&data.content);
    let text = text.trim_start_matches('\u{feff}');
    if data.is_xml() {
        item.insert("xml".into(), json!(text));
    } else if matches!(&data.content_type, Some(ct) if ct.as_str().ends_with("json")) {
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            item.insert("_json".into(), parsed);
        }
    }
    Value::Object(item)
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishResponse {
    pub id: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Token {
    access_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: Option<SearchHits>,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
}

/// Failure of one catalog request.
#[derive(Debug, thiserror::Error)]
enum ClientError {
    #[error("HTTP {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("no access token in token response")]
    NoToken,
    #[error("invalid URL: {0}")]
    Url(String),
}

impl ClientError {
    fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Status(s) if *s == StatusCode::UNAUTHORIZED)
    }
}

struct GptClient {
    http: reqwest::Client,
    host: Url,
    index: String,
    credentials: Option<Credentials>,
    token: Option<(String, DateTime<Utc>)>,
}

impl GptClient {
    async fn publish(
        &mut self,
        body: &Value,
        src_uri: &str,
        force_add: bool,
    ) -> std::result::Result<PublishResponse, ClientError> {
        let existing = if force_add {
            None
        } else {
            match self.query_id(src_uri).await {
                Err(e) if self.token_rejected(&e) => self.query_id(src_uri).await?,
                other => other?,
            }
        };
        let path = match &existing {
            Some(id) => format!("{}/{}", REST_ITEM_PATH, id),
            None => REST_ITEM_PATH.to_string(),
        };
        let mut response = match self.put_item(&path, body).await {
            Err(e) if self.token_rejected(&e) => self.put_item(&path, body).await?,
            other => other?,
        };
        if response.status.is_none() {
            let status = if existing.is_some() { "updated" } else { "created" };
            response.status = Some(status.to_string());
        }
        if response.id.is_none() {
            response.id = existing;
        }
        Ok(response)
    }

    /// On 401 with credentials, drops the cached token so the request can
    /// be repeated once with a fresh one.
    fn token_rejected(&mut self, err: &ClientError) -> bool {
        if err.is_unauthorized() && self.credentials.is_some() {
            debug!("GPT token rejected, requesting a new one");
            self.token = None;
            true
        } else {
            false
        }
    }

    async fn query_id(&mut self, src_uri: &str) -> std::result::Result<Option<String>, ClientError> {
        let url = self.join(&format!("elastic/{}/item/_search", self.index))?;
        let mut query = vec![("q", term_query("src_uri_s", src_uri)), ("size", "1".to_string())];
        if let Some(token) = self.access_token().await? {
            query.push(("access_token", token));
        }
        let response = self.http.get(url).query(&query).send().await?;
        let response = check(response)?;
        let found: SearchResponse = response.json().await?;
        Ok(found
            .hits
            .and_then(|h| h.hits.into_iter().next())
            .map(|hit| hit.id))
    }

    /// Ids of every item published from the input broker `broker_uri`,
    /// paged through a search scroll.
    async fn query_by_source(
        &mut self,
        broker_uri: &str,
    ) -> std::result::Result<Vec<String>, ClientError> {
        let mut ids = Vec::new();
        let mut scroll_id: Option<String> = None;
        loop {
            let page = match self.search_page(broker_uri, scroll_id.as_deref()).await {
                Err(e) if self.token_rejected(&e) => {
                    self.search_page(broker_uri, scroll_id.as_deref()).await?
                }
                other => other?,
            };
            let hits = page.hits.map(|h| h.hits).unwrap_or_default();
            if hits.is_empty() {
                break;
            }
            ids.extend(hits.into_iter().map(|hit| hit.id));
            match page.scroll_id {
                Some(next) => scroll_id = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }

    async fn search_page(
        &mut self,
        broker_uri: &str,
        scroll_id: Option<&str>,
    ) -> std::result::Result<SearchResponse, ClientError> {
        let (url, mut query) = match scroll_id {
            None => (
                self.join(&format!("elastic/{}/item/_search", self.index))?,
                vec![
                    ("q", term_query("src_source_uri_s", broker_uri)),
                    ("size", SCROLL_PAGE_SIZE.to_string()),
                    ("scroll", SCROLL_KEEP_ALIVE.to_string()),
                ],
            ),
            Some(id) => (
                self.join(SCROLL_PATH)?,
                vec![
                    ("scroll_id", id.to_string()),
                    ("scroll", SCROLL_KEEP_ALIVE.to_string()),
                ],
            ),
        };
        if let Some(token) = self.access_token().await? {
            query.push(("access_token", token));
        }
        let response = check(self.http.get(url).query(&query).send().await?)?;
        Ok(response.json().await?)
    }

    async fn delete(&mut self, id: &str) -> std::result::Result<(), ClientError> {
        match self.delete_item(id).await {
            Err(e) if self.token_rejected(&e) => self.delete_item(id).await,
            other => other,
        }
    }

    async fn delete_item(&mut self, id: &str) -> std::result::Result<(), ClientError> {
        let url = self.join(&format!("{}/{}", REST_ITEM_PATH, id))?;
        let mut request = self.http.delete(url);
        if let Some(token) = self.access_token().await? {
            request = request.query(&[("access_token", token)]);
        }
        check(request.send().await?)?;
        Ok(())
    }

    async fn put_item(
        &mut self,
        path: &str,
        body: &Value,
    ) -> std::result::Result<PublishResponse, ClientError> {
        let url = self.join(path)?;
        let mut request = self.http.put(url).json(body);
        if let Some(token) = self.access_token().await? {
            request = request.query(&[("access_token", token)]);
        }
        let response = check(request.send().await?)?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text).unwrap_or_default())
    }

    fn join(&self, path: &str) -> std::result::Result<Url, ClientError> {
        self.host
            .join(path)
            .map_err(|e| ClientError::Url(format!("{}{}: {}", self.host, path, e)))
    }

    /// Bearer token for the configured credentials, refreshed a minute
    /// before it expires. `None` without credentials.
    async fn access_token(&mut self) -> std::result::Result<Option<String>, ClientError> {
        let Some(cred) = &self.credentials else {
            return Ok(None);
        };
        let now = Utc::now();
        if let Some((token, valid_till)) = &self.token {
            if *valid_till - Duration::seconds(60) > now {
                return Ok(Some(token.clone()));
            }
        }

        let url = self.join(TOKEN_PATH)?;
        let form = [
            ("grant_type", "password"),
            ("client_id", CLIENT_ID),
            ("username", cred.username.trim()),
            ("password", cred.password.trim()),
        ];
        let response = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await?;
        let token: Token = check(response)?.json().await?;
        let access = token.access_token.ok_or(ClientError::NoToken)?;
        let valid_till = now + Duration::seconds(token.expires_in.unwrap_or(0));
        self.token = Some((access.clone(), valid_till));
        Ok(Some(access))
    }
}

/// Lucene term query on an exact field value.
fn term_query(field: &str, value: &str) -> String {
    format!("{}:\"{}\"", field, value.replace('"', "\\\""))
}

fn check(response: reqwest::Response) -> std::result::Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ClientError::Status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::MimeType;
    use chrono::TimeZone;

    fn record(content: &str) -> DataReference {
        let mut data = DataReference::new(
            "http://host/waf/a.xml",
            Url::parse("http://host/waf/a.xml").unwrap(),
            "WAF:http://host/waf/",
            content.as_bytes().to_vec(),
        );
        data.broker_name = Some("my waf".into());
        data
    }

    #[test]
    fn request_carries_provenance_and_xml() {
        let mut data = record("\u{feff}<md><title>Rivers</title></md>");
        data.content_type = Some(MimeType::xml());
        data.last_modified = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        data.attributes.insert("owner".into(), json!("gis"));

        let body = publish_request(&data);
        assert_eq!(body["src_source_type_s"], "WAF");
        assert_eq!(body["src_source_uri_s"], "WAF:http://host/waf/");
        assert_eq!(body["src_source_name_s"], "my waf");
        assert_eq!(body["src_uri_s"], "http://host/waf/a.xml");
        assert_eq!(body["src_lastupdate_dt"], "2024-05-01T12:00:00+00:00");
        assert_eq!(body["sys_owner_s"], "gis");
        assert_eq!(body["title"], "Rivers");
        assert_eq!(body["xml"], "<md><title>Rivers</title></md>");
    }

    #[test]
    fn json_records_are_embedded() {
        let mut data = record(r#"{"name": "layer"}"#);
        data.content_type = MimeType::parse("application/json");
        let body = publish_request(&data);
        assert!(body.get("xml").is_none());
        assert_eq!(body["_json"]["name"], "layer");
    }

    #[test]
    fn term_queries_escape_quotes() {
        assert_eq!(
            term_query("src_source_uri_s", "WAF:http://host/waf/"),
            "src_source_uri_s:\"WAF:http://host/waf/\""
        );
        assert_eq!(term_query("src_uri_s", "a\"b"), "src_uri_s:\"a\\\"b\"");
    }

    #[test]
    fn host_url_is_required() {
        let connector = GptConnector::new(HttpSettings::default());
        assert!(connector.create_broker(&EntityDefinition::new(TYPE)).is_err());
        let def = EntityDefinition::new(TYPE).with(P_HOST_URL, "http://gpt/geoportal");
        let broker = connector.create_broker(&def).unwrap();
        assert_eq!(broker.entity_definition(), &def);
    }
}
