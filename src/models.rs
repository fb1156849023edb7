//! Core data models used throughout the harvester.
//!
//! Definitions ([`EntityDefinition`], [`LinkDefinition`], [`TaskDefinition`],
//! [`TriggerDefinition`]) are plain serializable property bags; their JSON
//! shape matches the task files accepted by the `harvest` CLI. A
//! [`DataReference`] is the in-flight record passed from an input broker,
//! through filters and transformers, to output brokers.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::meta;
use crate::mime::MimeType;

/// Well-known record attribute names.
pub mod wka {
    pub const IDENTIFIER: &str = "identifier";
    pub const TITLE: &str = "title";
    pub const DESCRIPTION: &str = "description";
    pub const RESOURCE_URL: &str = "resource.url";
    pub const RESOURCE_URL_SCHEME: &str = "resource.url.scheme";
    pub const BBOX: &str = "bbox";
}

/// A harvested record.
#[derive(Debug, Clone)]
pub struct DataReference {
    /// Record id, unique within its broker (a path, a URL, a catalog id).
    pub id: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub source_uri: Url,
    /// URI of the broker that produced the record, e.g. `WAF:http://host/`.
    pub broker_uri: String,
    pub broker_name: Option<String>,
    pub task_id: Option<Uuid>,
    pub content: Vec<u8>,
    pub content_type: Option<MimeType>,
    pub attributes: BTreeMap<String, Value>,
    /// The reference this one was derived from by a transformer.
    pub origin: Option<Box<DataReference>>,
}

impl DataReference {
    pub fn new(
        id: impl Into<String>,
        source_uri: Url,
        broker_uri: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            last_modified: None,
            source_uri,
            broker_uri: broker_uri.into(),
            broker_name: None,
            task_id: None,
            content,
            content_type: None,
            attributes: BTreeMap::new(),
            origin: None,
        }
    }

    /// Record title: the `title` attribute if set, otherwise the first
    /// `title` element of XML content, otherwise empty.
    pub fn title(&self) -> String {
        if let Some(Value::String(title)) = self.attributes.get(wka::TITLE) {
            return title.clone();
        }
        if self.is_xml() {
            if let Some(title) = meta::extract_title(&self.content) {
                return title;
            }
        }
        String::new()
    }

    pub fn is_xml(&self) -> bool {
        match &self.content_type {
            Some(ct) => ct.is_xml(),
            None => self.content.trim_ascii_start().starts_with(b"<"),
        }
    }

    /// A new reference with the same identity and the given content; the
    /// receiver becomes its `origin`.
    pub fn derive(&self, content: Vec<u8>, content_type: Option<MimeType>) -> Self {
        Self {
            id: self.id.clone(),
            last_modified: self.last_modified,
            source_uri: self.source_uri.clone(),
            broker_uri: self.broker_uri.clone(),
            broker_name: self.broker_name.clone(),
            task_id: self.task_id,
            content,
            content_type,
            attributes: self.attributes.clone(),
            origin: Some(Box::new(self.clone())),
        }
    }

    /// The reference as originally produced by the input broker.
    pub fn root(&self) -> &DataReference {
        let mut current = self;
        while let Some(origin) = &current.origin {
            current = origin;
        }
        current
    }
}

impl fmt::Display for DataReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_modified {
            Some(ts) => write!(f, "{} [{}]", self.id, ts.to_rfc3339()),
            None => write!(f, "{} [-]", self.id),
        }
    }
}

/// Outcome counters of publishing one or more records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishingStatus {
    pub skipped: u64,
    pub created: u64,
    pub updated: u64,
}

impl PublishingStatus {
    pub const EMPTY: Self = Self::new(0, 0, 0);
    pub const SKIPPED: Self = Self::new(1, 0, 0);
    pub const CREATED: Self = Self::new(0, 1, 0);
    pub const UPDATED: Self = Self::new(0, 0, 1);

    pub const fn new(skipped: u64, created: u64, updated: u64) -> Self {
        Self {
            skipped,
            created,
            updated,
        }
    }

    /// Accumulate another status into a new one.
    pub fn collect(self, other: PublishingStatus) -> Self {
        Self::new(
            self.skipped + other.skipped,
            self.created + other.created,
            self.updated + other.updated,
        )
    }
}

impl fmt::Display for PublishingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STATUS::skipped:{},created:{},updated:{}",
            self.skipped, self.created, self.updated
        )
    }
}

/// Configuration of one connector, filter, transformer or processor
/// instance: a type name plus a flat string property bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDefinition {
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl EntityDefinition {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    /// Builder-style property setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The label, falling back to the type.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.entity_type)
    }
}

/// Two definitions are equal when their type and properties are; label and
/// keywords are presentation only.
impl PartialEq for EntityDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type && self.properties == other.properties
    }
}

impl Eq for EntityDefinition {}

impl fmt::Display for EntityDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let props = self
            .properties
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "{}/{}/[{}]",
            self.entity_type,
            self.label.as_deref().unwrap_or(""),
            props
        )
    }
}

/// One node of a destination tree: an action (output broker, filter or
/// transformer) and the links records flow into after the action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDefinition {
    pub action: EntityDefinition,
    #[serde(default)]
    pub drains: Vec<LinkDefinition>,
}

impl LinkDefinition {
    pub fn new(action: EntityDefinition) -> Self {
        Self {
            action,
            drains: Vec::new(),
        }
    }

    pub fn with_drain(mut self, drain: LinkDefinition) -> Self {
        self.drains.push(drain);
        self
    }
}

impl fmt::Display for LinkDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let drains = self
            .drains
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "LINK {}:[{}]", self.action, drains)
    }
}

/// A harvest task: one source and a tree of destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Processor definition, `None` for the default processor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<EntityDefinition>,
    pub source: EntityDefinition,
    #[serde(default)]
    pub destinations: Vec<LinkDefinition>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub ignore_robots_txt: bool,
}

impl TaskDefinition {
    pub fn new(source: EntityDefinition) -> Self {
        Self {
            name: None,
            processor: None,
            source,
            destinations: Vec::new(),
            keywords: Vec::new(),
            incremental: false,
            ignore_robots_txt: false,
        }
    }

    pub fn with_destination(mut self, link: LinkDefinition) -> Self {
        self.destinations.push(link);
        self
    }
}

impl fmt::Display for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            return write!(f, "{}", name);
        }
        let destinations = self
            .destinations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "SOURCE: {}, DESTINATIONS: [{}], INCREMENTAL: {}, IGNOREROBOTSTXT: {}",
            self.source, destinations, self.incremental, self.ignore_robots_txt
        )
    }
}

/// Trigger configuration: type, its arguments, and the task to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_definition: Option<TaskDefinition>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl TriggerDefinition {
    pub fn new(trigger_type: impl Into<String>, task: TaskDefinition) -> Self {
        Self {
            trigger_type: trigger_type.into(),
            task_definition: Some(task),
            properties: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for TriggerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task_definition {
            Some(task) => write!(f, "{} FOR: {}", self.trigger_type, task),
            None => write!(f, "{}", self.trigger_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_definition_equality_ignores_label() {
        let a = EntityDefinition::new("UNC")
            .with("unc-root-folder", "/data")
            .with_label("first");
        let b = EntityDefinition::new("UNC")
            .with("unc-root-folder", "/data")
            .with_label("second");
        assert_eq!(a, b);
        assert_ne!(a, EntityDefinition::new("WAF").with("unc-root-folder", "/data"));
        assert_eq!(a.to_string(), "UNC/first/[unc-root-folder=/data]");
    }

    #[test]
    fn task_definition_reads_original_json_shape() {
        let json = r#"{
            "source": { "type": "WAF", "properties": { "waf-host-url": "http://host/waf/" } },
            "destinations": [
                { "action": { "type": "REGEX", "properties": { "f-regex-pattern": ".*" } },
                  "drains": [ { "action": { "type": "CONSOLE" } } ] }
            ],
            "incremental": true,
            "ignoreRobotsTxt": true
        }"#;
        let td: TaskDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(td.source.entity_type, "WAF");
        assert!(td.incremental);
        assert!(td.ignore_robots_txt);
        assert_eq!(td.destinations[0].drains[0].action.entity_type, "CONSOLE");

        let back: TaskDefinition =
            serde_json::from_str(&serde_json::to_string(&td).unwrap()).unwrap();
        assert_eq!(back, td);
    }

    #[test]
    fn publishing_status_collects() {
        let total = PublishingStatus::CREATED
            .collect(PublishingStatus::UPDATED)
            .collect(PublishingStatus::CREATED)
            .collect(PublishingStatus::EMPTY);
        assert_eq!(total, PublishingStatus::new(0, 2, 1));
    }

    #[test]
    fn title_prefers_attribute_then_xml() {
        let url = Url::parse("file:///data/a.xml").unwrap();
        let mut r = DataReference::new(
            "/data/a.xml",
            url,
            "UNC:/data",
            b"<rec><dc:title xmlns:dc=\"x\">From XML</dc:title></rec>".to_vec(),
        );
        r.content_type = Some(MimeType::xml());
        assert_eq!(r.title(), "From XML");

        r.attributes
            .insert(wka::TITLE.to_string(), Value::String("From attr".into()));
        assert_eq!(r.title(), "From attr");
    }

    #[test]
    fn derived_reference_keeps_origin_chain() {
        let url = Url::parse("file:///data/a.txt").unwrap();
        let r = DataReference::new("a", url, "UNC:/data", b"text".to_vec());
        let d = r.derive(b"<x/>".to_vec(), Some(MimeType::xml()));
        let dd = d.derive(b"<y/>".to_vec(), Some(MimeType::xml()));
        assert_eq!(dd.root().content, b"text");
        assert_eq!(dd.id, "a");
    }
}
