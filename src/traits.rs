//! Extension traits for connectors, filters, transformers and triggers.
//!
//! Every pluggable piece of the harvester is a *factory* registered under a
//! type name (`UNC`, `WAF`, `FOLDER`, `REGEX`, `PERIOD`, ...) that turns an
//! [`EntityDefinition`] into a stateful *instance*:
//!
//! ```text
//! ┌────────────────────┐   create_broker    ┌────────────────┐  iterator  ┌────────────────┐
//! │ InputConnector     │ ─────────────────▶ │ InputBroker    │ ─────────▶ │ BrokerIterator │
//! └────────────────────┘                    └────────────────┘            └───────┬────────┘
//!                                                                                 │ DataReference
//! ┌────────────────────┐   create_broker    ┌────────────────┐                    ▼
//! │ OutputConnector    │ ─────────────────▶ │ OutputBroker   │ ◀──── Link tree (filters,
//! └────────────────────┘                    └────────────────┘        transformers, brokers)
//! ```
//!
//! Instances see the running task through an [`InitContext`] and may
//! register a [`ProcessListener`] there to observe the run they belong to.
//!
//! Factories are looked up in a [`Registry`] keyed by type; an unknown type
//! is an [`HarvestError::InvalidDefinition`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::models::{
    DataReference, EntityDefinition, PublishingStatus, TaskDefinition, TriggerDefinition,
};
use crate::process::{ProcessHandle, ProcessListener};
use crate::template::UiTemplate;

// ═══════════════════════════════════════════════════════════════════════
// Contexts
// ═══════════════════════════════════════════════════════════════════════

/// Listeners attached to one process run, shared between the process and
/// the brokers it initializes.
pub type SharedListeners = Arc<Mutex<Vec<Arc<dyn ProcessListener>>>>;

/// What a broker, filter or transformer learns about the run it is
/// initialized for.
#[derive(Clone)]
pub struct InitContext {
    pub task: TaskDefinition,
    /// Id of the stored task, `None` for ad hoc runs.
    pub task_id: Option<Uuid>,
    /// URI of the task's input broker.
    pub source_broker_uri: String,
    /// Run parameters overriding broker properties.
    pub params: BTreeMap<String, String>,
    can_cleanup: bool,
    listeners: SharedListeners,
}

impl InitContext {
    pub fn new(task: TaskDefinition, task_id: Option<Uuid>, source_broker_uri: String) -> Self {
        let can_cleanup = !task.incremental;
        Self {
            task,
            task_id,
            source_broker_uri,
            params: BTreeMap::new(),
            can_cleanup,
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether an output broker may delete records not seen in this run:
    /// the run is a full harvest and no filter sits between the source and
    /// the broker.
    pub fn can_cleanup(&self) -> bool {
        self.can_cleanup
    }

    /// Context for links below a filter.
    pub fn without_cleanup(&self) -> Self {
        Self {
            can_cleanup: false,
            ..self.clone()
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ProcessListener>) {
        lock(&*self.listeners).push(listener);
    }

    pub fn listeners(&self) -> Vec<Arc<dyn ProcessListener>> {
        lock(&*self.listeners).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Iteration parameters.
#[derive(Debug, Clone, Default)]
pub struct IteratorContext {
    /// Start of the last successful harvest; only records changed since are
    /// wanted when set.
    pub last_harvest: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════
// Input
// ═══════════════════════════════════════════════════════════════════════

/// Common surface of every registered factory.
pub trait Descriptor: Send + Sync {
    /// Type name definitions refer to (e.g. `"WAF"`).
    fn entity_type(&self) -> &str;

    fn template(&self) -> UiTemplate;
}

pub trait InputConnector: Descriptor {
    fn create_broker(&self, def: &EntityDefinition) -> Result<Box<dyn InputBroker>>;
}

#[async_trait]
pub trait InputBroker: Send + Sync {
    fn entity_definition(&self) -> &EntityDefinition;

    /// Identifies the source, e.g. `WAF:http://host/waf/`.
    fn broker_uri(&self) -> String;

    async fn initialize(&mut self, ctx: &InitContext) -> Result<()>;

    async fn iterator(&self, ctx: &IteratorContext) -> Result<Box<dyn BrokerIterator>>;

    async fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Pull-style record cursor.
///
/// `has_next` errors are fatal for the run; a `next` error concerns one
/// record only and iteration continues.
#[async_trait]
pub trait BrokerIterator: Send {
    async fn has_next(&mut self) -> Result<bool>;

    async fn next(&mut self) -> Result<DataReference>;
}

// ═══════════════════════════════════════════════════════════════════════
// Output
// ═══════════════════════════════════════════════════════════════════════

pub trait OutputConnector: Descriptor {
    fn create_broker(&self, def: &EntityDefinition) -> Result<Box<dyn OutputBroker>>;
}

#[async_trait]
pub trait OutputBroker: Send + Sync {
    fn entity_definition(&self) -> &EntityDefinition;

    async fn initialize(&mut self, ctx: &InitContext) -> Result<()>;

    async fn publish(&mut self, data: &DataReference) -> Result<PublishingStatus>;

    async fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Filters and transformers
// ═══════════════════════════════════════════════════════════════════════

pub trait Filter: Descriptor {
    fn create_instance(&self, def: &EntityDefinition) -> Result<Box<dyn FilterInstance>>;
}

#[async_trait]
pub trait FilterInstance: Send + Sync {
    fn entity_definition(&self) -> &EntityDefinition;

    async fn initialize(&mut self, _ctx: &InitContext) -> Result<()> {
        Ok(())
    }

    /// `true` when the record passes.
    fn test(&self, data: &DataReference) -> bool;

    async fn terminate(&mut self) {}
}

pub trait Transformer: Descriptor {
    fn create_instance(&self, def: &EntityDefinition) -> Result<Box<dyn TransformerInstance>>;
}

#[async_trait]
pub trait TransformerInstance: Send + Sync {
    fn entity_definition(&self) -> &EntityDefinition;

    async fn initialize(&mut self, _ctx: &InitContext) -> Result<()> {
        Ok(())
    }

    /// Zero or more records derived from `data`.
    async fn transform(&self, data: &DataReference) -> Result<Vec<DataReference>>;

    async fn terminate(&mut self) {}
}

// ═══════════════════════════════════════════════════════════════════════
// Triggers
// ═══════════════════════════════════════════════════════════════════════

pub trait Trigger: Descriptor {
    fn create_instance(&self, def: &TriggerDefinition) -> Result<Box<dyn TriggerInstance>>;
}

#[async_trait]
pub trait TriggerInstance: Send + Sync {
    fn trigger_definition(&self) -> &TriggerDefinition;

    /// Start submitting runs through `ctx`.
    async fn activate(&mut self, ctx: Arc<dyn TriggerContext>) -> Result<()>;

    /// Stop scheduling further runs. Idempotent.
    async fn deactivate(&mut self);
}

/// The engine side of an activated trigger.
#[async_trait]
pub trait TriggerContext: Send + Sync {
    /// Start a run of `task`.
    async fn submit(&self, task: &TaskDefinition) -> Result<ProcessHandle>;

    /// Start of the most recent recorded harvest of the trigger's task.
    async fn last_harvest(&self) -> Option<DateTime<Utc>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registries
// ═══════════════════════════════════════════════════════════════════════

/// Factories keyed by type name. Registering a type twice replaces the
/// earlier factory.
pub struct Registry<C: ?Sized + Descriptor> {
    kind: &'static str,
    entries: HashMap<String, Arc<C>>,
}

pub type InboundRegistry = Registry<dyn InputConnector>;
pub type OutboundRegistry = Registry<dyn OutputConnector>;
pub type FilterRegistry = Registry<dyn Filter>;
pub type TransformerRegistry = Registry<dyn Transformer>;
pub type TriggerRegistry = Registry<dyn Trigger>;

impl<C: ?Sized + Descriptor> Registry<C> {
    /// `kind` names the registry in error messages ("input connector",
    /// "filter", ...).
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, entry: Arc<C>) {
        self.entries.insert(entry.entity_type().to_string(), entry);
    }

    pub fn get(&self, entity_type: &str) -> Result<Arc<C>> {
        self.entries.get(entity_type).cloned().ok_or_else(|| {
            HarvestError::invalid(format!("unknown {} type '{}'", self.kind, entity_type))
        })
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.entries.contains_key(entity_type)
    }

    /// Templates of every registered type, sorted by type name.
    pub fn templates(&self) -> Vec<UiTemplate> {
        let mut templates: Vec<_> = self.entries.values().map(|e| e.template()).collect();
        templates.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        templates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
