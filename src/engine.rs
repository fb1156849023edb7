//! The harvesting engine.
//!
//! [`Engine`] owns the connector registries, the history backend and the
//! report manager, and exposes the services built on them:
//!
//! - **templates**: UI templates of every registered type
//! - **brokers**: create and validate brokers from definitions
//! - **tasks**: stored task definitions
//! - **execution**: turn a [`TaskDefinition`] into a running [`Process`]
//! - **triggers**: schedule stored or ad-hoc tasks
//! - **processes**: list, abort and purge runs
//!
//! ```rust,no_run
//! # async fn demo() -> harvester::error::Result<()> {
//! use harvester::config::Config;
//! use harvester::engine::Engine;
//! use harvester::models::{EntityDefinition, LinkDefinition, TaskDefinition};
//! use harvester::traits::IteratorContext;
//!
//! let engine = Engine::bootstrap(&Config::minimal()).await?;
//! let task = TaskDefinition::new(
//!     EntityDefinition::new("UNC").with("unc-root-folder", "/data/metadata"),
//! )
//! .with_destination(LinkDefinition::new(EntityDefinition::new("CONSOLE")));
//! let process = engine.execute(&task, None, IteratorContext::default()).await?;
//! process.wait().await;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connector_console::ConsoleConnector;
use crate::connector_folder::FolderConnector;
use crate::connector_gpt::GptConnector;
use crate::connector_unc::UncConnector;
use crate::connector_waf::WafConnector;
use crate::crud::MemCrud;
use crate::error::{HarvestError, Result};
use crate::filter_regex::RegexFilter;
use crate::history::{
    History, HistoryManager, HistoryRecorder, MemHistoryManager, SqliteHistoryManager,
};
use crate::http::HttpSettings;
use crate::link::{Link, LinkAction};
use crate::models::{EntityDefinition, LinkDefinition, TaskDefinition, TriggerDefinition};
use crate::process::{Process, ProcessHandle, ProcessStatus, RuntimeTask};
use crate::report::{LogReportManager, ReportManager};
use crate::template::UiTemplate;
use crate::traits::{
    FilterRegistry, InboundRegistry, InputBroker, IteratorContext, OutboundRegistry,
    OutputBroker, TransformerRegistry, TriggerContext, TriggerInstance, TriggerRegistry,
};
use crate::transformer_dc::DcTransformer;
use crate::triggers::{AtTrigger, NowTrigger, PeriodTrigger};

/// Type of the only supported processor.
pub const DEFAULT_PROCESSOR: &str = "DEFAULT";

/// All factory registries.
pub struct Registries {
    pub inbound: InboundRegistry,
    pub outbound: OutboundRegistry,
    pub filters: FilterRegistry,
    pub transformers: TransformerRegistry,
    pub triggers: TriggerRegistry,
}

impl Registries {
    pub fn empty() -> Self {
        Self {
            inbound: InboundRegistry::new("input connector"),
            outbound: OutboundRegistry::new("output connector"),
            filters: FilterRegistry::new("filter"),
            transformers: TransformerRegistry::new("transformer"),
            triggers: TriggerRegistry::new("trigger"),
        }
    }

    /// Registries with every built-in type.
    pub fn builtin(settings: &HttpSettings) -> Self {
        let mut r = Self::empty();
        r.inbound.register(Arc::new(UncConnector));
        r.inbound.register(Arc::new(WafConnector::new(settings.clone())));
        r.outbound.register(Arc::new(ConsoleConnector));
        r.outbound.register(Arc::new(FolderConnector));
        r.outbound.register(Arc::new(GptConnector::new(settings.clone())));
        r.filters.register(Arc::new(RegexFilter));
        r.transformers.register(Arc::new(DcTransformer));
        r.triggers.register(Arc::new(NowTrigger));
        r.triggers.register(Arc::new(AtTrigger));
        r.triggers.register(Arc::new(PeriodTrigger));
        r
    }
}

/// A trigger known to the engine, active or not.
#[derive(Debug, Clone)]
pub struct ScheduledTrigger {
    /// Stored task the trigger runs, if any.
    pub task_id: Option<Uuid>,
    pub definition: TriggerDefinition,
}

pub struct Engine {
    registries: Registries,
    history: Arc<dyn HistoryManager>,
    reports: Arc<dyn ReportManager>,
    tasks: MemCrud<TaskDefinition>,
    processes: MemCrud<ProcessHandle>,
    triggers: MemCrud<ScheduledTrigger>,
    active: Mutex<HashMap<Uuid, Box<dyn TriggerInstance>>>,
    me: Weak<Engine>,
}

impl Engine {
    pub fn new(
        registries: Registries,
        history: Arc<dyn HistoryManager>,
        reports: Arc<dyn ReportManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registries,
            history,
            reports,
            tasks: MemCrud::new(),
            processes: MemCrud::new(),
            triggers: MemCrud::new(),
            active: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// Engine with the built-in types, the configured history backend and
    /// log based reporting.
    pub async fn bootstrap(config: &Config) -> Result<Arc<Self>> {
        let settings = HttpSettings::from_config(config);
        let history: Arc<dyn HistoryManager> = match config.history.backend.as_str() {
            "sqlite" => {
                let path = config.history.path.as_deref().ok_or_else(|| {
                    HarvestError::invalid("history.path is required for the sqlite backend")
                })?;
                info!(path = %path.display(), "using SQLite history");
                Arc::new(SqliteHistoryManager::open(path).await?)
            }
            _ => Arc::new(MemHistoryManager::new()),
        };
        Ok(Self::new(
            Registries::builtin(&settings),
            history,
            Arc::new(LogReportManager),
        ))
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn history(&self) -> &Arc<dyn HistoryManager> {
        &self.history
    }

    // ═══════════════════════════════════════════════════════════════════
    // Templates
    // ═══════════════════════════════════════════════════════════════════

    /// Templates of every registered type, grouped by category.
    pub fn templates(&self) -> Vec<(&'static str, Vec<UiTemplate>)> {
        vec![
            ("inbound", self.registries.inbound.templates()),
            ("outbound", self.registries.outbound.templates()),
            ("filters", self.registries.filters.templates()),
            ("transformers", self.registries.transformers.templates()),
            ("triggers", self.registries.triggers.templates()),
        ]
    }

    // ═══════════════════════════════════════════════════════════════════
    // Brokers
    // ═══════════════════════════════════════════════════════════════════

    pub fn create_input_broker(&self, def: &EntityDefinition) -> Result<Box<dyn InputBroker>> {
        self.registries
            .inbound
            .get(&def.entity_type)?
            .create_broker(def)
    }

    pub fn create_output_broker(&self, def: &EntityDefinition) -> Result<Box<dyn OutputBroker>> {
        self.registries
            .outbound
            .get(&def.entity_type)?
            .create_broker(def)
    }

    /// Check that every definition of `task` yields a broker, filter or
    /// transformer.
    pub fn validate_task(&self, task: &TaskDefinition) -> Result<()> {
        self.build_runtime(task.clone(), None).map(|_| ())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Tasks
    // ═══════════════════════════════════════════════════════════════════

    pub fn create_task(&self, task: TaskDefinition) -> Uuid {
        self.tasks.create(task)
    }

    pub fn read_task(&self, id: &Uuid) -> Option<TaskDefinition> {
        self.tasks.read(id)
    }

    /// Replace a stored task; returns the previous definition.
    pub fn update_task(&self, id: &Uuid, task: TaskDefinition) -> Option<TaskDefinition> {
        self.tasks.update(id, task)
    }

    pub fn list_tasks(&self) -> Vec<(Uuid, TaskDefinition)> {
        self.tasks.list()
    }

    /// Delete a stored task together with its history and triggers.
    pub async fn delete_task(&self, id: &Uuid) -> Result<Option<TaskDefinition>> {
        let trigger_ids: Vec<Uuid> = self
            .triggers
            .list()
            .into_iter()
            .filter(|(_, t)| t.task_id == Some(*id))
            .map(|(trigger_id, _)| trigger_id)
            .collect();
        for trigger_id in trigger_ids {
            self.deactivate(&trigger_id).await?;
        }
        self.history.purge_history(*id).await?;
        Ok(self.tasks.delete(id))
    }

    pub async fn task_history(&self, id: &Uuid) -> Result<History> {
        self.history.build_history(*id).await
    }

    /// Start of the latest recorded run of a stored task.
    async fn last_event_start(&self, task_id: Uuid) -> Option<DateTime<Utc>> {
        match self.history.build_history(task_id).await {
            Ok(history) => history.last_event().map(|e| e.started),
            Err(e) => {
                warn!(task = %task_id, error = %e, "failed to read task history");
                None
            }
        }
    }

    /// Iteration context of a stored task: incremental tasks only want
    /// records changed since the last run.
    async fn iterator_context(&self, task_id: Uuid, task: &TaskDefinition) -> IteratorContext {
        let last_harvest = if task.incremental {
            self.last_event_start(task_id).await
        } else {
            None
        };
        IteratorContext { last_harvest }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Execution
    // ═══════════════════════════════════════════════════════════════════

    /// Build the input broker and destination links of `task`.
    pub fn build_runtime(&self, task: TaskDefinition, task_id: Option<Uuid>) -> Result<RuntimeTask> {
        if let Some(processor) = &task.processor {
            if !processor.entity_type.eq_ignore_ascii_case(DEFAULT_PROCESSOR) {
                return Err(HarvestError::invalid(format!(
                    "unsupported processor type '{}'",
                    processor.entity_type
                )));
            }
        }
        let source = self.create_input_broker(&task.source)?;
        let links = task
            .destinations
            .iter()
            .map(|d| self.build_link(d))
            .collect::<Result<Vec<_>>>()?;
        Ok(RuntimeTask {
            definition: task,
            task_id,
            source,
            links,
        })
    }

    fn build_link(&self, def: &LinkDefinition) -> Result<Link> {
        let r = &self.registries;
        let action_type = def.action.entity_type.as_str();
        let action = if r.outbound.contains(action_type) {
            LinkAction::Broker(r.outbound.get(action_type)?.create_broker(&def.action)?)
        } else if r.filters.contains(action_type) {
            LinkAction::Filter(r.filters.get(action_type)?.create_instance(&def.action)?)
        } else if r.transformers.contains(action_type) {
            LinkAction::Transformer(r.transformers.get(action_type)?.create_instance(&def.action)?)
        } else {
            return Err(HarvestError::invalid(format!(
                "unknown destination type '{}'",
                action_type
            )));
        };
        let drains = def
            .drains
            .iter()
            .map(|d| self.build_link(d))
            .collect::<Result<Vec<_>>>()?;
        Ok(Link::new(action, drains))
    }

    /// Build and start a run of `task`. Runs of a stored task (`task_id`)
    /// are recorded in the history.
    pub async fn execute(
        &self,
        task: &TaskDefinition,
        task_id: Option<Uuid>,
        iter_ctx: IteratorContext,
    ) -> Result<ProcessHandle> {
        let process = self.prepare(task, task_id, iter_ctx)?;
        process.begin().await?;
        Ok(process)
    }

    /// Like [`Engine::execute`] but leaves the process in
    /// [`ProcessStatus::Submitted`] so callers can attach listeners before
    /// calling [`Process::begin`].
    pub fn prepare(
        &self,
        task: &TaskDefinition,
        task_id: Option<Uuid>,
        iter_ctx: IteratorContext,
    ) -> Result<ProcessHandle> {
        let runtime = self.build_runtime(task.clone(), task_id)?;
        let process = Process::new(runtime, iter_ctx);
        process.add_listener(self.reports.create_listener(process.info()));
        if let Some(task_id) = task_id {
            process.add_listener(Arc::new(HistoryRecorder::new(
                task_id,
                Arc::clone(&self.history),
            )));
        }
        self.processes.insert(process.id(), Arc::clone(&process));
        Ok(process)
    }

    /// Run a stored task now.
    pub async fn run_task(&self, task_id: &Uuid) -> Result<ProcessHandle> {
        let task = self
            .read_task(task_id)
            .ok_or_else(|| HarvestError::invalid(format!("no task {}", task_id)))?;
        let iter_ctx = self.iterator_context(*task_id, &task).await;
        self.execute(&task, Some(*task_id), iter_ctx).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Triggers
    // ═══════════════════════════════════════════════════════════════════

    /// Activate `trigger`, for a stored task when `task_id` is given. A
    /// trigger without its own task runs the stored one.
    pub async fn schedule(
        &self,
        task_id: Option<Uuid>,
        mut trigger: TriggerDefinition,
    ) -> Result<Uuid> {
        if let Some(id) = task_id {
            if trigger.task_definition.is_none() {
                let task = self
                    .read_task(&id)
                    .ok_or_else(|| HarvestError::invalid(format!("no task {}", id)))?;
                trigger.task_definition = Some(task);
            }
        }
        let scheduled = ScheduledTrigger {
            task_id,
            definition: trigger,
        };
        let trigger_id = Uuid::new_v4();
        self.activate(trigger_id, &scheduled).await?;
        self.triggers.insert(trigger_id, scheduled);
        Ok(trigger_id)
    }

    async fn activate(&self, trigger_id: Uuid, scheduled: &ScheduledTrigger) -> Result<()> {
        let def = &scheduled.definition;
        if let Some(task) = &def.task_definition {
            self.validate_task(task)?;
        }
        let mut instance = self
            .registries
            .triggers
            .get(&def.trigger_type)?
            .create_instance(def)?;
        let ctx = Arc::new(EngineTriggerContext {
            engine: self.me.clone(),
            task_id: scheduled.task_id,
        });
        instance.activate(ctx).await?;
        info!(trigger = %trigger_id, definition = %def, "trigger activated");
        self.active.lock().await.insert(trigger_id, instance);
        Ok(())
    }

    /// Deactivate and forget a trigger.
    pub async fn deactivate(&self, trigger_id: &Uuid) -> Result<TriggerDefinition> {
        let instance = self.active.lock().await.remove(trigger_id);
        let stored = self.triggers.delete(trigger_id);
        match (instance, stored) {
            (Some(mut instance), _) => {
                instance.deactivate().await;
                info!(trigger = %trigger_id, "trigger deactivated");
                Ok(instance.trigger_definition().clone())
            }
            (None, Some(stored)) => Ok(stored.definition),
            (None, None) => Err(HarvestError::invalid(format!("no trigger {}", trigger_id))),
        }
    }

    /// Active triggers, optionally only those of one stored task.
    pub async fn list_activated(&self, task_id: Option<Uuid>) -> Vec<(Uuid, ScheduledTrigger)> {
        let active = self.active.lock().await;
        let mut listed: Vec<_> = self
            .triggers
            .list()
            .into_iter()
            .filter(|(id, _)| active.contains_key(id))
            .filter(|(_, t)| task_id.is_none() || t.task_id == task_id)
            .collect();
        listed.sort_by_key(|(id, _)| *id);
        listed
    }

    /// Re-activate every known trigger that is not active. Returns the
    /// number activated; failures are logged.
    pub async fn activate_all(&self) -> usize {
        let mut activated = 0;
        for (id, scheduled) in self.triggers.list() {
            if self.active.lock().await.contains_key(&id) {
                continue;
            }
            match self.activate(id, &scheduled).await {
                Ok(()) => activated += 1,
                Err(e) => error!(trigger = %id, error = %e, "failed to activate trigger"),
            }
        }
        activated
    }

    /// Deactivate every active trigger, keeping their definitions for
    /// [`Engine::activate_all`].
    pub async fn deactivate_all(&self) -> usize {
        let drained: Vec<_> = self.active.lock().await.drain().collect();
        let count = drained.len();
        for (id, mut instance) in drained {
            instance.deactivate().await;
            info!(trigger = %id, "trigger deactivated");
        }
        count
    }

    // ═══════════════════════════════════════════════════════════════════
    // Processes
    // ═══════════════════════════════════════════════════════════════════

    pub fn list_processes(&self) -> Vec<(Uuid, ProcessHandle)> {
        self.processes.list()
    }

    pub fn get_process(&self, id: &Uuid) -> Option<ProcessHandle> {
        self.processes.read(id)
    }

    pub async fn abort_process(&self, id: &Uuid) -> Result<()> {
        let process = self
            .get_process(id)
            .ok_or_else(|| HarvestError::invalid(format!("no process {}", id)))?;
        process.abort().await
    }

    /// Forget completed processes; returns how many were removed.
    pub fn purge_processes(&self) -> usize {
        self.processes
            .retain(|_, p| p.status() != ProcessStatus::Completed)
    }

    /// Stop all triggers and abort running processes.
    pub async fn shutdown(&self) {
        self.deactivate_all().await;
        for (_, process) in self.list_processes() {
            if process.status() == ProcessStatus::Working {
                let _ = process.abort().await;
            }
        }
    }
}

/// Trigger side view of the engine. Holds the engine weakly so activated
/// triggers do not keep it alive.
struct EngineTriggerContext {
    engine: Weak<Engine>,
    task_id: Option<Uuid>,
}

impl EngineTriggerContext {
    fn engine(&self) -> Result<Arc<Engine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| HarvestError::processor("engine has been shut down"))
    }
}

#[async_trait]
impl TriggerContext for EngineTriggerContext {
    async fn submit(&self, task: &TaskDefinition) -> Result<ProcessHandle> {
        let engine = self.engine()?;
        let iter_ctx = match self.task_id {
            Some(id) => engine.iterator_context(id, task).await,
            None => IteratorContext::default(),
        };
        engine.execute(task, self.task_id, iter_ctx).await
    }

    async fn last_harvest(&self) -> Option<DateTime<Utc>> {
        let engine = self.engine().ok()?;
        engine.last_event_start(self.task_id?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector_folder;
    use crate::connector_unc;
    use crate::filter_regex;
    use crate::triggers;
    use std::fs;
    use tempfile::TempDir;

    async fn engine() -> Arc<Engine> {
        Engine::bootstrap(&Config::minimal()).await.unwrap()
    }

    fn unc_to_folder(src: &TempDir, dst: &TempDir) -> TaskDefinition {
        TaskDefinition::new(
            EntityDefinition::new(connector_unc::TYPE)
                .with(connector_unc::P_ROOT_FOLDER, src.path().to_string_lossy()),
        )
        .with_destination(LinkDefinition::new(
            EntityDefinition::new(connector_folder::TYPE)
                .with(connector_folder::P_ROOT_FOLDER, dst.path().to_string_lossy()),
        ))
    }

    fn files_under(dir: &std::path::Path) -> Vec<String> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn builtins_are_registered() {
        let engine = engine().await;
        let templates = engine.templates();
        let types = |kind: &str| -> Vec<String> {
            templates
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, t)| t.iter().map(|t| t.entity_type.clone()).collect())
                .unwrap_or_default()
        };
        assert_eq!(types("inbound"), vec!["UNC", "WAF"]);
        assert_eq!(types("outbound"), vec!["CONSOLE", "FOLDER", "GPT"]);
        assert_eq!(types("filters"), vec!["REGEX"]);
        assert_eq!(types("transformers"), vec!["DC"]);
        assert_eq!(types("triggers"), vec!["AT", "NOW", "PERIOD"]);
    }

    #[tokio::test]
    async fn broker_definitions_round_trip() {
        let engine = engine().await;
        let def = EntityDefinition::new("UNC")
            .with_label("local")
            .with("unc-root-folder", "/tmp");
        let broker = engine.create_input_broker(&def).unwrap();
        assert_eq!(broker.entity_definition(), &def);
        assert!(engine
            .create_input_broker(&EntityDefinition::new("CSW"))
            .is_err());
    }

    #[tokio::test]
    async fn invalid_tasks_are_rejected() {
        let engine = engine().await;
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        let mut task = unc_to_folder(&src, &dst);
        task.destinations
            .push(LinkDefinition::new(EntityDefinition::new("NOPE")));
        assert!(matches!(
            engine.validate_task(&task),
            Err(HarvestError::InvalidDefinition(_))
        ));

        let mut task = unc_to_folder(&src, &dst);
        task.processor = Some(EntityDefinition::new("PARALLEL"));
        assert!(engine.validate_task(&task).is_err());

        task.processor = Some(EntityDefinition::new("DEFAULT"));
        assert!(engine.validate_task(&task).is_ok());
    }

    #[tokio::test]
    async fn executes_filtered_link_tree() {
        let engine = engine().await;
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("keep.xml"), "<a/>").unwrap();
        fs::write(src.path().join("drop.xml"), "<b/>").unwrap();

        let folder = EntityDefinition::new(connector_folder::TYPE)
            .with(connector_folder::P_ROOT_FOLDER, dst.path().to_string_lossy());
        let filter = EntityDefinition::new(filter_regex::TYPE)
            .with(filter_regex::P_PATTERN, ".*keep\\.xml");
        let task = TaskDefinition::new(
            EntityDefinition::new(connector_unc::TYPE)
                .with(connector_unc::P_ROOT_FOLDER, src.path().to_string_lossy()),
        )
        .with_destination(LinkDefinition::new(filter).with_drain(LinkDefinition::new(folder)));

        let process = engine
            .execute(&task, None, IteratorContext::default())
            .await
            .unwrap();
        process.wait().await;
        assert_eq!(files_under(dst.path()), vec!["keep.xml"]);
        assert_eq!(engine.list_processes().len(), 1);
        assert_eq!(engine.purge_processes(), 1);
        assert!(engine.list_processes().is_empty());
    }

    #[tokio::test]
    async fn stored_task_runs_are_recorded_and_purged() {
        let engine = engine().await;
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("a.xml"), "<a/>").unwrap();

        let task_id = engine.create_task(unc_to_folder(&src, &dst));
        let process = engine.run_task(&task_id).await.unwrap();
        process.wait().await;

        let history = engine.task_history(&task_id).await.unwrap();
        let event = history.last_event().unwrap();
        assert_eq!(event.report.acquired, 1);
        assert_eq!(event.report.created, 1);

        assert!(engine.delete_task(&task_id).await.unwrap().is_some());
        assert!(engine.task_history(&task_id).await.unwrap().events().is_empty());
        assert!(engine.read_task(&task_id).is_none());
    }

    #[tokio::test]
    async fn now_trigger_runs_stored_task() {
        let engine = engine().await;
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(src.path().join("a.xml"), "<a/>").unwrap();
        let task_id = engine.create_task(unc_to_folder(&src, &dst));

        let trigger = TriggerDefinition {
            trigger_type: triggers::NOW.to_string(),
            task_definition: None,
            properties: Default::default(),
        };
        let trigger_id = engine.schedule(Some(task_id), trigger).await.unwrap();
        assert_eq!(engine.list_activated(Some(task_id)).await.len(), 1);
        assert!(engine.list_activated(Some(Uuid::new_v4())).await.is_empty());

        for _ in 0..200 {
            if !engine.task_history(&task_id).await.unwrap().events().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(engine.task_history(&task_id).await.unwrap().events().len(), 1);

        assert_eq!(engine.deactivate_all().await, 1);
        assert!(engine.list_activated(None).await.is_empty());
        engine.deactivate(&trigger_id).await.unwrap();
        assert!(engine.deactivate(&trigger_id).await.is_err());
    }

    #[tokio::test]
    async fn task_and_process_services() {
        let engine = engine().await;
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        assert_eq!(engine.registries().outbound.len(), 3);

        let task_id = engine.create_task(unc_to_folder(&src, &dst));
        let mut renamed = unc_to_folder(&src, &dst);
        renamed.name = Some("nightly".into());
        assert!(engine.update_task(&task_id, renamed).is_some());
        let listed = engine.list_tasks();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.name.as_deref(), Some("nightly"));

        let folder = EntityDefinition::new(connector_folder::TYPE)
            .with(connector_folder::P_ROOT_FOLDER, dst.path().to_string_lossy());
        assert_eq!(
            engine.create_output_broker(&folder).unwrap().entity_definition(),
            &folder
        );

        let process = engine.run_task(&task_id).await.unwrap();
        process.wait().await;
        assert!(engine.get_process(&process.id()).is_some());
        engine.abort_process(&process.id()).await.unwrap();
        assert!(engine.abort_process(&Uuid::new_v4()).await.is_err());
        assert!(engine
            .history()
            .build_history(task_id)
            .await
            .unwrap()
            .last_event()
            .is_some());
    }

    #[tokio::test]
    async fn deactivated_triggers_can_be_reactivated() {
        let engine = engine().await;
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let task_id = engine.create_task(unc_to_folder(&src, &dst));

        let trigger = TriggerDefinition::new(triggers::PERIOD, unc_to_folder(&src, &dst))
            .with(triggers::P_PERIOD, "P1D");
        engine.schedule(Some(task_id), trigger).await.unwrap();
        assert_eq!(engine.deactivate_all().await, 1);
        assert!(engine.list_activated(None).await.is_empty());

        assert_eq!(engine.activate_all().await, 1);
        assert_eq!(engine.list_activated(Some(task_id)).await.len(), 1);
        assert_eq!(engine.activate_all().await, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn schedule_rejects_bad_triggers() {
        let engine = engine().await;
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let task = unc_to_folder(&src, &dst);

        let unknown = TriggerDefinition::new("CRON", task.clone());
        assert!(engine.schedule(None, unknown).await.is_err());

        let bad_time = TriggerDefinition::new(triggers::AT, task.clone())
            .with(triggers::P_AT_TIME, "99:99");
        assert!(engine.schedule(None, bad_time).await.is_err());

        let no_task = TriggerDefinition {
            trigger_type: triggers::NOW.to_string(),
            task_definition: None,
            properties: Default::default(),
        };
        assert!(engine.schedule(Some(Uuid::new_v4()), no_task).await.is_err());
        assert!(engine.list_activated(None).await.is_empty());
    }
}
