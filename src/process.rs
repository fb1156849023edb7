//! Harvest processes.
//!
//! A [`Process`] drives one run of a [`RuntimeTask`]: it initializes the
//! input broker and the destination links, pulls every record from the
//! broker iterator, pushes it through each link, and terminates everything
//! at the end. Progress is reported to [`ProcessListener`]s.
//!
//! ```text
//! Submitted ──begin()──▶ Working ──abort()──▶ Aborting
//!                           │                    │
//!                           ▼                    ▼
//!                       Completed ◀──────────────┘
//! ```
//!
//! Listeners are called from the task running the harvest, in order. A
//! panicking broker is reported as a processor error and the process still
//! reaches [`ProcessStatus::Completed`].

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::link::Link;
use crate::models::{DataReference, PublishingStatus, TaskDefinition};
use crate::traits::{InitContext, InputBroker, IteratorContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Submitted,
    Working,
    Aborting,
    Completed,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Submitted => "submitted",
            ProcessStatus::Working => "working",
            ProcessStatus::Aborting => "aborting",
            ProcessStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Observer of a process run. Every method defaults to a no-op.
#[async_trait]
pub trait ProcessListener: Send + Sync {
    async fn on_status_change(&self, _process: &ProcessInfo, _status: ProcessStatus) {}

    async fn on_data_acquired(&self, _process: &ProcessInfo, _data: &DataReference) {}

    async fn on_data_processed(
        &self,
        _process: &ProcessInfo,
        _data: &DataReference,
        _status: PublishingStatus,
    ) {
    }

    async fn on_error(&self, _process: &ProcessInfo, _err: &HarvestError) {}
}

/// Raises a shared flag on any error of the run. Output brokers that clean
/// up after a full harvest skip the cleanup once it is raised.
pub struct ErrorFlag(pub Arc<AtomicBool>);

#[async_trait]
impl ProcessListener for ErrorFlag {
    async fn on_error(&self, _process: &ProcessInfo, _err: &HarvestError) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Identity of a process as seen by listeners.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub title: String,
}

/// An executable task: the input broker and the destination links built
/// from a [`TaskDefinition`].
pub struct RuntimeTask {
    pub definition: TaskDefinition,
    pub task_id: Option<Uuid>,
    pub source: Box<dyn InputBroker>,
    pub links: Vec<Link>,
}

impl RuntimeTask {
    pub fn title(&self) -> String {
        let destinations = self
            .links
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!("{} --> [{}]", self.source.broker_uri(), destinations)
    }
}

pub type ProcessHandle = Arc<Process>;

pub struct Process {
    info: ProcessInfo,
    definition: TaskDefinition,
    ctx: InitContext,
    status_tx: watch::Sender<ProcessStatus>,
    status_rx: watch::Receiver<ProcessStatus>,
    aborted: AtomicBool,
    /// Held while a status change is published and its listeners run.
    transition: AsyncMutex<()>,
    pending: Mutex<Option<(RuntimeTask, IteratorContext)>>,
}

impl Process {
    pub fn new(task: RuntimeTask, iter_ctx: IteratorContext) -> ProcessHandle {
        let info = ProcessInfo {
            id: Uuid::new_v4(),
            task_id: task.task_id,
            title: task.title(),
        };
        let ctx = InitContext::new(task.definition.clone(), task.task_id, task.source.broker_uri());
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Submitted);
        Arc::new(Self {
            info,
            definition: task.definition.clone(),
            ctx,
            status_tx,
            status_rx,
            aborted: AtomicBool::new(false),
            transition: AsyncMutex::new(()),
            pending: Mutex::new(Some((task, iter_ctx))),
        })
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn task_definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status_rx.borrow()
    }

    pub fn add_listener(&self, listener: Arc<dyn ProcessListener>) {
        self.ctx.add_listener(listener);
    }

    /// Start the run on the tokio runtime. Only legal once, from
    /// [`ProcessStatus::Submitted`].
    pub async fn begin(self: &Arc<Self>) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some((task, iter_ctx)) = pending else {
            return Err(HarvestError::processor(format!(
                "error beginning the process: process is in {} state",
                self.status()
            )));
        };
        self.set_status(ProcessStatus::Working).await;
        info!(process = %self.info.id, title = %self.info.title, "Started harvest");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let worker = Arc::clone(&this);
            let outcome = tokio::spawn(async move { worker.run(task, iter_ctx).await }).await;
            if let Err(e) = outcome {
                error!(process = %this.info.id, error = %e, "harvest task died");
                let err = HarvestError::processor(format!("harvest task died: {}", e));
                this.report_error(&err).await;
            }
            this.set_status(ProcessStatus::Completed).await;
            info!(process = %this.info.id, title = %this.info.title, "Completed harvest");
        });
        Ok(())
    }

    /// Request the run to stop after the current record. Fails before the
    /// process has begun; a no-op once it is aborting or completed.
    pub async fn abort(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        match self.status() {
            ProcessStatus::Submitted => {
                return Err(HarvestError::processor(format!(
                    "error aborting the process: process is in {} state",
                    ProcessStatus::Submitted
                )));
            }
            ProcessStatus::Aborting | ProcessStatus::Completed => return Ok(()),
            ProcessStatus::Working => {}
        }
        self.aborted.store(true, Ordering::SeqCst);
        self.status_tx.send_replace(ProcessStatus::Aborting);
        for l in self.ctx.listeners() {
            l.on_status_change(&self.info, ProcessStatus::Aborting).await;
        }
        Ok(())
    }

    /// Resolve once the process has completed and its listeners have seen
    /// the completion.
    pub async fn wait(&self) {
        let mut rx = self.status_rx.clone();
        let _ = rx.wait_for(|s| *s == ProcessStatus::Completed).await;
        drop(self.transition.lock().await);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn set_status(&self, status: ProcessStatus) {
        let _guard = self.transition.lock().await;
        if self.status() == status {
            return;
        }
        self.status_tx.send_replace(status);
        for l in self.ctx.listeners() {
            l.on_status_change(&self.info, status).await;
        }
    }

    async fn report_error(&self, err: &HarvestError) {
        for l in self.ctx.listeners() {
            l.on_error(&self.info, err).await;
        }
    }

    async fn run(self: Arc<Self>, mut task: RuntimeTask, iter_ctx: IteratorContext) {
        if task.links.is_empty() {
            info!(process = %self.info.id, "no destinations; nothing to harvest");
        } else if let Err(e) = self.harvest(&mut task, &iter_ctx).await {
            error!(process = %self.info.id, error = %e, "harvest failed");
            self.report_error(&e).await;
        }

        if !self.is_aborted() {
            if let Err(e) = task.source.terminate().await {
                warn!(process = %self.info.id, error = %e, "error terminating input broker");
            }
            for link in &mut task.links {
                link.terminate().await;
            }
        }
    }

    async fn harvest(&self, task: &mut RuntimeTask, iter_ctx: &IteratorContext) -> Result<()> {
        task.source.initialize(&self.ctx).await?;
        for link in &mut task.links {
            link.initialize(&self.ctx).await?;
        }

        let mut iter = task.source.iterator(iter_ctx).await?;
        while !self.is_aborted() && iter.has_next().await? {
            let data = match iter.next().await {
                Ok(mut data) => {
                    data.task_id = task.task_id;
                    data
                }
                Err(e) => {
                    warn!(process = %self.info.id, error = %e, "skipping record");
                    self.report_error(&e).await;
                    continue;
                }
            };
            for l in self.ctx.listeners() {
                l.on_data_acquired(&self.info, &data).await;
            }

            for link in &mut task.links {
                match link.push(&data).await {
                    Ok(status) => {
                        debug!(process = %self.info.id, record = %data, %status, "processed");
                        for l in self.ctx.listeners() {
                            l.on_data_processed(&self.info, &data, status).await;
                        }
                    }
                    Err(e) => {
                        debug!(process = %self.info.id, record = %data, error = %e, "failed");
                        self.report_error(&e).await;
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PROCESS:: status: {}, title: {}",
            self.status(),
            self.info.title
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::LinkAction;
    use crate::models::EntityDefinition;
    use crate::traits::{BrokerIterator, OutputBroker};
    use reqwest::Url;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    /// Input broker over a fixed list of outcomes.
    pub(crate) struct ListBroker {
        pub def: EntityDefinition,
        pub items: Vec<std::result::Result<&'static str, &'static str>>,
        pub gate: Option<Arc<Notify>>,
    }

    struct ListIter {
        items: VecDeque<std::result::Result<&'static str, &'static str>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl InputBroker for ListBroker {
        fn entity_definition(&self) -> &EntityDefinition {
            &self.def
        }
        fn broker_uri(&self) -> String {
            "LIST:test".to_string()
        }
        async fn initialize(&mut self, _ctx: &InitContext) -> Result<()> {
            Ok(())
        }
        async fn iterator(&self, _ctx: &IteratorContext) -> Result<Box<dyn crate::traits::BrokerIterator>> {
            Ok(Box::new(ListIter {
                items: self.items.iter().cloned().collect(),
                gate: self.gate.clone(),
            }))
        }
    }

    #[async_trait]
    impl BrokerIterator for ListIter {
        async fn has_next(&mut self) -> Result<bool> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(!self.items.is_empty())
        }
        async fn next(&mut self) -> Result<DataReference> {
            match self.items.pop_front() {
                Some(Ok(id)) => Ok(DataReference::new(
                    id,
                    Url::parse(&format!("http://host/{}", id)).unwrap(),
                    "LIST:test",
                    id.as_bytes().to_vec(),
                )),
                Some(Err(msg)) => Err(HarvestError::input("LIST:test", msg)),
                None => Err(HarvestError::input("LIST:test", "exhausted")),
            }
        }
    }

    pub(crate) struct CountingBroker {
        pub def: EntityDefinition,
        pub fail_on: Option<&'static str>,
        pub terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl OutputBroker for CountingBroker {
        fn entity_definition(&self) -> &EntityDefinition {
            &self.def
        }
        async fn initialize(&mut self, _ctx: &InitContext) -> Result<()> {
            Ok(())
        }
        async fn publish(&mut self, data: &DataReference) -> Result<PublishingStatus> {
            if self.fail_on == Some(data.id.as_str()) {
                return Err(HarvestError::output("COUNT", &data.id, "refused"));
            }
            Ok(PublishingStatus::CREATED)
        }
        async fn terminate(&mut self) -> Result<()> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Events {
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessListener for Events {
        async fn on_status_change(&self, _p: &ProcessInfo, status: ProcessStatus) {
            self.log.lock().unwrap().push(format!("status:{}", status));
        }
        async fn on_data_acquired(&self, _p: &ProcessInfo, data: &DataReference) {
            self.log.lock().unwrap().push(format!("acquired:{}", data.id));
        }
        async fn on_data_processed(&self, _p: &ProcessInfo, data: &DataReference, _s: PublishingStatus) {
            self.log.lock().unwrap().push(format!("processed:{}", data.id));
        }
        async fn on_error(&self, _p: &ProcessInfo, err: &HarvestError) {
            self.log.lock().unwrap().push(format!("error:{:?}", err.stage()));
        }
    }

    pub(crate) fn task(
        items: Vec<std::result::Result<&'static str, &'static str>>,
        fail_on: Option<&'static str>,
        gate: Option<Arc<Notify>>,
        terminated: Arc<AtomicBool>,
    ) -> RuntimeTask {
        RuntimeTask {
            definition: TaskDefinition::new(EntityDefinition::new("LIST")),
            task_id: None,
            source: Box::new(ListBroker {
                def: EntityDefinition::new("LIST"),
                items,
                gate,
            }),
            links: vec![Link::new(
                LinkAction::Broker(Box::new(CountingBroker {
                    def: EntityDefinition::new("COUNT"),
                    fail_on,
                    terminated,
                })),
                Vec::new(),
            )],
        }
    }

    #[tokio::test]
    async fn run_reports_records_and_errors_in_order() {
        let terminated = Arc::new(AtomicBool::new(false));
        let process = Process::new(
            task(vec![Ok("a"), Err("bad"), Ok("b"), Ok("c")], Some("b"), None, terminated.clone()),
            IteratorContext::default(),
        );
        let events = Arc::new(Events::default());
        process.add_listener(events.clone());

        process.begin().await.unwrap();
        process.wait().await;

        assert_eq!(process.status(), ProcessStatus::Completed);
        assert!(terminated.load(Ordering::SeqCst));
        let log = events.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "status:working",
                "acquired:a",
                "processed:a",
                "error:Input",
                "acquired:b",
                "error:Output",
                "acquired:c",
                "processed:c",
                "status:completed",
            ]
        );
    }

    #[tokio::test]
    async fn begin_twice_is_rejected() {
        let process = Process::new(
            task(vec![], None, None, Arc::new(AtomicBool::new(false))),
            IteratorContext::default(),
        );
        process.begin().await.unwrap();
        assert!(process.begin().await.is_err());
        process.wait().await;
        process.abort().await.unwrap();
        assert_eq!(process.status(), ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn abort_skips_termination() {
        let gate = Arc::new(Notify::new());
        let terminated = Arc::new(AtomicBool::new(false));
        let process = Process::new(
            task(vec![Ok("a"), Ok("b")], None, Some(gate.clone()), terminated.clone()),
            IteratorContext::default(),
        );
        assert!(process.abort().await.is_err());
        process.begin().await.unwrap();
        process.abort().await.unwrap();
        assert_eq!(process.status(), ProcessStatus::Aborting);
        gate.notify_one();
        process.wait().await;
        assert_eq!(process.status(), ProcessStatus::Completed);
        assert!(!terminated.load(Ordering::SeqCst));
    }

    struct PanickingBroker {
        def: EntityDefinition,
    }

    #[async_trait]
    impl InputBroker for PanickingBroker {
        fn entity_definition(&self) -> &EntityDefinition {
            &self.def
        }
        fn broker_uri(&self) -> String {
            "PANIC:test".to_string()
        }
        async fn initialize(&mut self, _ctx: &InitContext) -> Result<()> {
            Ok(())
        }
        async fn iterator(&self, _ctx: &IteratorContext) -> Result<Box<dyn BrokerIterator>> {
            panic!("broker blew up");
        }
    }

    #[tokio::test]
    async fn panicking_broker_still_completes() {
        let mut t = task(vec![], None, None, Arc::new(AtomicBool::new(false)));
        t.source = Box::new(PanickingBroker {
            def: EntityDefinition::new("PANIC"),
        });
        let process = Process::new(t, IteratorContext::default());
        let events = Arc::new(Events::default());
        process.add_listener(events.clone());

        process.begin().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), process.wait())
            .await
            .expect("process completes after a panic");

        assert_eq!(process.status(), ProcessStatus::Completed);
        let log = events.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec!["status:working", "error:Processor", "status:completed"]
        );
    }

    /// Holds the completion notification until released.
    struct SlowCompletion {
        release: Arc<Notify>,
        log: Mutex<Vec<ProcessStatus>>,
    }

    #[async_trait]
    impl ProcessListener for SlowCompletion {
        async fn on_status_change(&self, _p: &ProcessInfo, status: ProcessStatus) {
            self.log.lock().unwrap().push(status);
            if status == ProcessStatus::Completed {
                self.release.notified().await;
            }
        }
    }

    #[tokio::test]
    async fn abort_during_completion_is_a_no_op() {
        let release = Arc::new(Notify::new());
        let listener = Arc::new(SlowCompletion {
            release: release.clone(),
            log: Mutex::new(Vec::new()),
        });
        let process = Process::new(
            task(vec![], None, None, Arc::new(AtomicBool::new(false))),
            IteratorContext::default(),
        );
        process.add_listener(listener.clone());
        process.begin().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while process.status() != ProcessStatus::Completed {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let aborting = {
            let process = Arc::clone(&process);
            tokio::spawn(async move { process.abort().await })
        };
        let waiting = {
            let process = Arc::clone(&process);
            tokio::spawn(async move { process.wait().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        release.notify_one();
        aborting.await.unwrap().unwrap();
        waiting.await.unwrap();

        assert_eq!(process.status(), ProcessStatus::Completed);
        assert_eq!(
            *listener.log.lock().unwrap(),
            vec![ProcessStatus::Working, ProcessStatus::Completed]
        );
    }

    #[tokio::test]
    async fn task_without_destinations_completes_immediately() {
        let mut t = task(vec![Ok("a")], None, None, Arc::new(AtomicBool::new(false)));
        t.links.clear();
        let process = Process::new(t, IteratorContext::default());
        process.begin().await.unwrap();
        process.wait().await;
        assert_eq!(process.status(), ProcessStatus::Completed);
    }
}
