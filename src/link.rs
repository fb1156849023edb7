//! Destination trees.
//!
//! A task's destinations form a tree of [`Link`]s. Each link performs one
//! action on a record (publish it, test it, transform it) and pushes the
//! resulting records into its drains.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::models::{DataReference, LinkDefinition, PublishingStatus};
use crate::traits::{FilterInstance, InitContext, OutputBroker, TransformerInstance};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub enum LinkAction {
    Broker(Box<dyn OutputBroker>),
    Filter(Box<dyn FilterInstance>),
    Transformer(Box<dyn TransformerInstance>),
}

impl LinkAction {
    fn definition(&self) -> &crate::models::EntityDefinition {
        match self {
            LinkAction::Broker(b) => b.entity_definition(),
            LinkAction::Filter(f) => f.entity_definition(),
            LinkAction::Transformer(t) => t.entity_definition(),
        }
    }
}

pub struct Link {
    action: LinkAction,
    drains: Vec<Link>,
}

impl Link {
    pub fn new(action: LinkAction, drains: Vec<Link>) -> Self {
        Self { action, drains }
    }

    /// Re-derive the definition this link was built from.
    pub fn definition(&self) -> LinkDefinition {
        LinkDefinition {
            action: self.action.definition().clone(),
            drains: self.drains.iter().map(Link::definition).collect(),
        }
    }

    pub fn initialize<'a>(&'a mut self, ctx: &'a InitContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let drain_ctx = match &mut self.action {
                LinkAction::Broker(b) => {
                    b.initialize(ctx).await?;
                    ctx.clone()
                }
                LinkAction::Filter(f) => {
                    f.initialize(ctx).await?;
                    ctx.without_cleanup()
                }
                LinkAction::Transformer(t) => {
                    t.initialize(ctx).await?;
                    ctx.clone()
                }
            };
            for drain in &mut self.drains {
                drain.initialize(&drain_ctx).await?;
            }
            Ok(())
        })
    }

    /// Run the action on `data` and push its output into every drain,
    /// collecting the publishing statuses of the whole subtree.
    pub fn push<'a>(&'a mut self, data: &'a DataReference) -> BoxFuture<'a, Result<PublishingStatus>> {
        Box::pin(async move {
            let (mut status, outputs) = match &mut self.action {
                LinkAction::Broker(b) => (b.publish(data).await?, vec![data.clone()]),
                LinkAction::Filter(f) => {
                    let passed = if f.test(data) {
                        vec![data.clone()]
                    } else {
                        Vec::new()
                    };
                    (PublishingStatus::EMPTY, passed)
                }
                LinkAction::Transformer(t) => (PublishingStatus::EMPTY, t.transform(data).await?),
            };
            for output in &outputs {
                for drain in &mut self.drains {
                    status = status.collect(drain.push(output).await?);
                }
            }
            Ok(status)
        })
    }

    /// Terminate the action and then every drain. Errors are logged and do
    /// not stop the remaining terminations.
    pub fn terminate(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match &mut self.action {
                LinkAction::Broker(b) => {
                    if let Err(e) = b.terminate().await {
                        tracing::warn!(broker = %b.entity_definition(), error = %e, "error terminating broker");
                    }
                }
                LinkAction::Filter(f) => f.terminate().await,
                LinkAction::Transformer(t) => t.terminate().await,
            }
            for drain in &mut self.drains {
                drain.terminate().await;
            }
        })
    }
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.definition())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityDefinition;
    use async_trait::async_trait;
    use reqwest::Url;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        def: EntityDefinition,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl OutputBroker for Recorder {
        fn entity_definition(&self) -> &EntityDefinition {
            &self.def
        }
        async fn initialize(&mut self, _ctx: &InitContext) -> Result<()> {
            Ok(())
        }
        async fn publish(&mut self, data: &DataReference) -> Result<PublishingStatus> {
            self.seen.lock().unwrap().push(String::from_utf8_lossy(&data.content).into_owned());
            Ok(PublishingStatus::CREATED)
        }
    }

    struct EvenOnly(EntityDefinition);

    #[async_trait]
    impl FilterInstance for EvenOnly {
        fn entity_definition(&self) -> &EntityDefinition {
            &self.0
        }
        fn test(&self, data: &DataReference) -> bool {
            data.content.len() % 2 == 0
        }
    }

    struct Doubler(EntityDefinition);

    #[async_trait]
    impl TransformerInstance for Doubler {
        fn entity_definition(&self) -> &EntityDefinition {
            &self.0
        }
        async fn transform(&self, data: &DataReference) -> Result<Vec<DataReference>> {
            Ok(vec![
                data.derive(b"first".to_vec(), None),
                data.derive(b"second".to_vec(), None),
            ])
        }
    }

    fn record(content: &str) -> DataReference {
        DataReference::new(
            "id",
            Url::parse("http://host/a.xml").unwrap(),
            "TEST:x",
            content.as_bytes().to_vec(),
        )
    }

    fn recorder(seen: &Arc<Mutex<Vec<String>>>) -> Link {
        Link::new(
            LinkAction::Broker(Box::new(Recorder {
                def: EntityDefinition::new("REC"),
                seen: Arc::clone(seen),
            })),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn filter_forwards_only_passing_records() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut link = Link::new(
            LinkAction::Filter(Box::new(EvenOnly(EntityDefinition::new("EVEN")))),
            vec![recorder(&seen)],
        );
        assert_eq!(link.push(&record("ab")).await.unwrap(), PublishingStatus::CREATED);
        assert_eq!(link.push(&record("abc")).await.unwrap(), PublishingStatus::EMPTY);
        assert_eq!(*seen.lock().unwrap(), vec!["ab"]);
    }

    #[tokio::test]
    async fn transformer_fans_out_and_statuses_collect() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut link = Link::new(
            LinkAction::Transformer(Box::new(Doubler(EntityDefinition::new("DOUBLE")))),
            vec![recorder(&seen), recorder(&seen)],
        );
        let status = link.push(&record("x")).await.unwrap();
        assert_eq!(status.created, 4);
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn definition_round_trips() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let link = Link::new(
            LinkAction::Filter(Box::new(EvenOnly(EntityDefinition::new("EVEN")))),
            vec![recorder(&seen)],
        );
        let def = link.definition();
        assert_eq!(def.action.entity_type, "EVEN");
        assert_eq!(def.drains[0].action.entity_type, "REC");
    }
}
