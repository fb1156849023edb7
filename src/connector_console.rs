//! CONSOLE output connector: prints every record to standard output.

use async_trait::async_trait;
use std::io::Write;

use crate::definition::DefinitionAdaptor;
use crate::error::{HarvestError, Result};
use crate::models::{DataReference, EntityDefinition, PublishingStatus};
use crate::template::UiTemplate;
use crate::traits::{Descriptor, InitContext, OutputBroker, OutputConnector};

pub const TYPE: &str = "CONSOLE";

#[derive(Debug, Default)]
pub struct ConsoleConnector;

impl Descriptor for ConsoleConnector {
    fn entity_type(&self) -> &str {
        TYPE
    }

    fn template(&self) -> UiTemplate {
        UiTemplate::new(TYPE, "Console", Vec::new())
    }
}

impl OutputConnector for ConsoleConnector {
    fn create_broker(&self, def: &EntityDefinition) -> Result<Box<dyn OutputBroker>> {
        let adaptor = DefinitionAdaptor::new(def, TYPE)?;
        Ok(Box::new(ConsoleBroker {
            adaptor,
            out: Box::new(std::io::stdout()),
            count: 0,
        }))
    }
}

pub struct ConsoleBroker {
    adaptor: DefinitionAdaptor,
    out: Box<dyn Write + Send + Sync>,
    count: u64,
}

/// Text printed for one record.
pub fn render(data: &DataReference, n: u64) -> String {
    format!(
        "{}\n{}\n--- END OF {} ---\n",
        data,
        String::from_utf8_lossy(&data.content),
        n
    )
}

#[async_trait]
impl OutputBroker for ConsoleBroker {
    fn entity_definition(&self) -> &EntityDefinition {
        self.adaptor.entity_definition()
    }

    async fn initialize(&mut self, _ctx: &InitContext) -> Result<()> {
        self.count = 0;
        Ok(())
    }

    async fn publish(&mut self, data: &DataReference) -> Result<PublishingStatus> {
        self.count += 1;
        let text = render(data, self.count);
        self.out
            .write_all(text.as_bytes())
            .and_then(|_| self.out.flush())
            .map_err(|e| {
                HarvestError::output(TYPE, &data.id, "error writing to console").with_source(e)
            })?;
        Ok(PublishingStatus::CREATED)
    }
}
