//! Error types shared by every harvesting stage.
//!
//! Errors are classified by the stage that produced them so that listeners
//! (reports, history) can count them separately: failures while reading a
//! source are [`Stage::Input`], failures while publishing are
//! [`Stage::Output`], and failures while wiring or running a process are
//! [`Stage::Processor`].

use thiserror::Error;

/// Boxed source error carried by the stage variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, HarvestError>;

/// Pipeline stage an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input,
    Output,
    Processor,
    Definition,
    Storage,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HarvestError {
    /// Reading from a source broker failed.
    #[error("input error [{broker}]: {message}")]
    Input {
        broker: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Publishing a record failed.
    #[error("output error [{broker}] publishing {data_id}: {message}")]
    Output {
        broker: String,
        data_id: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Initializing, terminating or driving a process failed.
    #[error("processor error: {message}")]
    Processor {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    pub fn input(broker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Input {
            broker: broker.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn output(
        broker: impl Into<String>,
        data_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Output {
            broker: broker.into(),
            data_id: data_id.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn processor(message: impl Into<String>) -> Self {
        Self::Processor {
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidDefinition(message.into())
    }

    /// Attach an underlying cause to a stage error. Other variants are
    /// returned unchanged.
    pub fn with_source(self, cause: impl Into<BoxError>) -> Self {
        match self {
            Self::Input {
                broker, message, ..
            } => Self::Input {
                broker,
                message,
                source: Some(cause.into()),
            },
            Self::Output {
                broker,
                data_id,
                message,
                ..
            } => Self::Output {
                broker,
                data_id,
                message,
                source: Some(cause.into()),
            },
            Self::Processor { message, .. } => Self::Processor {
                message,
                source: Some(cause.into()),
            },
            other => other,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Input { .. } => Stage::Input,
            Self::Output { .. } => Stage::Output,
            Self::Processor { .. } => Stage::Processor,
            Self::InvalidDefinition(_) => Stage::Definition,
            Self::Storage(_) => Stage::Storage,
            Self::Io(_) => Stage::Input,
        }
    }

    /// Id of the record that failed to publish, if this is an output error.
    pub fn data_id(&self) -> Option<&str> {
        match self {
            Self::Output { data_id, .. } => Some(data_id),
            _ => None,
        }
    }
}
