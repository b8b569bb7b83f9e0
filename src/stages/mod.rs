//! Optional processing applied to every message after translation.

use async_trait::async_trait;
use mqbridge_client::{Classify, ErrorClass};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::model::config::StageConfig;
use crate::model::message::BridgeMessage;

pub mod header;
pub mod schema;

pub use header::HeaderEnrichmentStage;
pub use schema::SchemaValidationStage;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to read schema {path}: {source}")]
    SchemaIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Payload is not JSON: {0}")]
    InvalidPayload(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl Classify for StageError {
    fn class(&self) -> ErrorClass {
        match self {
            StageError::SchemaIo { .. } | StageError::InvalidSchema(_) => ErrorClass::Fatal,
            StageError::InvalidPayload(_) | StageError::ValidationError(_) => ErrorClass::Poison,
        }
    }
}

#[async_trait]
pub trait MessageStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, message: BridgeMessage) -> Result<BridgeMessage, StageError>;
}

/// Stages run in registration order; the first failure stops the message.
#[derive(Default)]
pub struct StagePipeline {
    stages: Vec<Box<dyn MessageStage>>,
}

impl StagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &StageConfig) -> Result<Self, StageError> {
        let mut pipeline = Self::new();
        if !config.static_headers.is_empty() {
            pipeline.register(Box::new(HeaderEnrichmentStage::new(
                config.static_headers.clone(),
            )));
        }
        if let Some(path) = &config.payload_schema_path {
            pipeline.register(Box::new(SchemaValidationStage::from_file(path)?));
        }
        for stage in &pipeline.stages {
            info!("Registered message stage '{}'", stage.name());
        }
        Ok(pipeline)
    }

    pub fn register(&mut self, stage: Box<dyn MessageStage>) {
        self.stages.push(stage);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn apply(&self, message: BridgeMessage) -> Result<BridgeMessage, StageError> {
        let mut result = message;

        for stage in &self.stages {
            result = stage.apply(result).await?;
        }

        Ok(result)
    }
}
