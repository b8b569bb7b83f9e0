use async_trait::async_trait;
use jsonschema::{Draft, Validator};
use serde_json::Value;
use std::path::Path;

use super::{MessageStage, StageError};
use crate::model::message::BridgeMessage;

/// Rejects payloads that are not JSON documents valid against a Draft 7 schema.
pub struct SchemaValidationStage {
    validator: Validator,
}

impl SchemaValidationStage {
    pub fn new(schema: &Value) -> Result<Self, StageError> {
        let validator = jsonschema::options()
            .with_draft(Draft::Draft7)
            .build(schema)
            .map_err(|e| StageError::InvalidSchema(e.to_string()))?;
        Ok(Self { validator })
    }

    pub fn from_file(path: &Path) -> Result<Self, StageError> {
        let contents = std::fs::read_to_string(path).map_err(|source| StageError::SchemaIo {
            path: path.to_path_buf(),
            source,
        })?;
        let schema: Value = serde_json::from_str(&contents)
            .map_err(|e| StageError::InvalidSchema(format!("{}: {e}", path.display())))?;
        Self::new(&schema)
    }

    pub fn validate(&self, payload: &[u8]) -> Result<(), StageError> {
        let document: Value = serde_json::from_slice(payload)
            .map_err(|e| StageError::InvalidPayload(e.to_string()))?;

        let error_messages: Vec<String> = self
            .validator
            .iter_errors(&document)
            .map(|e| e.to_string())
            .collect();
        if !error_messages.is_empty() {
            return Err(StageError::ValidationError(error_messages.join(", ")));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStage for SchemaValidationStage {
    fn name(&self) -> &'static str {
        "schema_validation"
    }

    async fn apply(&self, message: BridgeMessage) -> Result<BridgeMessage, StageError> {
        self.validate(message.payload())?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transaction_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "transaction_id": {"type": "string"},
                "amount": {"type": "number", "minimum": 0}
            },
            "required": ["transaction_id", "amount"]
        })
    }

    #[test]
    fn test_valid_payload() {
        let stage = SchemaValidationStage::new(&transaction_schema()).unwrap();
        assert!(stage
            .validate(br#"{"transaction_id": "TXN-1", "amount": 12.5}"#)
            .is_ok());
    }

    #[test]
    fn test_violations_are_reported() {
        let stage = SchemaValidationStage::new(&transaction_schema()).unwrap();

        let err = stage.validate(br#"{"amount": -1}"#).unwrap_err();
        assert!(matches!(err, StageError::ValidationError(_)));

        let err = stage.validate(b"not json").unwrap_err();
        assert!(matches!(err, StageError::InvalidPayload(_)));
    }

    #[test]
    fn test_invalid_schema() {
        let err = SchemaValidationStage::new(&json!({"type": 12})).err().unwrap();
        assert!(matches!(err, StageError::InvalidSchema(_)));
    }
}
