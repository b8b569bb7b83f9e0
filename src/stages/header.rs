use async_trait::async_trait;
use mqbridge_client::Header;

use super::{MessageStage, StageError};
use crate::model::message::BridgeMessage;

/// Appends a fixed set of headers to every message.
pub struct HeaderEnrichmentStage {
    headers: Vec<(String, String)>,
}

impl HeaderEnrichmentStage {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl MessageStage for HeaderEnrichmentStage {
    fn name(&self) -> &'static str {
        "header_enrichment"
    }

    async fn apply(&self, message: BridgeMessage) -> Result<BridgeMessage, StageError> {
        Ok(message.with_appended_headers(
            self.headers
                .iter()
                .map(|(name, value)| Header::new(name.clone(), value.clone())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::SourceOffset;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_appends_after_existing_headers() {
        let stage = HeaderEnrichmentStage::new(vec![
            ("env".to_string(), "dev".to_string()),
            ("bridge".to_string(), "mqbridge".to_string()),
        ]);
        let message = BridgeMessage::new(
            Bytes::from("p"),
            None,
            vec![Header::new("env", "prod")],
            SourceOffset::Mq {
                queue: "KAFKA.IN".to_string(),
                message_id: Bytes::from_static(b"id"),
            },
        );

        let out = stage.apply(message).await.unwrap();
        let names: Vec<&str> = out.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["env", "env", "bridge"]);
        assert_eq!(out.payload(), &Bytes::from("p"));
    }
}
