use anyhow::Result;
use bytes::Bytes;
use tracing::info;

use super::Publisher;

/// Publisher that logs each payload instead of sending it.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait::async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        info!(
            topic,
            payload = %String::from_utf8_lossy(&payload),
            "Dry run publish"
        );
        Ok(())
    }
}
