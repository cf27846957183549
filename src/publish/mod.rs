//! Delivery capability: hands payloads to a pub/sub broker.
//!
//! [`Publisher`] is the seam the dispatcher talks to. [`MqttPublisher`] keeps a
//! connection to an MQTT broker, [`HttpPublisher`] posts to a broker's HTTP
//! publish endpoint and [`LogPublisher`] only logs, for dry runs.

mod http;
mod log;
mod mqtt;

pub use self::http::HttpPublisher;
pub use self::log::LogPublisher;
pub use self::mqtt::{MqttPublisher, MqttSettings, qos_level};

use anyhow::Result;
use bytes::Bytes;

/// Publishes a payload to a topic.
///
/// Shared by every dispatch task of every cycle, so implementations must be
/// safe for concurrent use. Timeouts are enforced by the caller.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Releases the underlying connection. Called once, after the last publish.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
