use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, Transport};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Publisher;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// How long `close` lets the event loop flush the disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
}

impl MqttSettings {
    pub fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(self.client_id.as_str(), self.host.as_str(), self.port);
        opts.set_keep_alive(KEEP_ALIVE);
        if let Some(username) = &self.username {
            let password = self.password.as_deref().unwrap_or_default();
            opts.set_credentials(username.as_str(), password);
        }
        if self.tls {
            opts.set_transport(Transport::tls_with_default_config());
        }
        opts
    }
}

/// Maps a configured QoS number to its MQTT level.
pub fn qos_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        n => Err(anyhow!("invalid qos level {n}")),
    }
}

/// Publishes over a persistent MQTT connection.
///
/// The connection is driven by a background task that reconnects on its own.
/// A publish succeeds once the client has queued the message; while the broker
/// is unreachable the queue fills and publishes block until the caller's
/// timeout.
pub struct MqttPublisher {
    client: AsyncClient,
    broker: String,
    default_qos: QoS,
    topic_qos: HashMap<String, QoS>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    /// Starts connecting in the background. Must be called inside a tokio runtime.
    pub fn connect(settings: &MqttSettings) -> Self {
        let (client, event_loop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
        let broker = format!("{}:{}", settings.host, settings.port);
        let handle = tokio::spawn(drive(event_loop, broker.clone()));
        Self::from_parts(client, broker, Some(handle))
    }

    fn from_parts(
        client: AsyncClient,
        broker: String,
        event_loop: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            client,
            broker,
            default_qos: QoS::AtLeastOnce,
            topic_qos: HashMap::new(),
            event_loop: Mutex::new(event_loop),
        }
    }

    /// Per-topic delivery levels. Topics not listed use at-least-once.
    pub fn with_topic_qos(mut self, topic_qos: HashMap<String, QoS>) -> Self {
        self.topic_qos = topic_qos;
        self
    }

    pub fn qos_for(&self, topic: &str) -> QoS {
        self.topic_qos.get(topic).copied().unwrap_or(self.default_qos)
    }
}

async fn drive(mut event_loop: EventLoop, broker: String) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                info!(%broker, code = ?ack.code, "Connected to MQTT broker");
            }
            Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                debug!(pkid = ack.pkid, "Publish acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!(%broker, "Disconnected from MQTT broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%broker, error = %e, "MQTT connection lost");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let qos = self.qos_for(topic);
        self.client
            .publish_bytes(topic, qos, false, payload)
            .await
            .with_context(|| format!("failed to queue publish to {topic}"))?;

        debug!(topic, ?qos, "Queued for broker");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let handle = self
            .event_loop
            .lock()
            .map_err(|_| anyhow!("event loop handle poisoned"))?
            .take();

        if let Err(e) = self.client.try_disconnect() {
            warn!(broker = %self.broker, error = %e, "Failed to request disconnect");
        }

        if let Some(mut handle) = handle {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        info!(broker = %self.broker, "Publisher closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MqttSettings {
        MqttSettings {
            host: "broker.example.com".to_string(),
            port: 8883,
            client_id: "notifier-1".to_string(),
            username: Some("notifier".to_string()),
            password: Some("secret".to_string()),
            tls: false,
        }
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_level(3).is_err());
    }

    #[test]
    fn test_options_from_settings() {
        let opts = settings().options();

        assert_eq!(opts.broker_address(), ("broker.example.com".to_string(), 8883));
        assert_eq!(opts.client_id(), "notifier-1");
        assert_eq!(opts.keep_alive(), KEEP_ALIVE);
    }

    #[tokio::test]
    async fn test_topic_qos_overrides_default() {
        let (client, _event_loop) = AsyncClient::new(settings().options(), 10);
        let publisher = MqttPublisher::from_parts(client, "test".to_string(), None)
            .with_topic_qos(HashMap::from([("t0".to_string(), QoS::AtMostOnce)]));

        assert_eq!(publisher.qos_for("t0"), QoS::AtMostOnce);
        assert_eq!(publisher.qos_for("t1"), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_publish_queues_while_disconnected() {
        let (client, _event_loop) = AsyncClient::new(settings().options(), 10);
        let publisher = MqttPublisher::from_parts(client, "test".to_string(), None);

        publisher
            .publish("hsr/01/king-james", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        publisher.close().await.unwrap();
    }
}
