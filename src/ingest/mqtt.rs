use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;

use super::Feed;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// [`Feed`] backed by a single MQTT topic subscription.
///
/// The subscription is (re)issued on every `ConnAck`, so a broker restart or a
/// dropped TCP connection is invisible to the caller apart from the gap in
/// messages.
pub struct MqttFeed {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
}

impl MqttFeed {
    pub fn new(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, 16);
        Self {
            client,
            eventloop,
            topic: config.topic.clone(),
        }
    }
}

impl Feed for MqttFeed {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %self.topic, "Connected to MQTT broker");
                    if let Err(e) = self.client.subscribe(&self.topic, QoS::AtLeastOnce).await {
                        warn!(topic = %self.topic, error = %e, "Failed to subscribe to MQTT topic");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT message received");
                    return Some(publish.payload.to_vec());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error; reconnecting");
                    time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}
