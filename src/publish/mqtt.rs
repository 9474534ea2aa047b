//! MQTT transport for the message bus

use crate::config::BusConfig;
use crate::error::BusError;
use crate::publish::bus::{BusMessage, MessageBus};
use crate::BoxFuture;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// MQTT client publishing with QoS 1
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Create the client and spawn its event loop
    ///
    /// The event loop (re)subscribes to `subscriptions` on every connection
    /// acknowledgement and forwards incoming publishes to `inbound`. It keeps
    /// reconnecting until `shutdown` flips.
    pub fn connect(
        config: &BusConfig,
        subscriptions: Vec<String>,
        inbound: mpsc::Sender<BusMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        info!(
            "Connecting to MQTT broker at {}:{}",
            config.host, config.port
        );

        let handle = tokio::spawn(run_event_loop(
            client.clone(),
            eventloop,
            subscriptions,
            inbound,
            shutdown,
        ));
        (Self { client }, handle)
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
    }
}

async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    subscriptions: Vec<String>,
    inbound: mpsc::Sender<BusMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    for topic in &subscriptions {
                        // the request channel is drained by this very loop, so never await here
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            error!("Failed to subscribe to {}: {}", topic, e);
                        } else {
                            debug!("Subscribed to {}", topic);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = BusMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    };
                    if inbound.send(message).await.is_err() {
                        debug!("Inbound receiver dropped, stopping MQTT event loop");
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {}; retrying in {:?}", e, RECONNECT_DELAY);
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("MQTT event loop stopping");
                    return;
                }
            }
        }
    }
}

impl MessageBus for MqttBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
        retain: bool,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        // a full request queue means the broker is unreachable; drop rather than wait
        let result = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|e| BusError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        Box::pin(std::future::ready(result))
    }
}
