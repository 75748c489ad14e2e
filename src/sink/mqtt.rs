//! MQTT transport for image records

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::error::SinkError;
use crate::sink::topic::{ImageRecord, LocalPublisher, TopicPublisher};

/// Large enough for an uncompressed 1080p RGBA frame
const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Pause between reconnect attempts while the broker is unreachable
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

fn options(config: &MqttConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    options
}

/// Thread polling one rumqttc connection. Connection errors never end it;
/// the next poll reconnects. Only a requested disconnect does.
struct Driver {
    closing: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Driver {
    fn spawn<F>(name: &str, mut connection: Connection, mut on_event: F) -> Result<Self, SinkError>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let closing = Arc::new(AtomicBool::new(false));
        let flag = closing.clone();
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || drive(&mut connection, &flag, &mut on_event))
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        Ok(Self {
            closing,
            handle: Some(handle),
        })
    }

    /// Ask the driver to stop after `client` disconnects, then wait for it.
    fn shutdown(&mut self, client: &Client) -> Result<(), SinkError> {
        self.closing.store(true, Ordering::Release);
        let result = client
            .try_disconnect()
            .map_err(|e| SinkError::Transport(e.to_string()));
        if let Some(handle) = self.handle.take() {
            if result.is_ok() {
                let _ = handle.join();
            } else {
                // A full request queue never drains the disconnect; leave the
                // thread to exit on its next connection error.
                warn!("MQTT disconnect not queued, not waiting for the connection thread");
            }
        }
        result
    }

    #[cfg(test)]
    fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

fn drive<F: FnMut(Event)>(connection: &mut Connection, closing: &AtomicBool, on_event: &mut F) {
    let mut connected = false;
    for event in connection.iter() {
        match event {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(event) => {
                if matches!(event, Event::Incoming(Packet::ConnAck(_))) {
                    info!("MQTT connected");
                    connected = true;
                }
                on_event(event);
            }
            Err(e) => {
                if closing.load(Ordering::Acquire) {
                    debug!("MQTT connection closed: {}", e);
                    break;
                }
                if connected {
                    warn!("MQTT connection lost, reconnecting: {}", e);
                    connected = false;
                } else {
                    debug!("MQTT broker unreachable: {}", e);
                }
                std::thread::sleep(RECONNECT_BACKOFF);
            }
        }
    }
}

/// Publishes the wire form of each record, at most once, without waiting on
/// the broker.
pub struct MqttPublisher {
    topic: String,
    client: Client,
    driver: Driver,
}

impl MqttPublisher {
    pub fn connect(config: &MqttConfig, topic: &str) -> Result<Self, SinkError> {
        let (client, connection) = Client::new(options(config, &config.client_id), 10);
        let driver = Driver::spawn("relay-mqtt", connection, |_| {})?;

        info!(
            "MQTT publisher for {} via {}:{}",
            topic, config.host, config.port
        );
        Ok(Self {
            topic: topic.to_string(),
            client,
            driver,
        })
    }
}

impl TopicPublisher for MqttPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn publish(&mut self, record: ImageRecord) -> Result<(), SinkError> {
        let payload = record.encode_wire()?;
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| SinkError::Publish {
                target: self.topic.clone(),
                reason: e.to_string(),
            })
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.driver.shutdown(&self.client)
    }
}

/// Receives image records from a broker topic and republishes them on the
/// in-process bus. Resubscribes after every reconnect.
pub struct MqttSubscriber {
    client: Client,
    driver: Driver,
}

impl MqttSubscriber {
    pub fn spawn(config: &MqttConfig, mut forward: LocalPublisher) -> Result<Self, SinkError> {
        let topic = forward.topic().to_string();
        let client_id = format!("{}-sub", config.client_id);
        let (client, connection) = Client::new(options(config, &client_id), 10);

        let subscriber = client.clone();
        let driver = Driver::spawn("relay-mqtt-sub", connection, move |event| match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                if let Err(e) = subscriber.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                    warn!(topic = %topic, error = %e, "MQTT subscribe failed");
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                match ImageRecord::decode_wire(publish.payload) {
                    Ok(record) => {
                        if let Err(e) = forward.publish(record) {
                            debug!(topic = %topic, error = %e, "Dropped received record");
                        }
                    }
                    Err(e) => warn!(stage = "subscribe", topic = %topic, error = %e, "Undecodable record"),
                }
            }
            _ => {}
        })?;

        info!("MQTT subscriber via {}:{}", config.host, config.port);
        Ok(Self { client, driver })
    }

    pub fn close(&mut self) -> Result<(), SinkError> {
        self.driver.shutdown(&self.client)
    }
}
