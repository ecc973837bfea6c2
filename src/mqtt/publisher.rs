/// MQTT publishing of sensor readings
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::models::SensorStatus;

const WAIT_AFTER_CONNECTION_ERROR: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 10;

/// Topic names derived from the configured stem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub temperature: String,
    pub humidity: String,
}

impl Topics {
    pub fn new(stem: &str) -> Self {
        let stem = stem.trim_end_matches('/');
        Topics {
            temperature: format!("{}/temperature", stem),
            humidity: format!("{}/humidity", stem),
        }
    }
}

/// Encode a measurement as a JSON number.
pub fn encode_value(value: f64) -> String {
    serde_json::Value::from(value).to_string()
}

/// Temperature and humidity if the last reading is younger than `max_age`.
pub fn fresh_values(status: &SensorStatus, max_age: Duration) -> Option<(f64, f64)> {
    if status.staleness() < max_age.as_secs_f64() {
        status
            .reading
            .map(|reading| (reading.temperature_c, reading.humidity_pct))
    } else {
        None
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    topics: Topics,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Create the client and start driving its event loop in the background.
    pub fn connect(broker: &BrokerConfig, topics: Topics) -> Self {
        let (client_id, clean_session) = match &broker.client_id {
            Some(id) => (id.clone(), false),
            None => (format!("dht2mqtt-{}", std::process::id()), true),
        };

        let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        options.set_keep_alive(broker.keep_alive);
        options.set_clean_session(clean_session);

        info!("Connecting to MQTT broker {}:{}", broker.host, broker.port);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self::with_client(client, topics, tokio::spawn(drive_event_loop(event_loop)))
    }

    fn with_client(client: AsyncClient, topics: Topics, event_loop: JoinHandle<()>) -> Self {
        MqttPublisher {
            client,
            topics,
            event_loop,
        }
    }

    /// Publish the reading if it is fresher than `max_age`; returns whether it was.
    ///
    /// Values are retained so late subscribers get the last measurement. Never
    /// waits on the broker: while it is unreachable and the request queue is
    /// full, the reading is dropped with an error instead of stalling the cycle.
    pub fn publish_if_fresh(&self, status: &SensorStatus, max_age: Duration) -> Result<bool> {
        let Some((temperature, humidity)) = fresh_values(status, max_age) else {
            return Ok(false);
        };

        self.client.try_publish(
            self.topics.temperature.as_str(),
            QoS::AtMostOnce,
            true,
            encode_value(temperature),
        )?;
        self.client.try_publish(
            self.topics.humidity.as_str(),
            QoS::AtMostOnce,
            true,
            encode_value(humidity),
        )?;
        Ok(true)
    }

    pub async fn disconnect(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
        self.event_loop.abort();
    }
}

async fn drive_event_loop(mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker: {:?}", ack.code);
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                error!("MQTT connection error: {}", e);
                sleep(WAIT_AFTER_CONNECTION_ERROR).await;
            }
        }
    }
}
