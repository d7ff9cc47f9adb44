//! Per-camera object counts over MQTT.
//!
//! Counts are published retained as `<camera>/<class>/count`, only when they
//! change. Cameras with vehicle checking also get a Home Assistant discovery
//! config so the vehicle count shows up as a sensor. Availability goes to
//! `aicam/status` with an `offline` last will.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use serde::Serialize;

use crate::detect::Detection;
use crate::sanitize_name;

pub const AVAILABILITY_TOPIC: &str = "aicam/status";
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_COUNTED_CLASSES: [&str; 4] = ["vehicle", "dog", "person", "package"];
const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

pub trait CountSink: Send + Sync {
    fn publish_count(&self, camera: &str, class: &str, count: usize) -> Result<()>;

    /// Advertise the camera's vehicle count sensor.
    fn announce_vehicle_sensor(&self, camera: &str) -> Result<()>;
}

/// Publish counts of `classes` that differ from `last`, updating `last`.
pub fn publish_changed_counts(
    sink: &dyn CountSink,
    camera: &str,
    classes: &[String],
    detections: &[Detection],
    last: &mut BTreeMap<String, usize>,
) -> usize {
    let mut published = 0;
    for class in classes {
        let count = detections
            .iter()
            .filter(|d| !d.is_ignored() && &d.class == class)
            .count();
        if last.get(class) == Some(&count) {
            continue;
        }
        log::info!("publishing count {}/{}/count={}", camera, class, count);
        match sink.publish_count(camera, class, count) {
            Ok(()) => {
                last.insert(class.clone(), count);
                published += 1;
            }
            Err(err) => log::warn!("failed to publish {}/{} count: {:#}", camera, class, err),
        }
    }
    published
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub discovery_prefix: String,
}

/// Parse `host:port` or `mqtt://host:port`; the port defaults to 1883.
pub fn parse_broker(addr: &str) -> Result<(String, u16)> {
    let trimmed = addr.trim();
    let rest = match trimmed.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((other, _)) => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        None => trimmed,
    };
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().context("invalid MQTT port")?;
            Ok((host.to_string(), port))
        }
        None if !rest.is_empty() => Ok((rest.to_string(), 1883)),
        None => Err(anyhow!("empty MQTT broker address")),
    }
}

#[derive(Serialize)]
struct HaSensorConfig {
    name: String,
    state_topic: String,
    state_class: &'static str,
    unique_id: String,
    availability_topic: &'static str,
}

pub struct MqttCountSink {
    client: Client,
    discovery_prefix: String,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttCountSink {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        let will = rumqttc::v5::mqttbytes::v5::LastWill::new(
            AVAILABILITY_TOPIC,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        );
        options.set_last_will(will);

        let (client, connection) = Client::new(options, 64);
        let handle = spawn_event_loop(connection);
        client
            .publish(AVAILABILITY_TOPIC, QoS::AtLeastOnce, true, PAYLOAD_ONLINE.as_bytes().to_vec())
            .context("publish availability")?;
        log::info!("mqtt client for {}:{} started", settings.host, settings.port);
        Ok(Self {
            client,
            discovery_prefix: settings.discovery_prefix.clone(),
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    /// Mark offline and stop the event loop.
    pub fn disconnect(&self) -> Result<()> {
        self.client
            .publish(AVAILABILITY_TOPIC, QoS::AtLeastOnce, true, PAYLOAD_OFFLINE.as_bytes().to_vec())
            .context("publish offline")?;
        self.client.disconnect().context("mqtt disconnect")?;
        let handle = self
            .connection_handle
            .lock()
            .map_err(|_| anyhow!("mqtt handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn spawn_event_loop(mut connection: Connection) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    log::warn!("MQTT connection error: {}", e);
                    break;
                }
            }
        }
    })
}

pub fn count_topic(camera: &str, class: &str) -> String {
    format!("{}/{}/count", sanitize_name(camera), class)
}

impl CountSink for MqttCountSink {
    fn publish_count(&self, camera: &str, class: &str, count: usize) -> Result<()> {
        self.client
            .publish(count_topic(camera, class), QoS::AtLeastOnce, true, count.to_string().into_bytes())
            .context("mqtt publish")?;
        Ok(())
    }

    fn announce_vehicle_sensor(&self, camera: &str) -> Result<()> {
        let id = sanitize_name(camera);
        let config = HaSensorConfig {
            name: format!("{} Vehicle Count", camera),
            state_topic: count_topic(camera, "vehicle"),
            state_class: "measurement",
            unique_id: format!("{}-vehicle", id),
            availability_topic: AVAILABILITY_TOPIC,
        };
        let topic = format!("{}/sensor/{}-vehicle/config", self.discovery_prefix, id);
        let payload = serde_json::to_vec(&config)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .context("publish discovery")?;
        Ok(())
    }
}

/// Records counts in memory; for tests and runs without a broker.
#[derive(Default)]
pub struct MemoryCountSink {
    published: Mutex<Vec<(String, usize)>>,
}

impl MemoryCountSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(topic, count)` in publish order.
    pub fn published(&self) -> Vec<(String, usize)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl CountSink for MemoryCountSink {
    fn publish_count(&self, camera: &str, class: &str, count: usize) -> Result<()> {
        self.published
            .lock()
            .map_err(|_| anyhow!("count sink lock poisoned"))?
            .push((count_topic(camera, class), count));
        Ok(())
    }

    fn announce_vehicle_sensor(&self, _camera: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::RawDetection;
    use crate::BoundingBox;

    fn det(class: &str) -> Detection {
        Detection::from_raw(
            RawDetection::new(class, 0.9, BoundingBox::new(0.1, 0.1, 0.1, 0.1)),
            "front entry",
        )
    }

    #[test]
    fn only_changed_counts_are_published() {
        let sink = MemoryCountSink::new();
        let classes: Vec<String> = DEFAULT_COUNTED_CLASSES.iter().map(|c| c.to_string()).collect();
        let mut last = BTreeMap::new();

        let mut ignored = det("person");
        ignored.mark_ignored("road");
        let dets = vec![det("dog"), det("dog"), ignored];
        assert_eq!(publish_changed_counts(&sink, "front entry", &classes, &dets, &mut last), 4);
        assert_eq!(publish_changed_counts(&sink, "front entry", &classes, &dets, &mut last), 0);
        assert_eq!(publish_changed_counts(&sink, "front entry", &classes, &[], &mut last), 1);

        let published = sink.published();
        assert!(published.contains(&("front_entry/dog/count".to_string(), 2)));
        assert!(published.contains(&("front_entry/person/count".to_string(), 0)));
        assert_eq!(published.last(), Some(&("front_entry/dog/count".to_string(), 0)));
    }

    #[test]
    fn broker_addresses() {
        assert_eq!(parse_broker("mqtt.home").unwrap(), ("mqtt.home".to_string(), 1883));
        assert_eq!(parse_broker("mqtt://mqtt.home:1884").unwrap(), ("mqtt.home".to_string(), 1884));
        assert!(parse_broker("ws://mqtt.home").is_err());
        assert!(parse_broker("").is_err());
    }

    #[test]
    fn discovery_config_serializes() {
        let config = HaSensorConfig {
            name: "deck Vehicle Count".into(),
            state_topic: count_topic("deck", "vehicle"),
            state_class: "measurement",
            unique_id: "deck-vehicle".into(),
            availability_topic: AVAILABILITY_TOPIC,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["state_topic"], "deck/vehicle/count");
        assert_eq!(json["availability_topic"], "aicam/status");
    }
}
