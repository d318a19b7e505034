//! MQTT publisher for device property updates
//!
//! Thin wrapper over the synchronous `rumqttc` client. Messages are retained
//! and published at QoS 0: the broker always holds the latest known state of
//! every device topic, and a missed sample is replaced seconds later by the
//! next poll cycle anyway.
//!
//! The client connects lazily (the first publish after startup or after a
//! broker outage triggers the reconnect) and a background thread drains the
//! connection event loop, logging connectivity transitions.

use crate::error::{Error, Result};
use crate::miio::device::Device;
use log::{debug, info, warn};
use rumqttc::{Client, Connection, Event, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Keep-alive also bounds how long a graceful disconnect can take
const KEEP_ALIVE: Duration = Duration::from_secs(5);

pub struct Publisher {
    client: Client,
    broker_url: String,
    shutdown: Arc<AtomicBool>,
    event_thread: Option<JoinHandle<()>>,
}

impl Publisher {
    /// Create the client and start its connection event thread
    ///
    /// `push_timeout` is the retry pause after a failed connection attempt.
    pub fn new(broker_url: &str, push_timeout: Duration) -> Result<Publisher> {
        let (host, port) = parse_broker_url(broker_url)?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let client_id = format!("setu-mqtt-{:06x}", nanos & 0xff_ffff);

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        let (client, connection) = Client::new(options, 16);
        let shutdown = Arc::new(AtomicBool::new(false));
        let event_thread = {
            let broker_url = broker_url.to_string();
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("mqtt-events".to_string())
                .spawn(move || event_loop(connection, &broker_url, shutdown, push_timeout))?
        };

        Ok(Publisher {
            client,
            broker_url: broker_url.to_string(),
            shutdown,
            event_thread: Some(event_thread),
        })
    }

    /// Publish a device's property object as a retained QoS-0 message
    pub fn publish(&self, device: &Device) -> Result<()> {
        let properties = device.properties();
        self.client
            .publish(device.topic(), QoS::AtMostOnce, true, properties.clone())?;
        device.set_state_published_now();
        debug!("publish to {}: {}", device.topic(), properties);
        Ok(())
    }

    /// Disconnect from the broker and stop the event thread
    pub fn disconnect(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Err(err) = self.client.disconnect() {
            debug!("disconnect from {}: {}", self.broker_url, err);
        }
        if let Some(handle) = self.event_thread.take() {
            if handle.join().is_err() {
                warn!("MQTT event thread panicked");
            }
        }
        debug!("disconnected from {}", self.broker_url);
    }
}

fn event_loop(
    mut connection: Connection,
    broker_url: &str,
    shutdown: Arc<AtomicBool>,
    retry_pause: Duration,
) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("connected to {}", broker_url);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(err) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                warn!("disconnected from {}: {}", broker_url, err);
                thread::sleep(retry_pause);
            }
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
    debug!("MQTT event loop stopped");
}

/// Split a broker URL into host and port
///
/// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` and bare
/// hostnames (defaulting to port 1883).
fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);
    if stripped.is_empty() {
        return Err(Error::Config(format!("invalid MQTT broker URL: {:?}", url)));
    }
    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(Error::Config(format!("invalid MQTT broker URL: {:?}", url)));
            }
            let port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid MQTT broker port: {:?}", url)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), DEFAULT_MQTT_PORT)),
    }
}
