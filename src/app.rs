//! Application orchestration for the setu-mqtt daemon
//!
//! Wires the pieces together: builds the device map from configuration,
//! installs signal handlers, runs the aligned poll scheduler and feeds the
//! MQTT publisher thread from the poller's updates channel.
//!
//! Each cycle gets a fresh UDP transport; a transport bootstrap failure skips
//! the cycle and is retried one poll interval later. Shutdown (SIGHUP /
//! SIGINT / SIGTERM) cancels the running cycle and the scheduler sleep, the
//! updates channel is drained into MQTT, and the process exits cleanly.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::miio::device::{Device, DeviceMap, DeviceStage};
use crate::miio::timestamp::TimeStamp;
use crate::mqtt::Publisher;
use crate::net::addr;
use crate::net::poller::Poller;
use crate::net::transport::UdpTransport;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct App {
    config: Config,
    devices: DeviceMap,
    shutdown: Arc<AtomicBool>,
    cancel: Receiver<()>,
}

impl App {
    pub fn new(config: Config) -> Result<App> {
        let devices = init_devices(&config)?;
        info!("{} devices configured", devices.len());

        let shutdown = Arc::new(AtomicBool::new(false));
        let cancel = spawn_signal_thread(Arc::clone(&shutdown))?;

        Ok(App {
            config,
            devices,
            shutdown,
            cancel,
        })
    }

    /// Run the scheduler loop until a termination signal arrives
    pub fn run(&self) -> Result<()> {
        let updates_capacity = (2 * self.devices.len()).max(1);
        let (updates_tx, updates_rx) = bounded::<Arc<Device>>(updates_capacity);

        let poller = Poller::new(
            self.devices.clone(),
            self.config.models.clone(),
            self.config.properties.clone(),
            self.config.miio_port,
            self.config.poll_timeout,
            updates_tx,
        );

        let publisher = Publisher::new(&self.config.mqtt.broker_url, self.config.push_timeout)?;
        let publisher_thread = thread::Builder::new()
            .name("mqtt-publisher".to_string())
            .spawn(move || publish_updates(updates_rx, publisher))?;

        info!(
            "polling every {:?} (timeout {:?})",
            self.config.poll_interval, self.config.poll_timeout
        );
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let delay = next_poll_delay(
                SystemTime::now(),
                self.config.poll_interval,
                self.config.poll_ahead_time,
            );
            match self.cancel.recv_timeout(delay) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            self.reset_stages();
            let transport = match UdpTransport::start(self.config.miio_port, self.devices.len()) {
                Ok(transport) => Arc::new(transport),
                Err(err) => {
                    warn!("unable to start UDP transport: {}", err);
                    continue;
                }
            };
            match poller.poll_devices(&transport, &self.cancel) {
                Ok(()) => debug!("all devices were updated successfully"),
                Err(err) => warn!("unable to update all devices: {}", err),
            }
            transport.stop();
        }

        // Dropping the poller closes the updates channel; the publisher
        // drains what is queued, disconnects and exits.
        drop(poller);
        if publisher_thread.join().is_err() {
            error!("publisher thread panicked");
        }
        info!("setu-mqtt stopped");
        Ok(())
    }

    /// Between-cycle stage policy
    ///
    /// Devices not heard from for 2 × PollInterval are demoted all the way to
    /// `Undiscovered` (forcing rediscovery); freshly updated devices drop to
    /// `Valid` so their properties are re-read without re-identification.
    fn reset_stages(&self) {
        let outdated = TimeStamp::from_secs((2 * self.config.poll_interval.as_secs()) as u32);
        self.devices
            .set_stage_where(DeviceStage::Undiscovered, |device| {
                if !device.in_stage(DeviceStage::Found) {
                    return false;
                }
                let updated_in = device.updated_in();
                if updated_in > outdated {
                    info!("outdated {} (updated {} ago)", device.name(), updated_in);
                    return true;
                }
                false
            });
        self.devices
            .set_stage_where(DeviceStage::Valid, |device| {
                device.in_stage(DeviceStage::Updated)
            });
    }
}

/// Build the device map from configuration
///
/// A preset id is the preferred key; address-only entries are keyed by their
/// IPv4 address as u32 until a hello reply discloses the real id. Entries
/// with neither, and key collisions, are skipped with a warning.
fn init_devices(config: &Config) -> Result<DeviceMap> {
    let devices = DeviceMap::new();
    for (name, device_config) in &config.devices {
        let token = device_config.token_bytes()?;
        let address = device_config.ipv4()?;
        let key = if device_config.id > 0 {
            device_config.id
        } else if let Some(ip) = address {
            addr::ipv4_to_u32(ip)
        } else {
            warn!("invalid device configuration: {}", name);
            continue;
        };
        if let Some(existing) = devices.get(key) {
            warn!("duplicate device: {} ({:08x}) >>> {}", name, key, existing.name());
            continue;
        }
        devices.insert(
            key,
            Arc::new(Device::new(
                name.clone(),
                device_config.topic.clone(),
                token,
                device_config.id,
                address,
            )),
        );
    }
    Ok(devices)
}

/// Install SIGHUP/SIGINT/SIGTERM handling
///
/// The returned channel disconnects on the first signal, waking every
/// `recv`/`recv_timeout` in the daemon at once.
fn spawn_signal_thread(shutdown: Arc<AtomicBool>) -> Result<Receiver<()>> {
    let (cancel_tx, cancel_rx) = bounded::<()>(0);
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM]).map_err(Error::from)?;
    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                warn!("{} signal received", signal_name(signal));
                shutdown.store(true, Ordering::Relaxed);
            }
            drop(cancel_tx);
        })?;
    Ok(cancel_rx)
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGHUP => "SIGHUP",
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        _ => "unexpected",
    }
}

/// Publisher loop: runs until the updates channel closes, then drains it
fn publish_updates(updates: Receiver<Arc<Device>>, publisher: Publisher) {
    while let Ok(device) = updates.recv() {
        if let Err(err) = publisher.publish(&device) {
            warn!("unable to publish to MQTT broker: {}", err);
        }
    }
    publisher.disconnect();
    debug!("stop processing mqtt messages");
}

/// Time until the next poll cycle should start
///
/// Cycles align to multiples of the poll interval, shifted `ahead` earlier so
/// results land just before the round tick. A fire time already in the past
/// rolls over to the next interval.
fn next_poll_delay(now: SystemTime, interval: Duration, ahead: Duration) -> Duration {
    let now_ms = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let interval_ms = interval.as_millis().max(1);
    let ahead_ms = ahead.as_millis();
    let mut next_ms = now_ms.div_ceil(interval_ms) * interval_ms;
    if next_ms.saturating_sub(ahead_ms) <= now_ms {
        next_ms += interval_ms;
    }
    Duration::from_millis(next_ms.saturating_sub(ahead_ms).saturating_sub(now_ms) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn at_unix_ms(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn test_next_poll_delay_aligns_to_interval() {
        // 12.345s with a 5s interval: next aligned tick is 15s, fire 1ms early.
        let delay = next_poll_delay(
            at_unix_ms(12_345),
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        assert_eq!(delay, Duration::from_millis(15_000 - 1 - 12_345));
    }

    #[test]
    fn test_next_poll_delay_rolls_past_ticks_over() {
        // Exactly on a tick: firing "ahead" of it would be in the past, so
        // the next interval is used.
        let delay = next_poll_delay(
            at_unix_ms(15_000),
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        assert_eq!(delay, Duration::from_millis(20_000 - 1 - 15_000));
    }

    #[test]
    fn test_next_poll_delay_without_ahead_time() {
        let delay = next_poll_delay(at_unix_ms(15_000), Duration::from_secs(5), Duration::ZERO);
        assert_eq!(delay, Duration::from_secs(5));

        let delay = next_poll_delay(at_unix_ms(15_001), Duration::from_secs(5), Duration::ZERO);
        assert_eq!(delay, Duration::from_millis(4_999));
    }

    fn config_with_devices(yaml: &str) -> Config {
        Config::parse(yaml).unwrap()
    }

    #[test]
    fn test_init_devices_prefers_preset_id() {
        let config = config_with_devices(
            r#"
Devices:
  Plug:
    ID: 120575413
    Address: 192.168.1.41
    Topic: home/plug
    Token: 00112233445566778899aabbccddeeff
  Monitor:
    Address: 192.168.1.40
    Topic: home/airmon
    Token: 9c3b2d1da5beceee2808a3d3653b485d
"#,
        );
        let devices = init_devices(&config).unwrap();
        assert_eq!(devices.len(), 2);
        // Preset id wins over address for the key.
        assert!(devices.get(120_575_413).is_some());
        assert!(devices
            .get(addr::ipv4_to_u32(Ipv4Addr::new(192, 168, 1, 40)))
            .is_some());
        assert!(devices
            .get(addr::ipv4_to_u32(Ipv4Addr::new(192, 168, 1, 41)))
            .is_none());
    }

    #[test]
    fn test_init_devices_skips_unkeyable_and_duplicate_entries() {
        let config = config_with_devices(
            r#"
Devices:
  No Key:
    Topic: home/nokey
    Token: 00112233445566778899aabbccddeeff
  First:
    ID: 7
    Topic: home/first
    Token: 00112233445566778899aabbccddeeff
  Second:
    ID: 7
    Topic: home/second
    Token: 9c3b2d1da5beceee2808a3d3653b485d
"#,
        );
        let devices = init_devices(&config).unwrap();
        // "No Key" is skipped, and only one of the colliding entries survives.
        assert_eq!(devices.len(), 1);
        assert!(devices.get(7).is_some());
    }

    #[test]
    fn test_reset_stages_policy() {
        let config = config_with_devices(
            r#"
PollInterval: 5s
Devices:
  Plug:
    ID: 7
    Topic: home/plug
    Token: 00112233445566778899aabbccddeeff
"#,
        );
        let devices = init_devices(&config).unwrap();
        let device = devices.get(7).unwrap();
        let app = App {
            config,
            devices: devices.clone(),
            shutdown: Arc::new(AtomicBool::new(false)),
            cancel: bounded::<()>(0).1,
        };

        // Freshly updated device drops to Valid for the next cycle.
        device.set_stage(DeviceStage::Updated);
        device.set_updated_now();
        app.reset_stages();
        assert_eq!(device.stage(), DeviceStage::Valid);

        // A never-found device is left alone.
        device.set_stage(DeviceStage::Undiscovered);
        app.reset_stages();
        assert_eq!(device.stage(), DeviceStage::Undiscovered);

        // Without a recent update the device is sent back to rediscovery
        // once 2 x PollInterval have passed. updated_at == 0 reads as "never
        // polled", which does not trip the threshold.
        device.set_stage(DeviceStage::Valid);
        app.reset_stages();
        assert_eq!(device.stage(), DeviceStage::Valid);
    }
}
