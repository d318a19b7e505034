//! Polling orchestrator: discovery, identification and property updates
//!
//! One call to [`Poller::poll_devices`] runs a full cycle under the
//! configured poll timeout:
//!
//! 1. A sender thread ticks every `timeout / 5` (first tick at `timeout / 50`)
//!    and, per device still short of its final stage, broadcasts a hello
//!    (at most one per tick), or unicasts a miIO.info / get_prop request.
//! 2. The receive loop drains the transport channel, routes 32-byte frames
//!    to hello processing and everything else to reply processing, and
//!    counts devices down as they reach their final stage.
//! 3. The cycle ends when every device is done, the deadline fires, or
//!    shutdown is requested; the sender is joined before returning.
//!
//! Nothing here is fatal to the process: malformed packets, unknown senders
//! and per-send failures are logged and the cycle carries on.

use crate::error::{Error, Result};
use crate::miio::device::{Device, DeviceMap, DeviceStage};
use crate::miio::model::{parse_reply, Models, Reply};
use crate::miio::packet::{self, Packet};
use crate::net::addr;
use crate::net::transport::{UdpPacket, UdpTransport};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Hello frames are exactly one bare header
const HELLO_FRAME_SIZE: usize = 32;

/// First sender tick fires almost immediately, at `timeout / 50`
const FIRST_TICK_DIVISOR: u32 = 50;

/// Subsequent sender ticks fire at `timeout / 5`
const TICK_DIVISOR: u32 = 5;

pub struct Poller {
    devices: DeviceMap,
    models: Models,
    aliases: HashMap<String, Value>,
    miio_port: u16,
    poll_timeout: Duration,
    updates: Sender<Arc<Device>>,
    unknown_replies: AtomicU32,
}

impl Poller {
    pub fn new(
        devices: DeviceMap,
        models: Models,
        aliases: HashMap<String, Value>,
        miio_port: u16,
        poll_timeout: Duration,
        updates: Sender<Arc<Device>>,
    ) -> Poller {
        Poller {
            devices,
            models,
            aliases,
            miio_port,
            poll_timeout,
            updates,
            unknown_replies: AtomicU32::new(0),
        }
    }

    /// Replies received from devices matching no configured entry
    pub fn unknown_reply_count(&self) -> u32 {
        self.unknown_replies.load(Ordering::Relaxed)
    }

    /// Run one poll cycle over the given transport
    ///
    /// Returns `Ok` when every device that needed an update reached its
    /// final stage, `DeadlineExceeded` when the poll timeout fired first and
    /// `Cancelled` when shutdown interrupted the cycle.
    pub fn poll_devices(&self, transport: &Arc<UdpTransport>, cancel: &Receiver<()>) -> Result<()> {
        let mut left = self.devices.count(|d| !d.in_final_stage());
        if left == 0 {
            info!("no device to update");
            return Ok(());
        }
        let deadline = Instant::now() + self.poll_timeout;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let sender = {
            let transport = Arc::clone(transport);
            let devices = self.devices.clone();
            let models = self.models.clone();
            let miio_port = self.miio_port;
            let poll_timeout = self.poll_timeout;
            thread::Builder::new()
                .name("miio-sender".to_string())
                .spawn(move || send_requests(transport, devices, models, miio_port, poll_timeout, stop_rx))?
        };

        debug!("start updating devices");
        let mut cancelled = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("updating devices done");
                break;
            }
            select! {
                recv(transport.packets()) -> received => {
                    let packet = match received {
                        Ok(packet) => packet,
                        Err(_) => break,
                    };
                    if packet.data.len() == HELLO_FRAME_SIZE {
                        self.process_hello_reply(&packet);
                        continue;
                    }
                    if self.process_reply(&packet) {
                        left -= 1;
                        if left == 0 {
                            debug!("all devices updated");
                            break;
                        }
                    }
                }
                recv(cancel) -> _ => {
                    cancelled = true;
                    break;
                }
                default(remaining) => {
                    debug!("updating devices done");
                    break;
                }
            }
        }

        drop(stop_tx);
        if sender.join().is_err() {
            error!("sender thread panicked");
        }
        if left == 0 {
            Ok(())
        } else if cancelled {
            Err(Error::Cancelled)
        } else {
            Err(Error::DeadlineExceeded)
        }
    }

    /// Handle a 32-byte hello reply: learn the device clock and address
    ///
    /// Address-only entries are re-keyed to the device id disclosed by the
    /// reply; entries found by id get their address refreshed instead.
    fn process_hello_reply(&self, packet: &UdpPacket) {
        let device_id = match packet::get_device_id(&packet.data) {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    "invalid packet received from {}: {} ({})",
                    packet.address,
                    hex::encode(&packet.data),
                    err
                );
                return;
            }
        };
        let reply = match packet::decode(&packet.data, &[]) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(
                    "invalid packet received from {}: {} ({})",
                    packet.address,
                    hex::encode(&packet.data),
                    err
                );
                return;
            }
        };

        let source_ip = *packet.address.ip();
        let address_key = addr::ipv4_to_u32(source_ip);
        let (device, found_by_address) = match self.devices.get(device_id) {
            Some(device) => (device, false),
            None => match self.devices.get(address_key) {
                Some(device) => (device, true),
                None => {
                    self.unknown_replies.fetch_add(1, Ordering::Relaxed);
                    debug!("hello reply from unknown device {:08x} ({})", device_id, source_ip);
                    return;
                }
            },
        };
        if device.in_stage(DeviceStage::Found) {
            debug!("hello reply from already discovered {}", device.name());
            return;
        }
        debug!("hello reply from {} (stage={}): {}", device.name(), device.stage(), reply);

        if let Err(err) = device.set_time_shift(packet.stamp, reply.stamp) {
            warn!("{}: {}", device.name(), err);
            return;
        }
        if found_by_address {
            self.devices.rekey(address_key, device_id);
        } else {
            device.set_address(source_ip);
        }
        device.set_stage(DeviceStage::Found);
        info!("discovered {}: {:08x} ({})", device.name(), device.id(), source_ip);
    }

    /// Handle an encrypted reply; true when the device reached its final
    /// stage in this call
    fn process_reply(&self, packet: &UdpPacket) -> bool {
        let device_id = match packet::get_device_id(&packet.data) {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    "invalid packet received from {}: {} ({})",
                    packet.address,
                    hex::encode(&packet.data),
                    err
                );
                return false;
            }
        };
        let device = match self.devices.get(device_id) {
            Some(device) => device,
            None => {
                self.unknown_replies.fetch_add(1, Ordering::Relaxed);
                debug!("reply from unknown device {:08x} ({})", device_id, packet.address);
                return false;
            }
        };
        if device.in_final_stage() {
            debug!("reply from already updated {}", device.name());
            return false;
        }
        let reply = match packet::decode(&packet.data, &device.token()) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(
                    "unable to decode packet from {}: {} ({})",
                    device.name(),
                    hex::encode(&packet.data),
                    err
                );
                return false;
            }
        };
        debug!("reply from {} (stage={}): {}", device.name(), device.stage(), reply);

        match parse_reply(&reply.data) {
            Reply::MiioInfo { model } => {
                if device.in_stage(DeviceStage::Valid) {
                    debug!("reply from already identified {}", device.name());
                    return false;
                }
                device.set_model(&model);
                device.set_stage(DeviceStage::Valid);
                info!("identified {} model: {}", device.name(), model);
                device.in_final_stage()
            }
            Reply::GetProp { props } => {
                let new_properties = match self.build_device_properties(&device, props) {
                    Ok(properties) => properties,
                    Err(err) => {
                        warn!("{}", err);
                        return false;
                    }
                };
                let old_properties = device.properties();
                if new_properties != old_properties {
                    device.set_properties(&new_properties);
                    device.set_state_changed_now();
                    info!("updated {}: {}", device.name(), new_properties);
                } else {
                    info!("{} state unchanged", device.name());
                }
                if let Err(err) = device.set_time_shift(packet.stamp, reply.stamp) {
                    warn!("{}: {}", device.name(), err);
                }
                device.set_updated_now();
                device.set_stage(DeviceStage::Updated);
                if device.state_change_unpublished() && self.updates.send(Arc::clone(&device)).is_err() {
                    warn!("updates channel closed, {} not queued for publishing", device.name());
                }
                true
            }
            Reply::Unrecognized => {
                warn!("unable to parse reply from {}: {}", device.name(), reply);
                false
            }
        }
    }

    /// Assemble the JSON property object for a get_prop reply
    ///
    /// The reply array is aligned positionally with the model's parameter
    /// list; values pass through the alias table. Keys serialize in sorted
    /// order for reproducible payloads.
    fn build_device_properties(&self, device: &Device, props: Vec<Value>) -> Result<String> {
        let model = device.model();
        let params = self.models.params(&model);
        if props.len() != params.len() {
            return Err(Error::Other(format!(
                "invalid number of properties ({} of {}) for {} ({})",
                props.len(),
                params.len(),
                device.name(),
                model
            )));
        }
        let mut data = serde_json::Map::new();
        for (key, value) in params.into_iter().zip(props) {
            data.insert(key, fix_property(&self.aliases, value));
        }
        Ok(serde_json::to_string(&Value::Object(data))?)
    }
}

/// Apply the alias table to a single property value
fn fix_property(aliases: &HashMap<String, Value>, value: Value) -> Value {
    if let Value::String(text) = &value {
        if let Some(replacement) = aliases.get(text) {
            return replacement.clone();
        }
    }
    value
}

/// Sender loop: one pass over the devices per tick
///
/// Exits when the stop channel fires (cycle over), or when a tick produced no
/// packet at all, which means no remaining device can make progress.
fn send_requests(
    transport: Arc<UdpTransport>,
    devices: DeviceMap,
    models: Models,
    miio_port: u16,
    poll_timeout: Duration,
    stop: Receiver<()>,
) {
    let hello = match Packet::hello().encode(&[]) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("unable to encode hello packet: {}", err);
            return;
        }
    };
    let mut next = poll_timeout / FIRST_TICK_DIVISOR;
    debug!("start sending requests");
    loop {
        match stop.recv_timeout(next) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("stop sending requests");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let mut hello_sent = false;
        let mut any_sent = false;
        for device in devices.snapshot() {
            if device.in_final_stage() {
                continue;
            }
            match device.stage() {
                DeviceStage::Undiscovered => {
                    if hello_sent {
                        continue;
                    }
                    debug!("sending hello packet to {}", transport.broadcast_address());
                    if let Err(err) = transport.send_to(&hello, transport.broadcast_address()) {
                        warn!("{}", err);
                        continue;
                    }
                    hello_sent = true;
                    any_sent = true;
                }
                DeviceStage::Found => {
                    let template = models.miio_info("*");
                    any_sent |= send_request(&transport, &device, &template, miio_port);
                }
                DeviceStage::Valid => {
                    let template = models.get_prop(&device.model());
                    any_sent |= send_request(&transport, &device, &template, miio_port);
                }
                DeviceStage::Updated => {}
            }
        }
        if !any_sent {
            debug!("no devices to send requests left");
            return;
        }
        next = poll_timeout / TICK_DIVISOR;
    }
}

/// Build, encrypt and send one unicast request; false when skipped or failed
fn send_request(
    transport: &UdpTransport,
    device: &Device,
    template: &str,
    miio_port: u16,
) -> bool {
    if template.is_empty() {
        return false;
    }
    let address = match device.address() {
        Some(ip) => SocketAddrV4::new(ip, miio_port),
        None => {
            warn!("no address known for {}", device.name());
            return false;
        }
    };
    let (request, raw) = match device.request(template) {
        Ok(built) => built,
        Err(err) => {
            warn!("{}: {}", device.name(), err);
            return false;
        }
    };
    debug!("sending {} to {} ({})", request, device.name(), address);
    if let Err(err) = transport.send_to(&raw, address) {
        warn!("{}", err);
        return false;
    }
    true
}
