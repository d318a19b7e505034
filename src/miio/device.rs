//! Per-device mutable state and request building
//!
//! A [`Device`] tracks one configured miIO endpoint through a poll cycle:
//! its identity (id/address/token), the stage it has reached, the clock
//! offset learned from its hello reply, and the last JSON property object it
//! reported. All mutable fields live behind a single mutex; callers that need
//! a consistent view take a [`DeviceSnapshot`].

use crate::error::{Error, Result};
use crate::miio::model::patch_template;
use crate::miio::packet::Packet;
use crate::miio::timestamp::TimeStamp;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Progress of a device through one poll cycle
///
/// Stages are ordered and only ever advance within a cycle; the scheduler
/// resets them between cycles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceStage {
    #[default]
    Undiscovered,
    Found,
    Valid,
    Updated,
}

impl DeviceStage {
    /// Clamps out-of-range raw values to `Undiscovered`
    pub fn from_raw(value: i32) -> DeviceStage {
        match value {
            1 => DeviceStage::Found,
            2 => DeviceStage::Valid,
            3 => DeviceStage::Updated,
            _ => DeviceStage::Undiscovered,
        }
    }
}

impl fmt::Display for DeviceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStage::Undiscovered => "undiscovered",
            DeviceStage::Found => "found",
            DeviceStage::Valid => "valid",
            DeviceStage::Updated => "updated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceState {
    id: u32,
    address: Option<Ipv4Addr>,
    model: String,
    properties: String,
    time_shift: TimeStamp,
    request_id: u32,
    stage: DeviceStage,
    final_stage: DeviceStage,
    updated_at: TimeStamp,
    state_changed_at: TimeStamp,
    state_published_at: TimeStamp,
}

/// Consistent point-in-time copy of a device's mutable state
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub id: u32,
    pub address: Option<Ipv4Addr>,
    pub model: String,
    pub properties: String,
    pub time_shift: TimeStamp,
    pub stage: DeviceStage,
    pub final_stage: DeviceStage,
    pub updated_at: TimeStamp,
    pub state_changed_at: TimeStamp,
    pub state_published_at: TimeStamp,
}

/// One configured miIO device
pub struct Device {
    name: String,
    topic: String,
    token: [u8; 16],
    state: Mutex<DeviceState>,
}

impl Device {
    pub fn new(
        name: String,
        topic: String,
        token: [u8; 16],
        id: u32,
        address: Option<Ipv4Addr>,
    ) -> Device {
        Device {
            name,
            topic,
            token,
            state: Mutex::new(DeviceState {
                id,
                address,
                final_stage: DeviceStage::Updated,
                ..DeviceState::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn token(&self) -> [u8; 16] {
        self.token
    }

    pub fn id(&self) -> u32 {
        self.state.lock().id
    }

    pub fn set_id(&self, id: u32) {
        self.state.lock().id = id;
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.state.lock().address
    }

    pub fn set_address(&self, address: Ipv4Addr) {
        self.state.lock().address = Some(address);
    }

    pub fn model(&self) -> String {
        self.state.lock().model.clone()
    }

    pub fn set_model(&self, model: &str) {
        self.state.lock().model = model.to_string();
    }

    pub fn properties(&self) -> String {
        self.state.lock().properties.clone()
    }

    pub fn set_properties(&self, properties: &str) {
        self.state.lock().properties = properties.to_string();
    }

    pub fn stage(&self) -> DeviceStage {
        self.state.lock().stage
    }

    pub fn set_stage(&self, stage: DeviceStage) {
        self.state.lock().stage = stage;
    }

    pub fn final_stage(&self) -> DeviceStage {
        self.state.lock().final_stage
    }

    /// The stage at which this device is considered done for a cycle.
    /// `Updated` by default; identification-only callers use `Valid`.
    pub fn set_final_stage(&self, stage: DeviceStage) {
        self.state.lock().final_stage = stage;
    }

    pub fn in_stage(&self, stage: DeviceStage) -> bool {
        self.state.lock().stage >= stage
    }

    pub fn in_final_stage(&self) -> bool {
        let state = self.state.lock();
        state.stage >= state.final_stage
    }

    pub fn time_shift(&self) -> TimeStamp {
        self.state.lock().time_shift
    }

    /// Store `now - reply_stamp` as the device clock offset
    ///
    /// Rejects stamps from the future; the previous offset is kept.
    pub fn set_time_shift(&self, now: TimeStamp, reply_stamp: TimeStamp) -> Result<()> {
        if reply_stamp >= now {
            return Err(Error::TimeInFuture);
        }
        self.state.lock().time_shift = TimeStamp::from_secs(now.secs() - reply_stamp.secs());
        Ok(())
    }

    /// Build a request packet from a JSON template
    ///
    /// Allocates the next request id, substitutes it for the `#` run after
    /// `"id":`, stamps the packet with the device's own clock and encrypts it
    /// with the device token. Returns the plaintext packet (for logging)
    /// alongside the wire bytes.
    pub fn request(&self, template: &str) -> Result<(Packet, Vec<u8>)> {
        let now = TimeStamp::now();
        let (device_id, stamp, data) = {
            let mut state = self.state.lock();
            if state.time_shift.is_zero() || state.time_shift >= now {
                return Err(Error::TimeShiftNotSet);
            }
            let stamp = TimeStamp::from_secs(now.secs() - state.time_shift.secs());
            state.request_id = state.request_id.wrapping_add(1);
            let data = patch_template(template, "\"id\":", &state.request_id.to_string());
            (state.id, stamp, data)
        };
        let packet = Packet::new(device_id, stamp, data.into_bytes());
        let raw = packet.encode(&self.token)?;
        Ok((packet, raw))
    }

    pub fn updated_at(&self) -> TimeStamp {
        self.state.lock().updated_at
    }

    pub fn set_updated_now(&self) {
        self.state.lock().updated_at = TimeStamp::now();
    }

    /// Seconds since the last successful poll; zero when never polled
    pub fn updated_in(&self) -> TimeStamp {
        let updated_at = self.state.lock().updated_at;
        let now = TimeStamp::now();
        if updated_at.is_zero() || now <= updated_at {
            return TimeStamp::ZERO;
        }
        now.saturating_sub(updated_at)
    }

    pub fn set_state_changed_now(&self) {
        self.state.lock().state_changed_at = TimeStamp::now();
    }

    pub fn set_state_published_now(&self) {
        self.state.lock().state_published_at = TimeStamp::now();
    }

    /// True when the last observed state change has not been published yet
    pub fn state_change_unpublished(&self) -> bool {
        let state = self.state.lock();
        state.state_changed_at > state.state_published_at
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let state = self.state.lock();
        DeviceSnapshot {
            id: state.id,
            address: state.address,
            model: state.model.clone(),
            properties: state.properties.clone(),
            time_shift: state.time_shift,
            stage: state.stage,
            final_stage: state.final_stage,
            updated_at: state.updated_at,
            state_changed_at: state.state_changed_at,
            state_published_at: state.state_published_at,
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Shared map of configured devices, keyed by device id or IPv4-as-u32
///
/// The receive loop is the only writer (re-keying an address-only entry once
/// its hello reply discloses the true id); the sender iterates over
/// snapshots under a shared lock.
#[derive(Clone, Default)]
pub struct DeviceMap {
    inner: Arc<RwLock<HashMap<u32, Arc<Device>>>>,
}

impl DeviceMap {
    pub fn new() -> DeviceMap {
        DeviceMap::default()
    }

    pub fn insert(&self, key: u32, device: Arc<Device>) {
        self.inner.write().insert(key, device);
    }

    pub fn get(&self, key: u32) -> Option<Arc<Device>> {
        self.inner.read().get(&key).cloned()
    }

    pub fn contains(&self, key: u32) -> bool {
        self.inner.read().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn count<F: Fn(&Device) -> bool>(&self, check: F) -> usize {
        self.inner.read().values().filter(|d| check(d)).count()
    }

    pub fn set_stage_where<F: Fn(&Device) -> bool>(&self, stage: DeviceStage, check: F) {
        for device in self.inner.read().values() {
            if check(device) {
                device.set_stage(stage);
            }
        }
    }

    /// Atomically move a device from its address key to its id key
    ///
    /// Holds the exclusive lock for the whole move so no reader observes the
    /// map without the entry or with two entries for one device.
    pub fn rekey(&self, from: u32, to: u32) -> bool {
        let mut map = self.inner.write();
        match map.remove(&from) {
            Some(device) => {
                device.set_id(to);
                map.insert(to, device);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Device {
        Device::new(
            "air monitor".to_string(),
            "home/air".to_string(),
            [0u8; 16],
            0x0011_2233,
            None,
        )
    }

    #[test]
    fn test_stage_ordering() {
        assert!(DeviceStage::Undiscovered < DeviceStage::Found);
        assert!(DeviceStage::Found < DeviceStage::Valid);
        assert!(DeviceStage::Valid < DeviceStage::Updated);
    }

    #[test]
    fn test_stage_from_raw_clamps() {
        assert_eq!(DeviceStage::from_raw(0), DeviceStage::Undiscovered);
        assert_eq!(DeviceStage::from_raw(2), DeviceStage::Valid);
        assert_eq!(DeviceStage::from_raw(-1), DeviceStage::Undiscovered);
        assert_eq!(DeviceStage::from_raw(10), DeviceStage::Undiscovered);
    }

    #[test]
    fn test_in_stage() {
        let device = test_device();
        assert!(device.in_stage(DeviceStage::Undiscovered));
        assert!(!device.in_stage(DeviceStage::Found));
        device.set_stage(DeviceStage::Valid);
        assert!(device.in_stage(DeviceStage::Found));
        assert!(device.in_stage(DeviceStage::Valid));
        assert!(!device.in_stage(DeviceStage::Updated));
    }

    #[test]
    fn test_final_stage() {
        let device = test_device();
        device.set_stage(DeviceStage::Valid);
        assert!(!device.in_final_stage());
        device.set_final_stage(DeviceStage::Valid);
        assert!(device.in_final_stage());
        device.set_final_stage(DeviceStage::Updated);
        device.set_stage(DeviceStage::Updated);
        assert!(device.in_final_stage());
    }

    #[test]
    fn test_set_time_shift() {
        let device = test_device();
        device
            .set_time_shift(TimeStamp::from_secs(100), TimeStamp::from_secs(90))
            .unwrap();
        assert_eq!(device.time_shift(), TimeStamp::from_secs(10));

        // A stamp from the future is rejected and the offset is kept.
        let err = device
            .set_time_shift(TimeStamp::from_secs(100), TimeStamp::from_secs(100))
            .unwrap_err();
        assert!(matches!(err, Error::TimeInFuture));
        assert_eq!(device.time_shift(), TimeStamp::from_secs(10));
    }

    #[test]
    fn test_request_without_time_shift() {
        let device = test_device();
        assert!(matches!(
            device.request(r#"{"method":"miIO.info","params":[],"id":#}"#),
            Err(Error::TimeShiftNotSet)
        ));
    }

    #[test]
    fn test_request_substitutes_id_and_stamps() {
        let device = Device::new(
            "plug".to_string(),
            "home/plug".to_string(),
            [0x11; 16],
            0x0011_2233,
            None,
        );
        // Device reports an uptime of 1000s, so its clock offset is
        // wall-now minus 1000 and request stamps land near 1000.
        let now = TimeStamp::now();
        device
            .set_time_shift(now, TimeStamp::from_secs(1000))
            .unwrap();

        let (packet, raw) = device
            .request(r#"{"method":"miIO.info","params":[],"id":#}"#)
            .unwrap();
        assert_eq!(packet.device_id, 0x0011_2233);
        assert_eq!(packet.data, br#"{"method":"miIO.info","params":[],"id":1}"#);
        assert!(TimeStamp::diff(packet.stamp, TimeStamp::from_secs(1000)).secs() <= 1);
        assert!(!raw.is_empty());

        // Request ids are monotonic.
        let (packet, _) = device
            .request(r#"{"method":"get_prop","params":["power"],"id":#}"#)
            .unwrap();
        assert_eq!(packet.data, br#"{"method":"get_prop","params":["power"],"id":2}"#);
    }

    #[test]
    fn test_updated_in() {
        let device = test_device();
        assert_eq!(device.updated_in(), TimeStamp::ZERO);
        device.set_updated_now();
        assert!(device.updated_in().secs() <= 1);
    }

    #[test]
    fn test_state_change_unpublished() {
        let device = test_device();
        assert!(!device.state_change_unpublished());
        device.set_state_changed_now();
        assert!(device.state_change_unpublished());
        device.set_state_published_now();
        assert!(!device.state_change_unpublished());
    }

    #[test]
    fn test_map_rekey_leaves_single_entry() {
        let devices = DeviceMap::new();
        let device = Arc::new(test_device());
        let address_key = u32::from(std::net::Ipv4Addr::new(192, 168, 1, 40));
        devices.insert(address_key, Arc::clone(&device));

        assert!(devices.rekey(address_key, 0x047b_d1b5));
        assert_eq!(devices.len(), 1);
        assert!(!devices.contains(address_key));
        let rekeyed = devices.get(0x047b_d1b5).unwrap();
        assert_eq!(rekeyed.id(), 0x047b_d1b5);

        // Re-keying a missing entry is a no-op.
        assert!(!devices.rekey(address_key, 1));
    }

    #[test]
    fn test_map_count_and_stage_sweep() {
        let devices = DeviceMap::new();
        for (key, stage) in [
            (1u32, DeviceStage::Undiscovered),
            (2, DeviceStage::Valid),
            (3, DeviceStage::Updated),
        ] {
            let device = Arc::new(test_device());
            device.set_stage(stage);
            devices.insert(key, device);
        }
        assert_eq!(devices.count(|d| !d.in_final_stage()), 2);

        devices.set_stage_where(DeviceStage::Valid, |d| d.in_stage(DeviceStage::Updated));
        assert_eq!(devices.get(3).unwrap().stage(), DeviceStage::Valid);
        assert_eq!(devices.count(|d| !d.in_final_stage()), 3);
    }
}
