//! miIO protocol engine: packet codec, device state and model registry

pub mod device;
pub mod model;
pub mod packet;
pub mod timestamp;

pub use device::{Device, DeviceMap, DeviceSnapshot, DeviceStage};
pub use model::{Model, Models, Reply};
pub use packet::Packet;
pub use timestamp::TimeStamp;
