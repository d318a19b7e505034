//! Error types for the setu-mqtt daemon
//!
//! # Error Recovery Strategies
//!
//! Different error types require different recovery approaches:
//!
//! ## Protocol Errors (Log and Drop)
//!
//! - **`InvalidMagicField`**, **`InvalidDataLength`**, **`InvalidTokenLength`**,
//!   **`InvalidChecksum`**, **`InvalidBlockSize`**, **`InvalidPadding`**: a
//!   received datagram failed framing or crypto validation. The packet is
//!   dropped; the device stays in its current stage and is retried on the
//!   next sender tick.
//!
//! ## Device-State Errors (Skip and Retry)
//!
//! - **`TimeShiftNotSet`**: a request was built before the device's hello
//!   reply established its clock offset. The sender skips the device for the
//!   current tick.
//! - **`TimeInFuture`**: a reply carried an uptime stamp ahead of the wall
//!   clock. The packet is dropped and the stored offset is left untouched.
//!
//! ## Cycle Errors (Log and Continue)
//!
//! - **`DeadlineExceeded`**: a poll cycle ran out of budget before every
//!   device reached its final stage. The next cycle proceeds normally.
//! - **`Cancelled`**: shutdown was requested while a cycle was in flight.
//!
//! ## Fatal Errors (Fix and Restart)
//!
//! - **`Config`**: the configuration file is invalid (bad token, bad
//!   address, unparseable YAML). The process exits non-zero.
//!
//! `Io` covers both fatal socket-bootstrap failures (the cycle is skipped and
//! retried one poll interval later) and transient send errors (logged, cycle
//! continues).

use thiserror::Error;

/// Errors that can occur in setu-mqtt
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid magic field")]
    InvalidMagicField,

    #[error("invalid data length")]
    InvalidDataLength,

    #[error("invalid token length")]
    InvalidTokenLength,

    #[error("invalid checksum")]
    InvalidChecksum,

    #[error("invalid block size")]
    InvalidBlockSize,

    #[error("invalid padding")]
    InvalidPadding,

    #[error("device time shift is not set")]
    TimeShiftNotSet,

    #[error("device time cannot be in the future")]
    TimeInFuture,

    #[error("poll deadline exceeded")]
    DeadlineExceeded,

    #[error("poll cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
