//! Device link abstraction
//!
//! The transport the session drives: it opens a connection to a controller,
//! accepts a handful of control requests and pushes batches of tagged
//! frames to a registered consumer from its own delivery thread.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::calibration::Calibration;
use crate::report::RawFrame;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("HID API error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("No Wii Remote found")]
    NotFound,

    #[error("Device {0} is already open")]
    AddressInUse(BdAddr),

    #[error("A report consumer is already registered")]
    ConsumerAlreadySet,

    #[error("Device did not answer")]
    NoResponse,

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Link closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives every batch of frames the link delivers
pub type ReportConsumer = Arc<dyn Fn(&[RawFrame]) + Send + Sync>;

/// Which report streams the device should send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReportMode {
    pub buttons: bool,
    pub accelerometer: bool,
}

impl ReportMode {
    pub const BUTTONS: ReportMode = ReportMode {
        buttons: true,
        accelerometer: false,
    };

    pub const BUTTONS_ACCELEROMETER: ReportMode = ReportMode {
        buttons: true,
        accelerometer: true,
    };
}

/// Transport used by a [`Session`](crate::session::Session).
///
/// `set_report_consumer` hands the link a callback that it must invoke on
/// its own thread, once per batch, until the handle is closed.
pub trait DeviceLink: Send + Sync + 'static {
    type Handle: Send + 'static;

    fn open(&self, address: &BdAddr) -> Result<Self::Handle, LinkError>;

    fn close(&self, handle: Self::Handle) -> Result<(), LinkError>;

    fn set_report_consumer(
        &self,
        handle: &Self::Handle,
        consumer: ReportConsumer,
    ) -> Result<(), LinkError>;

    fn enable_message_interface(&self, handle: &Self::Handle) -> Result<(), LinkError>;

    fn set_report_mode(&self, handle: &Self::Handle, mode: ReportMode) -> Result<(), LinkError>;

    fn query_calibration(&self, handle: &Self::Handle) -> Result<Calibration, LinkError>;
}

/// Bluetooth device address.
///
/// The all-zero address means "whichever device is available".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const ANY: BdAddr = BdAddr([0; 6]);

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid Bluetooth address: {0:?}")]
pub struct AddrParseError(String);

impl FromStr for BdAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddrParseError(s.to_string());
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);

        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }

        if parts.next().is_some() {
            return Err(err());
        }

        Ok(BdAddr(bytes))
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BdAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
