//! Accelerometer calibration
//!
//! Zero offsets are read once when a session connects. If the device does
//! not answer, a fixed default is used so the accelerometer stays usable,
//! only uncalibrated.

use serde::Serialize;
use tracing::{debug, warn};

use crate::link::{DeviceLink, LinkError};

/// Zero offset used when the device cannot be queried
pub const DEFAULT_ZERO: i16 = 124;

/// EEPROM block holding the accelerometer calibration
pub const CALIBRATION_ADDRESS: u32 = 0x0016;
pub const CALIBRATION_LEN: u16 = 7;

/// Per-axis accelerometer calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Calibration {
    /// Raw reading at rest, per axis (x, y, z)
    pub zero: [i16; 3],
    /// Raw reading at one g, per axis, when the device reported it
    pub one: Option<[i16; 3]>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            zero: [DEFAULT_ZERO; 3],
            one: None,
        }
    }
}

impl Calibration {
    pub fn new(zero: [i16; 3]) -> Self {
        Self { zero, one: None }
    }

    /// Query the device, falling back to the default on any failure
    pub fn fetch<L: DeviceLink>(link: &L, handle: &L::Handle) -> Self {
        match link.query_calibration(handle) {
            Ok(calibration) => {
                debug!("Accelerometer calibration: {:?}", calibration);
                calibration
            }
            Err(e) => {
                warn!(
                    "Unable to retrieve accelerometer calibration ({}), using default zero {}",
                    e, DEFAULT_ZERO
                );
                Self::default()
            }
        }
    }

    /// Decode the calibration block read from [`CALIBRATION_ADDRESS`].
    ///
    /// Layout: zero x, y, z at bytes 0-2, one-g x, y, z at bytes 4-6.
    pub fn parse(block: &[u8]) -> Result<Self, LinkError> {
        if block.len() < CALIBRATION_LEN as usize {
            return Err(LinkError::MalformedReply(format!(
                "calibration block too short: {} bytes",
                block.len()
            )));
        }

        let zero = [block[0] as i16, block[1] as i16, block[2] as i16];
        let one = [block[4] as i16, block[5] as i16, block[6] as i16];

        Ok(Self {
            zero,
            one: Some(one),
        })
    }

    /// Subtract the zero offsets from a raw sample
    pub fn apply(&self, x: u8, y: u8, z: u8) -> (i32, i32, i32) {
        (
            x as i32 - self.zero[0] as i32,
            y as i32 - self.zero[1] as i32,
            z as i32 - self.zero[2] as i32,
        )
    }
}
