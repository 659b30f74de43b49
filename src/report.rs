//! Report decoding
//!
//! Turns the tagged frames delivered by a [`DeviceLink`](crate::link::DeviceLink)
//! into typed [`Report`] values. Decoding never fails as a whole: a frame
//! with an unknown tag or a malformed payload becomes [`Report::Unknown`]
//! and its siblings in the same batch are decoded normally.

use std::fmt;

use serde::Serialize;
use tracing::trace;

/// Frame tags assigned by the link when it demultiplexes an input report.
pub mod tag {
    pub const STATUS: u8 = 0x00;
    pub const BUTTONS: u8 = 0x01;
    pub const ACCELEROMETER: u8 = 0x02;
    pub const IR: u8 = 0x03;
    pub const EXTENSION: u8 = 0x04;
    pub const UNKNOWN: u8 = 0xFF;
}

/// Core button bits that the device actually reports
pub const BUTTON_MASK: u16 = 0x1F9F;

/// Payload sizes
pub const BUTTONS_LEN: usize = 2;
pub const ACCELEROMETER_LEN: usize = 3;

/// One demultiplexed piece of an input report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub tag: u8,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(tag: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            data: data.into(),
        }
    }

    pub fn buttons(bits: u16) -> Self {
        Self::new(tag::BUTTONS, bits.to_be_bytes())
    }

    pub fn accelerometer(x: u8, y: u8, z: u8) -> Self {
        Self::new(tag::ACCELEROMETER, [x, y, z])
    }
}

/// Wii Remote core button state (16-bit flag set)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Buttons(u16);

impl Buttons {
    pub const NONE: Buttons = Buttons(0);
    pub const TWO: Buttons = Buttons(0x0001);
    pub const ONE: Buttons = Buttons(0x0002);
    pub const B: Buttons = Buttons(0x0004);
    pub const A: Buttons = Buttons(0x0008);
    pub const MINUS: Buttons = Buttons(0x0010);
    pub const HOME: Buttons = Buttons(0x0080);
    pub const LEFT: Buttons = Buttons(0x0100);
    pub const RIGHT: Buttons = Buttons(0x0200);
    pub const DOWN: Buttons = Buttons(0x0400);
    pub const UP: Buttons = Buttons(0x0800);
    pub const PLUS: Buttons = Buttons(0x1000);

    const NAMES: [(Buttons, &'static str); 11] = [
        (Buttons::TWO, "2"),
        (Buttons::ONE, "1"),
        (Buttons::B, "B"),
        (Buttons::A, "A"),
        (Buttons::MINUS, "-"),
        (Buttons::HOME, "HOME"),
        (Buttons::LEFT, "LEFT"),
        (Buttons::RIGHT, "RIGHT"),
        (Buttons::DOWN, "DOWN"),
        (Buttons::UP, "UP"),
        (Buttons::PLUS, "+"),
    ];

    pub const fn from_bits(bits: u16) -> Self {
        Buttons(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if any bit of `mask` is set
    pub const fn intersects(self, mask: Buttons) -> bool {
        self.0 & mask.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits that differ between two snapshots
    pub const fn changed(self, other: Buttons) -> Buttons {
        Buttons(self.0 ^ other.0)
    }

    /// Names of the pressed buttons, in bit order
    pub fn pressed_names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(mask, _)| self.intersects(*mask))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for Buttons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl std::ops::BitOr for Buttons {
    type Output = Buttons;

    fn bitor(self, rhs: Buttons) -> Buttons {
        Buttons(self.0 | rhs.0)
    }
}

/// A decoded input report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    Button { buttons: Buttons },
    Accelerometer { x: u8, y: u8, z: u8 },
    Unknown { tag: u8 },
}

impl Report {
    /// Decode a single frame
    pub fn decode(frame: &RawFrame) -> Self {
        match (frame.tag, frame.data.as_slice()) {
            (tag::BUTTONS, &[hi, lo]) => Report::Button {
                buttons: Buttons(u16::from_be_bytes([hi, lo]) & BUTTON_MASK),
            },
            (tag::ACCELEROMETER, &[x, y, z]) => Report::Accelerometer { x, y, z },
            (tag, data) => {
                trace!("Undecodable frame: tag={:#04x}, len={}", tag, data.len());
                Report::Unknown { tag }
            }
        }
    }
}

/// Decode a batch of frames in arrival order
pub fn decode_batch(frames: &[RawFrame]) -> Vec<Report> {
    frames.iter().map(Report::decode).collect()
}
