//! Accelerometer helpers
//!
//! Conversions on top of calibrated samples: G-force scaling, a simple tilt
//! estimate and the integer roll integrator used by the `roll` command.

use nalgebra::Vector3;
use serde::Serialize;

use crate::calibration::Calibration;

/// Calibrated accelerometer sample (raw minus zero offset)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccelSample {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl AccelSample {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Convert to G-force units.
    ///
    /// Needs the one-g readings; returns `None` when the calibration only
    /// has zero offsets or a degenerate scale.
    pub fn to_g(&self, calibration: &Calibration) -> Option<Vector3<f32>> {
        let one = calibration.one?;
        let scale = |axis: usize| {
            let span = one[axis] as f32 - calibration.zero[axis] as f32;
            (span > 0.0).then_some(span)
        };

        Some(Vector3::new(
            self.x as f32 / scale(0)?,
            self.y as f32 / scale(1)?,
            self.z as f32 / scale(2)?,
        ))
    }
}

/// Roll and pitch in radians from a gravity vector
pub fn tilt(g: &Vector3<f32>) -> (f32, f32) {
    let roll = g.x.atan2(g.z);
    let pitch = g.y.atan2((g.x * g.x + g.z * g.z).sqrt());
    (roll, pitch)
}

/// Change in roll, in arbitrary units, between two x/z samples
pub fn delta_roll(x: i32, z: i32, dx: i32, dz: i32) -> i64 {
    x as i64 * dz as i64 - z as i64 * dx as i64
}

/// Integrates roll while the trigger button is held.
///
/// Pressing or releasing the button resets the accumulated roll.
#[derive(Debug, Clone, Default)]
pub struct RollTracker {
    engaged: bool,
    prev_x: i32,
    prev_z: i32,
    roll: i64,
}

impl RollTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_engaged(&mut self, engaged: bool) {
        self.engaged = engaged;
        self.roll = 0;
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    pub fn roll(&self) -> i64 {
        self.roll
    }

    /// Feed a sample; returns the new roll while engaged
    pub fn update(&mut self, sample: AccelSample) -> Option<i64> {
        let result = if self.engaged {
            self.roll += delta_roll(
                sample.x,
                sample.z,
                self.prev_x - sample.x,
                self.prev_z - sample.z,
            );
            Some(self.roll)
        } else {
            None
        };

        self.prev_x = sample.x;
        self.prev_z = sample.z;
        result
    }
}
