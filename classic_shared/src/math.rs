//! Position and orientation types.
//!
//! This module intentionally stays small and deterministic.
//! The wire carries positions as 5-bit fixed point (`value * 32`) in an `i16`
//! and angles as a byte where 256 units make a full turn.

use serde::{Deserialize, Serialize};

/// Fixed-point scale used for positions on the wire.
pub const FIXED_POINT_SCALE: f32 = 32.0;

/// A position in block units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Converts to wire fixed point, truncating toward zero.
    pub fn to_fixed(self) -> [i16; 3] {
        [to_fixed(self.x), to_fixed(self.y), to_fixed(self.z)]
    }

    pub fn from_fixed(fixed: [i16; 3]) -> Self {
        Self::new(
            from_fixed(fixed[0]),
            from_fixed(fixed[1]),
            from_fixed(fixed[2]),
        )
    }
}

/// Yaw and pitch in degrees, kept in `[0, 360)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Orientation {
    yaw: f32,
    pitch: f32,
}

impl Orientation {
    pub fn new(yaw: f32, pitch: f32) -> Self {
        Self {
            yaw: normalize_degrees(yaw),
            pitch: normalize_degrees(pitch),
        }
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    /// Returns `(yaw, pitch)` as wire angle bytes.
    pub fn to_bytes(self) -> (u8, u8) {
        (angle_to_byte(self.yaw), angle_to_byte(self.pitch))
    }

    pub fn from_bytes(yaw: u8, pitch: u8) -> Self {
        Self::new(byte_to_angle(yaw), byte_to_angle(pitch))
    }
}

/// Wraps an angle in degrees into `[0, 360)`.
pub fn normalize_degrees(degrees: f32) -> f32 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs.
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Converts degrees to a wire angle byte.
pub fn angle_to_byte(degrees: f32) -> u8 {
    (normalize_degrees(degrees) * 256.0 / 360.0) as u8
}

pub fn byte_to_angle(byte: u8) -> f32 {
    byte as f32 * 360.0 / 256.0
}

/// Block units to wire fixed point. Out-of-range values saturate.
pub fn to_fixed(value: f32) -> i16 {
    (value * FIXED_POINT_SCALE) as i16
}

pub fn from_fixed(value: i16) -> f32 {
    value as f32 / FIXED_POINT_SCALE
}
