//! Geometry primitives shared by the scene model and the wire protocols
//!
//! Angles are in degrees, counter-clockwise, with 0° pointing along the
//! positive x axis. Rotations are about the vertical (z) axis.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// Cartesian position in metres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: 0.0 }
    }

    pub fn with_z(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length of the vector
    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Azimuth of the vector in the horizontal plane
    pub fn azimuth(&self) -> Orientation {
        Orientation::new(self.y.atan2(self.x).to_degrees())
    }

    /// Rotate about the vertical axis
    pub fn rotate(&self, angle: Orientation) -> Self {
        let (sin, cos) = angle.azimuth.to_radians().sin_cos();
        Self {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
            z: self.z,
        }
    }

    pub fn to_array(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::with_z(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::with_z(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Neg for Position {
    type Output = Position;

    fn neg(self) -> Position {
        Position::with_z(-self.x, -self.y, -self.z)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Horizontal orientation
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub azimuth: f32,
}

impl Orientation {
    pub fn new(azimuth: f32) -> Self {
        Self { azimuth }
    }

    /// Same orientation with the azimuth folded into `(-180, 180]`
    pub fn normalized(&self) -> Self {
        let mut azimuth = self.azimuth % 360.0;
        if azimuth > 180.0 {
            azimuth -= 360.0;
        } else if azimuth <= -180.0 {
            azimuth += 360.0;
        }
        Self { azimuth }
    }

    /// Unit quaternion `[x, y, z, w]` for a rotation about the z axis
    pub fn to_quaternion(&self) -> [f32; 4] {
        let half = self.azimuth.to_radians() / 2.0;
        [0.0, 0.0, half.sin(), half.cos()]
    }

    /// Azimuth of an arbitrary quaternion, projected onto the horizontal plane
    pub fn from_quaternion(q: [f32; 4]) -> Self {
        let [x, y, z, w] = q;
        let siny_cosp = 2.0 * (w * z + x * y);
        let cosy_cosp = 1.0 - 2.0 * (y * y + z * z);
        Self::new(siny_cosp.atan2(cosy_cosp).to_degrees())
    }
}

impl Add for Orientation {
    type Output = Orientation;

    fn add(self, rhs: Orientation) -> Orientation {
        Orientation::new(self.azimuth + rhs.azimuth)
    }
}

impl Sub for Orientation {
    type Output = Orientation;

    fn sub(self, rhs: Orientation) -> Orientation {
        Orientation::new(self.azimuth - rhs.azimuth)
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.azimuth)
    }
}

/// A position plus an orientation
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DirectionalPoint {
    pub position: Position,
    pub orientation: Orientation,
}

impl DirectionalPoint {
    pub fn new(position: Position, orientation: Orientation) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// Apply `offset` in the local frame of `self`
    ///
    /// Used to put a tracker correction on top of the reference pose.
    pub fn compose(&self, offset: &DirectionalPoint) -> DirectionalPoint {
        DirectionalPoint {
            position: self.position + offset.position.rotate(self.orientation),
            orientation: self.orientation + offset.orientation,
        }
    }
}

/// Orientation at `from` that faces `to`
///
/// Returns `current` when both points coincide.
pub fn look_at(from: Position, to: Position, current: Orientation) -> Orientation {
    let delta = to - from;
    if delta.x == 0.0 && delta.y == 0.0 {
        return current;
    }
    delta.azimuth()
}
