//! Sources, loudspeakers and their identifiers
//!
//! This module defines the value types the Scene stores per source and per
//! loudspeaker, plus:
//! - `SourceId` newtype with NCName validation
//! - `SourceIdAllocator` handing out ids that are never reused
//! - dB <-> linear gain helpers used by the wire protocols

use crate::domain::geometry::{DirectionalPoint, Orientation, Position};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing model names and ids
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("Unknown source model: {0}")]
    UnknownSourceModel(String),

    #[error("Unknown loudspeaker model: {0}")]
    UnknownLoudspeakerModel(String),

    #[error("Invalid source ID: {0:?}")]
    InvalidId(String),
}

/// Unique identifier of a live source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    /// Build an id, rejecting strings that are not valid NCNames
    pub fn parse(id: &str) -> Result<Self, ModelError> {
        if Self::is_valid(id) {
            Ok(Self(id.to_string()))
        } else {
            Err(ModelError::InvalidId(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(id: &str) -> bool {
        let mut chars = id.chars();
        match chars.next() {
            Some(first) if first.is_alphabetic() || first == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out `src-<n>` ids, skipping ids that were ever taken
///
/// `src-1` up to `src-<last>` are all taken; `peek` starts after them.
#[derive(Debug, Default)]
pub struct SourceIdAllocator {
    last: u64,
    taken: HashSet<SourceId>,
}

impl SourceIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn generated(n: u64) -> SourceId {
        SourceId(format!("src-{}", n))
    }

    /// The next free generated id, not yet taken
    pub fn peek(&self) -> SourceId {
        let mut n = self.last;
        loop {
            n += 1;
            let id = Self::generated(n);
            if !self.taken.contains(&id) {
                return id;
            }
        }
    }

    /// Take an id, generated or caller-supplied; returns false if it was
    /// used before
    pub fn reserve(&mut self, id: &SourceId) -> bool {
        if !self.taken.insert(id.clone()) {
            return false;
        }
        while self.taken.contains(&Self::generated(self.last + 1)) {
            self.last += 1;
        }
        true
    }
}

/// Rendering model of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceModel {
    #[default]
    Point,
    Plane,
    Line,
    Directional,
    Extended,
}

impl SourceModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceModel::Point => "point",
            SourceModel::Plane => "plane",
            SourceModel::Line => "line",
            SourceModel::Directional => "directional",
            SourceModel::Extended => "extended",
        }
    }
}

impl FromStr for SourceModel {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "point" => Ok(SourceModel::Point),
            "plane" => Ok(SourceModel::Plane),
            "line" => Ok(SourceModel::Line),
            "directional" => Ok(SourceModel::Directional),
            "extended" => Ok(SourceModel::Extended),
            other => Err(ModelError::UnknownSourceModel(other.to_string())),
        }
    }
}

impl fmt::Display for SourceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model of a loudspeaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoudspeakerModel {
    #[default]
    Normal,
    Subwoofer,
}

impl LoudspeakerModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoudspeakerModel::Normal => "normal",
            LoudspeakerModel::Subwoofer => "subwoofer",
        }
    }
}

impl FromStr for LoudspeakerModel {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(LoudspeakerModel::Normal),
            "subwoofer" => Ok(LoudspeakerModel::Subwoofer),
            other => Err(ModelError::UnknownLoudspeakerModel(other.to_string())),
        }
    }
}

/// Where the audio of a source comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AudioOrigin {
    /// A channel of an audio file; `channel` is 1-based
    File {
        path: PathBuf,
        channel: u32,
        #[serde(default)]
        length: u64,
    },
    /// A live input port
    Input { port: String },
}

impl AudioOrigin {
    pub fn file(path: impl Into<PathBuf>, channel: u32) -> Self {
        AudioOrigin::File {
            path: path.into(),
            channel,
            length: 0,
        }
    }

    pub fn input(port: impl Into<String>) -> Self {
        AudioOrigin::Input { port: port.into() }
    }
}

/// A single sound source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub model: SourceModel,
    pub origin: Option<AudioOrigin>,
    /// Engine port the source is fed from (player port or live input)
    pub port_name: String,
    pub pose: DirectionalPoint,
    /// Linear gain
    pub gain: f32,
    pub mute: bool,
    pub fixed: bool,
    pub properties_file: String,
    /// Instantaneous signal level, linear 0..1
    pub level: f32,
    /// One entry per loudspeaker
    pub output_activity: Vec<f32>,
}

impl Source {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            model: SourceModel::Point,
            origin: None,
            port_name: String::new(),
            pose: DirectionalPoint::default(),
            gain: 1.0,
            mute: false,
            fixed: false,
            properties_file: String::new(),
            level: 0.0,
            output_activity: Vec::new(),
        }
    }

    pub fn position(&self) -> Position {
        self.pose.position
    }

    pub fn orientation(&self) -> Orientation {
        self.pose.orientation
    }
}

impl Default for Source {
    fn default() -> Self {
        Self::new()
    }
}

/// A loudspeaker of the reproduction setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loudspeaker {
    pub pose: DirectionalPoint,
    #[serde(default)]
    pub model: LoudspeakerModel,
    /// Linear gain
    #[serde(default = "unity")]
    pub weight: f32,
    /// Seconds
    #[serde(default)]
    pub delay: f32,
    #[serde(default)]
    pub mute: bool,
    #[serde(skip)]
    pub active: bool,
}

fn unity() -> f32 {
    1.0
}

impl Loudspeaker {
    pub fn new(pose: DirectionalPoint, model: LoudspeakerModel) -> Self {
        Self {
            pose,
            model,
            weight: 1.0,
            delay: 0.0,
            mute: false,
            active: false,
        }
    }
}

/// Floor used when converting silence to dB
pub const MIN_DB: f32 = -60.0;

/// Convert decibels to a linear gain factor
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert a linear gain factor to decibels, flooring silence at `MIN_DB`
pub fn linear_to_db(gain: f32) -> f32 {
    if gain <= 0.0 {
        MIN_DB
    } else {
        (20.0 * gain.log10()).max(MIN_DB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_validation() {
        assert!(SourceId::parse("tom").is_ok());
        assert!(SourceId::parse("_a-1.b").is_ok());
        assert!(SourceId::parse("").is_err());
        assert!(SourceId::parse("1abc").is_err());
        assert!(SourceId::parse("has space").is_err());
    }

    #[test]
    fn test_allocator_never_reuses() {
        let mut allocator = SourceIdAllocator::new();
        assert!(allocator.reserve(&SourceId::new("src-2".to_string())));

        let first = allocator.peek();
        assert_eq!(first.as_str(), "src-1");
        assert!(allocator.reserve(&first));
        // src-2 was supplied by a caller, so it is skipped
        assert_eq!(allocator.peek().as_str(), "src-3");
        assert!(!allocator.reserve(&first));
    }

    #[test]
    fn test_allocator_moves_past_taken_ids() {
        let mut allocator = SourceIdAllocator::new();
        for n in 1..=1000 {
            let id = allocator.peek();
            assert_eq!(id.as_str(), format!("src-{}", n));
            assert!(allocator.reserve(&id));
        }
        assert_eq!(allocator.last, 1000);
    }

    #[test]
    fn test_model_round_trip() {
        for name in ["point", "plane", "line", "directional", "extended"] {
            let model: SourceModel = name.parse().unwrap();
            assert_eq!(model.as_str(), name);
        }
        assert!("cube".parse::<SourceModel>().is_err());
        assert_eq!("subwoofer".parse::<LoudspeakerModel>().unwrap(), LoudspeakerModel::Subwoofer);
    }

    #[test]
    fn test_db_conversion() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-6.0) - 0.501).abs() < 0.01);
        assert_eq!(linear_to_db(0.0), MIN_DB);
        assert!((linear_to_db(1.0)).abs() < 1e-6);
    }
}
