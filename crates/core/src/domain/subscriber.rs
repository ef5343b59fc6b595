//! Notification contract between the Publisher and its observers
//!
//! Observers implement only the capability slices they care about and are
//! registered per slice, so a metering display never has to implement
//! scene-control callbacks and vice versa:
//! - `BundleEvents`: grouping boundaries around one logical operation
//! - `SceneControl`: facts that can be changed by controllers
//! - `SceneInformation`: facts derived from the engine or file system
//! - `RendererControl` / `RendererInformation`: renderer-wide state
//! - `Transport`: transport position
//! - `Metering`: levels and load, subscribed per `MeteringKind`
//!
//! Every method takes `&self`; implementations use interior mutability and
//! must return quickly because they run inside a Publisher fan-out.

use crate::domain::geometry::{Orientation, Position};
use crate::domain::source::{Loudspeaker, SourceId, SourceModel};
use std::path::PathBuf;

pub trait BundleEvents: Send + Sync {
    fn bundle_start(&self);
    fn bundle_stop(&self);
}

pub trait SceneControl: Send + Sync {
    fn auto_rotate_sources(&self, enabled: bool);
    fn delete_source(&self, id: &SourceId);
    fn source_position(&self, id: &SourceId, position: Position);
    fn source_orientation(&self, id: &SourceId, orientation: Orientation);
    /// Linear gain
    fn source_volume(&self, id: &SourceId, gain: f32);
    fn source_mute(&self, id: &SourceId, mute: bool);
    fn source_name(&self, id: &SourceId, name: &str);
    fn source_model(&self, id: &SourceId, model: SourceModel);
    fn source_fixed(&self, id: &SourceId, fixed: bool);
    fn reference_position(&self, position: Position);
    fn reference_orientation(&self, orientation: Orientation);
    /// Linear gain
    fn master_volume(&self, gain: f32);
    fn decay_exponent(&self, exponent: f32);
    fn amplitude_reference_distance(&self, distance: f32);
}

/// Per-source facts that are not set by controllers directly
#[derive(Debug, Clone, PartialEq)]
pub enum SourceProperty {
    AudioFile(PathBuf),
    AudioFileChannel(u32),
    AudioFileLength(u64),
    PortName(String),
    PropertiesFile(String),
}

impl SourceProperty {
    /// Key used by the JSON protocol
    pub fn key(&self) -> &'static str {
        match self {
            SourceProperty::AudioFile(_) => "audio-file",
            SourceProperty::AudioFileChannel(_) => "audio-file-channel",
            SourceProperty::AudioFileLength(_) => "audio-file-length",
            SourceProperty::PortName(_) => "port-name",
            SourceProperty::PropertiesFile(_) => "properties-file",
        }
    }
}

pub trait SceneInformation: Send + Sync {
    fn sample_rate(&self, rate: u32);
    fn new_source(&self, id: &SourceId);
    fn source_property(&self, id: &SourceId, property: &SourceProperty);
    fn transport_rolling(&self, rolling: bool);
}

pub trait RendererControl: Send + Sync {
    fn processing(&self, enabled: bool);
    fn reference_offset_position(&self, position: Position);
    fn reference_offset_orientation(&self, orientation: Orientation);
}

pub trait RendererInformation: Send + Sync {
    fn renderer_name(&self, name: &str);
    fn loudspeakers(&self, loudspeakers: &[Loudspeaker]);
}

pub trait Transport: Send + Sync {
    fn transport_frame(&self, frame: u32);
}

/// Metering streams that can be subscribed independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeteringKind {
    SourceLevel,
    MasterLevel,
    OutputActivity,
    CpuLoad,
}

impl MeteringKind {
    pub const ALL: [MeteringKind; 4] = [
        MeteringKind::SourceLevel,
        MeteringKind::MasterLevel,
        MeteringKind::OutputActivity,
        MeteringKind::CpuLoad,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            MeteringKind::SourceLevel => 0,
            MeteringKind::MasterLevel => 1,
            MeteringKind::OutputActivity => 2,
            MeteringKind::CpuLoad => 3,
        }
    }
}

/// Metering callbacks; only the method matching the subscribed kind is called
pub trait Metering: Send + Sync {
    fn source_level(&self, _id: &SourceId, _level: f32) {}
    fn master_level(&self, _level: f32) {}
    fn output_activity(&self, _id: &SourceId, _activity: &[f32]) {}
    /// Percent
    fn cpu_load(&self, _load: f32) {}
}
