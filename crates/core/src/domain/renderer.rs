//! Capabilities the control plane needs from the real-time engine
//!
//! The control core never depends on a concrete engine type. An engine
//! exposes its parameter state behind a short-lived scoped lock, source
//! management, transport control and output enumeration through `Renderer`.
//! Audio files are opened through an `AudioPlayer`.

use crate::domain::geometry::DirectionalPoint;
use crate::domain::metering::MeteringReceiver;
use crate::domain::source::{Loudspeaker, SourceId, SourceModel};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a rendering engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("Source not known to the renderer: {0}")]
    UnknownSource(SourceId),

    #[error("Source already exists in the renderer: {0}")]
    DuplicateSource(SourceId),

    #[error("Input port not available: {0}")]
    PortUnavailable(String),

    #[error("No tracker connected")]
    NoTracker,

    #[error("Audio thread did not complete a cycle within {0:?}")]
    SyncTimeout(Duration),

    #[error("Renderer error: {0}")]
    Engine(String),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Per-source parameters read by the audio thread
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSource {
    pub port_name: String,
    pub properties_file: String,
    pub pose: DirectionalPoint,
    pub model: SourceModel,
    pub gain: f32,
    pub mute: bool,
}

impl RenderSource {
    pub fn new(port_name: String, properties_file: String) -> Self {
        Self {
            port_name,
            properties_file,
            pose: DirectionalPoint::default(),
            model: SourceModel::Point,
            gain: 1.0,
            mute: false,
        }
    }
}

/// Parameter state shared between the control plane and the audio thread
#[derive(Debug, Clone, PartialEq)]
pub struct RenderParams {
    pub reference: DirectionalPoint,
    pub reference_offset: DirectionalPoint,
    pub master_volume: f32,
    pub decay_exponent: f32,
    pub amplitude_reference_distance: f32,
    pub processing: bool,
    pub sources: HashMap<SourceId, RenderSource>,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            reference: DirectionalPoint::default(),
            reference_offset: DirectionalPoint::default(),
            master_volume: 1.0,
            decay_exponent: 1.0,
            amplitude_reference_distance: 3.0,
            processing: false,
            sources: HashMap::new(),
        }
    }
}

/// How a new source is connected inside the engine
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceInput {
    pub port_name: String,
    pub properties_file: String,
}

/// A real-time rendering engine
pub trait Renderer: Send + Sync {
    fn name(&self) -> &str;

    fn sample_rate(&self) -> u32;

    /// Output enumeration, fixed for the lifetime of the engine
    fn loudspeakers(&self) -> Vec<Loudspeaker>;

    /// Scoped lock over the parameter state; keep the critical section short
    fn lock(&self) -> MutexGuard<'_, RenderParams>;

    fn add_source(&self, id: &SourceId, input: &SourceInput) -> Result<()>;

    /// Detach a source; the audio thread may still reference it until `sync`
    fn remove_source(&self, id: &SourceId) -> Result<()>;

    /// Block until the audio thread has completed a cycle after this call
    ///
    /// Returns at once when no audio thread is running.
    fn sync(&self) -> Result<()>;

    fn transport_start(&self);

    fn transport_stop(&self);

    fn transport_locate(&self, frame: u32);

    /// (rolling, frame)
    fn transport_state(&self) -> (bool, u32);

    fn reset_tracker(&self) -> Result<()> {
        Err(RenderError::NoTracker)
    }

    /// Consumer end of the metering handoff; `None` once taken
    fn metering(&self) -> Option<MeteringReceiver>;
}

/// Errors when opening audio files for playback
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Audio file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid channel {channel} for {path}")]
    InvalidChannel { path: PathBuf, channel: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An opened audio-file channel, feeding an engine port
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackHandle {
    pub path: PathBuf,
    pub channel: u32,
    pub port_name: String,
    /// Length in frames, 0 if unknown
    pub file_length: u64,
}

/// Provider of audio-file playback ports
pub trait AudioPlayer: Send + Sync {
    fn acquire(&self, path: &Path, channel: u32) -> std::result::Result<PlaybackHandle, PlaybackError>;

    fn release(&self, handle: PlaybackHandle);
}
