//! In-memory renderer, player and recording subscriber for unit tests

use crate::domain::geometry::{DirectionalPoint, Orientation, Position};
use crate::domain::metering::MeteringReceiver;
use crate::domain::publisher::{Publisher, Subscription};
use crate::domain::renderer::{
    AudioPlayer, PlaybackError, PlaybackHandle, RenderError, RenderParams, RenderSource, Renderer,
    Result, SourceInput,
};
use crate::domain::source::{Loudspeaker, LoudspeakerModel, SourceId, SourceModel};
use crate::domain::subscriber::{
    BundleEvents, RendererControl, RendererInformation, SceneControl, SceneInformation,
    SourceProperty, Transport,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
pub struct NullRenderer {
    params: Mutex<RenderParams>,
    rolling: AtomicBool,
    frame: AtomicU32,
    stalled: AtomicBool,
}

impl NullRenderer {
    /// Make `sync` time out until called again with false
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }
}

impl Renderer for NullRenderer {
    fn name(&self) -> &str {
        "null"
    }

    fn sample_rate(&self) -> u32 {
        44100
    }

    fn loudspeakers(&self) -> Vec<Loudspeaker> {
        vec![
            Loudspeaker::new(
                DirectionalPoint::new(Position::new(-1.0, 1.0), Orientation::new(-45.0)),
                LoudspeakerModel::Normal,
            ),
            Loudspeaker::new(
                DirectionalPoint::new(Position::new(1.0, 1.0), Orientation::new(-135.0)),
                LoudspeakerModel::Normal,
            ),
        ]
    }

    fn lock(&self) -> MutexGuard<'_, RenderParams> {
        self.params.lock().unwrap()
    }

    fn add_source(&self, id: &SourceId, input: &SourceInput) -> Result<()> {
        let mut params = self.lock();
        if params.sources.contains_key(id) {
            return Err(RenderError::DuplicateSource(id.clone()));
        }
        params.sources.insert(
            id.clone(),
            RenderSource::new(input.port_name.clone(), input.properties_file.clone()),
        );
        Ok(())
    }

    fn remove_source(&self, id: &SourceId) -> Result<()> {
        self.lock()
            .sources
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RenderError::UnknownSource(id.clone()))
    }

    fn sync(&self) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            return Err(RenderError::SyncTimeout(std::time::Duration::ZERO));
        }
        Ok(())
    }

    fn transport_start(&self) {
        self.rolling.store(true, Ordering::SeqCst);
    }

    fn transport_stop(&self) {
        self.rolling.store(false, Ordering::SeqCst);
    }

    fn transport_locate(&self, frame: u32) {
        self.frame.store(frame, Ordering::SeqCst);
    }

    fn transport_state(&self) -> (bool, u32) {
        (
            self.rolling.load(Ordering::SeqCst),
            self.frame.load(Ordering::SeqCst),
        )
    }

    fn metering(&self) -> Option<MeteringReceiver> {
        None
    }
}

/// Player that opens any file except `MISSING`
#[derive(Default)]
pub struct NullPlayer {
    open: AtomicUsize,
}

impl NullPlayer {
    pub const MISSING: &'static str = "missing.wav";

    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl AudioPlayer for NullPlayer {
    fn acquire(
        &self,
        path: &Path,
        channel: u32,
    ) -> std::result::Result<PlaybackHandle, PlaybackError> {
        if path == Path::new(Self::MISSING) {
            return Err(PlaybackError::NotFound(path.to_path_buf()));
        }
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(PlaybackHandle {
            path: path.to_path_buf(),
            channel,
            port_name: format!("player:{}_{}", path.display(), channel),
            file_length: 44100,
        })
    }

    fn release(&self, _handle: PlaybackHandle) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BundleStart,
    BundleStop,
    AutoRotate(bool),
    DeleteSource(SourceId),
    SourcePosition(SourceId, Position),
    SourceOrientation(SourceId, Orientation),
    SourceVolume(SourceId, f32),
    SourceMute(SourceId, bool),
    SourceName(SourceId, String),
    SourceModel(SourceId, SourceModel),
    SourceFixed(SourceId, bool),
    ReferencePosition(Position),
    ReferenceOrientation(Orientation),
    MasterVolume(f32),
    DecayExponent(f32),
    AmplitudeReferenceDistance(f32),
    SampleRate(u32),
    NewSource(SourceId),
    SourceProperty(SourceId, SourceProperty),
    TransportRolling(bool),
    Processing(bool),
    ReferenceOffsetPosition(Position),
    ReferenceOffsetOrientation(Orientation),
    RendererName(String),
    Loudspeakers(usize),
    TransportFrame(u32),
}

/// Records every callback it receives
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    leave: Mutex<Option<Subscription>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Drop `subscription` from inside the next callback
    pub fn leave_on_next_event(&self, subscription: Subscription) {
        *self.leave.lock().unwrap() = Some(subscription);
    }

    pub fn subscribe_all(self: &Arc<Self>, publisher: &Publisher) -> Vec<Subscription> {
        let mut subscribe = publisher.subscribe();
        vec![
            subscribe.bundle(self.clone()),
            subscribe.scene_control(self.clone()),
            subscribe.scene_information(self.clone()),
            subscribe.renderer_control(self.clone()),
            subscribe.renderer_information(self.clone()),
            subscribe.transport(self.clone()),
        ]
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        let leaving = self.leave.lock().unwrap().take();
        drop(leaving);
    }
}

impl BundleEvents for Recorder {
    fn bundle_start(&self) {
        self.push(Event::BundleStart);
    }

    fn bundle_stop(&self) {
        self.push(Event::BundleStop);
    }
}

impl SceneControl for Recorder {
    fn auto_rotate_sources(&self, enabled: bool) {
        self.push(Event::AutoRotate(enabled));
    }

    fn delete_source(&self, id: &SourceId) {
        self.push(Event::DeleteSource(id.clone()));
    }

    fn source_position(&self, id: &SourceId, position: Position) {
        self.push(Event::SourcePosition(id.clone(), position));
    }

    fn source_orientation(&self, id: &SourceId, orientation: Orientation) {
        self.push(Event::SourceOrientation(id.clone(), orientation));
    }

    fn source_volume(&self, id: &SourceId, gain: f32) {
        self.push(Event::SourceVolume(id.clone(), gain));
    }

    fn source_mute(&self, id: &SourceId, mute: bool) {
        self.push(Event::SourceMute(id.clone(), mute));
    }

    fn source_name(&self, id: &SourceId, name: &str) {
        self.push(Event::SourceName(id.clone(), name.to_string()));
    }

    fn source_model(&self, id: &SourceId, model: SourceModel) {
        self.push(Event::SourceModel(id.clone(), model));
    }

    fn source_fixed(&self, id: &SourceId, fixed: bool) {
        self.push(Event::SourceFixed(id.clone(), fixed));
    }

    fn reference_position(&self, position: Position) {
        self.push(Event::ReferencePosition(position));
    }

    fn reference_orientation(&self, orientation: Orientation) {
        self.push(Event::ReferenceOrientation(orientation));
    }

    fn master_volume(&self, gain: f32) {
        self.push(Event::MasterVolume(gain));
    }

    fn decay_exponent(&self, exponent: f32) {
        self.push(Event::DecayExponent(exponent));
    }

    fn amplitude_reference_distance(&self, distance: f32) {
        self.push(Event::AmplitudeReferenceDistance(distance));
    }
}

impl SceneInformation for Recorder {
    fn sample_rate(&self, rate: u32) {
        self.push(Event::SampleRate(rate));
    }

    fn new_source(&self, id: &SourceId) {
        self.push(Event::NewSource(id.clone()));
    }

    fn source_property(&self, id: &SourceId, property: &SourceProperty) {
        self.push(Event::SourceProperty(id.clone(), property.clone()));
    }

    fn transport_rolling(&self, rolling: bool) {
        self.push(Event::TransportRolling(rolling));
    }
}

impl RendererControl for Recorder {
    fn processing(&self, enabled: bool) {
        self.push(Event::Processing(enabled));
    }

    fn reference_offset_position(&self, position: Position) {
        self.push(Event::ReferenceOffsetPosition(position));
    }

    fn reference_offset_orientation(&self, orientation: Orientation) {
        self.push(Event::ReferenceOffsetOrientation(orientation));
    }
}

impl RendererInformation for Recorder {
    fn renderer_name(&self, name: &str) {
        self.push(Event::RendererName(name.to_string()));
    }

    fn loudspeakers(&self, loudspeakers: &[Loudspeaker]) {
        self.push(Event::Loudspeakers(loudspeakers.len()));
    }
}

impl Transport for Recorder {
    fn transport_frame(&self, frame: u32) {
        self.push(Event::TransportFrame(frame));
    }
}
