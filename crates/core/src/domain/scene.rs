//! Canonical in-process cache of the audio scene
//!
//! The Scene is updated exclusively through the Subscriber callbacks, exactly
//! like every other observer, and answers synchronous queries. Per-source
//! queries return `None` for unknown ids. The only exception is the legacy
//! numeric mapping: `source_number` returns 0 for unknown ids.

use crate::domain::geometry::{DirectionalPoint, Orientation, Position};
use crate::domain::source::{AudioOrigin, Loudspeaker, Source, SourceId, SourceModel};
use crate::domain::subscriber::{
    Metering, RendererControl, RendererInformation, SceneControl, SceneInformation,
    SourceProperty, Transport,
};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

/// Scene-wide defaults used before anything has been published
pub const DEFAULT_MASTER_VOLUME: f32 = 1.0;
pub const DEFAULT_DECAY_EXPONENT: f32 = 1.0;
pub const DEFAULT_AMPLITUDE_REFERENCE_DISTANCE: f32 = 3.0;

/// Plain data held by the Scene
#[derive(Debug, Clone)]
pub struct SceneState {
    pub sources: HashMap<SourceId, Source>,
    /// Creation order, used for 1-based source numbers
    pub order: Vec<SourceId>,
    pub loudspeakers: Vec<Loudspeaker>,
    pub reference: DirectionalPoint,
    pub reference_offset: DirectionalPoint,
    pub master_volume: f32,
    pub decay_exponent: f32,
    pub amplitude_reference_distance: f32,
    pub sample_rate: u32,
    pub transport_rolling: bool,
    pub transport_frame: u32,
    pub processing: bool,
    pub auto_rotation: bool,
    pub master_level: f32,
    pub cpu_load: f32,
    pub renderer_name: String,
}

impl Default for SceneState {
    fn default() -> Self {
        Self {
            sources: HashMap::new(),
            order: Vec::new(),
            loudspeakers: Vec::new(),
            reference: DirectionalPoint::default(),
            reference_offset: DirectionalPoint::default(),
            master_volume: DEFAULT_MASTER_VOLUME,
            decay_exponent: DEFAULT_DECAY_EXPONENT,
            amplitude_reference_distance: DEFAULT_AMPLITUDE_REFERENCE_DISTANCE,
            sample_rate: 0,
            transport_rolling: false,
            transport_frame: 0,
            processing: false,
            auto_rotation: true,
            master_level: 0.0,
            cpu_load: 0.0,
            renderer_name: String::new(),
        }
    }
}

/// Scene cache
#[derive(Debug, Default)]
pub struct Scene {
    state: RwLock<SceneState>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SceneState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SceneState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a source, warning if it does not exist
    fn with_source(&self, id: &SourceId, what: &str, f: impl FnOnce(&mut Source)) {
        let mut state = self.write();
        match state.sources.get_mut(id) {
            Some(source) => f(source),
            None => warn!(%id, "Scene: cannot set {} of unknown source", what),
        }
    }

    /// Copy of the whole state
    pub fn state(&self) -> SceneState {
        self.read().clone()
    }

    pub fn get_source(&self, id: &SourceId) -> Option<Source> {
        self.read().sources.get(id).cloned()
    }

    pub fn contains(&self, id: &SourceId) -> bool {
        self.read().sources.contains_key(id)
    }

    pub fn get_source_position(&self, id: &SourceId) -> Option<Position> {
        self.read().sources.get(id).map(|s| s.pose.position)
    }

    pub fn get_source_orientation(&self, id: &SourceId) -> Option<Orientation> {
        self.read().sources.get(id).map(|s| s.pose.orientation)
    }

    pub fn get_source_gain(&self, id: &SourceId) -> Option<f32> {
        self.read().sources.get(id).map(|s| s.gain)
    }

    pub fn get_source_mute(&self, id: &SourceId) -> Option<bool> {
        self.read().sources.get(id).map(|s| s.mute)
    }

    pub fn get_source_fixed(&self, id: &SourceId) -> Option<bool> {
        self.read().sources.get(id).map(|s| s.fixed)
    }

    pub fn get_source_name(&self, id: &SourceId) -> Option<String> {
        self.read().sources.get(id).map(|s| s.name.clone())
    }

    pub fn get_source_model(&self, id: &SourceId) -> Option<SourceModel> {
        self.read().sources.get(id).map(|s| s.model)
    }

    pub fn get_source_level(&self, id: &SourceId) -> Option<f32> {
        self.read().sources.get(id).map(|s| s.level)
    }

    /// Ids in creation order
    pub fn source_ids(&self) -> Vec<SourceId> {
        self.read().order.clone()
    }

    pub fn source_count(&self) -> usize {
        self.read().order.len()
    }

    /// Id of the source with the given 1-based number
    pub fn source_id(&self, number: u32) -> Option<SourceId> {
        let index = (number as usize).checked_sub(1)?;
        self.read().order.get(index).cloned()
    }

    /// 1-based number of a source; 0 if the id is unknown
    pub fn source_number(&self, id: &SourceId) -> u32 {
        self.read()
            .order
            .iter()
            .position(|other| other == id)
            .map(|index| index as u32 + 1)
            .unwrap_or(0)
    }

    pub fn get_reference(&self) -> DirectionalPoint {
        self.read().reference
    }

    pub fn get_reference_offset(&self) -> DirectionalPoint {
        self.read().reference_offset
    }

    pub fn get_master_volume(&self) -> f32 {
        self.read().master_volume
    }

    pub fn get_decay_exponent(&self) -> f32 {
        self.read().decay_exponent
    }

    pub fn get_amplitude_reference_distance(&self) -> f32 {
        self.read().amplitude_reference_distance
    }

    pub fn get_sample_rate(&self) -> u32 {
        self.read().sample_rate
    }

    pub fn get_transport_rolling(&self) -> bool {
        self.read().transport_rolling
    }

    pub fn get_transport_frame(&self) -> u32 {
        self.read().transport_frame
    }

    pub fn get_processing(&self) -> bool {
        self.read().processing
    }

    pub fn get_auto_rotation(&self) -> bool {
        self.read().auto_rotation
    }

    pub fn get_master_level(&self) -> f32 {
        self.read().master_level
    }

    pub fn get_cpu_load(&self) -> f32 {
        self.read().cpu_load
    }

    pub fn get_renderer_name(&self) -> String {
        self.read().renderer_name.clone()
    }

    pub fn get_loudspeakers(&self) -> Vec<Loudspeaker> {
        self.read().loudspeakers.clone()
    }

    /// Re-emit the scene-control state to a new subscriber
    pub fn replay_scene_control(&self, target: &dyn SceneControl) {
        let state = self.state();
        target.auto_rotate_sources(state.auto_rotation);
        target.reference_position(state.reference.position);
        target.reference_orientation(state.reference.orientation);
        target.master_volume(state.master_volume);
        target.decay_exponent(state.decay_exponent);
        target.amplitude_reference_distance(state.amplitude_reference_distance);
        for id in &state.order {
            if let Some(source) = state.sources.get(id) {
                target.source_name(id, &source.name);
                target.source_model(id, source.model);
                target.source_position(id, source.pose.position);
                target.source_orientation(id, source.pose.orientation);
                target.source_fixed(id, source.fixed);
                target.source_volume(id, source.gain);
                target.source_mute(id, source.mute);
            }
        }
    }

    /// Re-emit the scene-information state to a new subscriber
    pub fn replay_scene_information(&self, target: &dyn SceneInformation) {
        let state = self.state();
        target.sample_rate(state.sample_rate);
        for id in &state.order {
            let Some(source) = state.sources.get(id) else {
                continue;
            };
            target.new_source(id);
            target.source_property(id, &SourceProperty::PortName(source.port_name.clone()));
            if let Some(AudioOrigin::File {
                path,
                channel,
                length,
            }) = &source.origin
            {
                target.source_property(id, &SourceProperty::AudioFile(path.clone()));
                target.source_property(id, &SourceProperty::AudioFileChannel(*channel));
                target.source_property(id, &SourceProperty::AudioFileLength(*length));
            }
            target.source_property(
                id,
                &SourceProperty::PropertiesFile(source.properties_file.clone()),
            );
        }
        target.transport_rolling(state.transport_rolling);
    }

    pub fn replay_renderer_control(&self, target: &dyn RendererControl) {
        let state = self.state();
        target.processing(state.processing);
        target.reference_offset_position(state.reference_offset.position);
        target.reference_offset_orientation(state.reference_offset.orientation);
    }

    pub fn replay_renderer_information(&self, target: &dyn RendererInformation) {
        let state = self.state();
        target.renderer_name(&state.renderer_name);
        target.loudspeakers(&state.loudspeakers);
    }
}

impl SceneControl for Scene {
    fn auto_rotate_sources(&self, enabled: bool) {
        self.write().auto_rotation = enabled;
    }

    fn delete_source(&self, id: &SourceId) {
        let mut state = self.write();
        if state.sources.remove(id).is_some() {
            state.order.retain(|other| other != id);
            debug!(%id, "Scene: source removed");
        } else {
            warn!(%id, "Scene: cannot delete unknown source");
        }
    }

    fn source_position(&self, id: &SourceId, position: Position) {
        self.with_source(id, "position", |s| s.pose.position = position);
    }

    fn source_orientation(&self, id: &SourceId, orientation: Orientation) {
        self.with_source(id, "orientation", |s| s.pose.orientation = orientation);
    }

    fn source_volume(&self, id: &SourceId, gain: f32) {
        self.with_source(id, "volume", |s| s.gain = gain);
    }

    fn source_mute(&self, id: &SourceId, mute: bool) {
        self.with_source(id, "mute", |s| s.mute = mute);
    }

    fn source_name(&self, id: &SourceId, name: &str) {
        self.with_source(id, "name", |s| s.name = name.to_string());
    }

    fn source_model(&self, id: &SourceId, model: SourceModel) {
        self.with_source(id, "model", |s| s.model = model);
    }

    fn source_fixed(&self, id: &SourceId, fixed: bool) {
        self.with_source(id, "fixed", |s| s.fixed = fixed);
    }

    fn reference_position(&self, position: Position) {
        self.write().reference.position = position;
    }

    fn reference_orientation(&self, orientation: Orientation) {
        self.write().reference.orientation = orientation;
    }

    fn master_volume(&self, gain: f32) {
        self.write().master_volume = gain;
    }

    fn decay_exponent(&self, exponent: f32) {
        self.write().decay_exponent = exponent;
    }

    fn amplitude_reference_distance(&self, distance: f32) {
        self.write().amplitude_reference_distance = distance;
    }
}

impl SceneInformation for Scene {
    fn sample_rate(&self, rate: u32) {
        self.write().sample_rate = rate;
    }

    fn new_source(&self, id: &SourceId) {
        let mut state = self.write();
        if state.sources.contains_key(id) {
            warn!(%id, "Scene: source already exists");
            return;
        }
        let mut source = Source::new();
        source.output_activity = vec![0.0; state.loudspeakers.len()];
        state.sources.insert(id.clone(), source);
        state.order.push(id.clone());
        debug!(%id, "Scene: source added");
    }

    fn source_property(&self, id: &SourceId, property: &SourceProperty) {
        self.with_source(id, property.key(), |s| match property {
            SourceProperty::AudioFile(path) => match &mut s.origin {
                Some(AudioOrigin::File { path: p, .. }) => *p = path.clone(),
                _ => s.origin = Some(AudioOrigin::file(path.clone(), 1)),
            },
            SourceProperty::AudioFileChannel(channel) => {
                if let Some(AudioOrigin::File { channel: c, .. }) = &mut s.origin {
                    *c = *channel;
                }
            }
            SourceProperty::AudioFileLength(length) => {
                if let Some(AudioOrigin::File { length: l, .. }) = &mut s.origin {
                    *l = *length;
                }
            }
            SourceProperty::PortName(port) => {
                s.port_name = port.clone();
                if s.origin.is_none() && !port.is_empty() {
                    s.origin = Some(AudioOrigin::input(port.clone()));
                }
            }
            SourceProperty::PropertiesFile(file) => s.properties_file = file.clone(),
        });
    }

    fn transport_rolling(&self, rolling: bool) {
        self.write().transport_rolling = rolling;
    }
}

impl RendererControl for Scene {
    fn processing(&self, enabled: bool) {
        self.write().processing = enabled;
    }

    fn reference_offset_position(&self, position: Position) {
        self.write().reference_offset.position = position;
    }

    fn reference_offset_orientation(&self, orientation: Orientation) {
        self.write().reference_offset.orientation = orientation;
    }
}

impl RendererInformation for Scene {
    fn renderer_name(&self, name: &str) {
        self.write().renderer_name = name.to_string();
    }

    fn loudspeakers(&self, loudspeakers: &[Loudspeaker]) {
        let mut state = self.write();
        if !state.loudspeakers.is_empty() {
            warn!("Scene: loudspeakers can only be set once");
            return;
        }
        state.loudspeakers = loudspeakers.to_vec();
    }
}

impl Transport for Scene {
    fn transport_frame(&self, frame: u32) {
        self.write().transport_frame = frame;
    }
}

impl Metering for Scene {
    fn source_level(&self, id: &SourceId, level: f32) {
        if let Some(source) = self.write().sources.get_mut(id) {
            source.level = level;
        } else {
            trace!(%id, "Scene: level for unknown source");
        }
    }

    fn master_level(&self, level: f32) {
        self.write().master_level = level;
    }

    fn output_activity(&self, id: &SourceId, activity: &[f32]) {
        if let Some(source) = self.write().sources.get_mut(id) {
            source.output_activity.clear();
            source.output_activity.extend_from_slice(activity);
        }
    }

    fn cpu_load(&self, load: f32) {
        self.write().cpu_load = load;
    }
}
