//! Publisher: the single mutation entry point of the control plane
//!
//! All changes go through a `Control` guard obtained with
//! `Publisher::take_control()`. The guard holds the Publisher's exclusive
//! lock for its whole lifetime, so:
//! - every subscriber observes fan-outs in the same total order
//! - each subscriber method is called once per published fact
//! - a guard brackets its facts with `bundle_start` / `bundle_stop`
//!
//! Subscriptions are registered per capability slice and removed lazily:
//! dropping a `Subscription` only clears a flag, so a subscriber may
//! unsubscribe from inside its own callback. Inactive entries are skipped
//! by the running fan-out and purged when the next guard is taken.

use crate::domain::geometry::{look_at, Orientation, Position};
use crate::domain::metering::MeteringSnapshot;
use crate::domain::persistence::{SceneDocument, SceneFileError, SceneStore};
use crate::domain::render_subscriber::RenderSubscriber;
use crate::domain::renderer::{
    AudioPlayer, PlaybackError, PlaybackHandle, RenderError, Renderer, SourceInput,
};
use crate::domain::scene::Scene;
use crate::domain::source::{
    db_to_linear, AudioOrigin, SourceId, SourceIdAllocator, SourceModel,
};
use crate::domain::subscriber::{
    BundleEvents, Metering, MeteringKind, RendererControl, RendererInformation, SceneControl,
    SceneInformation, SourceProperty, Transport,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub type Result<T> = std::result::Result<T, ControlError>;

/// Reasons a control request is rejected
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Source not found: {0}")]
    UnknownSource(SourceId),

    #[error("Source is fixed: {0}")]
    SourceFixed(SourceId),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Resource error: {0}")]
    Resource(#[from] PlaybackError),

    #[error("Renderer error: {0}")]
    Renderer(#[from] RenderError),

    #[error("Scene file error: {0}")]
    SceneFile(#[from] SceneFileError),
}

/// Request for `Control::new_source`
#[derive(Debug, Clone, PartialEq)]
pub struct NewSource {
    /// Requested id; one is allocated when `None`
    pub id: Option<SourceId>,
    pub name: String,
    pub model: SourceModel,
    pub origin: AudioOrigin,
    pub position: Position,
    pub orientation: Orientation,
    pub fixed: bool,
    /// Linear gain
    pub volume: f32,
    pub mute: bool,
    pub properties_file: String,
}

impl NewSource {
    pub fn new(name: impl Into<String>, origin: AudioOrigin) -> Self {
        Self {
            id: None,
            name: name.into(),
            model: SourceModel::Point,
            origin,
            position: Position::ORIGIN,
            orientation: Orientation::default(),
            fixed: false,
            volume: 1.0,
            mute: false,
            properties_file: String::new(),
        }
    }

    pub fn with_id(mut self, id: SourceId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_model(mut self, model: SourceModel) -> Self {
        self.model = model;
        self
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn facing(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }
}

/// Settings fixed at construction
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Prefix prepended to live-input port numbers
    pub input_port_prefix: String,
    pub auto_rotation: bool,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            input_port_prefix: "system:capture_".to_string(),
            auto_rotation: true,
        }
    }
}

/// Keeps a registration alive; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

struct Slot<T: ?Sized> {
    active: Arc<AtomicBool>,
    subscriber: Arc<T>,
}

impl<T: ?Sized> Slot<T> {
    fn new(subscriber: Arc<T>) -> (Self, Subscription) {
        let active = Arc::new(AtomicBool::new(true));
        let slot = Self {
            active: active.clone(),
            subscriber,
        };
        (slot, Subscription { active })
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.subscriber) as *const () as usize
    }
}

#[derive(Default)]
struct Registry {
    bundle: Vec<Slot<dyn BundleEvents>>,
    scene_control: Vec<Slot<dyn SceneControl>>,
    scene_information: Vec<Slot<dyn SceneInformation>>,
    renderer_control: Vec<Slot<dyn RendererControl>>,
    renderer_information: Vec<Slot<dyn RendererInformation>>,
    transport: Vec<Slot<dyn Transport>>,
    metering: [Vec<Slot<dyn Metering>>; 4],
}

impl Registry {
    fn purge(&mut self) {
        self.bundle.retain(Slot::is_active);
        self.scene_control.retain(Slot::is_active);
        self.scene_information.retain(Slot::is_active);
        self.renderer_control.retain(Slot::is_active);
        self.renderer_information.retain(Slot::is_active);
        self.transport.retain(Slot::is_active);
        for slots in &mut self.metering {
            slots.retain(Slot::is_active);
        }
    }
}

/// Active subscribers of one slice, in registration order
fn active<T: ?Sized>(slots: &[Slot<T>], skip: Option<usize>) -> impl Iterator<Item = &T> {
    slots
        .iter()
        .filter(move |slot| slot.is_active() && Some(slot.address()) != skip)
        .map(|slot| slot.subscriber.as_ref())
}

struct Inner {
    registry: Registry,
    allocator: SourceIdAllocator,
    playback: HashMap<SourceId, PlaybackHandle>,
    /// Handles of deleted sources the audio thread may still be reading
    unreleased: Vec<PlaybackHandle>,
}

impl Inner {
    fn bundle(&self, mut f: impl FnMut(&dyn BundleEvents)) {
        for subscriber in active(&self.registry.bundle, None) {
            f(subscriber);
        }
    }
}

/// The authoritative mutation and notification hub
pub struct Publisher {
    inner: Mutex<Inner>,
    scene: Arc<Scene>,
    renderer: Arc<dyn Renderer>,
    player: Arc<dyn AudioPlayer>,
    store: Arc<dyn SceneStore>,
    settings: PublisherSettings,
    _internal: Vec<Subscription>,
}

impl Publisher {
    /// Create a Publisher with the Scene and the RenderSubscriber attached
    pub fn new(
        renderer: Arc<dyn Renderer>,
        player: Arc<dyn AudioPlayer>,
        store: Arc<dyn SceneStore>,
        settings: PublisherSettings,
    ) -> Self {
        let scene = Arc::new(Scene::new());
        let render_subscriber = Arc::new(RenderSubscriber::new(renderer.clone()));

        let mut registry = Registry::default();
        let mut internal = Vec::new();

        let (slot, sub) = Slot::new(scene.clone() as Arc<dyn SceneControl>);
        registry.scene_control.push(slot);
        internal.push(sub);
        let (slot, sub) = Slot::new(scene.clone() as Arc<dyn SceneInformation>);
        registry.scene_information.push(slot);
        internal.push(sub);
        let (slot, sub) = Slot::new(scene.clone() as Arc<dyn RendererControl>);
        registry.renderer_control.push(slot);
        internal.push(sub);
        let (slot, sub) = Slot::new(scene.clone() as Arc<dyn RendererInformation>);
        registry.renderer_information.push(slot);
        internal.push(sub);
        let (slot, sub) = Slot::new(scene.clone() as Arc<dyn Transport>);
        registry.transport.push(slot);
        internal.push(sub);
        for kind in MeteringKind::ALL {
            let (slot, sub) = Slot::new(scene.clone() as Arc<dyn Metering>);
            registry.metering[kind.index()].push(slot);
            internal.push(sub);
        }

        let (slot, sub) = Slot::new(render_subscriber.clone() as Arc<dyn SceneControl>);
        registry.scene_control.push(slot);
        internal.push(sub);
        let (slot, sub) = Slot::new(render_subscriber as Arc<dyn RendererControl>);
        registry.renderer_control.push(slot);
        internal.push(sub);

        let publisher = Self {
            inner: Mutex::new(Inner {
                registry,
                allocator: SourceIdAllocator::new(),
                playback: HashMap::new(),
                unreleased: Vec::new(),
            }),
            scene,
            renderer,
            player,
            store,
            settings,
            _internal: internal,
        };

        {
            let control = publisher.take_control();
            let name = control.publisher.renderer.name().to_string();
            let loudspeakers = control.publisher.renderer.loudspeakers();
            let sample_rate = control.publisher.renderer.sample_rate();
            let (rolling, _) = control.publisher.renderer.transport_state();

            control.renderer_information(|s| s.renderer_name(&name));
            control.renderer_information(|s| s.loudspeakers(&loudspeakers));
            control.scene_control(|s| s.auto_rotate_sources(control.publisher.settings.auto_rotation));
            control.scene_information(|s| s.sample_rate(sample_rate));
            control.scene_information(|s| s.transport_rolling(rolling));
            info!(renderer = %name, outputs = loudspeakers.len(), sample_rate, "Publisher ready");
        }

        publisher
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The Scene cache kept in sync by this Publisher
    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    /// Obtain exclusive control; facts are bundled until the guard drops
    pub fn take_control(&self) -> Control<'_> {
        Control::new(self, self.lock(), None)
    }

    /// Like `take_control`, but `initiator` receives no scene-control facts
    /// caused through this guard
    pub fn take_control_suppressing<T: ?Sized>(&self, initiator: &Arc<T>) -> Control<'_> {
        let address = Arc::as_ptr(initiator) as *const () as usize;
        Control::new(self, self.lock(), Some(address))
    }

    /// Register subscribers; current state is replayed where applicable
    pub fn subscribe(&self) -> Subscribe<'_> {
        let inner = self.lock();
        inner.bundle(|s| s.bundle_start());
        Subscribe {
            publisher: self,
            inner,
        }
    }

    /// Id of the source with the given 1-based number
    pub fn source_id(&self, number: u32) -> Option<SourceId> {
        self.scene.source_id(number)
    }

    /// 1-based number of a source, 0 if unknown
    pub fn source_number(&self, id: &SourceId) -> u32 {
        self.scene.source_number(id)
    }
}

/// Registration helper holding the Publisher lock
pub struct Subscribe<'a> {
    publisher: &'a Publisher,
    inner: MutexGuard<'a, Inner>,
}

impl Subscribe<'_> {
    pub fn bundle(&mut self, subscriber: Arc<dyn BundleEvents>) -> Subscription {
        let (slot, sub) = Slot::new(subscriber);
        self.inner.registry.bundle.push(slot);
        sub
    }

    pub fn scene_control(&mut self, subscriber: Arc<dyn SceneControl>) -> Subscription {
        self.publisher.scene.replay_scene_control(subscriber.as_ref());
        let (slot, sub) = Slot::new(subscriber);
        self.inner.registry.scene_control.push(slot);
        sub
    }

    pub fn scene_information(&mut self, subscriber: Arc<dyn SceneInformation>) -> Subscription {
        self.publisher.scene.replay_scene_information(subscriber.as_ref());
        let (slot, sub) = Slot::new(subscriber);
        self.inner.registry.scene_information.push(slot);
        sub
    }

    pub fn renderer_control(&mut self, subscriber: Arc<dyn RendererControl>) -> Subscription {
        self.publisher.scene.replay_renderer_control(subscriber.as_ref());
        let (slot, sub) = Slot::new(subscriber);
        self.inner.registry.renderer_control.push(slot);
        sub
    }

    pub fn renderer_information(
        &mut self,
        subscriber: Arc<dyn RendererInformation>,
    ) -> Subscription {
        self.publisher.scene.replay_renderer_information(subscriber.as_ref());
        let (slot, sub) = Slot::new(subscriber);
        self.inner.registry.renderer_information.push(slot);
        sub
    }

    pub fn transport(&mut self, subscriber: Arc<dyn Transport>) -> Subscription {
        let (slot, sub) = Slot::new(subscriber);
        self.inner.registry.transport.push(slot);
        sub
    }

    pub fn metering(&mut self, kind: MeteringKind, subscriber: Arc<dyn Metering>) -> Subscription {
        let (slot, sub) = Slot::new(subscriber);
        self.inner.registry.metering[kind.index()].push(slot);
        sub
    }
}

impl Drop for Subscribe<'_> {
    fn drop(&mut self) {
        self.inner.bundle(|s| s.bundle_stop());
    }
}

/// Exclusive access to the Publisher for one logical operation
pub struct Control<'a> {
    publisher: &'a Publisher,
    inner: MutexGuard<'a, Inner>,
    suppress: Option<usize>,
}

impl<'a> Control<'a> {
    fn new(publisher: &'a Publisher, mut inner: MutexGuard<'a, Inner>, suppress: Option<usize>) -> Self {
        inner.registry.purge();
        inner.bundle(|s| s.bundle_start());
        Self {
            publisher,
            inner,
            suppress,
        }
    }

    fn scene(&self) -> &Scene {
        &self.publisher.scene
    }

    fn scene_control(&self, mut f: impl FnMut(&dyn SceneControl)) {
        for subscriber in active(&self.inner.registry.scene_control, self.suppress) {
            f(subscriber);
        }
    }

    fn scene_information(&self, mut f: impl FnMut(&dyn SceneInformation)) {
        for subscriber in active(&self.inner.registry.scene_information, None) {
            f(subscriber);
        }
    }

    fn renderer_control(&self, mut f: impl FnMut(&dyn RendererControl)) {
        for subscriber in active(&self.inner.registry.renderer_control, None) {
            f(subscriber);
        }
    }

    fn renderer_information(&self, mut f: impl FnMut(&dyn RendererInformation)) {
        for subscriber in active(&self.inner.registry.renderer_information, None) {
            f(subscriber);
        }
    }

    fn transport(&self, mut f: impl FnMut(&dyn Transport)) {
        for subscriber in active(&self.inner.registry.transport, None) {
            f(subscriber);
        }
    }

    fn metering(&self, kind: MeteringKind, mut f: impl FnMut(&dyn Metering)) {
        for subscriber in active(&self.inner.registry.metering[kind.index()], None) {
            f(subscriber);
        }
    }

    /// Existing, movable source
    fn check_movable(&self, id: &SourceId) -> Result<()> {
        match self.scene().get_source_fixed(id) {
            None => {
                warn!(%id, "Source does not exist");
                Err(ControlError::UnknownSource(id.clone()))
            }
            Some(true) => {
                warn!(%id, "Source cannot be moved because it is fixed");
                Err(ControlError::SourceFixed(id.clone()))
            }
            Some(false) => Ok(()),
        }
    }

    fn check_exists(&self, id: &SourceId) -> Result<()> {
        if self.scene().contains(id) {
            Ok(())
        } else {
            warn!(%id, "Source does not exist");
            Err(ControlError::UnknownSource(id.clone()))
        }
    }

    fn orient_toward_reference(&self, id: &SourceId) {
        let Some(source) = self.scene().get_source(id) else {
            warn!(%id, "Auto-rotation: source does not exist");
            return;
        };
        let reference = self.scene().get_reference().position;
        let orientation = look_at(source.position(), reference, source.orientation());
        self.scene_control(|s| s.source_orientation(id, orientation));
    }

    fn orient_all_toward_reference(&self) {
        for id in self.scene().source_ids() {
            if self.scene().get_source_fixed(&id) == Some(false) {
                self.orient_toward_reference(&id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Scene control

    pub fn set_auto_rotation(&self, enabled: bool) {
        self.scene_control(|s| s.auto_rotate_sources(enabled));
        if enabled {
            self.orient_all_toward_reference();
            debug!("Auto-rotation of sources enabled");
        } else {
            debug!("Auto-rotation of sources disabled");
        }
    }

    pub fn set_source_position(&self, id: &SourceId, position: Position) -> Result<()> {
        self.check_movable(id)?;
        self.scene_control(|s| s.source_position(id, position));
        if self.scene().get_auto_rotation() {
            self.orient_toward_reference(id);
        }
        Ok(())
    }

    /// Ignored while auto-rotation is enabled
    pub fn set_source_orientation(&self, id: &SourceId, orientation: Orientation) -> Result<()> {
        if self.scene().get_auto_rotation() {
            debug!(%id, "Ignoring source orientation, auto-rotation is enabled");
            return Ok(());
        }
        self.check_movable(id)?;
        self.scene_control(|s| s.source_orientation(id, orientation));
        Ok(())
    }

    /// Linear gain
    pub fn set_source_gain(&self, id: &SourceId, gain: f32) -> Result<()> {
        self.check_exists(id)?;
        self.scene_control(|s| s.source_volume(id, gain));
        Ok(())
    }

    pub fn set_source_mute(&self, id: &SourceId, mute: bool) -> Result<()> {
        self.check_exists(id)?;
        self.scene_control(|s| s.source_mute(id, mute));
        Ok(())
    }

    pub fn set_source_name(&self, id: &SourceId, name: &str) -> Result<()> {
        self.check_exists(id)?;
        self.scene_control(|s| s.source_name(id, name));
        Ok(())
    }

    pub fn set_source_model(&self, id: &SourceId, model: SourceModel) -> Result<()> {
        self.check_exists(id)?;
        self.scene_control(|s| s.source_model(id, model));
        Ok(())
    }

    pub fn set_source_position_fixed(&self, id: &SourceId, fixed: bool) -> Result<()> {
        self.check_exists(id)?;
        self.scene_control(|s| s.source_fixed(id, fixed));
        Ok(())
    }

    pub fn set_source_properties_file(&self, id: &SourceId, file: &str) -> Result<()> {
        self.check_exists(id)?;
        {
            let mut params = self.publisher.renderer.lock();
            if let Some(source) = params.sources.get_mut(id) {
                source.properties_file = file.to_string();
            }
        }
        let property = SourceProperty::PropertiesFile(file.to_string());
        self.scene_information(|s| s.source_property(id, &property));
        Ok(())
    }

    pub fn set_source_port_name(&self, id: &SourceId, port: &str) -> Result<()> {
        self.check_exists(id)?;
        {
            let mut params = self.publisher.renderer.lock();
            if let Some(source) = params.sources.get_mut(id) {
                source.port_name = port.to_string();
            }
        }
        let property = SourceProperty::PortName(port.to_string());
        self.scene_information(|s| s.source_property(id, &property));
        Ok(())
    }

    pub fn set_reference_position(&self, position: Position) {
        self.scene_control(|s| s.reference_position(position));
        if self.scene().get_auto_rotation() {
            self.orient_all_toward_reference();
        }
    }

    pub fn set_reference_orientation(&self, orientation: Orientation) {
        self.scene_control(|s| s.reference_orientation(orientation));
    }

    /// Linear gain
    pub fn set_master_volume(&self, gain: f32) {
        self.scene_control(|s| s.master_volume(gain));
    }

    pub fn set_decay_exponent(&self, exponent: f32) {
        self.scene_control(|s| s.decay_exponent(exponent));
    }

    /// Rejected unless `distance > 1`
    pub fn set_amplitude_reference_distance(&self, distance: f32) -> Result<()> {
        if distance > 1.0 {
            self.scene_control(|s| s.amplitude_reference_distance(distance));
            Ok(())
        } else {
            warn!(distance, "Amplitude reference distance must be greater than 1");
            Err(ControlError::Invalid(format!(
                "amplitude reference distance must be > 1, got {}",
                distance
            )))
        }
    }

    // ------------------------------------------------------------------
    // Renderer control

    pub fn set_processing_state(&self, enabled: bool) {
        self.renderer_control(|s| s.processing(enabled));
    }

    pub fn start_processing(&self) {
        self.set_processing_state(true);
    }

    pub fn stop_processing(&self) {
        self.set_processing_state(false);
    }

    pub fn set_reference_offset_position(&self, position: Position) {
        self.renderer_control(|s| s.reference_offset_position(position));
    }

    pub fn set_reference_offset_orientation(&self, orientation: Orientation) {
        self.renderer_control(|s| s.reference_offset_orientation(orientation));
    }

    // ------------------------------------------------------------------
    // Transport

    pub fn transport_start(&self) {
        self.publisher.renderer.transport_start();
    }

    pub fn transport_stop(&self) {
        self.publisher.renderer.transport_stop();
    }

    pub fn transport_locate_frames(&self, frame: u32) {
        self.publisher.renderer.transport_locate(frame);
    }

    pub fn transport_locate_seconds(&self, seconds: f32) {
        let frames = (seconds.max(0.0) * self.publisher.renderer.sample_rate() as f32) as u32;
        self.transport_locate_frames(frames);
    }

    pub fn reset_tracker(&self) -> Result<()> {
        self.publisher.renderer.reset_tracker().map_err(|e| {
            warn!(error = %e, "Cannot reset tracker");
            ControlError::from(e)
        })
    }

    // ------------------------------------------------------------------
    // Source lifecycle

    /// Create a source; nothing is published if a resource cannot be secured
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub fn new_source(&mut self, request: NewSource) -> Result<SourceId> {
        if let Some(id) = &request.id {
            if !SourceId::is_valid(id.as_str()) {
                warn!(%id, "Invalid source ID");
                return Err(ControlError::Invalid(format!("invalid source ID {:?}", id.as_str())));
            }
            if self.scene().contains(id) {
                warn!(%id, "Source ID already in use");
                return Err(ControlError::Invalid(format!("source ID {:?} already in use", id.as_str())));
            }
        }

        let (port_name, handle) = match &request.origin {
            AudioOrigin::File { path, channel, .. } => {
                if *channel == 0 {
                    return Err(ControlError::Invalid("audio file channel must be >= 1".to_string()));
                }
                let handle = self.publisher.player.acquire(path, *channel).map_err(|e| {
                    warn!(error = %e, "Cannot open audio file");
                    ControlError::from(e)
                })?;
                (handle.port_name.clone(), Some(handle))
            }
            AudioOrigin::Input { port } => {
                if port.is_empty() {
                    return Err(ControlError::Invalid("no audio file or input port given".to_string()));
                }
                // bare numbers refer to system inputs, anything else is a full port name
                let port_name = if port.contains(':') {
                    port.clone()
                } else {
                    format!("{}{}", self.publisher.settings.input_port_prefix, port)
                };
                (port_name, None)
            }
        };

        let id = match &request.id {
            Some(id) => id.clone(),
            None => self.inner.allocator.peek(),
        };

        let input = SourceInput {
            port_name: port_name.clone(),
            properties_file: request.properties_file.clone(),
        };
        if let Err(e) = self.publisher.renderer.add_source(&id, &input) {
            warn!(error = %e, "Renderer refused new source");
            if let Some(handle) = handle {
                self.publisher.player.release(handle);
            }
            return Err(e.into());
        }
        self.inner.allocator.reserve(&id);

        let file_length = handle.as_ref().map(|h| h.file_length).unwrap_or(0);
        if let Some(handle) = handle {
            self.inner.playback.insert(id.clone(), handle);
        }

        self.scene_information(|s| s.new_source(&id));
        let port = SourceProperty::PortName(port_name.clone());
        self.scene_information(|s| s.source_property(&id, &port));
        if let AudioOrigin::File { path, channel, .. } = &request.origin {
            let properties = [
                SourceProperty::AudioFile(path.clone()),
                SourceProperty::AudioFileChannel(*channel),
                SourceProperty::AudioFileLength(file_length),
            ];
            for property in &properties {
                self.scene_information(|s| s.source_property(&id, property));
            }
        }
        let properties_file = SourceProperty::PropertiesFile(request.properties_file.clone());
        self.scene_information(|s| s.source_property(&id, &properties_file));

        self.scene_control(|s| s.source_name(&id, &request.name));
        self.scene_control(|s| s.source_model(&id, request.model));
        self.scene_control(|s| s.source_position(&id, request.position));
        let orientation = if self.scene().get_auto_rotation() && !request.fixed {
            let reference = self.scene().get_reference().position;
            look_at(request.position, reference, request.orientation)
        } else {
            request.orientation
        };
        self.scene_control(|s| s.source_orientation(&id, orientation));
        self.scene_control(|s| s.source_fixed(&id, request.fixed));
        self.scene_control(|s| s.source_volume(&id, request.volume));
        self.scene_control(|s| s.source_mute(&id, request.mute));

        info!(%id, port = %port_name, "Source created");
        Ok(id)
    }

    /// Delete a source; returns false (and publishes nothing) for unknown ids
    pub fn delete_source(&mut self, id: &SourceId) -> bool {
        if !self.scene().contains(id) {
            debug!(%id, "Delete ignored, source does not exist");
            return false;
        }

        self.scene_control(|s| s.delete_source(id));
        let handle = self.inner.playback.remove(id);

        match self.publisher.renderer.sync() {
            Ok(()) => {
                let held = std::mem::take(&mut self.inner.unreleased);
                for handle in held.into_iter().chain(handle) {
                    self.publisher.player.release(handle);
                }
            }
            Err(e) => {
                // released after the next acknowledged cycle
                error!(
                    %id,
                    error = %e,
                    "Deleted source may still be playing, keeping its file open"
                );
                self.inner.unreleased.extend(handle);
            }
        }
        info!(%id, "Source deleted");
        true
    }

    pub fn delete_all_sources(&mut self) {
        while let Some(id) = self.scene().source_id(1) {
            if !self.delete_source(&id) {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Scene files

    /// Replace the scene with the contents of a scene file
    ///
    /// The current scene is left untouched if the file cannot be loaded.
    pub fn load_scene(&mut self, path: &Path) -> Result<()> {
        let document = self.publisher.store.load(path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Loading scene failed");
            ControlError::from(e)
        })?;

        self.delete_all_sources();

        self.set_master_volume(db_to_linear(document.volume_db));
        if let Some(exponent) = document.decay_exponent {
            self.set_decay_exponent(exponent);
        }
        if let Some(distance) = document.amplitude_reference_distance {
            self.set_amplitude_reference_distance(distance)?;
        }
        if let Some(enabled) = document.auto_rotation {
            self.scene_control(|s| s.auto_rotate_sources(enabled));
        }
        self.set_reference_position(document.reference.position);
        self.set_reference_orientation(document.reference.orientation);

        for entry in &document.sources {
            let origin = entry.origin()?;
            let request = NewSource {
                id: entry.id.as_deref().map(|id| SourceId::new(id.to_string())),
                name: entry.name.clone(),
                model: entry.model,
                origin,
                position: entry.position,
                orientation: entry.orientation,
                fixed: entry.fixed,
                volume: db_to_linear(entry.volume_db),
                mute: entry.mute,
                properties_file: entry.properties_file.clone(),
            };
            if let Err(e) = self.new_source(request) {
                warn!(name = %entry.name, error = %e, "Skipping source from scene file");
            }
        }

        info!(path = %path.display(), sources = self.scene().source_count(), "Scene loaded");
        Ok(())
    }

    pub fn save_scene(&self, path: &Path) -> Result<()> {
        let document = SceneDocument::from_state(&self.scene().state());
        self.publisher.store.save(path, &document).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Saving scene failed");
            ControlError::from(e)
        })
    }

    /// The current scene as a scene-file document
    pub fn scene_document(&self) -> Result<String> {
        let document = SceneDocument::from_state(&self.scene().state());
        Ok(self.publisher.store.to_text(&document)?)
    }

    // ------------------------------------------------------------------
    // Metering

    /// Publish one metering snapshot; called by the query loop
    pub fn publish_metering(&self, snapshot: &MeteringSnapshot) {
        self.transport(|s| s.transport_frame(snapshot.frame));
        if snapshot.rolling != self.scene().get_transport_rolling() {
            self.scene_information(|s| s.transport_rolling(snapshot.rolling));
        }
        self.metering(MeteringKind::CpuLoad, |s| s.cpu_load(snapshot.cpu_load));
        self.metering(MeteringKind::MasterLevel, |s| s.master_level(snapshot.master_level));

        if snapshot.discard_sources {
            return;
        }
        for meter in &snapshot.sources {
            let id = SourceId::new(meter.id.clone());
            self.metering(MeteringKind::SourceLevel, |s| s.source_level(&id, meter.level));
            self.metering(MeteringKind::OutputActivity, |s| {
                s.output_activity(&id, &meter.outputs)
            });
        }
    }
}

impl Drop for Control<'_> {
    fn drop(&mut self) {
        self.inner.bundle(|s| s.bundle_stop());
    }
}
