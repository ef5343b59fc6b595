//! Subscriber that mirrors published facts into the real-time engine
//!
//! Every callback takes the renderer's own scoped lock for a single write.
//! The engine's source set can briefly lag the Scene during creation and
//! deletion, so unknown ids are reported as `RenderError::UnknownSource`
//! instead of being treated as a fault.

use crate::domain::geometry::{Orientation, Position};
use crate::domain::renderer::{RenderError, RenderSource, Renderer, Result};
use crate::domain::source::{SourceId, SourceModel};
use crate::domain::subscriber::{RendererControl, SceneControl};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RenderSubscriber {
    renderer: Arc<dyn Renderer>,
}

impl RenderSubscriber {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self { renderer }
    }

    /// Apply `f` to a source's engine parameters
    pub fn try_update_source(
        &self,
        id: &SourceId,
        f: impl FnOnce(&mut RenderSource),
    ) -> Result<()> {
        let mut params = self.renderer.lock();
        let source = params
            .sources
            .get_mut(id)
            .ok_or_else(|| RenderError::UnknownSource(id.clone()))?;
        f(source);
        Ok(())
    }

    fn update_source(&self, id: &SourceId, f: impl FnOnce(&mut RenderSource)) {
        if let Err(e) = self.try_update_source(id, f) {
            warn!(error = %e, "RenderSubscriber: update ignored");
        }
    }
}

impl SceneControl for RenderSubscriber {
    fn auto_rotate_sources(&self, _enabled: bool) {
        // orientation updates arrive as separate facts
    }

    fn delete_source(&self, id: &SourceId) {
        match self.renderer.remove_source(id) {
            Ok(()) => debug!(%id, "Source removed from renderer"),
            Err(e) => warn!(error = %e, "RenderSubscriber: remove failed"),
        }
    }

    fn source_position(&self, id: &SourceId, position: Position) {
        self.update_source(id, |s| s.pose.position = position);
    }

    fn source_orientation(&self, id: &SourceId, orientation: Orientation) {
        self.update_source(id, |s| s.pose.orientation = orientation);
    }

    fn source_volume(&self, id: &SourceId, gain: f32) {
        self.update_source(id, |s| s.gain = gain);
    }

    fn source_mute(&self, id: &SourceId, mute: bool) {
        self.update_source(id, |s| s.mute = mute);
    }

    fn source_name(&self, _id: &SourceId, _name: &str) {}

    fn source_model(&self, id: &SourceId, model: SourceModel) {
        self.update_source(id, |s| s.model = model);
    }

    fn source_fixed(&self, _id: &SourceId, _fixed: bool) {}

    fn reference_position(&self, position: Position) {
        self.renderer.lock().reference.position = position;
    }

    fn reference_orientation(&self, orientation: Orientation) {
        self.renderer.lock().reference.orientation = orientation;
    }

    fn master_volume(&self, gain: f32) {
        self.renderer.lock().master_volume = gain;
    }

    fn decay_exponent(&self, exponent: f32) {
        self.renderer.lock().decay_exponent = exponent;
    }

    fn amplitude_reference_distance(&self, distance: f32) {
        self.renderer.lock().amplitude_reference_distance = distance;
    }
}

impl RendererControl for RenderSubscriber {
    fn processing(&self, enabled: bool) {
        self.renderer.lock().processing = enabled;
    }

    fn reference_offset_position(&self, position: Position) {
        self.renderer.lock().reference_offset.position = position;
    }

    fn reference_offset_orientation(&self, orientation: Orientation) {
        self.renderer.lock().reference_offset.orientation = orientation;
    }
}
