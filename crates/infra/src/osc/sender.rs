//! Subscriber turning published facts into OSC packets
//!
//! Packets are queued on an unbounded channel and sent by the handler's send
//! task, so a slow or unreachable peer never stalls a Publisher fan-out.
//! Each packet carries a `PacketClass` so the send task can route it by the
//! peers' message levels.
//!
//! A new source is announced with a single `/source/new` message. The facts
//! that make up a source arrive as separate callbacks, so they are collected
//! in a `SourceBuilder` until every mandatory field has been seen.

use crate::osc::codec::{OscMessage, OscType};
use crate::osc::ordinal::OrdinalTable;
use soundscape_core::domain::{
    linear_to_db, Loudspeaker, Metering, Orientation, Position, RendererControl,
    RendererInformation, SceneControl, SceneInformation, SourceId, SourceModel, SourceProperty,
    Transport,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Which side of the OSC link this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Authoritative; mirrors facts to every client
    Server,
    /// Follows a server; mirrors local facts upstream as `/update/*`
    Client,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::Server => "",
            Role::Client => "/update",
        }
    }
}

/// Routing class of an outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// Scene, renderer and transport state changes
    Scene,
    /// Transport frame and levels, sent every query interval
    Metering,
}

/// An encoded packet waiting for the send task
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub class: PacketClass,
    pub bytes: Vec<u8>,
}

/// Fields collected for a source that has not been announced yet
#[derive(Debug, Default, Clone)]
pub struct SourceBuilder {
    name: Option<String>,
    model: Option<SourceModel>,
    port: Option<String>,
    file: Option<PathBuf>,
    channel: Option<u32>,
    position: Option<Position>,
    orientation: Option<Orientation>,
    fixed: Option<bool>,
    volume: Option<f32>,
    mute: Option<bool>,
    properties_file: Option<String>,
}

impl SourceBuilder {
    /// Every mandatory field has been observed
    pub fn is_complete(&self) -> bool {
        self.name.is_some()
            && self.model.is_some()
            && (self.port.is_some() || self.file.is_some())
            && self.position.is_some()
            && self.orientation.is_some()
            && self.fixed.is_some()
            && self.volume.is_some()
            && self.mute.is_some()
            && self.properties_file.is_some()
    }

    /// `/source/new` with layout `i s s s i f f T|F f T|F f T|F s`
    fn to_message(&self, path: String, ordinal: i32) -> OscMessage {
        let (file_or_port, channel) = match &self.file {
            Some(file) => (file.display().to_string(), self.channel.unwrap_or(1) as i32),
            None => (self.port.clone().unwrap_or_default(), 0),
        };
        let position = self.position.unwrap_or_default();
        let fixed = self.fixed.unwrap_or(false);
        OscMessage::new(
            path,
            vec![
                ordinal.into(),
                self.name.clone().unwrap_or_default().into(),
                self.model.unwrap_or_default().as_str().into(),
                file_or_port.into(),
                channel.into(),
                position.x.into(),
                position.y.into(),
                fixed.into(),
                self.orientation.unwrap_or_default().azimuth.into(),
                fixed.into(),
                self.volume.unwrap_or(1.0).into(),
                self.mute.unwrap_or(false).into(),
                self.properties_file.clone().unwrap_or_default().into(),
            ],
        )
    }
}

pub struct OscSender {
    role: Role,
    ordinals: Arc<Mutex<OrdinalTable>>,
    staged: Mutex<HashMap<SourceId, SourceBuilder>>,
    outbox: mpsc::UnboundedSender<Packet>,
    trace_messages: bool,
}

impl OscSender {
    pub fn new(
        role: Role,
        ordinals: Arc<Mutex<OrdinalTable>>,
        outbox: mpsc::UnboundedSender<Packet>,
        trace_messages: bool,
    ) -> Self {
        Self {
            role,
            ordinals,
            staged: Mutex::new(HashMap::new()),
            outbox,
            trace_messages,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Stop staging `id`; its creation is known to the peer already
    pub fn forget_staged(&self, id: &SourceId) {
        self.staged().remove(id);
    }

    fn ordinals(&self) -> MutexGuard<'_, OrdinalTable> {
        self.ordinals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn staged(&self) -> MutexGuard<'_, HashMap<SourceId, SourceBuilder>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self, path: &str) -> String {
        format!("{}{}", self.role.prefix(), path)
    }

    fn send(&self, message: OscMessage) {
        self.send_classed(PacketClass::Scene, message);
    }

    fn send_classed(&self, class: PacketClass, message: OscMessage) {
        if self.trace_messages {
            debug!(path = %message.path, tags = %message.tags(), ?class, "OSC out");
        } else {
            trace!(path = %message.path, tags = %message.tags(), ?class, "OSC out");
        }
        let packet = Packet {
            class,
            bytes: message.encode(),
        };
        if self.outbox.send(packet).is_err() {
            trace!("OSC send task gone, message dropped");
        }
    }

    fn send_path(&self, path: &str, args: Vec<OscType>) {
        self.send(OscMessage::new(self.path(path), args));
    }

    fn send_metering(&self, path: &str, args: Vec<OscType>) {
        self.send_classed(PacketClass::Metering, OscMessage::new(self.path(path), args));
    }

    fn ordinal(&self, id: &SourceId) -> Option<i32> {
        let ordinal = self.ordinals().ordinal(id);
        if ordinal.is_none() {
            trace!(%id, "No OSC ordinal for source");
        }
        ordinal.map(|o| o as i32)
    }

    /// Stage a field of an unannounced source, or send it right away
    fn source_field(
        &self,
        id: &SourceId,
        stage: impl FnOnce(&mut SourceBuilder),
        path: &str,
        args: impl FnOnce(i32) -> Vec<OscType>,
    ) {
        {
            let mut staged = self.staged();
            if let Some(builder) = staged.get_mut(id) {
                stage(builder);
                if builder.is_complete() {
                    let builder = staged.remove(id).unwrap_or_default();
                    drop(staged);
                    if let Some(ordinal) = self.ordinal(id) {
                        self.send(builder.to_message(self.path("/source/new"), ordinal));
                    }
                }
                return;
            }
        }
        if let Some(ordinal) = self.ordinal(id) {
            self.send_path(path, args(ordinal));
        }
    }
}

impl SceneControl for OscSender {
    fn auto_rotate_sources(&self, enabled: bool) {
        self.send_path("/scene/auto_rotate", vec![enabled.into()]);
    }

    fn delete_source(&self, id: &SourceId) {
        let was_staged = self.staged().remove(id).is_some();
        let ordinal = self.ordinals().retire(id);
        if let (false, Some(ordinal)) = (was_staged, ordinal) {
            self.send_path("/source/delete", vec![(ordinal as i32).into()]);
        }
    }

    fn source_position(&self, id: &SourceId, position: Position) {
        self.source_field(
            id,
            |b| b.position = Some(position),
            "/source/position",
            |o| vec![o.into(), position.x.into(), position.y.into()],
        );
    }

    fn source_orientation(&self, id: &SourceId, orientation: Orientation) {
        self.source_field(
            id,
            |b| b.orientation = Some(orientation),
            "/source/orientation",
            |o| vec![o.into(), orientation.azimuth.into()],
        );
    }

    fn source_volume(&self, id: &SourceId, gain: f32) {
        self.source_field(
            id,
            |b| b.volume = Some(gain),
            "/source/volume",
            |o| vec![o.into(), linear_to_db(gain).into()],
        );
    }

    fn source_mute(&self, id: &SourceId, mute: bool) {
        self.source_field(
            id,
            |b| b.mute = Some(mute),
            "/source/mute",
            |o| vec![o.into(), mute.into()],
        );
    }

    fn source_name(&self, id: &SourceId, name: &str) {
        self.source_field(
            id,
            |b| b.name = Some(name.to_string()),
            "/source/name",
            |o| vec![o.into(), name.into()],
        );
    }

    fn source_model(&self, id: &SourceId, model: SourceModel) {
        self.source_field(
            id,
            |b| b.model = Some(model),
            "/source/model",
            |o| vec![o.into(), model.as_str().into()],
        );
    }

    fn source_fixed(&self, id: &SourceId, fixed: bool) {
        self.source_field(
            id,
            |b| b.fixed = Some(fixed),
            "/source/position_fixed",
            |o| vec![o.into(), fixed.into()],
        );
    }

    fn reference_position(&self, position: Position) {
        self.send_path("/reference/position", vec![position.x.into(), position.y.into()]);
    }

    fn reference_orientation(&self, orientation: Orientation) {
        self.send_path("/reference/orientation", vec![orientation.azimuth.into()]);
    }

    fn master_volume(&self, gain: f32) {
        self.send_path("/scene/volume", vec![linear_to_db(gain).into()]);
    }

    fn decay_exponent(&self, exponent: f32) {
        self.send_path("/scene/decay_exponent", vec![exponent.into()]);
    }

    fn amplitude_reference_distance(&self, distance: f32) {
        self.send_path("/scene/amplitude_reference_distance", vec![distance.into()]);
    }
}

impl SceneInformation for OscSender {
    fn sample_rate(&self, rate: u32) {
        self.send_path("/scene/sample_rate", vec![(rate as i32).into()]);
    }

    fn new_source(&self, id: &SourceId) {
        let ordinal = self.ordinals().assign(id);
        debug!(%id, ordinal, "Staging new source for OSC");
        self.staged().insert(id.clone(), SourceBuilder::default());
    }

    fn source_property(&self, id: &SourceId, property: &SourceProperty) {
        match property {
            SourceProperty::PortName(port) => self.source_field(
                id,
                |b| b.port = Some(port.clone()),
                "/source/port_name",
                |o| vec![o.into(), port.as_str().into()],
            ),
            SourceProperty::AudioFile(path) => self.source_field(
                id,
                |b| b.file = Some(path.clone()),
                "/source/file_name",
                |o| vec![o.into(), path.display().to_string().into()],
            ),
            SourceProperty::AudioFileChannel(channel) => self.source_field(
                id,
                |b| b.channel = Some(*channel),
                "/source/file_channel",
                |o| vec![o.into(), (*channel as i32).into()],
            ),
            SourceProperty::AudioFileLength(length) => self.source_field(
                id,
                |_| {},
                "/source/length",
                |o| vec![o.into(), ((*length).min(i32::MAX as u64) as i32).into()],
            ),
            SourceProperty::PropertiesFile(file) => self.source_field(
                id,
                |b| b.properties_file = Some(file.clone()),
                "/source/file",
                |o| vec![o.into(), file.as_str().into()],
            ),
        }
    }

    fn transport_rolling(&self, rolling: bool) {
        self.send_path("/transport/state", vec![rolling.into()]);
    }
}

impl RendererControl for OscSender {
    fn processing(&self, enabled: bool) {
        self.send_path("/processing/state", vec![enabled.into()]);
    }

    fn reference_offset_position(&self, position: Position) {
        self.send_path(
            "/reference_offset/position",
            vec![position.x.into(), position.y.into()],
        );
    }

    fn reference_offset_orientation(&self, orientation: Orientation) {
        self.send_path("/reference_offset/orientation", vec![orientation.azimuth.into()]);
    }
}

impl RendererInformation for OscSender {
    fn renderer_name(&self, name: &str) {
        self.send_path("/renderer/name", vec![name.into()]);
    }

    fn loudspeakers(&self, loudspeakers: &[Loudspeaker]) {
        trace!(count = loudspeakers.len(), "Loudspeakers are not sent over OSC");
    }
}

impl Transport for OscSender {
    fn transport_frame(&self, frame: u32) {
        self.send_metering("/transport/frame", vec![(frame.min(i32::MAX as u32) as i32).into()]);
    }
}

impl Metering for OscSender {
    fn source_level(&self, id: &SourceId, level: f32) {
        if let Some(ordinal) = self.ordinal(id) {
            self.send_metering("/source/level", vec![ordinal.into(), level.into()]);
        }
    }

    fn master_level(&self, level: f32) {
        self.send_metering("/scene/level", vec![level.into()]);
    }

    fn cpu_load(&self, load: f32) {
        self.send_metering("/scene/cpu_load", vec![load.into()]);
    }
}
