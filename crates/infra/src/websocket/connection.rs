//! One WebSocket client: a Publisher subscriber plus a command interpreter
//!
//! Outbound facts are collected in a `Bundle` and flushed as one text frame
//! on `bundle_stop`. The frame goes onto an unbounded channel drained by the
//! socket's writer task, so a slow client never stalls a fan-out.
//!
//! Inbound frames are interpreted by `handle_text`, which may block on the
//! Publisher and must therefore run off the async executor.

use crate::websocket::protocol::{
    loudspeakers_value, parse_bool, parse_f32, parse_model, parse_new_source, parse_position,
    parse_rotation, parse_string, position_value, rotation_value, Bundle, Category, Result,
    WsError,
};
use serde_json::{json, Value};
use soundscape_core::domain::{
    BundleEvents, Control, Loudspeaker, Metering, MeteringKind, Orientation, Position, Publisher,
    RendererControl, RendererInformation, SceneControl, SceneInformation, SourceId, SourceModel,
    SourceProperty, Subscription, Transport,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

pub struct Connection {
    peer: String,
    publisher: Arc<Publisher>,
    bundle: Mutex<Bundle>,
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,
    subscriptions: Mutex<HashMap<Category, Vec<Subscription>>>,
    bundle_subscription: Mutex<Option<Subscription>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Create the connection and subscribe it to bundle boundaries
    pub fn open(
        publisher: Arc<Publisher>,
        peer: impl Into<String>,
        outbox: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            peer: peer.into(),
            publisher,
            bundle: Mutex::new(Bundle::new()),
            outbox: Mutex::new(Some(outbox)),
            subscriptions: Mutex::new(HashMap::new()),
            bundle_subscription: Mutex::new(None),
        });
        let subscription = connection
            .publisher
            .subscribe()
            .bundle(connection.clone());
        *lock(&connection.bundle_subscription) = Some(subscription);
        info!(peer = %connection.peer, "WebSocket connection opened");
        connection
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_subscribed(&self, category: Category) -> bool {
        lock(&self.subscriptions).contains_key(&category)
    }

    /// Drop every subscription and the outbound channel
    pub fn close(&self) {
        lock(&self.subscriptions).clear();
        lock(&self.bundle_subscription).take();
        lock(&self.outbox).take();
        info!(peer = %self.peer, "WebSocket connection closed");
    }

    /// Queue a text frame for the client
    pub fn send(&self, text: String) {
        trace!(peer = %self.peer, %text, "WebSocket out");
        if let Some(outbox) = lock(&self.outbox).as_ref() {
            if outbox.send(text).is_err() {
                debug!(peer = %self.peer, "WebSocket writer gone, frame dropped");
            }
        }
    }

    pub fn send_error(&self, error: &WsError) {
        self.send(error.to_frame());
    }

    fn state(&self, key: &str, value: Value) {
        lock(&self.bundle).set_state(key, value);
    }

    fn source(&self, id: &SourceId, key: &str, value: Value) {
        lock(&self.bundle).set_source(id, key, value);
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Interpret one text frame; returns the errors to report
    ///
    /// Commands of one frame share a control guard, so their facts arrive as
    /// one bundle. A failing command stops at the failing field; the
    /// following commands still run.
    pub fn handle_text(self: &Arc<Self>, text: &str) -> Vec<WsError> {
        trace!(peer = %self.peer, %text, "WebSocket in");
        let mut errors: Vec<WsError> = Vec::new();
        let commands: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                errors.push(e.into());
                return errors;
            }
        };
        let Value::Array(commands) = commands else {
            errors.push(WsError::NotAnArray);
            return errors;
        };

        let mut control: Option<Control<'_>> = None;
        for pair in commands.chunks(2) {
            let [command, value] = pair else {
                errors.push(WsError::MissingValue(pair[0].to_string()));
                break;
            };
            let Some(command) = command.as_str() else {
                errors.push(WsError::UnknownCommand(command.to_string()));
                continue;
            };

            let result = match command {
                "subscribe" | "unsubscribe" => {
                    // registration needs the Publisher lock
                    control = None;
                    self.change_subscriptions(command == "subscribe", value, &mut errors)
                }
                "state" | "new-src" | "mod-src" | "del-src" | "load-scene" | "save-scene" => {
                    let control = control.get_or_insert_with(|| self.publisher.take_control());
                    run(control, command, value)
                }
                other => Err(WsError::UnknownCommand(other.to_string())),
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }
        errors
    }

    fn change_subscriptions(
        self: &Arc<Self>,
        subscribe: bool,
        value: &Value,
        errors: &mut Vec<WsError>,
    ) -> Result<()> {
        let names = value
            .as_array()
            .ok_or_else(|| WsError::invalid("subscription list", value))?;
        let mut categories = Vec::with_capacity(names.len());
        for name in names {
            categories.push(parse_string(name, "subscription")?.parse::<Category>()?);
        }

        if !subscribe {
            let mut subscriptions = lock(&self.subscriptions);
            for category in categories {
                match subscriptions.remove(&category) {
                    Some(_) => debug!(peer = %self.peer, %category, "Unsubscribed"),
                    None => errors.push(WsError::NotSubscribed(category)),
                }
            }
            return Ok(());
        }

        let fresh: Vec<Category> = categories
            .into_iter()
            .filter(|category| {
                let known = self.is_subscribed(*category);
                if known {
                    errors.push(WsError::AlreadySubscribed(*category));
                }
                !known
            })
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        // one Subscribe helper: all replays arrive as one bundle
        let mut registration = self.publisher.subscribe();
        let mut added = Vec::with_capacity(fresh.len());
        for category in fresh {
            let subscriptions = match category {
                // information first, so replayed sources are new before their fields
                Category::Scene => vec![
                    registration.scene_information(self.clone()),
                    registration.scene_control(self.clone()),
                ],
                Category::Renderer => vec![
                    registration.renderer_information(self.clone()),
                    registration.renderer_control(self.clone()),
                ],
                Category::TransportFrame => vec![registration.transport(self.clone())],
                Category::SourceMetering => {
                    vec![registration.metering(MeteringKind::SourceLevel, self.clone())]
                }
                Category::MasterMetering => {
                    vec![registration.metering(MeteringKind::MasterLevel, self.clone())]
                }
                Category::OutputActivity => {
                    vec![registration.metering(MeteringKind::OutputActivity, self.clone())]
                }
                Category::CpuLoad => vec![registration.metering(MeteringKind::CpuLoad, self.clone())],
            };
            debug!(peer = %self.peer, %category, "Subscribed");
            added.push((category, subscriptions));
        }
        lock(&self.subscriptions).extend(added);
        drop(registration);
        Ok(())
    }
}

fn run(control: &mut Control<'_>, command: &str, value: &Value) -> Result<()> {
    match command {
        "state" => {
            let members = value
                .as_object()
                .ok_or_else(|| WsError::invalid("state object", value))?;
            for (key, member) in members {
                apply_state(control, key, member)?;
            }
        }
        "new-src" => {
            let sources = value
                .as_array()
                .ok_or_else(|| WsError::invalid("list of new sources", value))?;
            for source in sources {
                let request = parse_new_source(source)?;
                control.new_source(request)?;
            }
        }
        "mod-src" => {
            let sources = value
                .as_object()
                .ok_or_else(|| WsError::invalid("source modifications", value))?;
            for (id, changes) in sources {
                let id = SourceId::new(id.clone());
                let changes = changes
                    .as_object()
                    .ok_or_else(|| WsError::invalid("source object", changes))?;
                for (key, member) in changes {
                    modify_source(control, &id, key, member)?;
                }
            }
        }
        "del-src" => {
            let ids = value
                .as_array()
                .ok_or_else(|| WsError::invalid("list of source IDs", value))?;
            for id in ids {
                let id = SourceId::new(parse_string(id, "source ID")?.to_string());
                control.delete_source(&id);
            }
        }
        "load-scene" => {
            let path = parse_string(value, "scene file name")?;
            control.load_scene(Path::new(path))?;
        }
        "save-scene" => {
            let path = parse_string(value, "scene file name")?;
            control.save_scene(Path::new(path))?;
        }
        other => return Err(WsError::UnknownCommand(other.to_string())),
    }
    Ok(())
}

fn apply_state(control: &mut Control<'_>, key: &str, value: &Value) -> Result<()> {
    match key {
        "auto-rotate-sources" => control.set_auto_rotation(parse_bool(value, "auto-rotate state")?),
        "ref-pos" => control.set_reference_position(parse_position(value)?),
        "ref-rot" => control.set_reference_orientation(parse_rotation(value)?),
        "master-volume" => control.set_master_volume(parse_f32(value, "master volume")?),
        "decay-exponent" => control.set_decay_exponent(parse_f32(value, "decay exponent")?),
        "amplitude-reference-distance" => control
            .set_amplitude_reference_distance(parse_f32(value, "amplitude reference distance")?)?,
        "processing" => control.set_processing_state(parse_bool(value, "processing state")?),
        "ref-pos-offset" => control.set_reference_offset_position(parse_position(value)?),
        "ref-rot-offset" => control.set_reference_offset_orientation(parse_rotation(value)?),
        "transport-rolling" => {
            if parse_bool(value, "transport state")? {
                control.transport_start();
            } else {
                control.transport_stop();
            }
        }
        "frame" => {
            let frame = value
                .as_u64()
                .filter(|f| *f <= u32::MAX as u64)
                .ok_or_else(|| WsError::invalid("frame", value))?;
            control.transport_locate_frames(frame as u32);
        }
        "tracker" => match value.as_str() {
            Some("reset") => control.reset_tracker()?,
            _ => return Err(WsError::invalid("tracker command", value)),
        },
        other => {
            return Err(WsError::Unknown {
                what: "state property",
                name: other.to_string(),
            })
        }
    }
    Ok(())
}

fn modify_source(control: &mut Control<'_>, id: &SourceId, key: &str, value: &Value) -> Result<()> {
    match key {
        "pos" => control.set_source_position(id, parse_position(value)?)?,
        "rot" => control.set_source_orientation(id, parse_rotation(value)?)?,
        "volume" => control.set_source_gain(id, parse_f32(value, "volume")?)?,
        "mute" => control.set_source_mute(id, parse_bool(value, "mute state")?)?,
        "name" => control.set_source_name(id, parse_string(value, "source name")?)?,
        "model" => control.set_source_model(id, parse_model(value)?)?,
        "fixed" => control.set_source_position_fixed(id, parse_bool(value, "fixed state")?)?,
        other => {
            return Err(WsError::Unknown {
                what: "source property",
                name: other.to_string(),
            })
        }
    }
    Ok(())
}

// ============================================================================
// Outbound
// ============================================================================

impl BundleEvents for Connection {
    fn bundle_start(&self) {}

    fn bundle_stop(&self) {
        let text = lock(&self.bundle).take();
        if let Some(text) = text {
            self.send(text);
        }
    }
}

impl SceneControl for Connection {
    fn auto_rotate_sources(&self, enabled: bool) {
        self.state("auto-rotate-sources", json!(enabled));
    }

    fn delete_source(&self, id: &SourceId) {
        lock(&self.bundle).delete_source(id);
    }

    fn source_position(&self, id: &SourceId, position: Position) {
        self.source(id, "pos", position_value(position));
    }

    fn source_orientation(&self, id: &SourceId, orientation: Orientation) {
        self.source(id, "rot", rotation_value(orientation));
    }

    fn source_volume(&self, id: &SourceId, gain: f32) {
        self.source(id, "volume", json!(gain));
    }

    fn source_mute(&self, id: &SourceId, mute: bool) {
        self.source(id, "mute", json!(mute));
    }

    fn source_name(&self, id: &SourceId, name: &str) {
        self.source(id, "name", json!(name));
    }

    fn source_model(&self, id: &SourceId, model: SourceModel) {
        self.source(id, "model", json!(model.as_str()));
    }

    fn source_fixed(&self, id: &SourceId, fixed: bool) {
        self.source(id, "fixed", json!(fixed));
    }

    fn reference_position(&self, position: Position) {
        self.state("ref-pos", position_value(position));
    }

    fn reference_orientation(&self, orientation: Orientation) {
        self.state("ref-rot", rotation_value(orientation));
    }

    fn master_volume(&self, gain: f32) {
        self.state("master-volume", json!(gain));
    }

    fn decay_exponent(&self, exponent: f32) {
        self.state("decay-exponent", json!(exponent));
    }

    fn amplitude_reference_distance(&self, distance: f32) {
        self.state("amplitude-reference-distance", json!(distance));
    }
}

impl SceneInformation for Connection {
    fn sample_rate(&self, rate: u32) {
        self.state("sample-rate", json!(rate));
    }

    fn new_source(&self, id: &SourceId) {
        lock(&self.bundle).new_source(id);
    }

    fn source_property(&self, id: &SourceId, property: &SourceProperty) {
        let value = match property {
            SourceProperty::AudioFile(path) => json!(path.display().to_string()),
            SourceProperty::AudioFileChannel(channel) => json!(channel),
            SourceProperty::AudioFileLength(length) => json!(length),
            SourceProperty::PortName(port) => json!(port),
            SourceProperty::PropertiesFile(file) => json!(file),
        };
        self.source(id, property.key(), value);
    }

    fn transport_rolling(&self, rolling: bool) {
        self.state("transport-rolling", json!(rolling));
    }
}

impl RendererControl for Connection {
    fn processing(&self, enabled: bool) {
        self.state("processing", json!(enabled));
    }

    fn reference_offset_position(&self, position: Position) {
        self.state("ref-pos-offset", position_value(position));
    }

    fn reference_offset_orientation(&self, orientation: Orientation) {
        self.state("ref-rot-offset", rotation_value(orientation));
    }
}

impl RendererInformation for Connection {
    fn renderer_name(&self, name: &str) {
        self.state("renderer-name", json!(name));
    }

    fn loudspeakers(&self, loudspeakers: &[Loudspeaker]) {
        self.state("loudspeakers", loudspeakers_value(loudspeakers));
    }
}

impl Transport for Connection {
    fn transport_frame(&self, frame: u32) {
        self.state("frame", json!(frame));
    }
}

impl Metering for Connection {
    fn source_level(&self, id: &SourceId, level: f32) {
        self.source(id, "level", json!(level));
    }

    fn master_level(&self, level: f32) {
        self.state("master-level", json!(level));
    }

    fn output_activity(&self, id: &SourceId, activity: &[f32]) {
        if !activity.is_empty() {
            self.source(id, "output-activity", json!(activity));
        }
    }

    fn cpu_load(&self, load: f32) {
        self.state("cpu", json!(load));
    }
}
