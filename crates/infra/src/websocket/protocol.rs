//! JSON message format of the WebSocket bridge
//!
//! A frame is a JSON array of alternating command names and values, e.g.
//! `["state", {"master-volume": 0.5}, "del-src", ["src-1"]]`.
//!
//! Outbound frames are built by `Bundle`, which collects every fact of one
//! Publisher bundle. Inbound values are decoded by the `parse_*` helpers.

use serde_json::{json, Map, Value};
use soundscape_core::domain::{
    AudioOrigin, ControlError, Loudspeaker, LoudspeakerModel, NewSource, Orientation, Position,
    SourceId, SourceModel,
};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WsError>;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Unable to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON message must be an array")]
    NotAnArray,

    #[error("Expected command/value pairs, not a single {0}")]
    MissingValue(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },

    #[error("Unknown {what}: {name}")]
    Unknown { what: &'static str, name: String },

    #[error("{0}: already subscribed")]
    AlreadySubscribed(Category),

    #[error("{0}: not subscribed")]
    NotSubscribed(Category),

    #[error("{0}")]
    Control(#[from] ControlError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WsError {
    pub fn invalid(what: &'static str, value: &Value) -> Self {
        WsError::InvalidValue {
            what,
            value: value.to_string(),
        }
    }

    /// `["error", message]` frame sent back to the client
    pub fn to_frame(&self) -> String {
        json!(["error", self.to_string()]).to_string()
    }
}

/// Interest categories a connection can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Scene,
    Renderer,
    TransportFrame,
    SourceMetering,
    MasterMetering,
    OutputActivity,
    CpuLoad,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Scene => "scene",
            Category::Renderer => "renderer",
            Category::TransportFrame => "transport-frame",
            Category::SourceMetering => "source-metering",
            Category::MasterMetering => "master-metering",
            Category::OutputActivity => "output-activity",
            Category::CpuLoad => "cpu-load",
        }
    }
}

impl FromStr for Category {
    type Err = WsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scene" => Ok(Category::Scene),
            "renderer" => Ok(Category::Renderer),
            "transport-frame" => Ok(Category::TransportFrame),
            "source-metering" => Ok(Category::SourceMetering),
            "master-metering" => Ok(Category::MasterMetering),
            "output-activity" => Ok(Category::OutputActivity),
            "cpu-load" => Ok(Category::CpuLoad),
            other => Err(WsError::Unknown {
                what: "subscription",
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Outbound
// ============================================================================

pub fn position_value(position: Position) -> Value {
    json!(position.to_array())
}

pub fn rotation_value(orientation: Orientation) -> Value {
    json!(orientation.to_quaternion())
}

pub fn loudspeakers_value(loudspeakers: &[Loudspeaker]) -> Value {
    Value::Array(
        loudspeakers
            .iter()
            .map(|loudspeaker| {
                let mut object = Map::new();
                object.insert("pos".to_string(), position_value(loudspeaker.pose.position));
                object.insert("rot".to_string(), rotation_value(loudspeaker.pose.orientation));
                if loudspeaker.model != LoudspeakerModel::Normal {
                    object.insert("model".to_string(), json!(loudspeaker.model.as_str()));
                }
                Value::Object(object)
            })
            .collect(),
    )
}

/// Facts collected between `bundle_start` and `bundle_stop`
#[derive(Debug, Default)]
pub struct Bundle {
    state: Map<String, Value>,
    new_sources: Map<String, Value>,
    modified_sources: Map<String, Value>,
    deleted_sources: Vec<Value>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A repeated key overwrites the earlier value
    pub fn set_state(&mut self, key: &str, value: Value) {
        self.state.insert(key.to_string(), value);
    }

    pub fn new_source(&mut self, id: &SourceId) {
        self.new_sources
            .insert(id.as_str().to_string(), Value::Object(Map::new()));
    }

    /// Merged into the source's `new-src` entry if it was created in this
    /// bundle, otherwise into `mod-src`
    pub fn set_source(&mut self, id: &SourceId, key: &str, value: Value) {
        let entry = match self.new_sources.get_mut(id.as_str()) {
            Some(entry) => entry,
            None => self
                .modified_sources
                .entry(id.as_str().to_string())
                .or_insert_with(|| Value::Object(Map::new())),
        };
        if let Value::Object(object) = entry {
            object.insert(key.to_string(), value);
        }
    }

    /// A source created in this bundle simply vanishes from it; any other
    /// deletion drops the pending modifications of that id
    pub fn delete_source(&mut self, id: &SourceId) {
        self.modified_sources.remove(id.as_str());
        if self.new_sources.remove(id.as_str()).is_none() {
            self.deleted_sources.push(json!(id.as_str()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
            && self.new_sources.is_empty()
            && self.modified_sources.is_empty()
            && self.deleted_sources.is_empty()
    }

    /// Serialise and reset; `None` when nothing was collected
    pub fn take(&mut self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let Bundle {
            state,
            new_sources,
            modified_sources,
            deleted_sources,
        } = std::mem::take(self);

        let mut commands = Vec::with_capacity(8);
        if !state.is_empty() {
            commands.push(json!("state"));
            commands.push(Value::Object(state));
        }
        // deletions first: an id may be deleted and created again in one bundle
        if !deleted_sources.is_empty() {
            commands.push(json!("del-src"));
            commands.push(Value::Array(deleted_sources));
        }
        if !new_sources.is_empty() {
            commands.push(json!("new-src"));
            commands.push(Value::Object(new_sources));
        }
        if !modified_sources.is_empty() {
            commands.push(json!("mod-src"));
            commands.push(Value::Object(modified_sources));
        }
        Some(Value::Array(commands).to_string())
    }
}

// ============================================================================
// Inbound
// ============================================================================

fn number(value: &Value, what: &'static str) -> Result<f32> {
    value
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| WsError::invalid(what, value))
}

pub fn parse_bool(value: &Value, what: &'static str) -> Result<bool> {
    value.as_bool().ok_or_else(|| WsError::invalid(what, value))
}

pub fn parse_f32(value: &Value, what: &'static str) -> Result<f32> {
    number(value, what)
}

pub fn parse_string<'a>(value: &'a Value, what: &'static str) -> Result<&'a str> {
    value.as_str().ok_or_else(|| WsError::invalid(what, value))
}

/// `[x, y]` or `[x, y, z]`
pub fn parse_position(value: &Value) -> Result<Position> {
    let coordinates = value
        .as_array()
        .filter(|a| a.len() == 2 || a.len() == 3)
        .ok_or_else(|| WsError::invalid("position", value))?;
    let mut xyz = [0.0f32; 3];
    for (slot, coordinate) in xyz.iter_mut().zip(coordinates) {
        *slot = number(coordinate, "position")?;
    }
    Ok(Position::with_z(xyz[0], xyz[1], xyz[2]))
}

/// Quaternion `[x, y, z, w]`
pub fn parse_rotation(value: &Value) -> Result<Orientation> {
    let q = value
        .as_array()
        .filter(|a| a.len() == 4)
        .ok_or_else(|| WsError::invalid("rotation", value))?;
    let mut xyzw = [0.0f32; 4];
    for (slot, component) in xyzw.iter_mut().zip(q) {
        *slot = number(component, "rotation")?;
    }
    Ok(Orientation::from_quaternion(xyzw))
}

pub fn parse_model(value: &Value) -> Result<SourceModel> {
    let name = parse_string(value, "source model")?;
    name.parse().map_err(|_| WsError::Unknown {
        what: "source model",
        name: name.to_string(),
    })
}

/// One object of a `new-src` list
pub fn parse_new_source(value: &Value) -> Result<NewSource> {
    let object = value
        .as_object()
        .ok_or_else(|| WsError::invalid("new source", value))?;

    let mut id = None;
    let mut name = String::new();
    let mut model = SourceModel::Point;
    let mut audio_file = None;
    let mut port_number = None;
    let mut channel = None;
    let mut position = Position::default();
    let mut orientation = Orientation::default();
    let mut fixed = false;
    let mut volume = 1.0;
    let mut mute = false;
    let mut properties_file = String::new();

    for (key, member) in object {
        match key.as_str() {
            "id" => id = Some(SourceId::new(parse_string(member, "source ID")?.to_string())),
            "name" => name = parse_string(member, "source name")?.to_string(),
            "model" => model = parse_model(member)?,
            "audio-file" => audio_file = Some(parse_string(member, "audio file name")?.to_string()),
            "port-number" => {
                port_number = Some(
                    member
                        .as_i64()
                        .ok_or_else(|| WsError::invalid("port number", member))?,
                )
            }
            "channel" => {
                let c = member
                    .as_u64()
                    .filter(|c| *c >= 1 && *c <= u32::MAX as u64)
                    .ok_or_else(|| WsError::invalid("channel number", member))?;
                channel = Some(c as u32);
            }
            "pos" => position = parse_position(member)?,
            "rot" => orientation = parse_rotation(member)?,
            "fixed" => fixed = parse_bool(member, "fixed state")?,
            "volume" => volume = number(member, "volume")?,
            "mute" => mute = parse_bool(member, "mute state")?,
            "properties-file" => {
                properties_file = parse_string(member, "properties file name")?.to_string()
            }
            other => {
                return Err(WsError::Unknown {
                    what: "source property",
                    name: other.to_string(),
                })
            }
        }
    }

    let origin = match (audio_file, port_number, channel) {
        (Some(_), Some(_), _) => {
            return Err(WsError::invalid(
                "new source (both audio-file and port-number)",
                value,
            ))
        }
        (None, Some(_), Some(_)) => {
            return Err(WsError::invalid(
                "new source (both port-number and channel)",
                value,
            ))
        }
        (Some(file), None, channel) => AudioOrigin::file(file, channel.unwrap_or(1)),
        (None, Some(port), None) => AudioOrigin::input(port.to_string()),
        (None, None, _) => {
            return Err(WsError::invalid(
                "new source (audio-file or port-number needed)",
                value,
            ))
        }
    };

    let mut request = NewSource::new(name, origin)
        .with_model(model)
        .at(position)
        .facing(orientation);
    request.id = id;
    request.fixed = fixed;
    request.volume = volume;
    request.mute = mute;
    request.properties_file = properties_file;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundscape_core::domain::DirectionalPoint;

    fn id(s: &str) -> SourceId {
        SourceId::new(s.to_string())
    }

    fn frame(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_empty_bundle_sends_nothing() {
        let mut bundle = Bundle::new();
        assert_eq!(bundle.take(), None);
    }

    #[test]
    fn test_state_keys_overwrite() {
        let mut bundle = Bundle::new();
        bundle.set_state("master-volume", json!(0.5));
        bundle.set_state("master-volume", json!(0.25));

        let text = bundle.take().unwrap();
        assert_eq!(frame(&text), json!(["state", {"master-volume": 0.25}]));
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_modify_only_delta() {
        let mut bundle = Bundle::new();
        bundle.set_source(&id("a"), "mute", json!(true));
        bundle.set_source(&id("a"), "volume", json!(0.5));

        let text = bundle.take().unwrap();
        assert_eq!(
            frame(&text),
            json!(["mod-src", {"a": {"mute": true, "volume": 0.5}}])
        );
    }

    #[test]
    fn test_fields_of_new_source_merge_into_new_src() {
        let mut bundle = Bundle::new();
        bundle.new_source(&id("b"));
        bundle.set_source(&id("b"), "name", json!("tom"));
        bundle.set_source(&id("a"), "mute", json!(false));
        bundle.delete_source(&id("c"));
        bundle.set_state("processing", json!(true));

        let text = bundle.take().unwrap();
        assert_eq!(
            frame(&text),
            json!([
                "state", {"processing": true},
                "del-src", ["c"],
                "new-src", {"b": {"name": "tom"}},
                "mod-src", {"a": {"mute": false}}
            ])
        );
    }

    #[test]
    fn test_recreated_source_is_deleted_first() {
        let mut bundle = Bundle::new();
        bundle.set_source(&id("mic"), "mute", json!(true));
        bundle.delete_source(&id("mic"));
        bundle.new_source(&id("mic"));
        bundle.set_source(&id("mic"), "name", json!("Mic"));

        let text = bundle.take().unwrap();
        assert_eq!(
            frame(&text),
            json!(["del-src", ["mic"], "new-src", {"mic": {"name": "Mic"}}])
        );
    }

    #[test]
    fn test_source_created_and_deleted_in_one_bundle_is_dropped() {
        let mut bundle = Bundle::new();
        bundle.new_source(&id("tmp"));
        bundle.set_source(&id("tmp"), "name", json!("x"));
        bundle.delete_source(&id("tmp"));

        assert_eq!(bundle.take(), None);
    }

    #[test]
    fn test_loudspeakers_value() {
        let speakers = vec![
            Loudspeaker::new(
                DirectionalPoint::new(Position::new(1.0, 0.0), Orientation::new(0.0)),
                LoudspeakerModel::Normal,
            ),
            Loudspeaker::new(DirectionalPoint::default(), LoudspeakerModel::Subwoofer),
        ];
        let value = loudspeakers_value(&speakers);
        assert_eq!(value[0]["pos"], json!([1.0, 0.0, 0.0]));
        assert!(value[0].get("model").is_none());
        assert_eq!(value[1]["model"], json!("subwoofer"));
    }

    #[test]
    fn test_parse_new_source() {
        let request = parse_new_source(&json!({
            "id": "tom",
            "name": "Tom",
            "audio-file": "tom.wav",
            "pos": [0, 1],
            "volume": 0.5
        }))
        .unwrap();
        assert_eq!(request.id, Some(id("tom")));
        assert_eq!(request.origin, AudioOrigin::file("tom.wav", 1));
        assert_eq!(request.position, Position::new(0.0, 1.0));
        assert_eq!(request.volume, 0.5);

        let port = parse_new_source(&json!({"port-number": 3})).unwrap();
        assert_eq!(port.origin, AudioOrigin::input("3"));
    }

    #[test]
    fn test_parse_new_source_origin_rules() {
        assert!(parse_new_source(&json!({"audio-file": "a.wav", "port-number": 1})).is_err());
        assert!(parse_new_source(&json!({"port-number": 1, "channel": 2})).is_err());
        assert!(parse_new_source(&json!({"name": "nothing"})).is_err());
        assert!(parse_new_source(&json!({"audio-file": "a.wav", "channel": 0})).is_err());
        assert!(parse_new_source(&json!({"audio-file": "a.wav", "colour": "red"})).is_err());
    }

    #[test]
    fn test_parse_geometry() {
        assert_eq!(
            parse_position(&json!([1, 2, 3])).unwrap(),
            Position::with_z(1.0, 2.0, 3.0)
        );
        assert!(parse_position(&json!([1])).is_err());
        assert!(parse_position(&json!(["x", 2])).is_err());

        let rot = parse_rotation(&rotation_value(Orientation::new(90.0))).unwrap();
        assert!((rot.azimuth - 90.0).abs() < 1e-3);
        assert!(parse_rotation(&json!([0, 0, 1])).is_err());
    }

    #[test]
    fn test_category_names() {
        for name in [
            "scene",
            "renderer",
            "transport-frame",
            "source-metering",
            "master-metering",
            "output-activity",
            "cpu-load",
        ] {
            assert_eq!(name.parse::<Category>().unwrap().as_str(), name);
        }
        assert!("gossip".parse::<Category>().is_err());
    }

    #[test]
    fn test_error_frame() {
        let error = WsError::AlreadySubscribed(Category::Scene);
        assert_eq!(frame(&error.to_frame()), json!(["error", "scene: already subscribed"]));
    }
}
