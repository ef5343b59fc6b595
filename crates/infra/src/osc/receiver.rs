//! Inbound OSC commands
//!
//! Decoding is pure: `OscCommand::parse` turns a message into a command or
//! an `OscError` without touching any state. `OscReceiver::apply` then runs
//! the command against the Publisher. Applying may block (deleting a source
//! waits for the audio thread), so the handler calls it from a blocking task.

use crate::osc::codec::{OscError, OscMessage, Result};
use crate::osc::ordinal::OrdinalTable;
use crate::osc::sender::{OscSender, Role};
use soundscape_core::domain::{
    db_to_linear, AudioOrigin, Control, ControlError, MessageLevel, NewSource, Orientation,
    Position, Publisher, SourceId, SourceModel,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum OscCommand {
    SourcePosition(u32, Position),
    SourceFixed(u32, bool),
    SourceOrientation(u32, Orientation),
    /// dB
    SourceVolume(u32, f32),
    SourceMute(u32, bool),
    SourceName(u32, String),
    SourceModel(u32, SourceModel),
    SourcePropertiesFile(u32, String),
    SourcePortName(u32, String),
    /// Ordinal is only present in the form sent by a server
    NewSource(Option<u32>, NewSource),
    /// 0 deletes every source
    DeleteSource(u32),
    ReferencePosition(Position),
    ReferenceOrientation(Orientation),
    ReferenceOffsetPosition(Position),
    ReferenceOffsetOrientation(Orientation),
    /// dB
    MasterVolume(f32),
    SaveScene(PathBuf),
    LoadScene(PathBuf),
    ClearScene,
    AutoRotate(bool),
    DecayExponent(f32),
    AmplitudeReferenceDistance(f32),
    Processing(bool),
    Transport(bool),
    Rewind,
    /// Seconds
    Seek(f32),
    ResetTracker,
    Poll,
    Alive,
    /// A client chose what it wants to receive
    MessageLevel(MessageLevel),
    /// Upstream mirror sent by a client
    Update(String),
}

impl OscCommand {
    pub fn parse(message: &OscMessage) -> Result<Self> {
        if message.path.starts_with("/update/") {
            return Ok(OscCommand::Update(message.path.clone()));
        }

        let tags = message.tags();
        let m = message;
        let command = match (m.path.as_str(), bool_tags(&tags).as_str()) {
            ("/source/position", "iff") => OscCommand::SourcePosition(
                ordinal(m, 0)?,
                Position::new(m.float(1)?, m.float(2)?),
            ),
            ("/source/position_fixed", "ib") => OscCommand::SourceFixed(ordinal(m, 0)?, m.bool(1)?),
            ("/source/orientation", "if") => {
                OscCommand::SourceOrientation(ordinal(m, 0)?, Orientation::new(m.float(1)?))
            }
            ("/source/volume", "if") => OscCommand::SourceVolume(ordinal(m, 0)?, m.float(1)?),
            ("/source/mute", "ib") => OscCommand::SourceMute(ordinal(m, 0)?, m.bool(1)?),
            ("/source/name", "is") => OscCommand::SourceName(ordinal(m, 0)?, m.string(1)?.to_string()),
            ("/source/model", "is") => OscCommand::SourceModel(ordinal(m, 0)?, model(m, 1)?),
            ("/source/file", "is") => {
                OscCommand::SourcePropertiesFile(ordinal(m, 0)?, m.string(1)?.to_string())
            }
            ("/source/port_name", "is") => {
                OscCommand::SourcePortName(ordinal(m, 0)?, m.string(1)?.to_string())
            }
            ("/source/new", "isssiffbfbfbs") => {
                OscCommand::NewSource(Some(ordinal(m, 0)?), new_source(m, 1, true, true)?)
            }
            ("/source/new", "sssffbfbfb") => OscCommand::NewSource(None, new_source(m, 0, false, false)?),
            ("/source/new", "sssiffbfbfb") => OscCommand::NewSource(None, new_source(m, 0, true, false)?),
            ("/source/new", "sssiffbfbfbs") => OscCommand::NewSource(None, new_source(m, 0, true, true)?),
            ("/source/delete", "i") => OscCommand::DeleteSource(ordinal_or_all(m, 0)?),
            ("/reference/position", "ff") => {
                OscCommand::ReferencePosition(Position::new(m.float(0)?, m.float(1)?))
            }
            ("/reference/orientation", "f") => {
                OscCommand::ReferenceOrientation(Orientation::new(m.float(0)?))
            }
            ("/reference_offset/position", "ff") => {
                OscCommand::ReferenceOffsetPosition(Position::new(m.float(0)?, m.float(1)?))
            }
            ("/reference_offset/orientation", "f") => {
                OscCommand::ReferenceOffsetOrientation(Orientation::new(m.float(0)?))
            }
            ("/scene/volume", "f") => OscCommand::MasterVolume(m.float(0)?),
            ("/scene/save", "s") => OscCommand::SaveScene(PathBuf::from(m.string(0)?)),
            ("/scene/load", "s") => OscCommand::LoadScene(PathBuf::from(m.string(0)?)),
            ("/scene/clear", "") => OscCommand::ClearScene,
            ("/scene/auto_rotate", "b") => OscCommand::AutoRotate(m.bool(0)?),
            ("/scene/decay_exponent", "f") => OscCommand::DecayExponent(m.float(0)?),
            ("/scene/amplitude_reference_distance", "f") => {
                OscCommand::AmplitudeReferenceDistance(m.float(0)?)
            }
            ("/processing/state", "b") => OscCommand::Processing(m.bool(0)?),
            ("/transport/state", "b") => OscCommand::Transport(m.bool(0)?),
            ("/transport/rewind", "") => OscCommand::Rewind,
            ("/transport/seek", "s") => {
                let text = m.string(0)?;
                let seconds = parse_time(text)
                    .ok_or_else(|| value_error(m, format!("cannot read a time from {:?}", text)))?;
                OscCommand::Seek(seconds)
            }
            ("/tracker/reset", "") => OscCommand::ResetTracker,
            ("/poll", _) => OscCommand::Poll,
            ("/alive", _) => OscCommand::Alive,
            ("/message_level", "i") => {
                let level = m.int(0)?;
                let level = MessageLevel::from_wire(level)
                    .ok_or_else(|| value_error(m, format!("unknown message level {}", level)))?;
                OscCommand::MessageLevel(level)
            }
            (
                "/source/position" | "/source/position_fixed" | "/source/orientation"
                | "/source/volume" | "/source/mute" | "/source/name" | "/source/model"
                | "/source/file" | "/source/port_name" | "/source/new" | "/source/delete"
                | "/reference/position" | "/reference/orientation"
                | "/reference_offset/position" | "/reference_offset/orientation"
                | "/scene/volume" | "/scene/save" | "/scene/load" | "/scene/clear"
                | "/scene/auto_rotate" | "/scene/decay_exponent"
                | "/scene/amplitude_reference_distance" | "/processing/state"
                | "/transport/state" | "/transport/rewind" | "/transport/seek"
                | "/tracker/reset" | "/message_level",
                _,
            ) => return Err(m.unexpected()),
            (path, _) => return Err(OscError::UnknownPath(path.to_string())),
        };
        Ok(command)
    }
}

/// `T` and `F` both read as `b`
fn bool_tags(tags: &str) -> String {
    tags.chars()
        .map(|c| if c == 'T' || c == 'F' { 'b' } else { c })
        .collect()
}

fn value_error(message: &OscMessage, reason: impl Into<String>) -> OscError {
    OscError::Value {
        path: message.path.clone(),
        reason: reason.into(),
    }
}

fn ordinal(message: &OscMessage, index: usize) -> Result<u32> {
    match message.int(index)? {
        n if n > 0 => Ok(n as u32),
        n => Err(value_error(message, format!("invalid source number {}", n))),
    }
}

fn ordinal_or_all(message: &OscMessage, index: usize) -> Result<u32> {
    match message.int(index)? {
        n if n >= 0 => Ok(n as u32),
        n => Err(value_error(message, format!("invalid source number {}", n))),
    }
}

fn model(message: &OscMessage, index: usize) -> Result<SourceModel> {
    message
        .string(index)?
        .parse::<SourceModel>()
        .map_err(|e| value_error(message, e.to_string()))
}

/// Read a creation record starting at `at`
///
/// Layout: name, model, file-or-port, [channel], x, y, position-fixed,
/// azimuth, orientation-fixed, volume, mute, [properties file].
fn new_source(message: &OscMessage, at: usize, has_channel: bool, has_file: bool) -> Result<NewSource> {
    let m = message;
    let name = m.string(at)?;
    let model = model(m, at + 1)?;
    let file_or_port = m.string(at + 2)?;
    let (channel, rest) = if has_channel {
        (m.int(at + 3)?, at + 4)
    } else {
        (0, at + 3)
    };

    let origin = match channel {
        0 => AudioOrigin::input(file_or_port),
        c if c > 0 => AudioOrigin::file(file_or_port, c as u32),
        c => return Err(value_error(m, format!("invalid channel {}", c))),
    };

    let position = Position::new(m.float(rest)?, m.float(rest + 1)?);
    let position_fixed = m.bool(rest + 2)?;
    let orientation = Orientation::new(m.float(rest + 3)?);
    let orientation_fixed = m.bool(rest + 4)?;
    let volume = m.float(rest + 5)?;
    let mute = m.bool(rest + 6)?;
    let properties_file = if has_file {
        m.string(rest + 7)?.to_string()
    } else {
        String::new()
    };

    let mut request = NewSource::new(name, origin)
        .with_model(model)
        .at(position)
        .facing(orientation);
    request.fixed = position_fixed || orientation_fixed;
    request.volume = volume;
    request.mute = mute;
    request.properties_file = properties_file;
    Ok(request)
}

/// Seconds from `h:mm:ss(.frac)`, `mm:ss(.frac)` or plain seconds
pub fn parse_time(text: &str) -> Option<f32> {
    let text = text.trim();
    let parts: Vec<&str> = text.split(':').collect();
    let seconds: f32 = parts.last()?.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = |s: &str| s.parse::<u32>().ok().map(|v| v as f32);
    match parts.as_slice() {
        [_] => Some(seconds),
        [m, _] if seconds < 60.0 => Some(whole(m)? * 60.0 + seconds),
        [h, m, _] if seconds < 60.0 => {
            let minutes = whole(m)?;
            if minutes >= 60.0 {
                return None;
            }
            Some(whole(h)? * 3600.0 + minutes * 60.0 + seconds)
        }
        _ => None,
    }
}

/// Applies decoded commands through the Publisher
pub struct OscReceiver {
    publisher: Arc<Publisher>,
    sender: Arc<OscSender>,
    ordinals: Arc<Mutex<OrdinalTable>>,
}

impl OscReceiver {
    pub fn new(
        publisher: Arc<Publisher>,
        sender: Arc<OscSender>,
        ordinals: Arc<Mutex<OrdinalTable>>,
    ) -> Self {
        Self {
            publisher,
            sender,
            ordinals,
        }
    }

    fn ordinals(&self) -> MutexGuard<'_, OrdinalTable> {
        self.ordinals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn id(&self, ordinal: u32) -> std::result::Result<SourceId, ControlError> {
        self.ordinals()
            .id(ordinal)
            .ok_or_else(|| ControlError::Invalid(format!("no source with OSC number {}", ordinal)))
    }

    fn control(&self) -> Control<'_> {
        match self.sender.role() {
            Role::Server => self.publisher.take_control(),
            Role::Client => self.publisher.take_control_suppressing(&self.sender),
        }
    }

    /// Run `command`; network-level commands are a no-op here
    pub fn apply(&self, command: OscCommand) -> std::result::Result<(), ControlError> {
        trace!(?command, "Applying OSC command");
        match command {
            OscCommand::SourcePosition(n, position) => {
                let id = self.id(n)?;
                self.control().set_source_position(&id, position)
            }
            OscCommand::SourceFixed(n, fixed) => {
                let id = self.id(n)?;
                self.control().set_source_position_fixed(&id, fixed)
            }
            OscCommand::SourceOrientation(n, orientation) => {
                let id = self.id(n)?;
                self.control().set_source_orientation(&id, orientation)
            }
            OscCommand::SourceVolume(n, db) => {
                let id = self.id(n)?;
                self.control().set_source_gain(&id, db_to_linear(db))
            }
            OscCommand::SourceMute(n, mute) => {
                let id = self.id(n)?;
                self.control().set_source_mute(&id, mute)
            }
            OscCommand::SourceName(n, name) => {
                let id = self.id(n)?;
                self.control().set_source_name(&id, &name)
            }
            OscCommand::SourceModel(n, model) => {
                let id = self.id(n)?;
                self.control().set_source_model(&id, model)
            }
            OscCommand::SourcePropertiesFile(n, file) => {
                let id = self.id(n)?;
                self.control().set_source_properties_file(&id, &file)
            }
            OscCommand::SourcePortName(n, port) => {
                let id = self.id(n)?;
                self.control().set_source_port_name(&id, &port)
            }
            OscCommand::NewSource(ordinal, request) => self.new_source(ordinal, request),
            OscCommand::DeleteSource(0) => {
                self.control().delete_all_sources();
                Ok(())
            }
            OscCommand::DeleteSource(n) => {
                let id = self.id(n)?;
                self.control().delete_source(&id);
                Ok(())
            }
            OscCommand::ReferencePosition(position) => {
                self.control().set_reference_position(position);
                Ok(())
            }
            OscCommand::ReferenceOrientation(orientation) => {
                self.control().set_reference_orientation(orientation);
                Ok(())
            }
            OscCommand::ReferenceOffsetPosition(position) => {
                self.control().set_reference_offset_position(position);
                Ok(())
            }
            OscCommand::ReferenceOffsetOrientation(orientation) => {
                self.control().set_reference_offset_orientation(orientation);
                Ok(())
            }
            OscCommand::MasterVolume(db) => {
                self.control().set_master_volume(db_to_linear(db));
                Ok(())
            }
            OscCommand::SaveScene(path) => self.control().save_scene(&path),
            OscCommand::LoadScene(path) => self.control().load_scene(&path),
            OscCommand::ClearScene => {
                self.control().delete_all_sources();
                Ok(())
            }
            OscCommand::AutoRotate(enabled) => {
                self.control().set_auto_rotation(enabled);
                Ok(())
            }
            OscCommand::DecayExponent(exponent) => {
                self.control().set_decay_exponent(exponent);
                Ok(())
            }
            OscCommand::AmplitudeReferenceDistance(distance) => {
                self.control().set_amplitude_reference_distance(distance)
            }
            OscCommand::Processing(enabled) => {
                self.control().set_processing_state(enabled);
                Ok(())
            }
            OscCommand::Transport(true) => {
                self.control().transport_start();
                Ok(())
            }
            OscCommand::Transport(false) => {
                self.control().transport_stop();
                Ok(())
            }
            OscCommand::Rewind => {
                self.control().transport_locate_frames(0);
                Ok(())
            }
            OscCommand::Seek(seconds) => {
                self.control().transport_locate_seconds(seconds);
                Ok(())
            }
            OscCommand::ResetTracker => self.control().reset_tracker(),
            OscCommand::Poll
            | OscCommand::Alive
            | OscCommand::MessageLevel(_)
            | OscCommand::Update(_) => Ok(()),
        }
    }

    fn new_source(
        &self,
        ordinal: Option<u32>,
        request: NewSource,
    ) -> std::result::Result<(), ControlError> {
        let client = self.sender.role() == Role::Client;
        let mut control = self.control();
        if let (true, Some(ordinal)) = (client, ordinal) {
            self.ordinals().expect(ordinal);
        }
        let result = control.new_source(request);
        self.ordinals().clear_expected();
        drop(control);

        let id = result?;
        if client {
            // the server announced this source; nothing to mirror upstream
            self.sender.forget_staged(&id);
        }
        debug!(%id, ?ordinal, "Source created from OSC");
        Ok(())
    }
}
