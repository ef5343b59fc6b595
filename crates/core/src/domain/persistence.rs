//! Scene files
//!
//! A scene document describes the scene-wide settings and the sources to
//! create. Loading is all-or-nothing: a document that fails to parse or
//! validate is rejected before the current scene is touched.

use crate::domain::geometry::{DirectionalPoint, Orientation, Position};
use crate::domain::scene::SceneState;
use crate::domain::source::{linear_to_db, AudioOrigin, SourceId, SourceModel};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, SceneFileError>;

#[derive(Debug, Error)]
pub enum SceneFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scene parsing error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Scene serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid scene: {0}")]
    Invalid(String),
}

/// One source entry of a scene document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: SourceModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub volume_db: f32,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub properties_file: String,
}

impl SourceEntry {
    /// Audio origin described by this entry
    pub fn origin(&self) -> Result<AudioOrigin> {
        match (&self.file, &self.port) {
            (Some(file), None) => Ok(AudioOrigin::file(file.clone(), self.channel.unwrap_or(1))),
            (None, Some(port)) => Ok(AudioOrigin::input(port.clone())),
            (Some(_), Some(_)) => Err(SceneFileError::Invalid(format!(
                "source {:?} has both a file and a port",
                self.name
            ))),
            (None, None) => Err(SceneFileError::Invalid(format!(
                "source {:?} has neither a file nor a port",
                self.name
            ))),
        }
    }
}

/// Serializable scene description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDocument {
    #[serde(default)]
    pub volume_db: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_exponent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amplitude_reference_distance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rotation: Option<bool>,
    #[serde(default)]
    pub reference: DirectionalPoint,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceEntry>,
}

impl SceneDocument {
    /// Describe the current scene
    pub fn from_state(state: &SceneState) -> Self {
        let sources = state
            .order
            .iter()
            .filter_map(|id| state.sources.get(id).map(|source| (id, source)))
            .map(|(id, source)| {
                let (file, channel, port) = match &source.origin {
                    Some(AudioOrigin::File { path, channel, .. }) => {
                        (Some(path.clone()), Some(*channel), None)
                    }
                    Some(AudioOrigin::Input { port }) => (None, None, Some(port.clone())),
                    None => (None, None, None),
                };
                SourceEntry {
                    id: Some(id.as_str().to_string()),
                    name: source.name.clone(),
                    model: source.model,
                    file,
                    channel,
                    port,
                    position: source.pose.position,
                    orientation: source.pose.orientation,
                    fixed: source.fixed,
                    volume_db: linear_to_db(source.gain),
                    mute: source.mute,
                    properties_file: source.properties_file.clone(),
                }
            })
            .collect();

        Self {
            volume_db: linear_to_db(state.master_volume),
            decay_exponent: Some(state.decay_exponent),
            amplitude_reference_distance: Some(state.amplitude_reference_distance),
            auto_rotation: Some(state.auto_rotation),
            reference: state.reference,
            sources,
        }
    }

    /// Semantic checks on top of the schema enforced by serde
    pub fn validate(&self) -> Result<()> {
        if let Some(distance) = self.amplitude_reference_distance {
            if distance <= 1.0 {
                return Err(SceneFileError::Invalid(format!(
                    "amplitude reference distance must be > 1, got {}",
                    distance
                )));
            }
        }

        let mut ids = HashSet::new();
        for source in &self.sources {
            if let Some(id) = &source.id {
                SourceId::parse(id).map_err(|e| SceneFileError::Invalid(e.to_string()))?;
                if !ids.insert(id.as_str()) {
                    return Err(SceneFileError::Invalid(format!("duplicate source ID {:?}", id)));
                }
            }
            if let AudioOrigin::File { channel: 0, .. } = source.origin()? {
                return Err(SceneFileError::Invalid(format!(
                    "source {:?}: channel must be >= 1",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

/// Load, save and serialize scene documents
pub trait SceneStore: Send + Sync {
    fn load(&self, path: &Path) -> Result<SceneDocument>;

    fn save(&self, path: &Path, document: &SceneDocument) -> Result<()>;

    fn to_text(&self, document: &SceneDocument) -> Result<String>;
}

/// Scene documents stored as TOML
#[derive(Debug, Default, Clone)]
pub struct TomlSceneStore;

impl TomlSceneStore {
    pub fn new() -> Self {
        Self
    }
}

impl SceneStore for TomlSceneStore {
    fn load(&self, path: &Path) -> Result<SceneDocument> {
        info!(path = %path.display(), "Loading scene");
        let contents = std::fs::read_to_string(path)?;
        let document: SceneDocument = toml::from_str(&contents)?;
        document.validate()?;
        debug!(sources = document.sources.len(), "Scene file is valid");
        Ok(document)
    }

    fn save(&self, path: &Path, document: &SceneDocument) -> Result<()> {
        info!(path = %path.display(), "Saving scene");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_text(document)?)?;
        Ok(())
    }

    fn to_text(&self, document: &SceneDocument) -> Result<String> {
        Ok(toml::to_string_pretty(document)?)
    }
}
