//! Domain entities and business rules

pub mod config;
pub mod geometry;
pub mod metering;
pub mod persistence;
pub mod publisher;
pub mod render_subscriber;
pub mod renderer;
pub mod scene;
pub mod source;
pub mod subscriber;

#[cfg(test)]
pub(crate) mod testing;

// Re-export specific items to avoid ambiguous glob imports
pub use config::{
    ConfigError, ConfigManager, MessageLevel, OscConfig, OscMode, SceneDefaults, SoundscapeConfig,
    WebSocketConfig,
};
pub use geometry::{look_at, DirectionalPoint, Orientation, Position};
pub use metering::{metering_channel, MeteringReceiver, MeteringSender, MeteringSnapshot, QueryLoop};
pub use persistence::{SceneDocument, SceneFileError, SceneStore, TomlSceneStore};
pub use publisher::{
    Control, ControlError, NewSource, Publisher, PublisherSettings, Subscribe, Subscription,
};
pub use render_subscriber::RenderSubscriber;
pub use renderer::{
    AudioPlayer, PlaybackError, PlaybackHandle, RenderError, RenderParams, RenderSource,
    Renderer, SourceInput,
};
pub use scene::{Scene, SceneState};
pub use source::{
    db_to_linear, linear_to_db, AudioOrigin, Loudspeaker, LoudspeakerModel, Source, SourceId,
    SourceModel,
};
pub use subscriber::{
    BundleEvents, Metering, MeteringKind, RendererControl, RendererInformation, SceneControl,
    SceneInformation, SourceProperty, Transport,
};
