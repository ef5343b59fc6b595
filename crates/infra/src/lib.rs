//! Soundscape infrastructure: engines, playback and network bridges
//!
//! Everything here talks to the control plane only through the Publisher
//! and the capability traits of `soundscape_core`.

pub mod engine;
pub mod osc;
pub mod player;
pub mod websocket;

pub use engine::SimulatedRenderer;
pub use osc::OscHandler;
pub use player::FilePlayer;
pub use websocket::WsServer;
