//! Rendering engines usable behind the `Renderer` capability

pub mod simulated;

pub use simulated::{SimulatedRenderer, SIGNAL_LEVEL};
