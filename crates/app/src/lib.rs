//! Soundscape application: command line and service wiring

pub mod args;
pub mod runtime;

pub use args::Cli;
pub use runtime::{Soundscape, StartupError};
