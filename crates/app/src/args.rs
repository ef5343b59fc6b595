//! Command-line options layered over the config file

use clap::Parser;
use soundscape_core::domain::{OscMode, SoundscapeConfig};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "soundscape")]
#[command(about = "Spatial audio scene server with OSC and WebSocket control", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/soundscape/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// OSC role: off, server or client
    #[arg(long)]
    pub osc_mode: Option<OscMode>,

    /// Local OSC port
    #[arg(long)]
    pub osc_port: Option<u16>,

    /// Client to address in server mode, `host:port`; repeatable
    #[arg(long = "osc-client")]
    pub osc_clients: Vec<String>,

    /// Server to follow in client mode, `host:port`
    #[arg(long)]
    pub osc_server: Option<String>,

    /// WebSocket port
    #[arg(long)]
    pub ws_port: Option<u16>,

    /// Disable the WebSocket server
    #[arg(long)]
    pub no_websocket: bool,

    /// Scene file loaded at startup
    #[arg(short, long)]
    pub scene: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Override config values given on the command line
    pub fn apply(&self, config: &mut SoundscapeConfig) {
        if let Some(mode) = self.osc_mode {
            config.osc.mode = mode;
        }
        if let Some(port) = self.osc_port {
            config.osc.port = port;
        }
        if !self.osc_clients.is_empty() {
            config.osc.clients = self.osc_clients.clone();
        }
        if let Some(server) = &self.osc_server {
            config.osc.server = Some(server.clone());
        }
        if let Some(port) = self.ws_port {
            config.websocket.port = port;
        }
        if self.no_websocket {
            config.websocket.enabled = false;
        }
        if let Some(scene) = &self.scene {
            config.app.scene_file = Some(scene.clone());
        }
    }
}
