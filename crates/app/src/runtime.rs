//! Service wiring: engine, Publisher, metering loop and network bridges

use soundscape_core::domain::{
    config::circular_array, OscMode, Publisher, QueryLoop, Renderer, SoundscapeConfig,
    TomlSceneStore,
};
use soundscape_infra::websocket::WsError;
use soundscape_infra::{FilePlayer, OscHandler, SimulatedRenderer, WsServer};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OSC bridge: {0}")]
    Osc(std::io::Error),

    #[error("WebSocket server: {0}")]
    WebSocket(#[from] WsError),
}

/// All running services of one Soundscape instance
pub struct Soundscape {
    publisher: Arc<Publisher>,
    renderer: Arc<SimulatedRenderer>,
    query_loop: Option<QueryLoop>,
    osc: Option<OscHandler>,
    websocket: Option<WsServer>,
}

impl Soundscape {
    /// Start every service the config enables
    ///
    /// A scene file that fails to load is logged and skipped; the scene
    /// stays empty.
    #[instrument(skip(config))]
    pub async fn start(config: &SoundscapeConfig) -> Result<Self, StartupError> {
        let loudspeakers = if config.loudspeakers.is_empty() {
            warn!("No loudspeakers configured, using an eight-channel circle");
            circular_array(8, 1.5)
        } else {
            config.loudspeakers.clone()
        };

        let renderer = Arc::new(SimulatedRenderer::new(
            config.app.renderer_name.clone(),
            config.app.sample_rate,
            config.app.block_size,
            loudspeakers,
        ));
        let publisher = Arc::new(Publisher::new(
            renderer.clone(),
            Arc::new(FilePlayer::default()),
            Arc::new(TomlSceneStore::new()),
            config.publisher_settings(),
        ));

        {
            let control = publisher.take_control();
            config.scene.apply(&control);
            control.start_processing();
        }

        renderer.start()?;
        let query_loop = match renderer.metering() {
            Some(receiver) => Some(QueryLoop::start(
                publisher.clone(),
                receiver,
                config.app.query_interval(),
            )?),
            None => None,
        };

        if let Some(path) = &config.app.scene_file {
            let mut control = publisher.take_control();
            match control.load_scene(path) {
                Ok(()) => info!(path = %path.display(), "Scene loaded"),
                Err(e) => warn!(path = %path.display(), error = %e, "Starting with an empty scene"),
            }
        }

        let mut soundscape = Self {
            publisher: publisher.clone(),
            renderer,
            query_loop,
            osc: None,
            websocket: None,
        };

        if config.osc.mode != OscMode::Off {
            let handler = OscHandler::start(publisher.clone(), &config.osc)
                .await
                .map_err(StartupError::Osc)?;
            soundscape.osc = Some(handler);
        }

        if config.websocket.enabled {
            soundscape.websocket = Some(WsServer::start(publisher, &config.websocket).await?);
        }

        info!("Soundscape running");
        Ok(soundscape)
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn osc_addr(&self) -> Option<SocketAddr> {
        self.osc.as_ref().map(OscHandler::local_addr)
    }

    pub fn websocket_addr(&self) -> Option<SocketAddr> {
        self.websocket.as_ref().map(WsServer::local_addr)
    }

    /// Stop services in reverse start order
    pub async fn shutdown(mut self) {
        if let Some(websocket) = self.websocket.take() {
            websocket.stop().await;
        }
        if let Some(osc) = self.osc.take() {
            osc.stop().await;
        }
        if let Some(mut query_loop) = self.query_loop.take() {
            query_loop.stop();
        }
        self.renderer.stop();
        info!("Soundscape stopped");
    }
}
