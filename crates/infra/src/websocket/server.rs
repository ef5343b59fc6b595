//! axum server upgrading `GET /` and `GET /ws` to WebSocket connections

use crate::websocket::connection::Connection;
use crate::websocket::protocol::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use soundscape_core::domain::{Publisher, WebSocketConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
struct ServerState {
    publisher: Arc<Publisher>,
    token: CancellationToken,
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/ws", get(upgrade))
        .with_state(state)
}

async fn upgrade(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, peer, state))
}

async fn serve_connection(socket: WebSocket, peer: SocketAddr, state: ServerState) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut queue) = mpsc::unbounded_channel::<String>();

    let publisher = state.publisher.clone();
    let connection = match tokio::task::spawn_blocking(move || {
        Connection::open(publisher, peer.to_string(), outbox)
    })
    .await
    {
        Ok(connection) => connection,
        Err(e) => {
            warn!(%peer, error = %e, "Cannot open WebSocket connection");
            return;
        }
    };

    let writer = tokio::spawn(async move {
        while let Some(text) = queue.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let message = tokio::select! {
            _ = state.token.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                let text = text.as_str().to_owned();
                let handler = connection.clone();
                let errors = tokio::task::spawn_blocking(move || handler.handle_text(&text))
                    .await
                    .unwrap_or_else(|e| {
                        warn!(%peer, error = %e, "WebSocket command task failed");
                        Vec::new()
                    });
                for error in errors {
                    warn!(%peer, error = %error, "WebSocket command failed");
                    connection.send_error(&error);
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(%peer, error = %e, "WebSocket receive failed");
                break;
            }
        }
    }

    connection.close();
    if let Err(e) = writer.await {
        debug!(%peer, error = %e, "WebSocket writer failed");
    }
}

/// A running WebSocket server
pub struct WsServer {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WsServer {
    #[instrument(skip(publisher, config), fields(address = %config.address()))]
    pub async fn start(publisher: Arc<Publisher>, config: &WebSocketConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.address()).await?;
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();

        let app = router(ServerState {
            publisher,
            token: token.clone(),
        });
        let shutdown = token.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
            if let Err(e) = served {
                warn!(error = %e, "WebSocket server failed");
            }
        });

        info!(%local_addr, "WebSocket server listening");
        Ok(Self {
            local_addr,
            token,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close every connection and wait for the server task
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "WebSocket server task failed");
            }
        }
        info!("WebSocket server stopped");
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
