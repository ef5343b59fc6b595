//! WebSocket/JSON bridge
//!
//! Every connection is its own Publisher subscriber and sends the facts of
//! one bundle as one JSON frame.

pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::Connection;
pub use protocol::{Bundle, Category, WsError};
pub use server::WsServer;
