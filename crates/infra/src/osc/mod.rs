//! OSC bridge over UDP
//!
//! In the server role this process is authoritative and mirrors every fact
//! to its clients. In the client role it follows a remote server and sends
//! local changes upstream as `/update/*` messages.

pub mod codec;
pub mod handler;
pub mod ordinal;
pub mod receiver;
pub mod sender;

pub use codec::{OscError, OscMessage, OscType};
pub use handler::{OscHandler, Peers};
pub use ordinal::OrdinalTable;
pub use receiver::{OscCommand, OscReceiver};
pub use sender::{OscSender, Packet, PacketClass, Role};
