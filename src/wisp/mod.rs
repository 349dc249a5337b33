//! Wisp protocol server implementation for proxying TCP/UDP connections.
//!
//! This module provides a WebSocket-based proxy server using the Wisp protocol.
//! It allows web clients to establish TCP and UDP connections through the server.

mod config;
mod dialer;
mod handler;
mod packet;
mod resolver;
mod session;
mod stream;

pub use config::WispConfig;
pub use dialer::{DialError, DialedSocket, Dialer, NetDialer};
pub use handler::{WispState, wisp_ws_handler};
pub use packet::{CloseReason, ConnectPayload, Packet, PacketError, PacketType, StreamType};
pub use session::WispSession;
