//! Wisp server: many TCP/UDP client streams multiplexed over one WebSocket.
//!
//! The [`wisp`] module holds the protocol engine; [`config`] loads and
//! resolves the JSON config file; [`server`] assembles the axum router the
//! binary serves.

pub mod config;
pub mod server;
pub mod wisp;
