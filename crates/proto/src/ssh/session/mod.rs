//! Async SSH sessions over any byte stream.
//!
//! [`ClientSession::connect`] and [`ServerSession::accept`] take a stream
//! (a `TcpStream`, a `tokio::io::duplex` pipe, ...) and spawn the task that
//! runs the transport and the channel multiplexer for it. What comes back is
//! a [`ConnectionHandle`]:
//!
//! - clients authenticate through it and open channels, getting a
//!   [`ChannelHandle`] to write with and [`ChannelEvents`] to read from
//! - servers register a [`ChannelOpener`] per channel type; every accepted
//!   channel is served by the [`ChannelHandler`] it returns
//!
//! Sends past the peer's window suspend until WINDOW_ADJUST arrives. Every
//! pending call fails with a connection error once the connection ends.
//!
//! An optional [`KeepaliveTask`] sends SSH_MSG_IGNORE at
//! [`SessionConfig::keepalive_interval`].

mod actor;
pub mod config;
mod handle;
pub mod handler;
pub mod keepalive;
pub mod properties;

pub use actor::{ClientSession, GlobalRequestFilter, ServerSession};
pub use config::SessionConfig;
pub use handle::{
    ChannelEvent, ChannelEvents, ChannelHandle, CloseReason, ConnectionHandle, ConnectionInfo,
};
pub use handler::{ChannelHandler, ChannelOpener, OpenRejection};
pub use keepalive::{KeepaliveTask, KEEPALIVE_PAYLOAD};
pub use properties::Properties;
