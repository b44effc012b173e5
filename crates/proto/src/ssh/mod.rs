//! SSH (Secure Shell) protocol implementation.
//!
//! This module implements SSH2 according to RFC 4251-4254, plus the SFTP v3
//! subsystem.
//!
//! # Architecture
//!
//! The implementation is layered, leaf to root:
//!
//! 1. **Buffers and wire** ([`buffer_pool`], [`wire`]) - pooled byte buffers, RFC 4251 §5 types
//! 2. **Packet Layer** ([`packet`]) - Binary packet protocol (RFC 4253 Section 6)
//! 3. **Key Exchange** ([`kex`], [`kex_dh`], [`algorithm`], [`crypto`]) - negotiation and key derivation
//! 4. **Transport Layer** ([`transport`]) - sans-IO state machine, re-key (RFC 4253)
//! 5. **Authentication Layer** ([`auth`]) - `password` and `publickey` (RFC 4252)
//! 6. **Connection Layer** ([`connection`], [`channel`], [`mux`]) - channels and windows (RFC 4254)
//! 7. **Sessions** ([`session`]) - tokio tasks driving all of the above over a byte stream
//! 8. **Subsystems and supervision** ([`sftp`], [`supervisor`])
//!
//! # Security Considerations
//!
//! - **Input Validation**: packet lengths, padding and name lists are bounds checked
//! - **Constant-Time Operations**: MAC and password comparisons use [`subtle`]
//! - **Memory Safety**: key material is zeroized on drop using [`zeroize`]
//! - **No Unsafe Code**: Pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::hostkey::AcceptAnyHostKey;
//! use kestrel_proto::ssh::session::{ClientSession, SessionConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = tokio::net::TcpStream::connect("server:22").await?;
//! let connection = ClientSession::new(SessionConfig::default(), Arc::new(AcceptAnyHostKey))
//!     .connect(stream)
//!     .await?;
//! connection.authenticate_password("user", "password").await?;
//!
//! let (channel, mut events) = connection.open_session().await?;
//! channel.exec("uptime").await?;
//! let output = events.read_to_end().await;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod algorithm;
pub mod auth;
pub mod buffer_pool;
pub mod channel;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod logging;
pub mod message;
pub mod mux;
pub mod packet;
pub mod session;
pub mod sftp;
pub mod supervisor;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use algorithm::AlgorithmRegistry;
pub use auth::{AuthContext, Authenticator, StaticAuthenticator};
pub use buffer_pool::BufferPool;
pub use channel::ChannelConfig;
pub use connection::{ChannelOpenFailureReason, ChannelRequestType, ChannelType};
pub use hostkey::{Ed25519HostKey, HostKey, HostKeyVerifier};
pub use message::{DisconnectReason, MessageType};
pub use mux::Multiplexer;
pub use session::{ClientSession, ConnectionHandle, ServerSession, SessionConfig};
pub use supervisor::{IdleSupervisor, SupervisorConfig, SupervisorTask};
pub use transport::{Role, Transport, TransportConfig};
pub use version::Version;
