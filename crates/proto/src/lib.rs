//! SSH2 secure transport for the Kestrel workspace.
//!
//! This crate provides:
//!
//! - **Transport** - version exchange, key exchange, binary packet codec and
//!   re-key as a sans-IO state machine ([`ssh::transport`])
//! - **Connection** - channel multiplexer with flow-control windows, driven
//!   by tokio sessions over any byte stream ([`ssh::session`])
//! - **SFTP** - v3 client and server with hashing and multipart upload
//!   extensions ([`ssh::sftp`])
//! - **Supervision** - idle detection for long-lived connections
//!   ([`ssh::supervisor`])
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support (client + server)
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(4096);
//! let buf = pool.lease();
//! assert_eq!(buf.capacity(), 4096);
//! pool.release(buf);
//! assert_eq!(pool.free_count(), 1);
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted libraries (`ring`, `RustCrypto`, `dalek`)
//! - Constant-time comparisons for MACs and passwords
//! - Key material is zeroized on drop
//! - Packet and SFTP parsers are fuzzed
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [draft-ietf-secsh-filexfer-02](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02) - SFTP v3

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
