//! SFTP (SSH File Transfer Protocol) version 3.
//!
//! SFTP runs over a `session` channel on which the `sftp` subsystem was
//! accepted:
//!
//! ```text
//! Client                          Server
//!   |-- CHANNEL_OPEN session ----->|
//!   |-- CHANNEL_REQUEST subsystem ->|
//!   |<- CHANNEL_SUCCESS ------------|
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|  (lists extensions)
//!   |-- SSH_FXP_OPEN (id 1) ------->|
//!   |-- SSH_FXP_STAT (id 2) ------->|
//!   |<- SSH_FXP_ATTRS (id 2) -------|  (replies in any order)
//!   |<- SSH_FXP_HANDLE (id 1) ------|
//! ```
//!
//! [`SftpServer`] serves a [`FileSystem`](filesystem::FileSystem) and is
//! installed on a server session with
//! `ServerSession::with_opener("session", server.opener())`.
//! [`SftpClient`] drives the protocol from a connected client.
//!
//! Besides the base operations the server speaks the `check-file-*` hashing
//! extensions and multipart uploads:
//!
//! ```text
//! create-multipart-file  -> uuid
//! open-part-file         -> handle, WRITE at part-relative offsets
//! combine-multipart-file -> target = part 1 || part 2 || ...
//! cancel-multipart-file  -> all part data dropped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use kestrel_proto::ssh::sftp::{SftpClient, OpenFlags};
//! # use kestrel_proto::ssh::session::ConnectionHandle;
//!
//! # async fn run(connection: ConnectionHandle) -> Result<(), Box<dyn std::error::Error>> {
//! let sftp = SftpClient::open(&connection).await?;
//! sftp.write_file("/remote/hello.txt", b"hello").await?;
//! let data = sftp.read_file("/remote/hello.txt").await?;
//! assert_eq!(data, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod extensions;
pub mod filesystem;
pub mod message;
pub mod multipart;
pub mod server;
pub mod types;

pub use client::{RemoteHandle, SftpClient};
pub use extensions::{HashAlgorithm, SftpExtension};
pub use filesystem::{FileSystem, LocalFileSystem, MemoryFileSystem, OpenFile};
pub use message::{Framer, Request, Response, SftpMessageType, SFTP_VERSION};
pub use multipart::{MultipartRegistry, MultipartTransfer, PartSpec};
pub use server::{SftpContext, SftpServer};
pub use types::{
    FileAttributes, FileType, NameEntry, OpenFlags, SftpError, SftpResult, StatusCode,
};

use kestrel_platform::{KestrelError, KestrelResult};

/// Subsystem name requested on the session channel.
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// SFTP server limits.
#[derive(Debug, Clone)]
pub struct SftpConfig {
    /// Largest READ served; longer requests are clamped
    pub max_read_len: u32,
    /// Open handles per session
    pub max_handles: usize,
    /// Minimum size of every multipart part except the last
    pub min_part_size: u64,
    /// Requests of one session executing at once
    pub max_concurrent_requests: usize,
    /// Largest accepted packet
    pub max_packet_len: usize,
    /// Entries per READDIR reply
    pub readdir_batch: usize,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            max_read_len: 64 * 1024,
            max_handles: 256,
            min_part_size: 0,
            max_concurrent_requests: 16,
            max_packet_len: message::DEFAULT_MAX_PACKET_LEN,
            readdir_batch: 100,
        }
    }
}

impl SftpConfig {
    /// Sets the READ clamp.
    pub fn with_max_read_len(mut self, len: u32) -> Self {
        self.max_read_len = len;
        self
    }

    /// Sets the open handle limit.
    pub fn with_max_handles(mut self, handles: usize) -> Self {
        self.max_handles = handles;
        self
    }

    /// Sets the minimum non-final part size.
    pub fn with_min_part_size(mut self, size: u64) -> Self {
        self.min_part_size = size;
        self
    }

    /// Sets per-session request concurrency.
    pub fn with_max_concurrent_requests(mut self, requests: usize) -> Self {
        self.max_concurrent_requests = requests;
        self
    }

    /// Sets the packet size limit.
    pub fn with_max_packet_len(mut self, len: usize) -> Self {
        self.max_packet_len = len;
        self
    }

    /// Checks the limits are usable.
    pub fn validate(&self) -> KestrelResult<()> {
        if self.max_read_len == 0 {
            return Err(KestrelError::Config("max_read_len must be positive".into()));
        }
        if self.max_read_len as usize + 64 > self.max_packet_len {
            return Err(KestrelError::Config(format!(
                "max_read_len {} does not fit in max_packet_len {}",
                self.max_read_len, self.max_packet_len
            )));
        }
        if self.max_handles == 0 || self.max_concurrent_requests == 0 || self.readdir_batch == 0 {
            return Err(KestrelError::Config(
                "handle, request and readdir limits must be positive".into(),
            ));
        }
        Ok(())
    }
}
