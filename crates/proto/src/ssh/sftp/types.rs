//! SFTP data types: status codes, errors, open flags and file attributes.

use crate::ssh::wire::{put_string, Reader};
use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};
use std::io;
use std::ops::BitOr;
use thiserror::Error;

/// SSH_FX_* status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    /// SSH_FX_OK
    Ok = 0,
    /// SSH_FX_EOF
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED
    PermissionDenied = 3,
    /// SSH_FX_FAILURE
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED
    OpUnsupported = 8,
}

impl StatusCode {
    /// Converts a wire code.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::Eof,
            2 => Self::NoSuchFile,
            3 => Self::PermissionDenied,
            4 => Self::Failure,
            5 => Self::BadMessage,
            6 => Self::NoConnection,
            7 => Self::ConnectionLost,
            8 => Self::OpUnsupported,
            _ => return None,
        })
    }

    /// Default status text.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
        }
    }
}

/// Failure of one SFTP request. Never fatal to the subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SftpError {
    /// End of file or directory
    #[error("end of file")]
    Eof,
    /// Path does not exist
    #[error("no such file: {0}")]
    NotFound(String),
    /// Access refused
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Unknown or closed handle
    #[error("invalid handle")]
    InvalidHandle,
    /// Operation or extension not supported
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Malformed request
    #[error("bad message: {0}")]
    BadMessage(String),
    /// Any other failure
    #[error("failure: {0}")]
    Failure(String),
    /// Status reported by the peer that has no dedicated variant
    #[error("status {code}: {message}")]
    Status {
        /// SSH_FX_* code
        code: u32,
        /// Status text
        message: String,
    },
}

impl SftpError {
    /// Wire status code.
    pub fn code(&self) -> u32 {
        match self {
            Self::Eof => StatusCode::Eof as u32,
            Self::NotFound(_) => StatusCode::NoSuchFile as u32,
            Self::PermissionDenied(_) => StatusCode::PermissionDenied as u32,
            Self::InvalidHandle | Self::Failure(_) => StatusCode::Failure as u32,
            Self::Unsupported(_) => StatusCode::OpUnsupported as u32,
            Self::BadMessage(_) => StatusCode::BadMessage as u32,
            Self::Status { code, .. } => *code,
        }
    }

    /// Status text sent to the peer.
    pub fn message(&self) -> String {
        match self {
            Self::Eof => StatusCode::Eof.message().to_string(),
            Self::InvalidHandle => "invalid handle".to_string(),
            Self::NotFound(m)
            | Self::PermissionDenied(m)
            | Self::Unsupported(m)
            | Self::BadMessage(m)
            | Self::Failure(m)
            | Self::Status { message: m, .. } => m.clone(),
        }
    }

    /// Maps a status reply back to an error.
    pub fn from_status(code: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        match StatusCode::from_u32(code) {
            Some(StatusCode::Eof) => Self::Eof,
            Some(StatusCode::NoSuchFile) => Self::NotFound(message),
            Some(StatusCode::PermissionDenied) => Self::PermissionDenied(message),
            Some(StatusCode::Failure) if message == "invalid handle" => Self::InvalidHandle,
            Some(StatusCode::Failure) => Self::Failure(message),
            Some(StatusCode::OpUnsupported) => Self::Unsupported(message),
            Some(StatusCode::BadMessage) => Self::BadMessage(message),
            _ => Self::Status { code, message },
        }
    }
}

impl From<io::Error> for SftpError {
    fn from(err: io::Error) -> Self {
        let message = err.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(message),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(message),
            io::ErrorKind::Unsupported => Self::Unsupported(message),
            io::ErrorKind::UnexpectedEof => Self::Eof,
            _ => Self::Failure(message),
        }
    }
}

impl From<SftpError> for KestrelError {
    fn from(err: SftpError) -> Self {
        KestrelError::Sftp {
            code: err.code(),
            message: err.message(),
        }
    }
}

impl From<KestrelError> for SftpError {
    fn from(err: KestrelError) -> Self {
        match err {
            KestrelError::Sftp { code, message } => Self::from_status(code, message),
            KestrelError::Protocol(message) => Self::BadMessage(message),
            other => Self::Failure(other.to_string()),
        }
    }
}

/// Result of one SFTP operation.
pub type SftpResult<T> = Result<T, SftpError>;

/// SSH_FXF_* open flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// SSH_FXF_READ
    pub const READ: OpenFlags = OpenFlags(0x0000_0001);
    /// SSH_FXF_WRITE
    pub const WRITE: OpenFlags = OpenFlags(0x0000_0002);
    /// SSH_FXF_APPEND
    pub const APPEND: OpenFlags = OpenFlags(0x0000_0004);
    /// SSH_FXF_CREAT
    pub const CREATE: OpenFlags = OpenFlags(0x0000_0008);
    /// SSH_FXF_TRUNC
    pub const TRUNCATE: OpenFlags = OpenFlags(0x0000_0010);
    /// SSH_FXF_EXCL
    pub const EXCLUSIVE: OpenFlags = OpenFlags(0x0000_0020);

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flags for creating or replacing a file for writing.
    pub fn create_truncate() -> Self {
        Self::WRITE | Self::CREATE | Self::TRUNCATE
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// SSH_FILEXFER_ATTR_* presence flags.
pub mod attr_flags {
    /// Size present
    pub const SIZE: u32 = 0x0000_0001;
    /// uid and gid present
    pub const UIDGID: u32 = 0x0000_0002;
    /// Permissions present
    pub const PERMISSIONS: u32 = 0x0000_0004;
    /// atime and mtime present
    pub const ACMODTIME: u32 = 0x0000_0008;
    /// Extended pairs present
    pub const EXTENDED: u32 = 0x8000_0000;
}

/// POSIX file type bits carried in the permissions field.
pub mod mode {
    /// File type mask
    pub const S_IFMT: u32 = 0o170_000;
    /// Directory
    pub const S_IFDIR: u32 = 0o040_000;
    /// Regular file
    pub const S_IFREG: u32 = 0o100_000;
    /// Symbolic link
    pub const S_IFLNK: u32 = 0o120_000;
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Anything else
    Other,
}

/// SFTP v3 file attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// Size in bytes
    pub size: Option<u64>,
    /// Owner and group ids
    pub uid_gid: Option<(u32, u32)>,
    /// Mode bits including the file type
    pub permissions: Option<u32>,
    /// Access and modification times (Unix seconds)
    pub times: Option<(u32, u32)>,
    /// Extended name/value pairs
    pub extended: Vec<(String, String)>,
}

impl FileAttributes {
    /// Attributes with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attributes of a regular file.
    pub fn file(size: u64, perm: u32) -> Self {
        Self {
            size: Some(size),
            permissions: Some(mode::S_IFREG | (perm & 0o7777)),
            ..Self::default()
        }
    }

    /// Attributes of a directory.
    pub fn directory(perm: u32) -> Self {
        Self {
            permissions: Some(mode::S_IFDIR | (perm & 0o7777)),
            ..Self::default()
        }
    }

    /// File type from the permission bits.
    pub fn file_type(&self) -> FileType {
        match self.permissions.map(|p| p & mode::S_IFMT) {
            Some(mode::S_IFREG) => FileType::Regular,
            Some(mode::S_IFDIR) => FileType::Directory,
            Some(mode::S_IFLNK) => FileType::Symlink,
            _ => FileType::Other,
        }
    }

    /// `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// Appends the wire encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= attr_flags::SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= attr_flags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= attr_flags::PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= attr_flags::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= attr_flags::EXTENDED;
        }
        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(perm) = self.permissions {
            buf.put_u32(perm);
        }
        if let Some((atime, mtime)) = self.times {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
        if !self.extended.is_empty() {
            buf.put_u32(self.extended.len() as u32);
            for (name, value) in &self.extended {
                put_string(buf, name.as_bytes());
                put_string(buf, value.as_bytes());
            }
        }
    }

    /// Reads attributes from `reader`.
    pub fn decode(reader: &mut Reader<'_>) -> KestrelResult<Self> {
        let flags = reader.read_u32()?;
        let mut attrs = Self::new();
        if flags & attr_flags::SIZE != 0 {
            attrs.size = Some(reader.read_u64()?);
        }
        if flags & attr_flags::UIDGID != 0 {
            attrs.uid_gid = Some((reader.read_u32()?, reader.read_u32()?));
        }
        if flags & attr_flags::PERMISSIONS != 0 {
            attrs.permissions = Some(reader.read_u32()?);
        }
        if flags & attr_flags::ACMODTIME != 0 {
            attrs.times = Some((reader.read_u32()?, reader.read_u32()?));
        }
        if flags & attr_flags::EXTENDED != 0 {
            let count = reader.read_u32()?;
            if count as usize > reader.remaining() / 8 {
                return Err(KestrelError::Protocol(format!(
                    "extended attribute count {} exceeds message",
                    count
                )));
            }
            for _ in 0..count {
                attrs.extended.push((reader.read_utf8()?, reader.read_utf8()?));
            }
        }
        Ok(attrs)
    }
}

/// One SSH_FXP_NAME entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// File name (no directory part for READDIR)
    pub filename: String,
    /// `ls -l` style line
    pub longname: String,
    /// Attributes
    pub attrs: FileAttributes,
}

impl NameEntry {
    /// Creates an entry, deriving the long name from the attributes.
    pub fn new(filename: impl Into<String>, attrs: FileAttributes) -> Self {
        let filename = filename.into();
        let longname = long_name(&filename, &attrs);
        Self {
            filename,
            longname,
            attrs,
        }
    }
}

fn long_name(filename: &str, attrs: &FileAttributes) -> String {
    let perm = attrs.permissions.unwrap_or(0);
    let kind = match attrs.file_type() {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        _ => '-',
    };
    let mut bits = String::with_capacity(10);
    bits.push(kind);
    for shift in [6u32, 3, 0] {
        let triplet = (perm >> shift) & 0o7;
        bits.push(if triplet & 0o4 != 0 { 'r' } else { '-' });
        bits.push(if triplet & 0o2 != 0 { 'w' } else { '-' });
        bits.push(if triplet & 0o1 != 0 { 'x' } else { '-' });
    }
    let (uid, gid) = attrs.uid_gid.unwrap_or((0, 0));
    format!(
        "{} 1 {:<8} {:<8} {:>8} {}",
        bits,
        uid,
        gid,
        attrs.size.unwrap_or(0),
        filename
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(StatusCode::from_u32(2), Some(StatusCode::NoSuchFile));
        assert_eq!(StatusCode::from_u32(999), None);

        assert_eq!(SftpError::InvalidHandle.code(), 4);
        assert_eq!(SftpError::InvalidHandle.message(), "invalid handle");
        assert_eq!(SftpError::from_status(4, "invalid handle"), SftpError::InvalidHandle);
        assert_eq!(
            SftpError::from_status(8, "nope"),
            SftpError::Unsupported("nope".to_string())
        );
        assert_eq!(
            SftpError::from_status(42, "odd"),
            SftpError::Status {
                code: 42,
                message: "odd".to_string()
            }
        );
    }

    #[test]
    fn test_io_error_mapping() {
        let err: SftpError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code(), StatusCode::NoSuchFile as u32);
        let err: SftpError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert_eq!(err.code(), StatusCode::PermissionDenied as u32);
    }

    #[test]
    fn test_into_kestrel_error() {
        let err: KestrelError = SftpError::NotFound("/x".to_string()).into();
        assert!(matches!(err, KestrelError::Sftp { code: 2, ref message } if message == "/x"));
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::create_truncate();
        assert!(flags.contains(OpenFlags::WRITE));
        assert!(flags.contains(OpenFlags::CREATE | OpenFlags::TRUNCATE));
        assert!(!flags.contains(OpenFlags::READ));
    }

    #[test]
    fn test_attributes_with_extended_pairs() {
        let attrs = FileAttributes {
            size: Some(1024),
            uid_gid: Some((1000, 100)),
            permissions: Some(mode::S_IFREG | 0o644),
            times: Some((1, 2)),
            extended: vec![("owner@example".to_string(), "alice".to_string())],
        };
        let mut buf = BytesMut::new();
        attrs.encode(&mut buf);
        let mut reader = Reader::new(&buf);
        assert_eq!(FileAttributes::decode(&mut reader).unwrap(), attrs);
        assert!(reader.is_empty());
        assert_eq!(attrs.file_type(), FileType::Regular);
    }

    #[test]
    fn test_long_name() {
        let entry = NameEntry::new("docs", FileAttributes::directory(0o755));
        assert!(entry.longname.starts_with("drwxr-xr-x"));
        assert!(entry.longname.ends_with("docs"));
    }
}
