//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both peers start by sending an identification line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification; those are
//! skipped by [`IdentificationReader`], up to a bounded count.
//!
//! # Security
//!
//! - Maximum line length: 255 characters
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::version::Version;
//!
//! let version = Version::new("Kestrel_0.1.0", Some("sftp"));
//! assert_eq!(version.to_string(), "SSH-2.0-Kestrel_0.1.0 sftp");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use bytes::BytesMut;
use kestrel_platform::{KestrelError, KestrelResult};

/// Maximum length of an identification line, CR LF excluded.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines accepted before the
/// identification line.
pub const MAX_BANNER_LINES: usize = 1024;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an identification for protocol version 2.0.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// The identification Kestrel sends unless configured otherwise.
    ///
    /// ```rust
    /// use kestrel_proto::ssh::version::Version;
    ///
    /// assert!(Version::default_kestrel().to_string().starts_with("SSH-2.0-Kestrel_"));
    /// ```
    pub fn default_kestrel() -> Self {
        Self::new(&format!("Kestrel_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line, with or without CR LF.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] if the line is too long, contains
    /// a null byte, does not start with `SSH-`, or names a protocol version
    /// other than 2.0 or 1.99.
    pub fn parse(line: &str) -> KestrelResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(KestrelError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(KestrelError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }
        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            KestrelError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            ))
        })?;

        let (proto_version, software_and_comments) = rest.split_once('-').ok_or_else(|| {
            KestrelError::Protocol(format!("Invalid version string format: '{}'", line))
        })?;
        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(KestrelError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match software_and_comments.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (software_and_comments.to_string(), None),
        };
        if software_version.is_empty() {
            return Err(KestrelError::Protocol(
                "Version string has empty software version".to_string(),
            ));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Protocol version, e.g. "2.0".
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Software version, e.g. "OpenSSH_8.9".
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The line as sent on the wire, CR LF included.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Peer identification as received: the parsed form plus the exact line
/// (without CR LF) that enters the exchange hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentification {
    /// Parsed identification
    pub version: Version,
    /// Raw line bytes without the line terminator
    pub raw: Vec<u8>,
}

/// Incremental reader for the peer identification line.
#[derive(Debug, Default)]
pub struct IdentificationReader {
    banner_lines: usize,
}

impl IdentificationReader {
    /// Creates a reader that has seen no lines yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-identification lines skipped so far.
    pub fn banner_lines(&self) -> usize {
        self.banner_lines
    }

    /// Consumes complete lines from `input`.
    ///
    /// Returns `Ok(None)` while more bytes are needed. Bytes after the
    /// identification line are left in `input` for the packet layer.
    pub fn read(&mut self, input: &mut BytesMut) -> KestrelResult<Option<PeerIdentification>> {
        loop {
            let newline = match input.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => {
                    if input.len() > MAX_VERSION_LENGTH + 2 {
                        return Err(KestrelError::Protocol(
                            "identification line exceeds 255 bytes".to_string(),
                        ));
                    }
                    return Ok(None);
                }
            };

            let mut line = input.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.starts_with(b"SSH-") {
                let text = std::str::from_utf8(&line).map_err(|_| {
                    KestrelError::Protocol("identification line is not UTF-8".to_string())
                })?;
                let version = Version::parse(text)?;
                return Ok(Some(PeerIdentification {
                    version,
                    raw: line.to_vec(),
                }));
            }

            if line.len() > MAX_VERSION_LENGTH {
                return Err(KestrelError::Protocol(
                    "pre-identification line exceeds 255 bytes".to_string(),
                ));
            }
            self.banner_lines += 1;
            if self.banner_lines > MAX_BANNER_LINES {
                return Err(KestrelError::Protocol(
                    "too many lines before identification".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        let version = Version::new("Kestrel_0.1.0", None);
        assert_eq!(version.to_string(), "SSH-2.0-Kestrel_0.1.0");
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Kestrel_0.1.0\r\n");
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_version_parse_1_99_accepted() {
        let version = Version::parse("SSH-1.99-Legacy").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_rejects_bad_input() {
        assert!(matches!(
            Version::parse("INVALID-2.0-Test"),
            Err(KestrelError::Protocol(_))
        ));
        assert!(Version::parse("SSH-1.0-OldClient").is_err());
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
        assert!(Version::parse(&format!("SSH-2.0-{}", "A".repeat(300))).is_err());
    }

    #[test]
    fn test_reader_skips_banner_lines() {
        let mut reader = IdentificationReader::new();
        let mut input = BytesMut::from(&b"welcome\r\nto the host\nSSH-2.0-Peer_1.0\r\nREST"[..]);

        let id = reader.read(&mut input).unwrap().unwrap();
        assert_eq!(id.version.software(), "Peer_1.0");
        assert_eq!(id.raw, b"SSH-2.0-Peer_1.0");
        assert_eq!(reader.banner_lines(), 2);
        assert_eq!(&input[..], b"REST");
    }

    #[test]
    fn test_reader_waits_for_complete_line() {
        let mut reader = IdentificationReader::new();
        let mut input = BytesMut::from(&b"SSH-2.0-Pe"[..]);
        assert!(reader.read(&mut input).unwrap().is_none());

        input.extend_from_slice(b"er\r\n");
        assert!(reader.read(&mut input).unwrap().is_some());
    }

    #[test]
    fn test_reader_rejects_overlong_line() {
        let mut reader = IdentificationReader::new();
        let mut input = BytesMut::from(vec![b'x'; 400].as_slice());
        assert!(reader.read(&mut input).is_err());
    }
}
