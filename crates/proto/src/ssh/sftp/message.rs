//! SFTP v3 packets.
//!
//! Every packet is `uint32 length | byte type | payload`; every request
//! except INIT carries a `uint32 request-id` first in its payload, echoed by
//! the reply. Channel data does not respect packet boundaries, so inbound
//! bytes go through a [`Framer`] first.

use super::types::{FileAttributes, NameEntry, OpenFlags, SftpError};
use crate::ssh::wire::{put_string, Reader};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};

/// Protocol version spoken by both ends.
pub const SFTP_VERSION: u32 = 3;

/// Default limit for one packet (length field value).
pub const DEFAULT_MAX_PACKET_LEN: usize = 256 * 1024;

/// SSH_FXP_* packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SftpMessageType {
    /// SSH_FXP_INIT
    Init = 1,
    /// SSH_FXP_VERSION
    Version = 2,
    /// SSH_FXP_OPEN
    Open = 3,
    /// SSH_FXP_CLOSE
    Close = 4,
    /// SSH_FXP_READ
    Read = 5,
    /// SSH_FXP_WRITE
    Write = 6,
    /// SSH_FXP_LSTAT
    Lstat = 7,
    /// SSH_FXP_FSTAT
    Fstat = 8,
    /// SSH_FXP_SETSTAT
    Setstat = 9,
    /// SSH_FXP_FSETSTAT
    Fsetstat = 10,
    /// SSH_FXP_OPENDIR
    Opendir = 11,
    /// SSH_FXP_READDIR
    Readdir = 12,
    /// SSH_FXP_REMOVE
    Remove = 13,
    /// SSH_FXP_MKDIR
    Mkdir = 14,
    /// SSH_FXP_RMDIR
    Rmdir = 15,
    /// SSH_FXP_REALPATH
    Realpath = 16,
    /// SSH_FXP_STAT
    Stat = 17,
    /// SSH_FXP_RENAME
    Rename = 18,
    /// SSH_FXP_READLINK
    Readlink = 19,
    /// SSH_FXP_SYMLINK
    Symlink = 20,
    /// SSH_FXP_STATUS
    Status = 101,
    /// SSH_FXP_HANDLE
    Handle = 102,
    /// SSH_FXP_DATA
    Data = 103,
    /// SSH_FXP_NAME
    Name = 104,
    /// SSH_FXP_ATTRS
    Attrs = 105,
    /// SSH_FXP_EXTENDED
    Extended = 200,
    /// SSH_FXP_EXTENDED_REPLY
    ExtendedReply = 201,
}

impl SftpMessageType {
    /// Converts a wire type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        use SftpMessageType::*;
        Some(match value {
            1 => Init,
            2 => Version,
            3 => Open,
            4 => Close,
            5 => Read,
            6 => Write,
            7 => Lstat,
            8 => Fstat,
            9 => Setstat,
            10 => Fsetstat,
            11 => Opendir,
            12 => Readdir,
            13 => Remove,
            14 => Mkdir,
            15 => Rmdir,
            16 => Realpath,
            17 => Stat,
            18 => Rename,
            19 => Readlink,
            20 => Symlink,
            101 => Status,
            102 => Handle,
            103 => Data,
            104 => Name,
            105 => Attrs,
            200 => Extended,
            201 => ExtendedReply,
            _ => return None,
        })
    }
}

/// Client to server packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// SSH_FXP_INIT
    Init {
        /// Client version
        version: u32,
        /// Extension pairs
        extensions: Vec<(String, Vec<u8>)>,
    },
    /// SSH_FXP_OPEN
    Open {
        /// Request id
        id: u32,
        /// Path
        path: String,
        /// SSH_FXF_* flags
        flags: OpenFlags,
        /// Initial attributes
        attrs: FileAttributes,
    },
    /// SSH_FXP_CLOSE
    Close {
        /// Request id
        id: u32,
        /// Handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_READ
    Read {
        /// Request id
        id: u32,
        /// Handle
        handle: Vec<u8>,
        /// File offset
        offset: u64,
        /// Requested length
        len: u32,
    },
    /// SSH_FXP_WRITE
    Write {
        /// Request id
        id: u32,
        /// Handle
        handle: Vec<u8>,
        /// File offset
        offset: u64,
        /// Bytes to write
        data: Vec<u8>,
    },
    /// SSH_FXP_LSTAT
    Lstat {
        /// Request id
        id: u32,
        /// Path
        path: String,
    },
    /// SSH_FXP_FSTAT
    Fstat {
        /// Request id
        id: u32,
        /// Handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_SETSTAT
    Setstat {
        /// Request id
        id: u32,
        /// Path
        path: String,
        /// Attributes to apply
        attrs: FileAttributes,
    },
    /// SSH_FXP_FSETSTAT
    Fsetstat {
        /// Request id
        id: u32,
        /// Handle
        handle: Vec<u8>,
        /// Attributes to apply
        attrs: FileAttributes,
    },
    /// SSH_FXP_OPENDIR
    Opendir {
        /// Request id
        id: u32,
        /// Directory path
        path: String,
    },
    /// SSH_FXP_READDIR
    Readdir {
        /// Request id
        id: u32,
        /// Directory handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_REMOVE
    Remove {
        /// Request id
        id: u32,
        /// Path
        path: String,
    },
    /// SSH_FXP_MKDIR
    Mkdir {
        /// Request id
        id: u32,
        /// Path
        path: String,
        /// Initial attributes
        attrs: FileAttributes,
    },
    /// SSH_FXP_RMDIR
    Rmdir {
        /// Request id
        id: u32,
        /// Path
        path: String,
    },
    /// SSH_FXP_REALPATH
    Realpath {
        /// Request id
        id: u32,
        /// Path
        path: String,
    },
    /// SSH_FXP_STAT
    Stat {
        /// Request id
        id: u32,
        /// Path
        path: String,
    },
    /// SSH_FXP_RENAME
    Rename {
        /// Request id
        id: u32,
        /// Existing path
        old_path: String,
        /// New path
        new_path: String,
    },
    /// SSH_FXP_READLINK
    Readlink {
        /// Request id
        id: u32,
        /// Link path
        path: String,
    },
    /// SSH_FXP_SYMLINK
    Symlink {
        /// Request id
        id: u32,
        /// Link to create
        link_path: String,
        /// What it points at
        target_path: String,
    },
    /// SSH_FXP_EXTENDED
    Extended {
        /// Request id
        id: u32,
        /// Extension name
        name: String,
        /// Extension specific payload
        data: Vec<u8>,
    },
}

impl Request {
    /// Request id, `None` for INIT.
    pub fn id(&self) -> Option<u32> {
        match self {
            Request::Init { .. } => None,
            Request::Open { id, .. }
            | Request::Close { id, .. }
            | Request::Read { id, .. }
            | Request::Write { id, .. }
            | Request::Lstat { id, .. }
            | Request::Fstat { id, .. }
            | Request::Setstat { id, .. }
            | Request::Fsetstat { id, .. }
            | Request::Opendir { id, .. }
            | Request::Readdir { id, .. }
            | Request::Remove { id, .. }
            | Request::Mkdir { id, .. }
            | Request::Rmdir { id, .. }
            | Request::Realpath { id, .. }
            | Request::Stat { id, .. }
            | Request::Rename { id, .. }
            | Request::Readlink { id, .. }
            | Request::Symlink { id, .. }
            | Request::Extended { id, .. } => Some(*id),
        }
    }

    /// Handle the request operates on, if any.
    pub fn handle(&self) -> Option<&[u8]> {
        match self {
            Request::Close { handle, .. }
            | Request::Read { handle, .. }
            | Request::Write { handle, .. }
            | Request::Fstat { handle, .. }
            | Request::Fsetstat { handle, .. }
            | Request::Readdir { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Packet type byte.
    pub fn message_type(&self) -> SftpMessageType {
        match self {
            Request::Init { .. } => SftpMessageType::Init,
            Request::Open { .. } => SftpMessageType::Open,
            Request::Close { .. } => SftpMessageType::Close,
            Request::Read { .. } => SftpMessageType::Read,
            Request::Write { .. } => SftpMessageType::Write,
            Request::Lstat { .. } => SftpMessageType::Lstat,
            Request::Fstat { .. } => SftpMessageType::Fstat,
            Request::Setstat { .. } => SftpMessageType::Setstat,
            Request::Fsetstat { .. } => SftpMessageType::Fsetstat,
            Request::Opendir { .. } => SftpMessageType::Opendir,
            Request::Readdir { .. } => SftpMessageType::Readdir,
            Request::Remove { .. } => SftpMessageType::Remove,
            Request::Mkdir { .. } => SftpMessageType::Mkdir,
            Request::Rmdir { .. } => SftpMessageType::Rmdir,
            Request::Realpath { .. } => SftpMessageType::Realpath,
            Request::Stat { .. } => SftpMessageType::Stat,
            Request::Rename { .. } => SftpMessageType::Rename,
            Request::Readlink { .. } => SftpMessageType::Readlink,
            Request::Symlink { .. } => SftpMessageType::Symlink,
            Request::Extended { .. } => SftpMessageType::Extended,
        }
    }

    /// Encodes the full packet including the length prefix.
    pub fn to_bytes(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(self.message_type() as u8);
        match self {
            Request::Init {
                version,
                extensions,
            } => {
                body.put_u32(*version);
                for (name, data) in extensions {
                    put_string(&mut body, name.as_bytes());
                    put_string(&mut body, data);
                }
            }
            Request::Open {
                id,
                path,
                flags,
                attrs,
            } => {
                body.put_u32(*id);
                put_string(&mut body, path.as_bytes());
                body.put_u32(flags.0);
                attrs.encode(&mut body);
            }
            Request::Close { id, handle }
            | Request::Fstat { id, handle }
            | Request::Readdir { id, handle } => {
                body.put_u32(*id);
                put_string(&mut body, handle);
            }
            Request::Read {
                id,
                handle,
                offset,
                len,
            } => {
                body.put_u32(*id);
                put_string(&mut body, handle);
                body.put_u64(*offset);
                body.put_u32(*len);
            }
            Request::Write {
                id,
                handle,
                offset,
                data,
            } => {
                body.put_u32(*id);
                put_string(&mut body, handle);
                body.put_u64(*offset);
                put_string(&mut body, data);
            }
            Request::Lstat { id, path }
            | Request::Opendir { id, path }
            | Request::Remove { id, path }
            | Request::Rmdir { id, path }
            | Request::Realpath { id, path }
            | Request::Stat { id, path }
            | Request::Readlink { id, path } => {
                body.put_u32(*id);
                put_string(&mut body, path.as_bytes());
            }
            Request::Setstat { id, path, attrs } | Request::Mkdir { id, path, attrs } => {
                body.put_u32(*id);
                put_string(&mut body, path.as_bytes());
                attrs.encode(&mut body);
            }
            Request::Fsetstat { id, handle, attrs } => {
                body.put_u32(*id);
                put_string(&mut body, handle);
                attrs.encode(&mut body);
            }
            Request::Rename {
                id,
                old_path,
                new_path,
            } => {
                body.put_u32(*id);
                put_string(&mut body, old_path.as_bytes());
                put_string(&mut body, new_path.as_bytes());
            }
            Request::Symlink {
                id,
                link_path,
                target_path,
            } => {
                body.put_u32(*id);
                put_string(&mut body, link_path.as_bytes());
                put_string(&mut body, target_path.as_bytes());
            }
            Request::Extended { id, name, data } => {
                body.put_u32(*id);
                put_string(&mut body, name.as_bytes());
                body.put_slice(data);
            }
        }
        frame(body)
    }

    /// Parses one packet body (type byte onwards, no length prefix).
    pub fn parse(body: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(body);
        let type_byte = r.read_u8()?;
        let msg_type = SftpMessageType::from_u8(type_byte).ok_or_else(|| {
            KestrelError::Protocol(format!("unknown SFTP request type {}", type_byte))
        })?;
        let request = match msg_type {
            SftpMessageType::Init => {
                let version = r.read_u32()?;
                let mut extensions = Vec::new();
                while !r.is_empty() {
                    let name = r.read_utf8()?;
                    let data = r.read_string()?.to_vec();
                    extensions.push((name, data));
                }
                Request::Init {
                    version,
                    extensions,
                }
            }
            SftpMessageType::Open => Request::Open {
                id: r.read_u32()?,
                path: r.read_utf8()?,
                flags: OpenFlags(r.read_u32()?),
                attrs: FileAttributes::decode(&mut r)?,
            },
            SftpMessageType::Close => Request::Close {
                id: r.read_u32()?,
                handle: r.read_string()?.to_vec(),
            },
            SftpMessageType::Read => Request::Read {
                id: r.read_u32()?,
                handle: r.read_string()?.to_vec(),
                offset: r.read_u64()?,
                len: r.read_u32()?,
            },
            SftpMessageType::Write => Request::Write {
                id: r.read_u32()?,
                handle: r.read_string()?.to_vec(),
                offset: r.read_u64()?,
                data: r.read_string()?.to_vec(),
            },
            SftpMessageType::Lstat => Request::Lstat {
                id: r.read_u32()?,
                path: r.read_utf8()?,
            },
            SftpMessageType::Fstat => Request::Fstat {
                id: r.read_u32()?,
                handle: r.read_string()?.to_vec(),
            },
            SftpMessageType::Setstat => Request::Setstat {
                id: r.read_u32()?,
                path: r.read_utf8()?,
                attrs: FileAttributes::decode(&mut r)?,
            },
            SftpMessageType::Fsetstat => Request::Fsetstat {
                id: r.read_u32()?,
                handle: r.read_string()?.to_vec(),
                attrs: FileAttributes::decode(&mut r)?,
            },
            SftpMessageType::Opendir => Request::Opendir {
                id: r.read_u32()?,
                path: r.read_utf8()?,
            },
            SftpMessageType::Readdir => Request::Readdir {
                id: r.read_u32()?,
                handle: r.read_string()?.to_vec(),
            },
            SftpMessageType::Remove => Request::Remove {
                id: r.read_u32()?,
                path: r.read_utf8()?,
            },
            SftpMessageType::Mkdir => Request::Mkdir {
                id: r.read_u32()?,
                path: r.read_utf8()?,
                attrs: FileAttributes::decode(&mut r)?,
            },
            SftpMessageType::Rmdir => Request::Rmdir {
                id: r.read_u32()?,
                path: r.read_utf8()?,
            },
            SftpMessageType::Realpath => Request::Realpath {
                id: r.read_u32()?,
                path: r.read_utf8()?,
            },
            SftpMessageType::Stat => Request::Stat {
                id: r.read_u32()?,
                path: r.read_utf8()?,
            },
            SftpMessageType::Rename => Request::Rename {
                id: r.read_u32()?,
                old_path: r.read_utf8()?,
                new_path: r.read_utf8()?,
            },
            SftpMessageType::Readlink => Request::Readlink {
                id: r.read_u32()?,
                path: r.read_utf8()?,
            },
            SftpMessageType::Symlink => Request::Symlink {
                id: r.read_u32()?,
                link_path: r.read_utf8()?,
                target_path: r.read_utf8()?,
            },
            SftpMessageType::Extended => Request::Extended {
                id: r.read_u32()?,
                name: r.read_utf8()?,
                data: r.read_rest().to_vec(),
            },
            other => {
                return Err(KestrelError::Protocol(format!(
                    "{:?} is not a request",
                    other
                )))
            }
        };
        r.finish()?;
        Ok(request)
    }
}

/// Server to client packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// SSH_FXP_VERSION
    Version {
        /// Server version
        version: u32,
        /// Advertised extensions (name, data)
        extensions: Vec<(String, Vec<u8>)>,
    },
    /// SSH_FXP_STATUS
    Status {
        /// Request id
        id: u32,
        /// SSH_FX_* code
        code: u32,
        /// Human readable text
        message: String,
        /// Language tag
        language: String,
    },
    /// SSH_FXP_HANDLE
    Handle {
        /// Request id
        id: u32,
        /// Opaque handle
        handle: Vec<u8>,
    },
    /// SSH_FXP_DATA
    Data {
        /// Request id
        id: u32,
        /// File bytes
        data: Vec<u8>,
    },
    /// SSH_FXP_NAME
    Name {
        /// Request id
        id: u32,
        /// Entries
        entries: Vec<NameEntry>,
    },
    /// SSH_FXP_ATTRS
    Attrs {
        /// Request id
        id: u32,
        /// Attributes
        attrs: FileAttributes,
    },
    /// SSH_FXP_EXTENDED_REPLY
    ExtendedReply {
        /// Request id
        id: u32,
        /// Extension specific payload
        data: Vec<u8>,
    },
}

impl Response {
    /// SSH_FX_OK status.
    pub fn ok(id: u32) -> Self {
        Response::Status {
            id,
            code: 0,
            message: "Success".to_string(),
            language: "en".to_string(),
        }
    }

    /// Status reply describing `err`.
    pub fn error(id: u32, err: &SftpError) -> Self {
        Response::Status {
            id,
            code: err.code(),
            message: err.message(),
            language: "en".to_string(),
        }
    }

    /// Request id this answers, `None` for VERSION.
    pub fn id(&self) -> Option<u32> {
        match self {
            Response::Version { .. } => None,
            Response::Status { id, .. }
            | Response::Handle { id, .. }
            | Response::Data { id, .. }
            | Response::Name { id, .. }
            | Response::Attrs { id, .. }
            | Response::ExtendedReply { id, .. } => Some(*id),
        }
    }

    /// Encodes the full packet including the length prefix.
    pub fn to_bytes(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);
        match self {
            Response::Version {
                version,
                extensions,
            } => {
                body.put_u8(SftpMessageType::Version as u8);
                body.put_u32(*version);
                for (name, data) in extensions {
                    put_string(&mut body, name.as_bytes());
                    put_string(&mut body, data);
                }
            }
            Response::Status {
                id,
                code,
                message,
                language,
            } => {
                body.put_u8(SftpMessageType::Status as u8);
                body.put_u32(*id);
                body.put_u32(*code);
                put_string(&mut body, message.as_bytes());
                put_string(&mut body, language.as_bytes());
            }
            Response::Handle { id, handle } => {
                body.put_u8(SftpMessageType::Handle as u8);
                body.put_u32(*id);
                put_string(&mut body, handle);
            }
            Response::Data { id, data } => {
                body.put_u8(SftpMessageType::Data as u8);
                body.put_u32(*id);
                put_string(&mut body, data);
            }
            Response::Name { id, entries } => {
                body.put_u8(SftpMessageType::Name as u8);
                body.put_u32(*id);
                body.put_u32(entries.len() as u32);
                for entry in entries {
                    put_string(&mut body, entry.filename.as_bytes());
                    put_string(&mut body, entry.longname.as_bytes());
                    entry.attrs.encode(&mut body);
                }
            }
            Response::Attrs { id, attrs } => {
                body.put_u8(SftpMessageType::Attrs as u8);
                body.put_u32(*id);
                attrs.encode(&mut body);
            }
            Response::ExtendedReply { id, data } => {
                body.put_u8(SftpMessageType::ExtendedReply as u8);
                body.put_u32(*id);
                body.put_slice(data);
            }
        }
        frame(body)
    }

    /// Parses one packet body (type byte onwards, no length prefix).
    pub fn parse(body: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(body);
        let type_byte = r.read_u8()?;
        let response = match SftpMessageType::from_u8(type_byte) {
            Some(SftpMessageType::Version) => {
                let version = r.read_u32()?;
                let mut extensions = Vec::new();
                while !r.is_empty() {
                    let name = r.read_utf8()?;
                    let data = r.read_string()?.to_vec();
                    extensions.push((name, data));
                }
                Response::Version {
                    version,
                    extensions,
                }
            }
            Some(SftpMessageType::Status) => {
                let id = r.read_u32()?;
                let code = r.read_u32()?;
                // Pre-v3 servers omit message and language.
                let (message, language) = if r.is_empty() {
                    (String::new(), String::new())
                } else {
                    (r.read_utf8()?, r.read_utf8()?)
                };
                Response::Status {
                    id,
                    code,
                    message,
                    language,
                }
            }
            Some(SftpMessageType::Handle) => Response::Handle {
                id: r.read_u32()?,
                handle: r.read_string()?.to_vec(),
            },
            Some(SftpMessageType::Data) => Response::Data {
                id: r.read_u32()?,
                data: r.read_string()?.to_vec(),
            },
            Some(SftpMessageType::Name) => {
                let id = r.read_u32()?;
                let count = r.read_u32()?;
                if count as usize > r.remaining() / 12 {
                    return Err(KestrelError::Protocol(format!(
                        "name count {} exceeds message",
                        count
                    )));
                }
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(NameEntry {
                        filename: r.read_utf8()?,
                        longname: r.read_utf8()?,
                        attrs: FileAttributes::decode(&mut r)?,
                    });
                }
                Response::Name { id, entries }
            }
            Some(SftpMessageType::Attrs) => Response::Attrs {
                id: r.read_u32()?,
                attrs: FileAttributes::decode(&mut r)?,
            },
            Some(SftpMessageType::ExtendedReply) => Response::ExtendedReply {
                id: r.read_u32()?,
                data: r.read_rest().to_vec(),
            },
            _ => {
                return Err(KestrelError::Protocol(format!(
                    "unexpected SFTP response type {}",
                    type_byte
                )))
            }
        };
        r.finish()?;
        Ok(response)
    }
}

fn frame(body: BytesMut) -> Bytes {
    let mut packet = BytesMut::with_capacity(4 + body.len());
    packet.put_u32(body.len() as u32);
    packet.extend_from_slice(&body);
    packet.freeze()
}

/// Reassembles SFTP packets from arbitrarily split channel data.
#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
    max_len: usize,
}

impl Framer {
    /// Creates a framer rejecting packets longer than `max_len`.
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
        }
    }

    /// Appends received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete packet body, if one is buffered.
    pub fn next_packet(&mut self) -> KestrelResult<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 || len > self.max_len {
            return Err(KestrelError::Protocol(format!(
                "SFTP packet length {} out of range (max {})",
                len, self.max_len
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(request: &Request) -> Request {
        let bytes = request.to_bytes();
        Request::parse(&bytes[4..]).unwrap()
    }

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(SftpMessageType::from_u8(1), Some(SftpMessageType::Init));
        assert_eq!(SftpMessageType::from_u8(201), Some(SftpMessageType::ExtendedReply));
        assert_eq!(SftpMessageType::from_u8(99), None);
    }

    #[test]
    fn test_open_request_wire_layout() {
        let request = Request::Open {
            id: 7,
            path: "/a".to_string(),
            flags: OpenFlags::READ,
            attrs: FileAttributes::new(),
        };
        let bytes = request.to_bytes();
        assert_eq!(
            &bytes[..],
            &[0, 0, 0, 19, 3, 0, 0, 0, 7, 0, 0, 0, 2, b'/', b'a', 0, 0, 0, 1, 0, 0, 0, 0][..]
        );
        assert_eq!(reparse(&request), request);
        assert_eq!(request.id(), Some(7));
    }

    #[test]
    fn test_extended_request_keeps_payload() {
        let request = Request::Extended {
            id: 1,
            name: "check-file-name".to_string(),
            data: vec![1, 2, 3],
        };
        assert_eq!(reparse(&request), request);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let bytes = Request::Remove {
            id: 1,
            path: "x".to_string(),
        }
        .to_bytes();
        let mut body = bytes[4..].to_vec();
        body.push(0);
        assert!(Request::parse(&body).is_err());
    }

    #[test]
    fn test_response_is_not_a_request() {
        let bytes = Response::ok(3).to_bytes();
        assert!(Request::parse(&bytes[4..]).is_err());
    }

    #[test]
    fn test_status_response() {
        let response = Response::error(9, &SftpError::InvalidHandle);
        let bytes = response.to_bytes();
        match Response::parse(&bytes[4..]).unwrap() {
            Response::Status {
                id,
                code,
                message,
                language,
            } => {
                assert_eq!(id, 9);
                assert_eq!(code, 4);
                assert_eq!(message, "invalid handle");
                assert_eq!(language, "en");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_name_response() {
        let response = Response::Name {
            id: 2,
            entries: vec![
                NameEntry::new("a.txt", FileAttributes::file(10, 0o644)),
                NameEntry::new("dir", FileAttributes::directory(0o755)),
            ],
        };
        let bytes = response.to_bytes();
        assert_eq!(Response::parse(&bytes[4..]).unwrap(), response);
    }

    #[test]
    fn test_framer_reassembles_split_packets() {
        let a = Request::Stat {
            id: 1,
            path: "/one".to_string(),
        };
        let b = Request::Stat {
            id: 2,
            path: "/two".to_string(),
        };
        let mut stream = a.to_bytes().to_vec();
        stream.extend_from_slice(&b.to_bytes());

        let mut framer = Framer::default();
        framer.push(&stream[..3]);
        assert!(framer.next_packet().unwrap().is_none());
        framer.push(&stream[3..10]);
        assert!(framer.next_packet().unwrap().is_none());
        framer.push(&stream[10..]);

        let first = framer.next_packet().unwrap().unwrap();
        assert_eq!(Request::parse(&first).unwrap(), a);
        let second = framer.next_packet().unwrap().unwrap();
        assert_eq!(Request::parse(&second).unwrap(), b);
        assert!(framer.next_packet().unwrap().is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_framer_rejects_oversized_length() {
        let mut framer = Framer::new(1024);
        framer.push(&[0, 0, 0x10, 0]);
        assert!(framer.next_packet().is_err());
    }
}
