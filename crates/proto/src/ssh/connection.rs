//! SSH connection protocol messages (RFC 4254).
//!
//! This module defines the wire messages of the connection protocol:
//! - Channel open / confirmation / failure (Section 5.1)
//! - Window adjust, data and extended data (Section 5.2)
//! - EOF and close (Section 5.3)
//! - Channel requests and their replies (Section 5.4, 6)
//! - Global requests (Section 4)
//!
//! Channel state lives in [`super::channel`]; routing lives in
//! [`super::mux`]. [`ConnectionMessage::parse`] turns any payload in the
//! 80..=100 range into a typed message.
//!
//! # Security
//!
//! - **Maximum packet size** - peers may not advertise more than
//!   [`MAX_PACKET_SIZE`]
//! - **Strict parsing** - every field is length checked by [`Reader`]
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::connection::{ChannelOpen, ChannelType};
//!
//! let open = ChannelOpen::new(ChannelType::Session, 0, 2 * 1024 * 1024, 32768);
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert_eq!(parsed.channel_type().name(), "session");
//! ```

use super::message::{expect_type, MessageType};
use super::wire::{put_bool, put_string, Reader};
use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};

/// Maximum window size (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum packet size a peer may advertise (256 KB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel (remote port forwarding).
    ForwardedTcpip {
        /// Connected address
        connected_address: String,
        /// Connected port
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Any other type; type specific data is kept raw.
    Other {
        /// Type name
        name: String,
        /// Type specific data
        data: Vec<u8>,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    ///
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        put_string(&mut buf, self.channel_type.name().as_bytes());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);

        match &self.channel_type {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                put_string(&mut buf, host.as_bytes());
                buf.put_u32(*port);
                put_string(&mut buf, originator_address.as_bytes());
                buf.put_u32(*originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                put_string(&mut buf, connected_address.as_bytes());
                buf.put_u32(*connected_port);
                put_string(&mut buf, originator_address.as_bytes());
                buf.put_u32(*originator_port);
            }
            ChannelType::Other { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelOpen)?;
        let name = r.read_utf8()?;
        let sender_channel = r.read_u32()?;
        let initial_window_size = r.read_u32()?;
        let maximum_packet_size = r.read_u32()?;

        let channel_type = match name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: r.read_utf8()?,
                port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: r.read_utf8()?,
                connected_port: r.read_u32()?,
                originator_address: r.read_utf8()?,
                originator_port: r.read_u32()?,
            },
            _ => ChannelType::Other {
                name,
                data: r.read_rest().to_vec(),
            },
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a new confirmation.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes. Type specific trailing data is ignored.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from the wire code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Default description text.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: u32,
    description: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the reason's default description.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self::with_description(recipient_channel, reason, reason.as_str())
    }

    /// Creates a failure with a custom description.
    pub fn with_description(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: impl Into<String>,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: description.into(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Raw reason code; peers may send codes outside RFC 4254.
    pub fn reason_code(&self) -> u32 {
        self.reason_code
    }

    /// Known reason, if any.
    pub fn reason(&self) -> Option<ChannelOpenFailureReason> {
        ChannelOpenFailureReason::from_u32(self.reason_code)
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Converts into the error handed to whoever requested the open.
    pub fn into_error(self) -> KestrelError {
        KestrelError::ChannelOpenFailure {
            reason: self.reason_code,
            description: self.description,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        put_string(&mut buf, self.description.as_bytes());
        put_string(&mut buf, b"");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelOpenFailure)?;
        let recipient_channel = r.read_u32()?;
        let reason_code = r.read_u32()?;
        let description = r.read_utf8()?;
        // Language tag is optional in practice.
        if r.remaining() > 0 {
            r.read_string()?;
        }
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the bytes to add.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            bytes_to_add: r.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message, returning the data.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        put_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: u32,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates a new extended data message.
    pub fn new(recipient_channel: u32, data_type_code: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code ([`EXTENDED_DATA_STDERR`] for stderr).
    pub fn data_type_code(&self) -> u32 {
        self.data_type_code
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        put_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data_type_code: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

/// Messages that carry only a recipient channel.
macro_rules! recipient_only_message {
    ($(#[$doc:meta])* $name:ident, $msg:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            recipient_channel: u32,
        }

        impl $name {
            /// Creates the message.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Returns the recipient channel number.
            pub fn recipient_channel(&self) -> u32 {
                self.recipient_channel
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8($msg as u8);
                buf.put_u32(self.recipient_channel);
                buf.to_vec()
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
                let mut r = Reader::new(data);
                expect_type(&mut r, $msg)?;
                Ok(Self {
                    recipient_channel: r.read_u32()?,
                })
            }
        }
    };
}

recipient_only_message!(
    /// SSH_MSG_CHANNEL_EOF (RFC 4254 Section 5.3).
    ChannelEof,
    MessageType::ChannelEof
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE (RFC 4254 Section 5.3).
    ChannelClose,
    MessageType::ChannelClose
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS (RFC 4254 Section 5.4).
    ChannelSuccess,
    MessageType::ChannelSuccess
);
recipient_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE (RFC 4254 Section 5.4).
    ChannelFailure,
    MessageType::ChannelFailure
);

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Pseudo-terminal allocation
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Width in characters
        width_chars: u32,
        /// Height in rows
        height_rows: u32,
        /// Width in pixels
        width_pixels: u32,
        /// Height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Interactive shell
    Shell,
    /// Subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal size change
    WindowChange {
        /// Width in characters
        width_chars: u32,
        /// Height in rows
        height_rows: u32,
        /// Width in pixels
        width_pixels: u32,
        /// Height in pixels
        height_pixels: u32,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// Any other request; data is kept raw.
    Other {
        /// Request name
        name: String,
        /// Request specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        put_string(&mut buf, self.request_type.name().as_bytes());
        put_bool(&mut buf, self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                put_string(&mut buf, term.as_bytes());
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                put_string(&mut buf, modes);
            }
            ChannelRequestType::Env { name, value } => {
                put_string(&mut buf, name.as_bytes());
                put_string(&mut buf, value.as_bytes());
            }
            ChannelRequestType::Exec { command } => put_string(&mut buf, command.as_bytes()),
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => put_string(&mut buf, name.as_bytes()),
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                put_string(&mut buf, signal_name.as_bytes());
                put_bool(&mut buf, *core_dumped);
                put_string(&mut buf, error_message.as_bytes());
                put_string(&mut buf, language_tag.as_bytes());
            }
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    /// Parses from bytes. Unknown request names become
    /// [`ChannelRequestType::Other`] so the handler can still refuse them.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::ChannelRequest)?;
        let recipient_channel = r.read_u32()?;
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;

        let request_type = match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: r.read_utf8()?,
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
                modes: r.read_string()?.to_vec(),
            },
            "env" => ChannelRequestType::Env {
                name: r.read_utf8()?,
                value: r.read_utf8()?,
            },
            "exec" => ChannelRequestType::Exec {
                command: r.read_utf8()?,
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.read_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.read_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: r.read_utf8()?,
                core_dumped: r.read_bool()?,
                error_message: r.read_utf8()?,
                language_tag: r.read_utf8()?,
            },
            _ => ChannelRequestType::Other {
                name,
                data: r.read_rest().to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    name: String,
    want_reply: bool,
    data: Vec<u8>,
}

impl GlobalRequest {
    /// Creates a new global request with raw request data.
    pub fn new(name: impl Into<String>, want_reply: bool, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            want_reply,
            data,
        }
    }

    /// Request name (e.g. "keepalive@openssh.com").
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Request specific data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        put_string(&mut buf, self.name.as_bytes());
        put_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::GlobalRequest)?;
        Ok(Self {
            name: r.read_utf8()?,
            want_reply: r.read_bool()?,
            data: r.read_rest().to_vec(),
        })
    }
}

/// SSH_MSG_REQUEST_SUCCESS with optional response data.
pub fn request_success(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(MessageType::RequestSuccess as u8);
    out.extend_from_slice(data);
    out
}

/// SSH_MSG_REQUEST_FAILURE.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}

/// Any connection protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMessage {
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest(GlobalRequest),
    /// SSH_MSG_REQUEST_SUCCESS with its data
    RequestSuccess(Vec<u8>),
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure,
    /// SSH_MSG_CHANNEL_OPEN
    Open(ChannelOpen),
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    OpenConfirmation(ChannelOpenConfirmation),
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    OpenFailure(ChannelOpenFailure),
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    WindowAdjust(ChannelWindowAdjust),
    /// SSH_MSG_CHANNEL_DATA
    Data(ChannelData),
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ExtendedData(ChannelExtendedData),
    /// SSH_MSG_CHANNEL_EOF
    Eof(ChannelEof),
    /// SSH_MSG_CHANNEL_CLOSE
    Close(ChannelClose),
    /// SSH_MSG_CHANNEL_REQUEST
    Request(ChannelRequest),
    /// SSH_MSG_CHANNEL_SUCCESS
    Success(ChannelSuccess),
    /// SSH_MSG_CHANNEL_FAILURE
    Failure(ChannelFailure),
}

impl ConnectionMessage {
    /// Parses a payload in the 80..=100 range.
    pub fn parse(payload: &[u8]) -> KestrelResult<Self> {
        let msg_type = payload
            .first()
            .copied()
            .and_then(MessageType::from_u8)
            .ok_or_else(|| KestrelError::Protocol("empty or unknown connection message".into()))?;

        Ok(match msg_type {
            MessageType::GlobalRequest => Self::GlobalRequest(GlobalRequest::from_bytes(payload)?),
            MessageType::RequestSuccess => Self::RequestSuccess(payload[1..].to_vec()),
            MessageType::RequestFailure => Self::RequestFailure,
            MessageType::ChannelOpen => Self::Open(ChannelOpen::from_bytes(payload)?),
            MessageType::ChannelOpenConfirmation => {
                Self::OpenConfirmation(ChannelOpenConfirmation::from_bytes(payload)?)
            }
            MessageType::ChannelOpenFailure => Self::OpenFailure(ChannelOpenFailure::from_bytes(payload)?),
            MessageType::ChannelWindowAdjust => {
                Self::WindowAdjust(ChannelWindowAdjust::from_bytes(payload)?)
            }
            MessageType::ChannelData => Self::Data(ChannelData::from_bytes(payload)?),
            MessageType::ChannelExtendedData => {
                Self::ExtendedData(ChannelExtendedData::from_bytes(payload)?)
            }
            MessageType::ChannelEof => Self::Eof(ChannelEof::from_bytes(payload)?),
            MessageType::ChannelClose => Self::Close(ChannelClose::from_bytes(payload)?),
            MessageType::ChannelRequest => Self::Request(ChannelRequest::from_bytes(payload)?),
            MessageType::ChannelSuccess => Self::Success(ChannelSuccess::from_bytes(payload)?),
            MessageType::ChannelFailure => Self::Failure(ChannelFailure::from_bytes(payload)?),
            other => {
                return Err(KestrelError::Protocol(format!(
                    "{:?} is not a connection protocol message",
                    other
                )))
            }
        })
    }

    /// Local channel the message is addressed to, if any.
    pub fn recipient_channel(&self) -> Option<u32> {
        match self {
            Self::GlobalRequest(_) | Self::RequestSuccess(_) | Self::RequestFailure | Self::Open(_) => None,
            Self::OpenConfirmation(m) => Some(m.recipient_channel()),
            Self::OpenFailure(m) => Some(m.recipient_channel()),
            Self::WindowAdjust(m) => Some(m.recipient_channel()),
            Self::Data(m) => Some(m.recipient_channel()),
            Self::ExtendedData(m) => Some(m.recipient_channel()),
            Self::Eof(m) => Some(m.recipient_channel()),
            Self::Close(m) => Some(m.recipient_channel()),
            Self::Request(m) => Some(m.recipient_channel()),
            Self::Success(m) => Some(m.recipient_channel()),
            Self::Failure(m) => Some(m.recipient_channel()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_session() {
        let open = ChannelOpen::new(ChannelType::Session, 0, 1048576, 32768);
        let bytes = open.to_bytes();
        assert_eq!(bytes[0], 90);
        let parsed = ChannelOpen::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_channel_open_direct_tcpip() {
        let open = ChannelOpen::new(
            ChannelType::DirectTcpip {
                host: "example.com".to_string(),
                port: 80,
                originator_address: "127.0.0.1".to_string(),
                originator_port: 12345,
            },
            5,
            65536,
            16384,
        );
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
        assert_eq!(parsed.channel_type().name(), "direct-tcpip");
    }

    #[test]
    fn test_channel_open_custom_type_keeps_data() {
        let open = ChannelOpen::new(
            ChannelType::Other {
                name: "tunnel@example.com".to_string(),
                data: vec![1, 2, 3],
            },
            2,
            1024,
            512,
        );
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_open_failure_unknown_code() {
        let mut bytes = ChannelOpenFailure::new(3, ChannelOpenFailureReason::ConnectFailed).to_bytes();
        bytes[5..9].copy_from_slice(&77u32.to_be_bytes());
        let parsed = ChannelOpenFailure::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.reason_code(), 77);
        assert_eq!(parsed.reason(), None);
        match parsed.into_error() {
            KestrelError::ChannelOpenFailure { reason, .. } => assert_eq!(reason, 77),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_open_failure_without_language_tag() {
        let mut buf = BytesMut::new();
        buf.put_u8(92);
        buf.put_u32(1);
        buf.put_u32(1);
        put_string(&mut buf, b"no");
        let parsed = ChannelOpenFailure::from_bytes(&buf).unwrap();
        assert_eq!(
            parsed.reason(),
            Some(ChannelOpenFailureReason::AdministrativelyProhibited)
        );
    }

    #[test]
    fn test_channel_requests() {
        let requests = vec![
            ChannelRequestType::Subsystem {
                name: "sftp".to_string(),
            },
            ChannelRequestType::Exec {
                command: "ls".to_string(),
            },
            ChannelRequestType::Shell,
            ChannelRequestType::Env {
                name: "LANG".to_string(),
                value: "C".to_string(),
            },
            ChannelRequestType::WindowChange {
                width_chars: 80,
                height_rows: 24,
                width_pixels: 0,
                height_pixels: 0,
            },
            ChannelRequestType::ExitStatus { exit_status: 2 },
            ChannelRequestType::Other {
                name: "auth-agent-req@openssh.com".to_string(),
                data: vec![],
            },
        ];
        for request_type in requests {
            let req = ChannelRequest::new(4, request_type, true);
            assert_eq!(ChannelRequest::from_bytes(&req.to_bytes()).unwrap(), req);
        }
    }

    #[test]
    fn test_truncated_request_rejected() {
        let req = ChannelRequest::new(
            1,
            ChannelRequestType::PtyReq {
                term: "xterm".to_string(),
                width_chars: 80,
                height_rows: 24,
                width_pixels: 0,
                height_pixels: 0,
                modes: vec![0],
            },
            false,
        );
        let bytes = req.to_bytes();
        assert!(ChannelRequest::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_connection_message_dispatch() {
        let msgs: Vec<Vec<u8>> = vec![
            ChannelData::new(1, b"hi".to_vec()).to_bytes(),
            ChannelExtendedData::new(1, EXTENDED_DATA_STDERR, b"err".to_vec()).to_bytes(),
            ChannelWindowAdjust::new(1, 100).to_bytes(),
            ChannelEof::new(1).to_bytes(),
            ChannelClose::new(1).to_bytes(),
            ChannelSuccess::new(1).to_bytes(),
            ChannelFailure::new(1).to_bytes(),
            ChannelOpenConfirmation::new(1, 9, 10, 11).to_bytes(),
        ];
        for m in msgs {
            let parsed = ConnectionMessage::parse(&m).unwrap();
            assert_eq!(parsed.recipient_channel(), Some(1));
        }

        let global = GlobalRequest::new("keepalive@openssh.com", true, vec![]);
        assert_eq!(
            ConnectionMessage::parse(&global.to_bytes()).unwrap(),
            ConnectionMessage::GlobalRequest(global)
        );
        assert_eq!(
            ConnectionMessage::parse(&request_failure()).unwrap(),
            ConnectionMessage::RequestFailure
        );
        assert_eq!(
            ConnectionMessage::parse(&request_success(&[1, 2])).unwrap(),
            ConnectionMessage::RequestSuccess(vec![1, 2])
        );
        assert!(ConnectionMessage::parse(&[]).is_err());
        assert!(ConnectionMessage::parse(&[50]).is_err());
    }
}
