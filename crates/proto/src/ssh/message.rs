//! SSH protocol message numbers and transport-generic messages (RFC 4253).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key Exchange Method** (30-49): meaning depends on the negotiated method
//! - **User Authentication** (50-79)
//! - **Connection Protocol** (80-127)
//!
//! Numbers in the 30-49 range are reused by different key exchange methods
//! (30 is `KEXDH_INIT`, `KEX_ECDH_INIT` and `KEX_DH_GEX_REQUEST_OLD`), so only
//! the fixed ones appear in [`MessageType`]; the group exchange numbers are
//! constants in [`kex_dh`](super::kex_dh).
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::message::{MessageClass, MessageType};
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert_eq!(MessageClass::of(94), MessageClass::Connection);
//! ```

use super::wire::{put_bool, put_string, Reader};
use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};

/// SSH message numbers with a fixed meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// SSH_MSG_DISCONNECT
    Disconnect = 1,
    /// SSH_MSG_IGNORE
    Ignore = 2,
    /// SSH_MSG_UNIMPLEMENTED
    Unimplemented = 3,
    /// SSH_MSG_DEBUG
    Debug = 4,
    /// SSH_MSG_SERVICE_REQUEST
    ServiceRequest = 5,
    /// SSH_MSG_SERVICE_ACCEPT
    ServiceAccept = 6,
    /// SSH_MSG_KEXINIT
    KexInit = 20,
    /// SSH_MSG_NEWKEYS
    NewKeys = 21,
    /// SSH_MSG_KEXDH_INIT / SSH_MSG_KEX_ECDH_INIT
    KexdhInit = 30,
    /// SSH_MSG_KEXDH_REPLY / SSH_MSG_KEX_ECDH_REPLY
    KexdhReply = 31,
    /// SSH_MSG_USERAUTH_REQUEST
    UserauthRequest = 50,
    /// SSH_MSG_USERAUTH_FAILURE
    UserauthFailure = 51,
    /// SSH_MSG_USERAUTH_SUCCESS
    UserauthSuccess = 52,
    /// SSH_MSG_USERAUTH_BANNER
    UserauthBanner = 53,
    /// SSH_MSG_USERAUTH_PK_OK
    UserauthPkOk = 60,
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest = 80,
    /// SSH_MSG_REQUEST_SUCCESS
    RequestSuccess = 81,
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure = 82,
    /// SSH_MSG_CHANNEL_OPEN
    ChannelOpen = 90,
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    ChannelOpenConfirmation = 91,
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    ChannelOpenFailure = 92,
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    ChannelWindowAdjust = 93,
    /// SSH_MSG_CHANNEL_DATA
    ChannelData = 94,
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ChannelExtendedData = 95,
    /// SSH_MSG_CHANNEL_EOF
    ChannelEof = 96,
    /// SSH_MSG_CHANNEL_CLOSE
    ChannelClose = 97,
    /// SSH_MSG_CHANNEL_REQUEST
    ChannelRequest = 98,
    /// SSH_MSG_CHANNEL_SUCCESS
    ChannelSuccess = 99,
    /// SSH_MSG_CHANNEL_FAILURE
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// ```rust
    /// use kestrel_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        use MessageType::*;
        let t = match byte {
            1 => Disconnect,
            2 => Ignore,
            3 => Unimplemented,
            4 => Debug,
            5 => ServiceRequest,
            6 => ServiceAccept,
            20 => KexInit,
            21 => NewKeys,
            30 => KexdhInit,
            31 => KexdhReply,
            50 => UserauthRequest,
            51 => UserauthFailure,
            52 => UserauthSuccess,
            53 => UserauthBanner,
            60 => UserauthPkOk,
            80 => GlobalRequest,
            81 => RequestSuccess,
            82 => RequestFailure,
            90 => ChannelOpen,
            91 => ChannelOpenConfirmation,
            92 => ChannelOpenFailure,
            93 => ChannelWindowAdjust,
            94 => ChannelData,
            95 => ChannelExtendedData,
            96 => ChannelEof,
            97 => ChannelClose,
            98 => ChannelRequest,
            99 => ChannelSuccess,
            100 => ChannelFailure,
            _ => return None,
        };
        Some(t)
    }
}

/// Dispatch class of a message number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// 1..=19
    TransportGeneric,
    /// 20..=29
    AlgorithmNegotiation,
    /// 30..=49
    KeyExchangeMethod,
    /// 50..=79
    UserAuth,
    /// 80..=127
    Connection,
    /// 128..=191
    Reserved,
    /// 192..=255
    Local,
    /// 0
    Invalid,
}

impl MessageClass {
    /// Classifies a message number (RFC 4250 Section 4.1.2).
    pub fn of(msg: u8) -> Self {
        match msg {
            0 => MessageClass::Invalid,
            1..=19 => MessageClass::TransportGeneric,
            20..=29 => MessageClass::AlgorithmNegotiation,
            30..=49 => MessageClass::KeyExchangeMethod,
            50..=79 => MessageClass::UserAuth,
            80..=127 => MessageClass::Connection,
            128..=191 => MessageClass::Reserved,
            _ => MessageClass::Local,
        }
    }

    /// `true` for messages allowed while a key exchange is in progress.
    ///
    /// RFC 4253 Section 7.1 permits transport generic messages except the
    /// service messages, and everything in the 20-49 range.
    pub fn allowed_during_kex(msg: u8) -> bool {
        matches!(msg, 1..=4 | 20..=49)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Maps a wire code back to a reason, if it is a known one.
    pub fn from_u32(code: u32) -> Option<Self> {
        use DisconnectReason::*;
        let r = match code {
            1 => HostNotAllowedToConnect,
            2 => ProtocolError,
            3 => KeyExchangeFailed,
            4 => Reserved,
            5 => MacError,
            6 => CompressionError,
            7 => ServiceNotAvailable,
            8 => ProtocolVersionNotSupported,
            9 => HostKeyNotVerifiable,
            10 => ConnectionLost,
            11 => ByApplication,
            12 => TooManyConnections,
            13 => AuthCancelledByUser,
            14 => NoMoreAuthMethodsAvailable,
            15 => IllegalUserName,
            _ => return None,
        };
        Some(r)
    }

    /// Picks the reason to send when a fatal error terminates the connection.
    pub fn for_error(err: &KestrelError) -> Self {
        match err {
            KestrelError::Integrity(_) => DisconnectReason::MacError,
            KestrelError::Negotiation(_) => DisconnectReason::KeyExchangeFailed,
            KestrelError::HostKeyRejected(_) => DisconnectReason::HostKeyNotVerifiable,
            KestrelError::Auth(_) => DisconnectReason::NoMoreAuthMethodsAvailable,
            _ => DisconnectReason::ProtocolError,
        }
    }
}

/// SSH_MSG_DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason_code: u32,
    /// Human-readable description
    pub description: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: &str) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.to_string(),
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        put_string(&mut buf, self.description.as_bytes());
        put_string(&mut buf, b"");
        buf.to_vec()
    }

    /// Parses the message, tolerating a missing language tag.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        expect_type(&mut r, MessageType::Disconnect)?;
        let reason_code = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_string()?).into_owned();
        Ok(Self {
            reason_code,
            description,
        })
    }
}

/// Builds SSH_MSG_IGNORE carrying `data`.
pub fn ignore(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(MessageType::Ignore as u8);
    put_string(&mut buf, data);
    buf.to_vec()
}

/// Builds SSH_MSG_UNIMPLEMENTED for the rejected packet's sequence number.
pub fn unimplemented(sequence: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence);
    buf.to_vec()
}

/// Builds SSH_MSG_DEBUG.
pub fn debug(always_display: bool, message: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Debug as u8);
    put_bool(&mut buf, always_display);
    put_string(&mut buf, message.as_bytes());
    put_string(&mut buf, b"");
    buf.to_vec()
}

/// Builds SSH_MSG_SERVICE_REQUEST or SSH_MSG_SERVICE_ACCEPT.
pub fn service(msg: MessageType, name: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(msg as u8);
    put_string(&mut buf, name.as_bytes());
    buf.to_vec()
}

/// Parses a message carrying a single string after its type byte
/// (service request/accept).
pub fn parse_service(data: &[u8]) -> KestrelResult<String> {
    let mut r = Reader::new(data);
    r.read_u8()?;
    r.read_utf8()
}

/// Parses SSH_MSG_DEBUG into its message text.
pub fn parse_debug(data: &[u8]) -> KestrelResult<String> {
    let mut r = Reader::new(data);
    expect_type(&mut r, MessageType::Debug)?;
    r.read_bool()?;
    Ok(String::from_utf8_lossy(r.read_string()?).into_owned())
}

/// Parses SSH_MSG_UNIMPLEMENTED into the rejected sequence number.
pub fn parse_unimplemented(data: &[u8]) -> KestrelResult<u32> {
    let mut r = Reader::new(data);
    expect_type(&mut r, MessageType::Unimplemented)?;
    r.read_u32()
}

/// Consumes the type byte and checks it.
pub(crate) fn expect_type(r: &mut Reader<'_>, expected: MessageType) -> KestrelResult<()> {
    let got = r.read_u8()?;
    if got != expected as u8 {
        return Err(KestrelError::Protocol(format!(
            "expected message {:?} ({}), got {}",
            expected, expected as u8, got
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Disconnect as u8, 1);
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::ChannelFailure as u8, 100);
        assert_eq!(MessageType::from_u8(94), Some(MessageType::ChannelData));
        assert_eq!(MessageType::from_u8(7), None);
    }

    #[test]
    fn test_message_class() {
        assert_eq!(MessageClass::of(2), MessageClass::TransportGeneric);
        assert_eq!(MessageClass::of(21), MessageClass::AlgorithmNegotiation);
        assert_eq!(MessageClass::of(33), MessageClass::KeyExchangeMethod);
        assert_eq!(MessageClass::of(52), MessageClass::UserAuth);
        assert_eq!(MessageClass::of(200), MessageClass::Local);

        assert!(MessageClass::allowed_during_kex(1));
        assert!(MessageClass::allowed_during_kex(31));
        assert!(!MessageClass::allowed_during_kex(5));
        assert!(!MessageClass::allowed_during_kex(94));
    }

    #[test]
    fn test_disconnect_round_trip() {
        let msg = Disconnect::new(DisconnectReason::ByApplication, "bye");
        let parsed = Disconnect::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(
            DisconnectReason::from_u32(parsed.reason_code),
            Some(DisconnectReason::ByApplication)
        );
    }

    #[test]
    fn test_unimplemented_carries_sequence() {
        let msg = unimplemented(0xffff_fffe);
        assert_eq!(parse_unimplemented(&msg).unwrap(), 0xffff_fffe);
    }

    #[test]
    fn test_service_and_debug() {
        let req = service(MessageType::ServiceRequest, "ssh-userauth");
        assert_eq!(req[0], 5);
        assert_eq!(parse_service(&req).unwrap(), "ssh-userauth");

        let dbg = debug(false, "hello");
        assert_eq!(parse_debug(&dbg).unwrap(), "hello");
    }

    #[test]
    fn test_error_to_reason() {
        assert_eq!(
            DisconnectReason::for_error(&KestrelError::Integrity("x".into())),
            DisconnectReason::MacError
        );
        assert_eq!(
            DisconnectReason::for_error(&KestrelError::Negotiation("x".into())),
            DisconnectReason::KeyExchangeFailed
        );
    }
}
