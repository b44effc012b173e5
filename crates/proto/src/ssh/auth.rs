//! SSH authentication protocol (RFC 4252).
//!
//! This module implements user authentication for SSH:
//! - "publickey" - Public key authentication (RFC 4252 Section 7)
//! - "password" - Password authentication (RFC 4252 Section 8)
//! - "none" - Probes the server's method list
//!
//! The server side is [`UserAuthServer`], which asks a caller supplied
//! [`Authenticator`] for every decision. Signatures are checked here, so an
//! authenticator only answers "is this key allowed for this user".
//!
//! # Security
//!
//! - **Constant-time password comparison** - [`constant_time_compare`]
//! - **Bounded attempts** - the server disconnects after `max_attempts`
//! - **Session binding** - publickey signatures cover the session identifier
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let auth = AuthRequest::new(
//!     "user",
//!     "ssh-connection",
//!     AuthMethod::Password("secret".to_string()),
//! );
//! let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
//! assert_eq!(parsed.user_name(), "user");
//! ```

use super::algorithm::AlgorithmRegistry;
use super::hostkey::HostKey;
use super::message::MessageType;
use super::wire::{put_bool, put_name_list, put_string, Reader};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use zeroize::Zeroize;

/// Service name of the authentication protocol.
pub const SERVICE_USERAUTH: &str = "ssh-userauth";

/// Service name of the connection protocol.
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Method list probe.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g. "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (absent for a query)
        signature: Option<Vec<u8>>,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Builds a signed publickey request for `session_id`.
    pub fn public_key_signed(
        user_name: &str,
        service_name: &str,
        key: &dyn HostKey,
        session_id: &[u8],
    ) -> KestrelResult<Self> {
        let public_key = key.public_key_blob();
        let data = construct_signature_data(
            session_id,
            user_name,
            service_name,
            key.algorithm(),
            &public_key,
        );
        let signature = key.sign(&data)?;
        Ok(Self::new(
            user_name,
            service_name,
            AuthMethod::PublicKey {
                algorithm: key.algorithm().to_string(),
                public_key,
                signature: Some(signature),
            },
        ))
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        put_string(&mut buf, self.user_name.as_bytes());
        put_string(&mut buf, self.service_name.as_bytes());
        put_string(&mut buf, self.method.name().as_bytes());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                put_bool(&mut buf, false);
                put_string(&mut buf, password.as_bytes());
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                put_bool(&mut buf, signature.is_some());
                put_string(&mut buf, algorithm.as_bytes());
                put_string(&mut buf, public_key);
                if let Some(sig) = signature {
                    put_string(&mut buf, sig);
                }
            }
        }
        buf.to_vec()
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] if the data is malformed or names
    /// a method other than `none`, `password` or `publickey`.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        super::message::expect_type(&mut r, MessageType::UserauthRequest)?;
        let user_name = r.read_utf8()?;
        let service_name = r.read_utf8()?;
        let method_name = r.read_utf8()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = r.read_bool()?;
                AuthMethod::Password(r.read_utf8()?)
            }
            "publickey" => {
                let has_signature = r.read_bool()?;
                let algorithm = r.read_utf8()?;
                let public_key = r.read_string()?.to_vec();
                let signature = if has_signature {
                    Some(r.read_string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            other => {
                return Err(KestrelError::Protocol(format!(
                    "Unsupported authentication method: '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure listing the methods that can continue.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Partial success flag.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        put_name_list(&mut buf, &self.methods_can_continue);
        put_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        super::message::expect_type(&mut r, MessageType::UserauthFailure)?;
        Ok(Self {
            methods_can_continue: r.read_name_list()?,
            partial_success: r.read_bool()?,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS.
pub fn auth_success() -> Vec<u8> {
    vec![MessageType::UserauthSuccess as u8]
}

/// SSH_MSG_USERAUTH_BANNER (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        put_string(&mut buf, self.message.as_bytes());
        put_string(&mut buf, b"");
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        super::message::expect_type(&mut r, MessageType::UserauthBanner)?;
        Ok(Self {
            message: r.read_utf8()?,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK (RFC 4252 Section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates the message.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        put_string(&mut buf, self.algorithm.as_bytes());
        put_string(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        super::message::expect_type(&mut r, MessageType::UserauthPkOk)?;
        Ok(Self {
            algorithm: r.read_utf8()?,
            public_key: r.read_string()?.to_vec(),
        })
    }
}

/// A server answer to an authentication request, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// Authentication finished.
    Success,
    /// Authentication failed.
    Failure(AuthFailure),
    /// Informational banner; another answer follows.
    Banner(AuthBanner),
    /// The queried public key is acceptable.
    PkOk(AuthPkOk),
}

impl AuthResponse {
    /// Parses any message in the 51..=60 range the server may send.
    pub fn parse(data: &[u8]) -> KestrelResult<Self> {
        match data.first().copied().and_then(MessageType::from_u8) {
            Some(MessageType::UserauthSuccess) => Ok(AuthResponse::Success),
            Some(MessageType::UserauthFailure) => Ok(AuthResponse::Failure(AuthFailure::from_bytes(data)?)),
            Some(MessageType::UserauthBanner) => Ok(AuthResponse::Banner(AuthBanner::from_bytes(data)?)),
            Some(MessageType::UserauthPkOk) => Ok(AuthResponse::PkOk(AuthPkOk::from_bytes(data)?)),
            _ => Err(KestrelError::Protocol(format!(
                "unexpected message {:?} during authentication",
                data.first()
            ))),
        }
    }
}

/// Builds the data signed for publickey authentication.
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    put_string(&mut buf, user_name.as_bytes());
    put_string(&mut buf, service_name.as_bytes());
    put_string(&mut buf, b"publickey");
    put_bool(&mut buf, true);
    put_string(&mut buf, algorithm.as_bytes());
    put_string(&mut buf, public_key_blob);
    buf.to_vec()
}

/// Compares two passwords in constant time.
///
/// ```rust
/// use kestrel_proto::ssh::auth::constant_time_compare;
///
/// assert!(constant_time_compare("secret", "secret"));
/// assert!(!constant_time_compare("secret", "wrong"));
/// ```
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    // Hash first so differing lengths take the same time.
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());
    hash_a.ct_eq(&hash_b).into()
}

/// Who is asking, for an [`Authenticator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Requested user name
    pub username: String,
    /// Session identifier of the connection
    pub session_id: Vec<u8>,
    /// Peer description (address or identification line), when known
    pub peer: Option<String>,
}

/// Server-side credential decisions.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Accepts or rejects a password.
    async fn check_password(&self, _ctx: &AuthContext, _password: &str) -> bool {
        false
    }

    /// Accepts or rejects a public key for the user. The signature has
    /// already been verified when this is called for a signed request.
    async fn check_public_key(&self, _ctx: &AuthContext, _algorithm: &str, _key_blob: &[u8]) -> bool {
        false
    }

    /// Methods listed in USERAUTH_FAILURE.
    fn methods(&self) -> Vec<String> {
        vec!["publickey".to_string(), "password".to_string()]
    }
}

/// In-memory user table: passwords and authorized key blobs.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    passwords: HashMap<String, String>,
    keys: HashMap<String, Vec<Vec<u8>>>,
}

impl StaticAuthenticator {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows `user` to log in with `password`.
    pub fn with_password(mut self, user: &str, password: &str) -> Self {
        self.passwords.insert(user.to_string(), password.to_string());
        self
    }

    /// Allows `user` to log in with the key whose blob is `key_blob`.
    pub fn with_public_key(mut self, user: &str, key_blob: Vec<u8>) -> Self {
        self.keys.entry(user.to_string()).or_default().push(key_blob);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn check_password(&self, ctx: &AuthContext, password: &str) -> bool {
        self.passwords
            .get(&ctx.username)
            .map_or(false, |expected| constant_time_compare(expected, password))
    }

    async fn check_public_key(&self, ctx: &AuthContext, _algorithm: &str, key_blob: &[u8]) -> bool {
        self.keys
            .get(&ctx.username)
            .map_or(false, |keys| keys.iter().any(|k| k.as_slice() == key_blob))
    }
}

/// What the server does with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Send USERAUTH_SUCCESS; the connection protocol starts.
    Success {
        /// Authenticated user
        username: String,
    },
    /// Send this reply (FAILURE or PK_OK) and wait for the next request.
    Reply(Vec<u8>),
    /// Too many failures; disconnect.
    Exhausted,
}

/// Server side of `ssh-userauth`.
pub struct UserAuthServer {
    registry: AlgorithmRegistry,
    max_attempts: u32,
    failures: u32,
}

impl std::fmt::Debug for UserAuthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAuthServer")
            .field("max_attempts", &self.max_attempts)
            .field("failures", &self.failures)
            .finish()
    }
}

impl UserAuthServer {
    /// Creates a server allowing `max_attempts` failed requests.
    pub fn new(registry: AlgorithmRegistry, max_attempts: u32) -> Self {
        Self {
            registry,
            max_attempts,
            failures: 0,
        }
    }

    /// Failed attempts so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Decides on one USERAUTH_REQUEST payload.
    pub async fn handle(
        &mut self,
        authenticator: &dyn Authenticator,
        session_id: &[u8],
        peer: Option<String>,
        payload: &[u8],
    ) -> KestrelResult<AuthDecision> {
        let request = AuthRequest::from_bytes(payload)?;
        let ctx = AuthContext {
            username: request.user_name().to_string(),
            session_id: session_id.to_vec(),
            peer,
        };

        if request.service_name() != SERVICE_CONNECTION {
            warn!(service = request.service_name(), "Authentication for unknown service");
            return Ok(self.fail(authenticator));
        }

        let accepted = match request.method() {
            AuthMethod::None => false,
            AuthMethod::Password(password) => authenticator.check_password(&ctx, password).await,
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature: None,
            } => {
                if self.registry.host_key(algorithm).is_ok()
                    && authenticator.check_public_key(&ctx, algorithm, public_key).await
                {
                    return Ok(AuthDecision::Reply(
                        AuthPkOk::new(algorithm.clone(), public_key.clone()).to_bytes(),
                    ));
                }
                false
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature: Some(signature),
            } => {
                let data = construct_signature_data(
                    session_id,
                    request.user_name(),
                    request.service_name(),
                    algorithm,
                    public_key,
                );
                let valid = match self.registry.host_key(algorithm) {
                    Ok(verifier) => verifier.verify(public_key, &data, signature).unwrap_or(false),
                    Err(_) => false,
                };
                valid && authenticator.check_public_key(&ctx, algorithm, public_key).await
            }
        };

        if accepted {
            info!(user = %ctx.username, method = request.method().name(), "User authenticated");
            Ok(AuthDecision::Success {
                username: ctx.username,
            })
        } else {
            if !matches!(request.method(), AuthMethod::None) {
                warn!(user = %ctx.username, method = request.method().name(), "Authentication failed");
            }
            Ok(self.fail(authenticator))
        }
    }

    fn fail(&mut self, authenticator: &dyn Authenticator) -> AuthDecision {
        self.failures += 1;
        if self.failures > self.max_attempts {
            return AuthDecision::Exhausted;
        }
        AuthDecision::Reply(AuthFailure::new(authenticator.methods(), false).to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;

    #[test]
    fn test_auth_request_password_round_trip() {
        let req = AuthRequest::new(
            "alice",
            SERVICE_CONNECTION,
            AuthMethod::Password("secret123".to_string()),
        );
        let bytes = req.to_bytes();
        assert_eq!(bytes[0], 50);
        let parsed = AuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_auth_request_publickey_query() {
        let req = AuthRequest::new(
            "bob",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: None,
            },
        );
        let parsed = AuthRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(parsed.method().name(), "publickey");
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(50);
        put_string(&mut buf, b"u");
        put_string(&mut buf, b"ssh-connection");
        put_string(&mut buf, b"hostbased");
        assert!(AuthRequest::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_responses_parse() {
        let failure = AuthFailure::new(vec!["publickey".into(), "password".into()], false);
        assert_eq!(
            AuthResponse::parse(&failure.to_bytes()).unwrap(),
            AuthResponse::Failure(failure)
        );
        assert_eq!(AuthResponse::parse(&auth_success()).unwrap(), AuthResponse::Success);
        let banner = AuthBanner::new("welcome");
        assert_eq!(
            AuthResponse::parse(&banner.to_bytes()).unwrap(),
            AuthResponse::Banner(banner)
        );
        let pk = AuthPkOk::new("ssh-ed25519", vec![9; 8]);
        assert_eq!(AuthResponse::parse(&pk.to_bytes()).unwrap(), AuthResponse::PkOk(pk));
        assert!(AuthResponse::parse(&[94]).is_err());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("password", "password"));
        assert!(!constant_time_compare("password", "passwort"));
        assert!(!constant_time_compare("short", "much longer"));
    }

    #[tokio::test]
    async fn test_server_password_flow_and_attempt_limit() {
        let authenticator = StaticAuthenticator::new().with_password("alice", "secret");
        let mut server = UserAuthServer::new(AlgorithmRegistry::with_defaults(), 2);
        let sid = [7u8; 32];

        let wrong = AuthRequest::new("alice", SERVICE_CONNECTION, AuthMethod::Password("nope".into()));
        for _ in 0..2 {
            match server.handle(&authenticator, &sid, None, &wrong.to_bytes()).await.unwrap() {
                AuthDecision::Reply(reply) => {
                    let failure = AuthFailure::from_bytes(&reply).unwrap();
                    assert!(failure.methods_can_continue().contains(&"password".to_string()));
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        let right = AuthRequest::new("alice", SERVICE_CONNECTION, AuthMethod::Password("secret".into()));
        assert_eq!(
            server.handle(&authenticator, &sid, None, &right.to_bytes()).await.unwrap(),
            AuthDecision::Success { username: "alice".to_string() }
        );

        assert_eq!(
            server.handle(&authenticator, &sid, None, &wrong.to_bytes()).await.unwrap(),
            AuthDecision::Exhausted
        );
    }

    #[tokio::test]
    async fn test_server_publickey_query_and_signed_request() {
        let key = Ed25519HostKey::generate().unwrap();
        let authenticator = StaticAuthenticator::new().with_public_key("bob", key.public_key_blob());
        let mut server = UserAuthServer::new(AlgorithmRegistry::with_defaults(), 3);
        let sid = [3u8; 32];

        let query = AuthRequest::new(
            "bob",
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: key.public_key_blob(),
                signature: None,
            },
        );
        match server.handle(&authenticator, &sid, None, &query.to_bytes()).await.unwrap() {
            AuthDecision::Reply(reply) => {
                assert_eq!(AuthPkOk::from_bytes(&reply).unwrap().public_key(), key.public_key_blob());
            }
            other => panic!("unexpected {:?}", other),
        }

        let signed = AuthRequest::public_key_signed("bob", SERVICE_CONNECTION, &key, &sid).unwrap();
        assert!(matches!(
            server.handle(&authenticator, &sid, None, &signed.to_bytes()).await.unwrap(),
            AuthDecision::Success { .. }
        ));

        // A signature over another session must not verify.
        let replayed = AuthRequest::public_key_signed("bob", SERVICE_CONNECTION, &key, &[4u8; 32]).unwrap();
        assert!(matches!(
            server.handle(&authenticator, &sid, None, &replayed.to_bytes()).await.unwrap(),
            AuthDecision::Reply(_)
        ));
    }
}
