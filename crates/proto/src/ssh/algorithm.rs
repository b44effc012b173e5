//! Pluggable algorithm provider.
//!
//! The transport never names a concrete primitive. It negotiates names and
//! asks an [`AlgorithmRegistry`] for the matching factory. The registry is a
//! plain value built by the caller and injected into each transport, so tests
//! can register deterministic doubles alongside (or instead of) the defaults
//! from [`crypto::register_defaults`](super::crypto::register_defaults).
//!
//! Registration order is preference order: the default algorithm lists sent
//! in KEXINIT are the registered names in the order they were added.

use super::kex::HashAlgorithm;
use kestrel_platform::{KestrelError, KestrelResult};
use std::fmt;
use std::sync::Arc;

/// Packet cipher for one direction.
///
/// `packet` buffers passed to [`seal`](Cipher::seal) and
/// [`open`](Cipher::open) hold the whole binary packet starting at the
/// `packet_length` field.
pub trait Cipher: Send {
    /// Cipher block size; packets are padded to a multiple of it (min 8).
    fn block_size(&self) -> usize;

    /// Length of the authentication tag appended by AEAD ciphers, else 0.
    fn tag_len(&self) -> usize {
        0
    }

    /// `true` when the cipher authenticates packets itself and no separate
    /// MAC is used. AEAD ciphers also leave `packet_length` unencrypted.
    fn is_aead(&self) -> bool {
        self.tag_len() > 0
    }

    /// Encrypts `packet` in place; AEAD ciphers append their tag.
    fn seal(&mut self, sequence: u32, packet: &mut Vec<u8>) -> KestrelResult<()>;

    /// Decrypts the `packet_length` field from the first cipher block
    /// without consuming cipher state.
    fn peek_length(&self, sequence: u32, first_block: &[u8]) -> KestrelResult<u32>;

    /// Decrypts `packet` in place (tag included for AEAD, and stripped).
    ///
    /// AEAD tag failure is [`KestrelError::Integrity`].
    fn open(&mut self, sequence: u32, packet: &mut Vec<u8>) -> KestrelResult<()>;
}

/// Message authentication code for one direction (encrypt-and-MAC).
pub trait Mac: Send {
    /// Tag length in bytes.
    fn mac_len(&self) -> usize;

    /// Computes the tag over `sequence || packet`.
    fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8>;

    /// Verifies a tag in constant time.
    fn verify(&self, sequence: u32, packet: &[u8], tag: &[u8]) -> bool;
}

/// Payload compression for one direction.
pub trait Compression: Send {
    /// Compresses an outgoing payload.
    fn compress(&mut self, payload: &[u8]) -> KestrelResult<Vec<u8>>;

    /// Decompresses an incoming payload.
    fn decompress(&mut self, payload: &[u8]) -> KestrelResult<Vec<u8>>;
}

/// Result of a completed key exchange computation.
pub struct KexOutput {
    /// Shared secret `K` as an unsigned big-endian magnitude
    pub shared_secret: Vec<u8>,
    /// Method-specific fields of the exchange hash, already wire encoded
    /// (for example `string Q_C, string Q_S` or `mpint e, mpint f`)
    pub hash_fields: Vec<u8>,
}

impl fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexOutput")
            .field("shared_secret", &"<redacted>")
            .field("hash_fields_len", &self.hash_fields.len())
            .finish()
    }
}

impl Drop for KexOutput {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.shared_secret.zeroize();
    }
}

/// Client-side outcome of feeding one server message to a key exchange.
#[derive(Debug)]
pub enum ClientKexStep {
    /// Send this message and wait for the next server message.
    Send(Vec<u8>),
    /// The server reply arrived; verify `signature` over the exchange hash.
    Reply {
        /// Server host key blob `K_S`
        host_key: Vec<u8>,
        /// Signature blob over `H`
        signature: Vec<u8>,
        /// Secret and hash fields
        output: KexOutput,
    },
}

/// Server-side outcome of feeding one client message to a key exchange.
#[derive(Debug)]
pub enum ServerKexStep {
    /// Send this message and wait for the next client message.
    Send(Vec<u8>),
    /// Compute `H`, sign it and send the reply.
    ///
    /// The reply is `byte reply_type, string K_S, server_public,
    /// string signature`.
    Reply {
        /// Reply message number
        reply_type: u8,
        /// Server public value, already wire encoded
        server_public: Vec<u8>,
        /// Secret and hash fields
        output: KexOutput,
    },
}

/// One run of a key exchange method.
pub trait KeyExchange: Send {
    /// Hash used for the exchange hash and key derivation.
    fn hash(&self) -> HashAlgorithm;

    /// First client message (e.g. ECDH_INIT, GEX_REQUEST).
    fn client_start(&mut self) -> KestrelResult<Vec<u8>>;

    /// Handles a server message on the client.
    fn client_receive(&mut self, message: &[u8]) -> KestrelResult<ClientKexStep>;

    /// Handles a client message on the server.
    fn server_receive(&mut self, message: &[u8]) -> KestrelResult<ServerKexStep>;
}

/// Creates fresh [`KeyExchange`] runs.
pub trait KexFactory: Send + Sync {
    /// Starts a new exchange.
    fn create(&self) -> KestrelResult<Box<dyn KeyExchange>>;
}

/// Creates [`Cipher`] instances for derived keys.
pub trait CipherFactory: Send + Sync {
    /// Key length in bytes.
    fn key_len(&self) -> usize;
    /// IV length in bytes.
    fn iv_len(&self) -> usize;
    /// Whether the cipher is AEAD (MAC negotiation is then ignored).
    fn is_aead(&self) -> bool;
    /// Builds a cipher from derived key material.
    fn create(&self, key: &[u8], iv: &[u8]) -> KestrelResult<Box<dyn Cipher>>;
}

/// Creates [`Mac`] instances for derived keys.
pub trait MacFactory: Send + Sync {
    /// Key length in bytes.
    fn key_len(&self) -> usize;
    /// Builds a MAC from derived key material.
    fn create(&self, key: &[u8]) -> KestrelResult<Box<dyn Mac>>;
}

/// Creates [`Compression`] instances.
pub trait CompressionFactory: Send + Sync {
    /// Builds a compressor.
    fn create(&self) -> Box<dyn Compression>;
}

/// Verifies host key signatures for one public key algorithm.
pub trait SignatureVerifier: Send + Sync {
    /// Checks `signature` (an SSH signature blob) over `data` with the
    /// public key in `key_blob`.
    fn verify(&self, key_blob: &[u8], data: &[u8], signature: &[u8]) -> KestrelResult<bool>;
}

struct Entry<T: ?Sized> {
    name: String,
    factory: Arc<T>,
}

impl<T: ?Sized> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            factory: self.factory.clone(),
        }
    }
}

fn lookup<T: ?Sized>(entries: &[Entry<T>], name: &str, kind: &str) -> KestrelResult<Arc<T>> {
    entries
        .iter()
        .find(|e| e.name == name)
        .map(|e| e.factory.clone())
        .ok_or_else(|| KestrelError::Negotiation(format!("no {} registered as '{}'", kind, name)))
}

fn upsert<T: ?Sized>(entries: &mut Vec<Entry<T>>, name: &str, factory: Arc<T>) {
    if let Some(existing) = entries.iter_mut().find(|e| e.name == name) {
        existing.factory = factory;
    } else {
        entries.push(Entry {
            name: name.to_string(),
            factory,
        });
    }
}

/// Named algorithm factories, in preference order.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    kex: Vec<Entry<dyn KexFactory>>,
    host_keys: Vec<Entry<dyn SignatureVerifier>>,
    ciphers: Vec<Entry<dyn CipherFactory>>,
    macs: Vec<Entry<dyn MacFactory>>,
    compression: Vec<Entry<dyn CompressionFactory>>,
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("kex", &self.kex_names())
            .field("host_keys", &self.host_key_names())
            .field("ciphers", &self.cipher_names())
            .field("macs", &self.mac_names())
            .field("compression", &self.compression_names())
            .finish()
    }
}

impl AlgorithmRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the default provider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        super::crypto::register_defaults(&mut registry);
        registry
    }

    /// Registers (or replaces) a key exchange method.
    pub fn register_kex(&mut self, name: &str, factory: Arc<dyn KexFactory>) {
        upsert(&mut self.kex, name, factory);
    }

    /// Registers (or replaces) a host key signature algorithm.
    pub fn register_host_key(&mut self, name: &str, verifier: Arc<dyn SignatureVerifier>) {
        upsert(&mut self.host_keys, name, verifier);
    }

    /// Registers (or replaces) a cipher.
    pub fn register_cipher(&mut self, name: &str, factory: Arc<dyn CipherFactory>) {
        upsert(&mut self.ciphers, name, factory);
    }

    /// Registers (or replaces) a MAC.
    pub fn register_mac(&mut self, name: &str, factory: Arc<dyn MacFactory>) {
        upsert(&mut self.macs, name, factory);
    }

    /// Registers (or replaces) a compression method.
    pub fn register_compression(&mut self, name: &str, factory: Arc<dyn CompressionFactory>) {
        upsert(&mut self.compression, name, factory);
    }

    /// Starts a key exchange run for `name`.
    pub fn kex(&self, name: &str) -> KestrelResult<Box<dyn KeyExchange>> {
        lookup(&self.kex, name, "key exchange")?.create()
    }

    /// Host key signature verifier for `name`.
    pub fn host_key(&self, name: &str) -> KestrelResult<Arc<dyn SignatureVerifier>> {
        lookup(&self.host_keys, name, "host key algorithm")
    }

    /// Cipher factory for `name`.
    pub fn cipher(&self, name: &str) -> KestrelResult<Arc<dyn CipherFactory>> {
        lookup(&self.ciphers, name, "cipher")
    }

    /// MAC factory for `name`.
    pub fn mac(&self, name: &str) -> KestrelResult<Arc<dyn MacFactory>> {
        lookup(&self.macs, name, "MAC")
    }

    /// Compression factory for `name`.
    pub fn compression(&self, name: &str) -> KestrelResult<Arc<dyn CompressionFactory>> {
        lookup(&self.compression, name, "compression")
    }

    /// Registered key exchange names in preference order.
    pub fn kex_names(&self) -> Vec<String> {
        self.kex.iter().map(|e| e.name.clone()).collect()
    }

    /// Registered host key algorithm names in preference order.
    pub fn host_key_names(&self) -> Vec<String> {
        self.host_keys.iter().map(|e| e.name.clone()).collect()
    }

    /// Registered cipher names in preference order.
    pub fn cipher_names(&self) -> Vec<String> {
        self.ciphers.iter().map(|e| e.name.clone()).collect()
    }

    /// Registered MAC names in preference order.
    pub fn mac_names(&self) -> Vec<String> {
        self.macs.iter().map(|e| e.name.clone()).collect()
    }

    /// Registered compression names in preference order.
    pub fn compression_names(&self) -> Vec<String> {
        self.compression.iter().map(|e| e.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::NoneCompressionFactory;

    struct StubVerifier;

    impl SignatureVerifier for StubVerifier {
        fn verify(&self, _key: &[u8], _data: &[u8], _sig: &[u8]) -> KestrelResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_registration_order_is_preference_order() {
        let mut registry = AlgorithmRegistry::new();
        registry.register_host_key("b-key", Arc::new(StubVerifier));
        registry.register_host_key("a-key", Arc::new(StubVerifier));
        registry.register_host_key("b-key", Arc::new(StubVerifier));
        assert_eq!(registry.host_key_names(), vec!["b-key", "a-key"]);
    }

    #[test]
    fn test_missing_algorithm_is_negotiation_error() {
        let registry = AlgorithmRegistry::new();
        assert!(matches!(
            registry.cipher("aes256-ctr"),
            Err(KestrelError::Negotiation(_))
        ));
        assert!(registry.kex("curve25519-sha256").is_err());
    }

    #[test]
    fn test_defaults_cover_every_category() {
        let registry = AlgorithmRegistry::with_defaults();
        assert!(registry.kex_names().contains(&"curve25519-sha256".to_string()));
        assert_eq!(registry.host_key_names(), vec!["ssh-ed25519"]);
        assert!(registry.cipher_names().contains(&"aes256-gcm@openssh.com".to_string()));
        assert!(registry.mac_names().contains(&"hmac-sha2-256".to_string()));
        assert_eq!(registry.compression_names(), vec!["none"]);
        assert!(registry.cipher("aes128-ctr").is_ok());
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = AlgorithmRegistry::new();
        registry.register_compression("none", Arc::new(NoneCompressionFactory));
        let mut c = registry.compression("none").unwrap().create();
        assert_eq!(c.compress(b"abc").unwrap(), b"abc");
    }
}
