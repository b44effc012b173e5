//! SSH key exchange (RFC 4253 Sections 7 and 8).
//!
//! This module covers the method-independent half of key exchange:
//! - SSH_MSG_KEXINIT and SSH_MSG_NEWKEYS
//! - Algorithm negotiation (first client preference the server supports)
//! - The exchange hash `H`
//! - Key derivation of IVs, cipher keys and MAC keys (`A` .. `F`)
//!
//! The method-specific exchanges live in [`kex_dh`](super::kex_dh).
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Per category, the first algorithm on the client's list that the server
//!    also lists is chosen
//! 3. The negotiated method runs (DH, group exchange or ECDH)
//! 4. Both sides send SSH_MSG_NEWKEYS and switch keys per direction
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::kex::negotiate_algorithm;
//!
//! let client = vec!["kexA".to_string(), "kexB".to_string()];
//! let server = vec!["kexB".to_string()];
//! assert_eq!(negotiate_algorithm("kex", &client, &server).unwrap(), "kexB");
//! ```

use super::algorithm::AlgorithmRegistry;
use super::message::MessageType;
use super::packet::DirectionalKeys;
use super::transport::Role;
use super::wire::{encode_mpint, put_bool, put_name_list, put_string, Reader};
use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

/// Hash function of a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => {
                let mut h = Sha256::new();
                for part in parts {
                    h.update(part);
                }
                h.finalize().to_vec()
            }
            HashAlgorithm::Sha512 => {
                let mut h = Sha512::new();
                for part in parts {
                    h.update(part);
                }
                h.finalize().to_vec()
            }
        }
    }
}

/// Ordered algorithm preferences advertised in KEXINIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers (both directions)
    pub ciphers: Vec<String>,
    /// MACs (both directions)
    pub macs: Vec<String>,
    /// Compression methods (both directions)
    pub compression: Vec<String>,
}

impl AlgorithmPreferences {
    /// Everything the registry provides, in registration order.
    pub fn from_registry(registry: &AlgorithmRegistry) -> Self {
        Self {
            kex: registry.kex_names(),
            host_key: registry.host_key_names(),
            ciphers: registry.cipher_names(),
            macs: registry.mac_names(),
            compression: registry.compression_names(),
        }
    }

    /// Checks that every mandatory category is non-empty.
    pub fn validate(&self) -> KestrelResult<()> {
        let categories = [
            ("kex", &self.kex),
            ("host key", &self.host_key),
            ("cipher", &self.ciphers),
            ("compression", &self.compression),
        ];
        for (name, list) in categories {
            if list.is_empty() {
                return Err(KestrelError::Config(format!(
                    "{} algorithm list must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self::from_registry(&AlgorithmRegistry::with_defaults())
    }
}

/// SSH_MSG_KEXINIT (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_client_to_server: Vec<String>,
    encryption_server_to_client: Vec<String>,
    mac_client_to_server: Vec<String>,
    mac_server_to_client: Vec<String>,
    compression_client_to_server: Vec<String>,
    compression_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie.
    pub fn new(preferences: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        Self {
            cookie,
            kex_algorithms: preferences.kex.clone(),
            server_host_key_algorithms: preferences.host_key.clone(),
            encryption_client_to_server: preferences.ciphers.clone(),
            encryption_server_to_client: preferences.ciphers.clone(),
            mac_client_to_server: preferences.macs.clone(),
            mac_server_to_client: preferences.macs.clone(),
            compression_client_to_server: preferences.compression.clone(),
            compression_server_to_client: preferences.compression.clone(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Sets the `first_kex_packet_follows` flag.
    pub fn with_first_kex_packet_follows(mut self, follows: bool) -> Self {
        self.first_kex_packet_follows = follows;
        self
    }

    /// Random cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Key exchange methods.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Whether a guessed key exchange packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);
        for list in self.name_lists() {
            put_name_list(&mut buf, list);
        }
        put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> KestrelResult<Self> {
        let mut r = Reader::new(data);
        super::message::expect_type(&mut r, MessageType::KexInit)?;
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_bytes(16)?);

        let mut lists: Vec<Vec<String>> = Vec::with_capacity(10);
        for _ in 0..10 {
            lists.push(r.read_name_list()?);
        }
        let first_kex_packet_follows = r.read_bool()?;
        let _reserved = r.read_u32()?;

        let mut it = lists.into_iter();
        let mut next = || it.next().unwrap_or_default();
        Ok(Self {
            cookie,
            kex_algorithms: next(),
            server_host_key_algorithms: next(),
            encryption_client_to_server: next(),
            encryption_server_to_client: next(),
            mac_client_to_server: next(),
            mac_server_to_client: next(),
            compression_client_to_server: next(),
            compression_server_to_client: next(),
            languages_client_to_server: next(),
            languages_server_to_client: next(),
            first_kex_packet_follows,
        })
    }

    fn name_lists(&self) -> [&Vec<String>; 10] {
        [
            &self.kex_algorithms,
            &self.server_host_key_algorithms,
            &self.encryption_client_to_server,
            &self.encryption_server_to_client,
            &self.mac_client_to_server,
            &self.mac_server_to_client,
            &self.compression_client_to_server,
            &self.compression_server_to_client,
            &self.languages_client_to_server,
            &self.languages_server_to_client,
        ]
    }
}

/// SSH_MSG_NEWKEYS.
pub fn new_keys() -> Vec<u8> {
    vec![MessageType::NewKeys as u8]
}

/// Picks the first algorithm in `client` that also appears in `server`.
///
/// # Errors
///
/// [`KestrelError::Negotiation`] when the lists share no name.
pub fn negotiate_algorithm(
    category: &str,
    client: &[String],
    server: &[String],
) -> KestrelResult<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .cloned()
        .ok_or_else(|| {
            KestrelError::Negotiation(format!(
                "no common {} algorithm: client={:?}, server={:?}",
                category, client, server
            ))
        })
}

/// Outcome of algorithm negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: String,
    /// Host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_c2s: String,
    /// Cipher server to client
    pub cipher_s2c: String,
    /// MAC client to server (`None` with an AEAD cipher)
    pub mac_c2s: Option<String>,
    /// MAC server to client (`None` with an AEAD cipher)
    pub mac_s2c: Option<String>,
    /// Compression client to server
    pub compression_c2s: String,
    /// Compression server to client
    pub compression_s2c: String,
}

/// Negotiates every category of a KEXINIT pair.
///
/// Names must also resolve in `registry`; MAC negotiation is skipped for a
/// direction whose cipher is AEAD. Languages are not negotiated.
pub fn negotiate(
    client: &KexInit,
    server: &KexInit,
    registry: &AlgorithmRegistry,
) -> KestrelResult<Negotiated> {
    let kex = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
    let host_key = negotiate_algorithm(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;
    let cipher_c2s = negotiate_algorithm(
        "cipher (client to server)",
        &client.encryption_client_to_server,
        &server.encryption_client_to_server,
    )?;
    let cipher_s2c = negotiate_algorithm(
        "cipher (server to client)",
        &client.encryption_server_to_client,
        &server.encryption_server_to_client,
    )?;

    let mac_for = |cipher: &str, c: &[String], s: &[String], dir: &str| -> KestrelResult<Option<String>> {
        if registry.cipher(cipher)?.is_aead() {
            Ok(None)
        } else {
            negotiate_algorithm(&format!("MAC ({})", dir), c, s).map(Some)
        }
    };
    let mac_c2s = mac_for(
        &cipher_c2s,
        &client.mac_client_to_server,
        &server.mac_client_to_server,
        "client to server",
    )?;
    let mac_s2c = mac_for(
        &cipher_s2c,
        &client.mac_server_to_client,
        &server.mac_server_to_client,
        "server to client",
    )?;

    let compression_c2s = negotiate_algorithm(
        "compression (client to server)",
        &client.compression_client_to_server,
        &server.compression_client_to_server,
    )?;
    let compression_s2c = negotiate_algorithm(
        "compression (server to client)",
        &client.compression_server_to_client,
        &server.compression_server_to_client,
    )?;

    registry.host_key(&host_key)?;
    if let Some(mac) = &mac_c2s {
        registry.mac(mac)?;
    }
    if let Some(mac) = &mac_s2c {
        registry.mac(mac)?;
    }
    registry.compression(&compression_c2s)?;
    registry.compression(&compression_s2c)?;

    Ok(Negotiated {
        kex,
        host_key,
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        compression_c2s,
        compression_s2c,
    })
}

/// `true` when a guessed first key exchange packet matches the negotiated
/// method, i.e. both sides list the same preferred kex and host key
/// algorithm (RFC 4253 Section 7).
pub fn guess_is_correct(client: &KexInit, server: &KexInit) -> bool {
    client.kex_algorithms.first() == server.kex_algorithms.first()
        && client.server_host_key_algorithms.first() == server.server_host_key_algorithms.first()
}

/// Inputs of the exchange hash that do not depend on the method.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeContext<'a> {
    /// Client identification line, no CR LF
    pub client_version: &'a [u8],
    /// Server identification line, no CR LF
    pub server_version: &'a [u8],
    /// Client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload
    pub server_kexinit: &'a [u8],
}

/// Computes `H = HASH(V_C || V_S || I_C || I_S || K_S || fields || K)`.
///
/// `hash_fields` holds the method-specific values already encoded, and
/// `shared_secret` is the magnitude of `K`, encoded here as an mpint.
pub fn exchange_hash(
    hash: HashAlgorithm,
    ctx: &ExchangeContext<'_>,
    host_key_blob: &[u8],
    hash_fields: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_string(&mut buf, ctx.client_version);
    put_string(&mut buf, ctx.server_version);
    put_string(&mut buf, ctx.client_kexinit);
    put_string(&mut buf, ctx.server_kexinit);
    put_string(&mut buf, host_key_blob);
    buf.put_slice(hash_fields);
    put_string(&mut buf, &encode_mpint(shared_secret));
    let digest = hash.digest(&[&buf]);
    zeroize::Zeroize::zeroize(&mut buf[..]);
    digest
}

/// Derives `key_length` bytes of key material (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || X || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// ```
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut k = BytesMut::new();
    put_string(&mut k, &encode_mpint(shared_secret));
    let k = Zeroizing::new(k.to_vec());

    let mut key = Zeroizing::new(hash.digest(&[&k, exchange_hash, &[letter], session_id]));
    while key.len() < key_length {
        let block = hash.digest(&[&k, exchange_hash, &key]);
        key.extend_from_slice(&block);
    }
    key.truncate(key_length);
    key
}

/// Derives and instantiates the keys for both directions.
///
/// Returns `(outbound, inbound)` from the point of view of `role`.
pub fn derive_directional_keys(
    registry: &AlgorithmRegistry,
    negotiated: &Negotiated,
    role: Role,
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
) -> KestrelResult<(DirectionalKeys, DirectionalKeys)> {
    let build = |cipher: &str, mac: &Option<String>, compression: &str, letters: [u8; 3]| {
        let cipher_factory = registry.cipher(cipher)?;
        let iv = derive_key(hash, shared_secret, exchange_hash, letters[0], session_id, cipher_factory.iv_len());
        let key = derive_key(hash, shared_secret, exchange_hash, letters[1], session_id, cipher_factory.key_len());
        let cipher = cipher_factory.create(&key, &iv)?;

        let mac = match mac {
            Some(name) => {
                let factory = registry.mac(name)?;
                let key = derive_key(hash, shared_secret, exchange_hash, letters[2], session_id, factory.key_len());
                Some(factory.create(&key)?)
            }
            None => None,
        };
        let compression = registry.compression(compression)?.create();
        Ok::<_, KestrelError>(DirectionalKeys::new(cipher, mac, compression))
    };

    let c2s = build(
        &negotiated.cipher_c2s,
        &negotiated.mac_c2s,
        &negotiated.compression_c2s,
        [b'A', b'C', b'E'],
    )?;
    let s2c = build(
        &negotiated.cipher_s2c,
        &negotiated.mac_s2c,
        &negotiated.compression_s2c,
        [b'B', b'D', b'F'],
    )?;
    Ok(match role {
        Role::Client => (c2s, s2c),
        Role::Server => (s2c, c2s),
    })
}
