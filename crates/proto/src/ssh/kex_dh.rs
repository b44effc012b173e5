//! Key exchange methods (RFC 4253 Section 8, RFC 4419, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//! - diffie-hellman-group14-sha256 and diffie-hellman-group16-sha512 (RFC 8268)
//! - diffie-hellman-group-exchange-sha256 (RFC 4419)
//!
//! Each method is a [`KeyExchange`] state machine driven by the transport.
//! The method produces the shared secret and its own exchange hash fields;
//! hashing, signing and verification stay in the transport.
//!
//! # Security
//!
//! - Peer DH values are range checked: `1 < y < p - 1`
//! - All-zero X25519 results are rejected
//! - Private values are single use and dropped after agreement
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::algorithm::{ClientKexStep, KexFactory, ServerKexStep};
//! use kestrel_proto::ssh::kex_dh::Curve25519Factory;
//!
//! let mut client = Curve25519Factory.create().unwrap();
//! let mut server = Curve25519Factory.create().unwrap();
//!
//! let init = client.client_start().unwrap();
//! let ServerKexStep::Reply { output: server_out, .. } = server.server_receive(&init).unwrap() else {
//!     panic!("expected reply");
//! };
//! assert_eq!(server_out.shared_secret.len(), 32);
//! ```

use super::algorithm::{ClientKexStep, KexFactory, KexOutput, KeyExchange, ServerKexStep};
use super::kex::HashAlgorithm;
use super::wire::{put_mpint, put_string, Reader};
use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;

/// SSH_MSG_KEX_ECDH_INIT / SSH_MSG_KEXDH_INIT
pub const MSG_KEXDH_INIT: u8 = 30;
/// SSH_MSG_KEX_ECDH_REPLY / SSH_MSG_KEXDH_REPLY
pub const MSG_KEXDH_REPLY: u8 = 31;
/// SSH_MSG_KEX_DH_GEX_GROUP
pub const MSG_KEX_DH_GEX_GROUP: u8 = 31;
/// SSH_MSG_KEX_DH_GEX_INIT
pub const MSG_KEX_DH_GEX_INIT: u8 = 32;
/// SSH_MSG_KEX_DH_GEX_REPLY
pub const MSG_KEX_DH_GEX_REPLY: u8 = 33;
/// SSH_MSG_KEX_DH_GEX_REQUEST
pub const MSG_KEX_DH_GEX_REQUEST: u8 = 34;

/// Bits of private exponent drawn for finite field groups.
const PRIVATE_EXPONENT_BITS: u64 = 512;

/// A finite field Diffie-Hellman group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    /// Safe prime modulus
    pub p: BigUint,
    /// Generator
    pub g: BigUint,
}

impl DhGroup {
    fn from_hex(prime: &str) -> Self {
        let hex: String = prime.chars().filter(|c| !c.is_whitespace()).collect();
        Self {
            p: BigUint::parse_bytes(hex.as_bytes(), 16).expect("valid RFC 3526 prime"),
            g: BigUint::from(2u32),
        }
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> u64 {
        self.p.bits()
    }

    fn generate_private(&self) -> BigUint {
        let mut rng = rand::thread_rng();
        let upper = BigUint::from(1u32) << PRIVATE_EXPONENT_BITS;
        rng.gen_biguint_range(&BigUint::from(2u32), &upper)
    }

    fn check_peer_value(&self, y: &BigUint) -> KestrelResult<()> {
        let one = BigUint::from(1u32);
        if *y <= one || *y >= &self.p - &one {
            return Err(KestrelError::Protocol(
                "DH public value out of range".to_string(),
            ));
        }
        Ok(())
    }
}

/// 2048-bit MODP group (RFC 3526 group 14).
pub static GROUP14: Lazy<DhGroup> = Lazy::new(|| {
    DhGroup::from_hex(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F
         83655D23DCA3AD961C62F356208552BB9ED529077096966D
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510
         15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    )
});

/// 4096-bit MODP group (RFC 3526 group 16).
pub static GROUP16: Lazy<DhGroup> = Lazy::new(|| {
    DhGroup::from_hex(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F
         83655D23DCA3AD961C62F356208552BB9ED529077096966D
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510
         15728E5A8AAAC42DAD33170D04507A33A85521ABDF1CBA64
         ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7
         ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6B
         F12FFA06D98A0864D87602733EC86A64521F2B18177B200C
         BBE117577A615D6C770988C0BAD946E208E24FA074E5AB31
         43DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7
         88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA
         2583E9CA2AD44CE8DBBBC2DB04DE8EF92E8EFC141FBECAA6
         287C59474E6BC05D99B2964FA090C3A2233BA186515BE7ED
         1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9
         93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199
         FFFFFFFFFFFFFFFF",
    )
});

fn expect_message(r: &mut Reader<'_>, expected: u8, what: &str) -> KestrelResult<()> {
    let msg = r.read_u8()?;
    if msg != expected {
        return Err(KestrelError::Protocol(format!(
            "expected {} (type {}), got type {}",
            what, expected, msg
        )));
    }
    Ok(())
}

/// Parses `byte type, string K_S, <public>, string signature` where the
/// public value is a string (ECDH) or an mpint (DH).
fn parse_reply<'a>(data: &'a [u8], reply_type: u8) -> KestrelResult<(&'a [u8], &'a [u8], &'a [u8])> {
    let mut r = Reader::new(data);
    expect_message(&mut r, reply_type, "key exchange reply")?;
    let host_key = r.read_string()?;
    let public = r.read_string()?;
    let signature = r.read_string()?;
    r.finish()?;
    Ok((host_key, public, signature))
}

/// Factory for curve25519-sha256.
#[derive(Debug, Default, Clone, Copy)]
pub struct Curve25519Factory;

impl KexFactory for Curve25519Factory {
    fn create(&self) -> KestrelResult<Box<dyn KeyExchange>> {
        Ok(Box::new(Curve25519Exchange::default()))
    }
}

/// One curve25519-sha256 run.
#[derive(Default)]
pub struct Curve25519Exchange {
    private_key: Option<EphemeralPrivateKey>,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    fn generate(&mut self) -> KestrelResult<[u8; 32]> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| KestrelError::Security("Failed to generate Curve25519 key".to_string()))?;
        let public = private_key.compute_public_key().map_err(|_| {
            KestrelError::Security("Failed to compute Curve25519 public key".to_string())
        })?;
        self.public_key.copy_from_slice(public.as_ref());
        self.private_key = Some(private_key);
        Ok(self.public_key)
    }

    fn agree(&mut self, peer_public: &[u8]) -> KestrelResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(KestrelError::Protocol(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let private_key = self.private_key.take().ok_or_else(|| {
            KestrelError::Protocol("Curve25519 exchange used out of order".to_string())
        })?;
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        let secret = agree_ephemeral(private_key, &peer, |material| material.to_vec())
            .map_err(|_| KestrelError::Security("Curve25519 key agreement failed".to_string()))?;
        if secret.iter().all(|&b| b == 0) {
            return Err(KestrelError::Security(
                "Curve25519 shared secret is zero".to_string(),
            ));
        }
        Ok(secret)
    }
}

fn ecdh_hash_fields(client_public: &[u8], server_public: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(72);
    put_string(&mut buf, client_public);
    put_string(&mut buf, server_public);
    buf.to_vec()
}

impl KeyExchange for Curve25519Exchange {
    fn hash(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    fn client_start(&mut self) -> KestrelResult<Vec<u8>> {
        let public = self.generate()?;
        let mut buf = BytesMut::with_capacity(37);
        buf.put_u8(MSG_KEXDH_INIT);
        put_string(&mut buf, &public);
        Ok(buf.to_vec())
    }

    fn client_receive(&mut self, message: &[u8]) -> KestrelResult<ClientKexStep> {
        let (host_key, server_public, signature) = parse_reply(message, MSG_KEXDH_REPLY)?;
        let shared_secret = self.agree(server_public)?;
        Ok(ClientKexStep::Reply {
            host_key: host_key.to_vec(),
            signature: signature.to_vec(),
            output: KexOutput {
                shared_secret,
                hash_fields: ecdh_hash_fields(&self.public_key, server_public),
            },
        })
    }

    fn server_receive(&mut self, message: &[u8]) -> KestrelResult<ServerKexStep> {
        let mut r = Reader::new(message);
        expect_message(&mut r, MSG_KEXDH_INIT, "ECDH init")?;
        let client_public = r.read_string()?;
        r.finish()?;

        let server_public = self.generate()?;
        let shared_secret = self.agree(client_public)?;

        let mut encoded = BytesMut::with_capacity(36);
        put_string(&mut encoded, &server_public);
        Ok(ServerKexStep::Reply {
            reply_type: MSG_KEXDH_REPLY,
            server_public: encoded.to_vec(),
            output: KexOutput {
                shared_secret,
                hash_fields: ecdh_hash_fields(client_public, &server_public),
            },
        })
    }
}

/// Factory for a fixed finite field group.
#[derive(Debug, Clone, Copy)]
pub struct DhGroupFactory {
    group: &'static DhGroup,
    hash: HashAlgorithm,
}

impl DhGroupFactory {
    /// diffie-hellman-group14-sha256
    pub fn group14_sha256() -> Self {
        Self {
            group: &GROUP14,
            hash: HashAlgorithm::Sha256,
        }
    }

    /// diffie-hellman-group16-sha512
    pub fn group16_sha512() -> Self {
        Self {
            group: &GROUP16,
            hash: HashAlgorithm::Sha512,
        }
    }
}

impl KexFactory for DhGroupFactory {
    fn create(&self) -> KestrelResult<Box<dyn KeyExchange>> {
        Ok(Box::new(DhExchange {
            group: self.group,
            hash: self.hash,
            private: None,
            public: None,
        }))
    }
}

/// One finite field Diffie-Hellman run over a fixed group.
pub struct DhExchange {
    group: &'static DhGroup,
    hash: HashAlgorithm,
    private: Option<BigUint>,
    public: Option<BigUint>,
}

impl DhExchange {
    fn generate(&mut self) -> BigUint {
        let x = self.group.generate_private();
        let e = self.group.g.modpow(&x, &self.group.p);
        self.private = Some(x);
        self.public = Some(e.clone());
        e
    }

    fn agree(&mut self, peer: &BigUint) -> KestrelResult<Vec<u8>> {
        self.group.check_peer_value(peer)?;
        let x = self.private.take().ok_or_else(|| {
            KestrelError::Protocol("DH exchange used out of order".to_string())
        })?;
        Ok(peer.modpow(&x, &self.group.p).to_bytes_be())
    }
}

fn dh_hash_fields(e: &BigUint, f: &BigUint) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_mpint(&mut buf, &e.to_bytes_be());
    put_mpint(&mut buf, &f.to_bytes_be());
    buf.to_vec()
}

impl KeyExchange for DhExchange {
    fn hash(&self) -> HashAlgorithm {
        self.hash
    }

    fn client_start(&mut self) -> KestrelResult<Vec<u8>> {
        let e = self.generate();
        let mut buf = BytesMut::new();
        buf.put_u8(MSG_KEXDH_INIT);
        put_mpint(&mut buf, &e.to_bytes_be());
        Ok(buf.to_vec())
    }

    fn client_receive(&mut self, message: &[u8]) -> KestrelResult<ClientKexStep> {
        let mut r = Reader::new(message);
        expect_message(&mut r, MSG_KEXDH_REPLY, "DH reply")?;
        let host_key = r.read_string()?.to_vec();
        let f = BigUint::from_bytes_be(r.read_mpint()?);
        let signature = r.read_string()?.to_vec();
        r.finish()?;

        let e = self.public.clone().ok_or_else(|| {
            KestrelError::Protocol("DH reply before init".to_string())
        })?;
        let shared_secret = self.agree(&f)?;
        Ok(ClientKexStep::Reply {
            host_key,
            signature,
            output: KexOutput {
                shared_secret,
                hash_fields: dh_hash_fields(&e, &f),
            },
        })
    }

    fn server_receive(&mut self, message: &[u8]) -> KestrelResult<ServerKexStep> {
        let mut r = Reader::new(message);
        expect_message(&mut r, MSG_KEXDH_INIT, "DH init")?;
        let e = BigUint::from_bytes_be(r.read_mpint()?);
        r.finish()?;
        self.group.check_peer_value(&e)?;

        let f = self.generate();
        let shared_secret = self.agree(&e)?;

        let mut encoded = BytesMut::new();
        put_mpint(&mut encoded, &f.to_bytes_be());
        Ok(ServerKexStep::Reply {
            reply_type: MSG_KEXDH_REPLY,
            server_public: encoded.to_vec(),
            output: KexOutput {
                shared_secret,
                hash_fields: dh_hash_fields(&e, &f),
            },
        })
    }
}

/// Factory for diffie-hellman-group-exchange-sha256.
///
/// `min`, `preferred` and `max` are the modulus sizes a client requests.
/// A server answers with the known group closest to `preferred` that lies
/// within the client's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupExchangeFactory {
    /// Smallest acceptable modulus, bits
    pub min: u32,
    /// Preferred modulus, bits
    pub preferred: u32,
    /// Largest acceptable modulus, bits
    pub max: u32,
}

impl Default for GroupExchangeFactory {
    fn default() -> Self {
        Self {
            min: 2048,
            preferred: 4096,
            max: 8192,
        }
    }
}

impl KexFactory for GroupExchangeFactory {
    fn create(&self) -> KestrelResult<Box<dyn KeyExchange>> {
        Ok(Box::new(GroupExchange {
            request: *self,
            state: GexState::Idle,
        }))
    }
}

enum GexState {
    Idle,
    /// Client sent GEX_REQUEST.
    AwaitGroup,
    /// Client sent GEX_INIT.
    AwaitReply { group: DhGroup, x: BigUint, e: BigUint },
    /// Server sent GEX_GROUP.
    AwaitInit { request: GroupExchangeFactory, group: DhGroup },
    Done,
}

/// One diffie-hellman-group-exchange-sha256 run.
pub struct GroupExchange {
    request: GroupExchangeFactory,
    state: GexState,
}

impl GroupExchange {
    fn select_group(min: u32, preferred: u32, max: u32) -> KestrelResult<&'static DhGroup> {
        if min > preferred || preferred > max {
            return Err(KestrelError::Protocol(format!(
                "invalid group exchange request: min={} n={} max={}",
                min, preferred, max
            )));
        }
        [&*GROUP14, &*GROUP16]
            .into_iter()
            .filter(|g| g.bits() >= u64::from(min) && g.bits() <= u64::from(max))
            .min_by_key(|g| g.bits().abs_diff(u64::from(preferred)))
            .ok_or_else(|| {
                KestrelError::Negotiation(format!(
                    "no DH group between {} and {} bits",
                    min, max
                ))
            })
    }

    fn hash_fields(
        request: &GroupExchangeFactory,
        group: &DhGroup,
        e: &BigUint,
        f: &BigUint,
    ) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(request.min);
        buf.put_u32(request.preferred);
        buf.put_u32(request.max);
        put_mpint(&mut buf, &group.p.to_bytes_be());
        put_mpint(&mut buf, &group.g.to_bytes_be());
        put_mpint(&mut buf, &e.to_bytes_be());
        put_mpint(&mut buf, &f.to_bytes_be());
        buf.to_vec()
    }

    fn out_of_order(&self, what: &str) -> KestrelError {
        KestrelError::Protocol(format!("unexpected {} during group exchange", what))
    }
}

impl KeyExchange for GroupExchange {
    fn hash(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    fn client_start(&mut self) -> KestrelResult<Vec<u8>> {
        if !matches!(self.state, GexState::Idle) {
            return Err(self.out_of_order("client start"));
        }
        self.state = GexState::AwaitGroup;
        let mut buf = BytesMut::with_capacity(13);
        buf.put_u8(MSG_KEX_DH_GEX_REQUEST);
        buf.put_u32(self.request.min);
        buf.put_u32(self.request.preferred);
        buf.put_u32(self.request.max);
        Ok(buf.to_vec())
    }

    fn client_receive(&mut self, message: &[u8]) -> KestrelResult<ClientKexStep> {
        match std::mem::replace(&mut self.state, GexState::Done) {
            GexState::AwaitGroup => {
                let mut r = Reader::new(message);
                expect_message(&mut r, MSG_KEX_DH_GEX_GROUP, "GEX group")?;
                let p = BigUint::from_bytes_be(r.read_mpint()?);
                let g = BigUint::from_bytes_be(r.read_mpint()?);
                r.finish()?;

                let bits = p.bits();
                if bits < u64::from(self.request.min) || bits > u64::from(self.request.max) {
                    return Err(KestrelError::Negotiation(format!(
                        "server offered a {}-bit group outside {}..={}",
                        bits, self.request.min, self.request.max
                    )));
                }
                if g <= BigUint::from(1u32) || g >= p || p.to_bytes_be().last().map_or(true, |b| b & 1 == 0) {
                    return Err(KestrelError::Protocol("invalid DH group parameters".to_string()));
                }

                let group = DhGroup { p, g };
                let x = group.generate_private();
                let e = group.g.modpow(&x, &group.p);
                let mut buf = BytesMut::new();
                buf.put_u8(MSG_KEX_DH_GEX_INIT);
                put_mpint(&mut buf, &e.to_bytes_be());
                self.state = GexState::AwaitReply { group, x, e };
                Ok(ClientKexStep::Send(buf.to_vec()))
            }
            GexState::AwaitReply { group, x, e } => {
                let mut r = Reader::new(message);
                expect_message(&mut r, MSG_KEX_DH_GEX_REPLY, "GEX reply")?;
                let host_key = r.read_string()?.to_vec();
                let f = BigUint::from_bytes_be(r.read_mpint()?);
                let signature = r.read_string()?.to_vec();
                r.finish()?;

                group.check_peer_value(&f)?;
                let k = f.modpow(&x, &group.p);
                Ok(ClientKexStep::Reply {
                    host_key,
                    signature,
                    output: KexOutput {
                        shared_secret: k.to_bytes_be(),
                        hash_fields: Self::hash_fields(&self.request, &group, &e, &f),
                    },
                })
            }
            _ => Err(self.out_of_order("server message")),
        }
    }

    fn server_receive(&mut self, message: &[u8]) -> KestrelResult<ServerKexStep> {
        match std::mem::replace(&mut self.state, GexState::Done) {
            GexState::Idle => {
                let mut r = Reader::new(message);
                expect_message(&mut r, MSG_KEX_DH_GEX_REQUEST, "GEX request")?;
                let request = GroupExchangeFactory {
                    min: r.read_u32()?,
                    preferred: r.read_u32()?,
                    max: r.read_u32()?,
                };
                r.finish()?;

                let group = Self::select_group(request.min, request.preferred, request.max)?.clone();
                let mut buf = BytesMut::new();
                buf.put_u8(MSG_KEX_DH_GEX_GROUP);
                put_mpint(&mut buf, &group.p.to_bytes_be());
                put_mpint(&mut buf, &group.g.to_bytes_be());
                self.state = GexState::AwaitInit { request, group };
                Ok(ServerKexStep::Send(buf.to_vec()))
            }
            GexState::AwaitInit { request, group } => {
                let mut r = Reader::new(message);
                expect_message(&mut r, MSG_KEX_DH_GEX_INIT, "GEX init")?;
                let e = BigUint::from_bytes_be(r.read_mpint()?);
                r.finish()?;
                group.check_peer_value(&e)?;

                let y = group.generate_private();
                let f = group.g.modpow(&y, &group.p);
                let k = e.modpow(&y, &group.p);

                let mut encoded = BytesMut::new();
                put_mpint(&mut encoded, &f.to_bytes_be());
                Ok(ServerKexStep::Reply {
                    reply_type: MSG_KEX_DH_GEX_REPLY,
                    server_public: encoded.to_vec(),
                    output: KexOutput {
                        shared_secret: k.to_bytes_be(),
                        hash_fields: Self::hash_fields(&request, &group, &e, &f),
                    },
                })
            }
            _ => Err(self.out_of_order("client message")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the reply a transport would send from a server step.
    fn reply_message(reply_type: u8, server_public: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(reply_type);
        put_string(&mut buf, b"host-key-blob");
        buf.put_slice(server_public);
        put_string(&mut buf, b"signature-blob");
        buf.to_vec()
    }

    fn run(factory: &dyn KexFactory) -> (KexOutput, KexOutput) {
        let mut client = factory.create().unwrap();
        let mut server = factory.create().unwrap();

        let mut to_server = client.client_start().unwrap();
        loop {
            match server.server_receive(&to_server).unwrap() {
                ServerKexStep::Send(msg) => match client.client_receive(&msg).unwrap() {
                    ClientKexStep::Send(next) => to_server = next,
                    ClientKexStep::Reply { .. } => panic!("reply before server reply"),
                },
                ServerKexStep::Reply {
                    reply_type,
                    server_public,
                    output: server_out,
                } => {
                    let reply = reply_message(reply_type, &server_public);
                    match client.client_receive(&reply).unwrap() {
                        ClientKexStep::Reply {
                            host_key,
                            signature,
                            output,
                        } => {
                            assert_eq!(host_key, b"host-key-blob");
                            assert_eq!(signature, b"signature-blob");
                            return (output, server_out);
                        }
                        ClientKexStep::Send(_) => panic!("expected reply"),
                    }
                }
            }
        }
    }

    #[test]
    fn test_curve25519_agreement() {
        let (client, server) = run(&Curve25519Factory);
        assert_eq!(client.shared_secret, server.shared_secret);
        assert_eq!(client.hash_fields, server.hash_fields);
        assert_eq!(client.hash_fields.len(), 72);
    }

    #[test]
    fn test_group14_agreement() {
        let (client, server) = run(&DhGroupFactory::group14_sha256());
        assert_eq!(client.shared_secret, server.shared_secret);
        assert_eq!(client.hash_fields, server.hash_fields);
    }

    #[test]
    fn test_group_exchange_agreement() {
        let factory = GroupExchangeFactory {
            min: 2048,
            preferred: 2048,
            max: 4096,
        };
        let (client, server) = run(&factory);
        assert_eq!(client.shared_secret, server.shared_secret);
        assert_eq!(client.hash_fields, server.hash_fields);
        assert_eq!(&client.hash_fields[..12], &[0, 0, 8, 0, 0, 0, 8, 0, 0, 0, 16, 0]);
    }

    #[test]
    fn test_group_sizes() {
        assert_eq!(GROUP14.bits(), 2048);
        assert_eq!(GROUP16.bits(), 4096);
        assert_eq!(GroupExchange::select_group(2048, 4096, 8192).unwrap().bits(), 4096);
        assert_eq!(GroupExchange::select_group(1024, 2048, 3072).unwrap().bits(), 2048);
        assert!(GroupExchange::select_group(8192, 8192, 8192).is_err());
        assert!(GroupExchange::select_group(4096, 2048, 8192).is_err());
    }

    #[test]
    fn test_dh_rejects_degenerate_public_value() {
        let mut server = DhGroupFactory::group14_sha256().create().unwrap();
        let mut msg = BytesMut::new();
        msg.put_u8(MSG_KEXDH_INIT);
        put_mpint(&mut msg, &[1]);
        assert!(server.server_receive(&msg).is_err());
    }

    #[test]
    fn test_curve25519_rejects_short_key() {
        let mut server = Curve25519Factory.create().unwrap();
        let mut msg = BytesMut::new();
        msg.put_u8(MSG_KEXDH_INIT);
        put_string(&mut msg, &[9u8; 16]);
        assert!(server.server_receive(&msg).is_err());
    }

    #[test]
    fn test_wrong_message_type() {
        let mut server = Curve25519Factory.create().unwrap();
        assert!(server.server_receive(&[99, 0, 0, 0, 0]).is_err());
    }
}
