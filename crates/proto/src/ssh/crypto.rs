//! Default cipher, MAC and compression provider.
//!
//! - AES-128-GCM, AES-256-GCM (`aes*-gcm@openssh.com`, RFC 5647 as profiled
//!   by OpenSSH) on `ring`
//! - AES-128-CTR, AES-256-CTR (RFC 4344) on `aes` + `ctr`
//! - HMAC-SHA2-256, HMAC-SHA2-512 (RFC 6668)
//! - `none` compression
//!
//! [`register_defaults`] installs these together with the key exchange and
//! host key algorithms into an [`AlgorithmRegistry`].
//!
//! # Security
//!
//! - **GCM nonces** - 4 byte fixed field plus a 64 bit invocation counter taken
//!   from the derived IV and incremented once per packet
//! - **MAC comparison** - constant time via `subtle`
//! - **Key material** - derived keys are zeroized as soon as the primitive
//!   has been keyed

use super::algorithm::{
    AlgorithmRegistry, Cipher, CipherFactory, Compression, CompressionFactory, Mac, MacFactory,
};
use super::hostkey::Ed25519Verifier;
use super::kex_dh::{Curve25519Factory, DhGroupFactory, GroupExchangeFactory};
use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac as HmacTrait};
use kestrel_platform::{KestrelError, KestrelResult};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM,
};
use sha2::{Sha256, Sha512};
use std::sync::Arc;
use subtle::ConstantTimeEq;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Installs the default provider into `registry`, in preference order.
pub fn register_defaults(registry: &mut AlgorithmRegistry) {
    registry.register_kex("curve25519-sha256", Arc::new(Curve25519Factory));
    registry.register_kex("curve25519-sha256@libssh.org", Arc::new(Curve25519Factory));
    registry.register_kex(
        "diffie-hellman-group-exchange-sha256",
        Arc::new(GroupExchangeFactory::default()),
    );
    registry.register_kex(
        "diffie-hellman-group16-sha512",
        Arc::new(DhGroupFactory::group16_sha512()),
    );
    registry.register_kex(
        "diffie-hellman-group14-sha256",
        Arc::new(DhGroupFactory::group14_sha256()),
    );

    registry.register_host_key("ssh-ed25519", Arc::new(Ed25519Verifier));

    registry.register_cipher("aes256-gcm@openssh.com", Arc::new(AesGcmFactory { key_len: 32 }));
    registry.register_cipher("aes128-gcm@openssh.com", Arc::new(AesGcmFactory { key_len: 16 }));
    registry.register_cipher("aes256-ctr", Arc::new(AesCtrFactory { key_len: 32 }));
    registry.register_cipher("aes128-ctr", Arc::new(AesCtrFactory { key_len: 16 }));

    registry.register_mac("hmac-sha2-256", Arc::new(HmacFactory(MacAlgorithm::HmacSha256)));
    registry.register_mac("hmac-sha2-512", Arc::new(HmacFactory(MacAlgorithm::HmacSha512)));

    registry.register_compression("none", Arc::new(NoneCompressionFactory));
}

/// Cipher in effect before the first NEWKEYS.
#[derive(Debug, Default)]
pub struct NoneCipher;

impl Cipher for NoneCipher {
    fn block_size(&self) -> usize {
        8
    }

    fn seal(&mut self, _sequence: u32, _packet: &mut Vec<u8>) -> KestrelResult<()> {
        Ok(())
    }

    fn peek_length(&self, _sequence: u32, first_block: &[u8]) -> KestrelResult<u32> {
        read_length(first_block)
    }

    fn open(&mut self, _sequence: u32, _packet: &mut Vec<u8>) -> KestrelResult<()> {
        Ok(())
    }
}

fn read_length(block: &[u8]) -> KestrelResult<u32> {
    if block.len() < 4 {
        return Err(KestrelError::Protocol("short packet length field".to_string()));
    }
    Ok(u32::from_be_bytes([block[0], block[1], block[2], block[3]]))
}

enum CtrState {
    Aes128(Aes128Ctr),
    Aes256(Aes256Ctr),
}

impl CtrState {
    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CtrState::Aes128(c) => c.apply_keystream(data),
            CtrState::Aes256(c) => c.apply_keystream(data),
        }
    }

    fn peek(&self, data: &mut [u8]) {
        match self {
            CtrState::Aes128(c) => c.clone().apply_keystream(data),
            CtrState::Aes256(c) => c.clone().apply_keystream(data),
        }
    }
}

/// AES in counter mode; the keystream runs continuously across packets.
pub struct AesCtrCipher {
    state: CtrState,
}

impl std::fmt::Debug for AesCtrCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCtrCipher").field("key", &"<redacted>").finish()
    }
}

impl Cipher for AesCtrCipher {
    fn block_size(&self) -> usize {
        16
    }

    fn seal(&mut self, _sequence: u32, packet: &mut Vec<u8>) -> KestrelResult<()> {
        self.state.apply(packet);
        Ok(())
    }

    fn peek_length(&self, _sequence: u32, first_block: &[u8]) -> KestrelResult<u32> {
        let mut block = [0u8; 16];
        let n = first_block.len().min(16);
        block[..n].copy_from_slice(&first_block[..n]);
        self.state.peek(&mut block);
        read_length(&block)
    }

    fn open(&mut self, _sequence: u32, packet: &mut Vec<u8>) -> KestrelResult<()> {
        self.state.apply(packet);
        Ok(())
    }
}

/// Factory for `aes128-ctr` / `aes256-ctr`.
#[derive(Debug, Clone, Copy)]
pub struct AesCtrFactory {
    key_len: usize,
}

impl CipherFactory for AesCtrFactory {
    fn key_len(&self) -> usize {
        self.key_len
    }

    fn iv_len(&self) -> usize {
        16
    }

    fn is_aead(&self) -> bool {
        false
    }

    fn create(&self, key: &[u8], iv: &[u8]) -> KestrelResult<Box<dyn Cipher>> {
        let bad = |_| KestrelError::Security("invalid AES-CTR key or IV length".to_string());
        let state = match self.key_len {
            16 => CtrState::Aes128(Aes128Ctr::new_from_slices(key, iv).map_err(bad)?),
            _ => CtrState::Aes256(Aes256Ctr::new_from_slices(key, iv).map_err(bad)?),
        };
        Ok(Box::new(AesCtrCipher { state }))
    }
}

/// Per-packet GCM nonce: fixed field plus invocation counter.
struct InvocationCounter {
    fixed: [u8; 4],
    invocation: u64,
}

impl InvocationCounter {
    fn from_iv(iv: &[u8]) -> KestrelResult<Self> {
        if iv.len() < 12 {
            return Err(KestrelError::Security("GCM IV must be 12 bytes".to_string()));
        }
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);
        Ok(Self {
            fixed,
            invocation: u64::from_be_bytes(counter),
        })
    }
}

impl NonceSequence for InvocationCounter {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Ok(Nonce::assume_unique_for_key(nonce))
    }
}

/// AES-GCM with the packet length as associated data.
pub struct AesGcmCipher {
    sealing: SealingKey<InvocationCounter>,
    opening: OpeningKey<InvocationCounter>,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").field("key", &"<redacted>").finish()
    }
}

impl Cipher for AesGcmCipher {
    fn block_size(&self) -> usize {
        16
    }

    fn tag_len(&self) -> usize {
        16
    }

    fn seal(&mut self, _sequence: u32, packet: &mut Vec<u8>) -> KestrelResult<()> {
        let mut aad = [0u8; 4];
        aad.copy_from_slice(&packet[..4]);
        let tag = self
            .sealing
            .seal_in_place_separate_tag(Aad::from(aad), &mut packet[4..])
            .map_err(|_| KestrelError::Security("AES-GCM encryption failed".to_string()))?;
        packet.extend_from_slice(tag.as_ref());
        Ok(())
    }

    fn peek_length(&self, _sequence: u32, first_block: &[u8]) -> KestrelResult<u32> {
        read_length(first_block)
    }

    fn open(&mut self, _sequence: u32, packet: &mut Vec<u8>) -> KestrelResult<()> {
        if packet.len() < 4 + 16 {
            return Err(KestrelError::Protocol("GCM packet shorter than tag".to_string()));
        }
        let mut aad = [0u8; 4];
        aad.copy_from_slice(&packet[..4]);
        let plain_len = self
            .opening
            .open_in_place(Aad::from(aad), &mut packet[4..])
            .map_err(|_| KestrelError::Integrity("AES-GCM tag mismatch".to_string()))?
            .len();
        packet.truncate(4 + plain_len);
        Ok(())
    }
}

/// Factory for `aes128-gcm@openssh.com` / `aes256-gcm@openssh.com`.
#[derive(Debug, Clone, Copy)]
pub struct AesGcmFactory {
    key_len: usize,
}

impl CipherFactory for AesGcmFactory {
    fn key_len(&self) -> usize {
        self.key_len
    }

    fn iv_len(&self) -> usize {
        12
    }

    fn is_aead(&self) -> bool {
        true
    }

    fn create(&self, key: &[u8], iv: &[u8]) -> KestrelResult<Box<dyn Cipher>> {
        let algorithm = if self.key_len == 16 { &AES_128_GCM } else { &AES_256_GCM };
        let bound = |name: &str| {
            UnboundKey::new(algorithm, key)
                .map_err(|_| KestrelError::Security(format!("failed to create AES-GCM {} key", name)))
        };
        Ok(Box::new(AesGcmCipher {
            sealing: SealingKey::new(bound("sealing")?, InvocationCounter::from_iv(iv)?),
            opening: OpeningKey::new(bound("opening")?, InvocationCounter::from_iv(iv)?),
        }))
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Key and tag size in bytes.
    pub fn size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }
}

enum HmacState {
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

/// Keyed HMAC over `uint32 sequence || packet`.
pub struct MacKey {
    algorithm: MacAlgorithm,
    state: HmacState,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Keys the MAC with the first `algorithm.size()` bytes of `key_material`.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> KestrelResult<Self> {
        if key_material.len() < algorithm.size() {
            return Err(KestrelError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.size(),
                key_material.len()
            )));
        }
        let key = &key_material[..algorithm.size()];
        let bad = |_| KestrelError::Security("invalid HMAC key".to_string());
        let state = match algorithm {
            MacAlgorithm::HmacSha256 => {
                HmacState::Sha256(<Hmac<Sha256> as HmacTrait>::new_from_slice(key).map_err(bad)?)
            }
            MacAlgorithm::HmacSha512 => {
                HmacState::Sha512(<Hmac<Sha512> as HmacTrait>::new_from_slice(key).map_err(bad)?)
            }
        };
        Ok(Self { algorithm, state })
    }
}

impl Mac for MacKey {
    fn mac_len(&self) -> usize {
        self.algorithm.size()
    }

    fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        match &self.state {
            HmacState::Sha256(keyed) => {
                let mut mac = keyed.clone();
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            HmacState::Sha512(keyed) => {
                let mut mac = keyed.clone();
                mac.update(&sequence.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    fn verify(&self, sequence: u32, packet: &[u8], tag: &[u8]) -> bool {
        let expected = self.compute(sequence, packet);
        expected.len() == tag.len() && bool::from(expected.ct_eq(tag))
    }
}

/// Factory for `hmac-sha2-256` / `hmac-sha2-512`.
#[derive(Debug, Clone, Copy)]
pub struct HmacFactory(pub MacAlgorithm);

impl MacFactory for HmacFactory {
    fn key_len(&self) -> usize {
        self.0.size()
    }

    fn create(&self, key: &[u8]) -> KestrelResult<Box<dyn Mac>> {
        Ok(Box::new(MacKey::new(self.0, key)?))
    }
}

/// `none` compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compression for NoCompression {
    fn compress(&mut self, payload: &[u8]) -> KestrelResult<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn decompress(&mut self, payload: &[u8]) -> KestrelResult<Vec<u8>> {
        Ok(payload.to_vec())
    }
}

/// Factory for `none` compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneCompressionFactory;

impl CompressionFactory for NoneCompressionFactory {
    fn create(&self) -> Box<dyn Compression> {
        Box::new(NoCompression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Vec<u8> {
        // packet_length = 28, padding_length = 4, 23 bytes payload, 4 padding
        let mut p = 28u32.to_be_bytes().to_vec();
        p.push(4);
        p.extend_from_slice(&[0x5e; 23]);
        p.extend_from_slice(&[0; 4]);
        p
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let key = MacKey::new(MacAlgorithm::HmacSha256, &[7u8; 32]).unwrap();
        let tag = key.compute(3, b"packet");
        assert_eq!(tag.len(), 32);
        assert!(key.verify(3, b"packet", &tag));
        assert!(!key.verify(4, b"packet", &tag));
        assert!(!key.verify(3, b"packet!", &tag));
        assert!(!key.verify(3, b"packet", &tag[..31]));
    }

    #[test]
    fn test_mac_rejects_short_key() {
        assert!(MacKey::new(MacAlgorithm::HmacSha512, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_ctr_round_trip_across_packets() {
        let factory = AesCtrFactory { key_len: 32 };
        let mut enc = factory.create(&[1u8; 32], &[2u8; 16]).unwrap();
        let mut dec = factory.create(&[1u8; 32], &[2u8; 16]).unwrap();

        for seq in 0..3 {
            let plain = sample_packet();
            let mut wire = plain.clone();
            enc.seal(seq, &mut wire).unwrap();
            assert_ne!(wire, plain);

            assert_eq!(dec.peek_length(seq, &wire[..16]).unwrap(), 28);
            dec.open(seq, &mut wire).unwrap();
            assert_eq!(wire, plain);
        }
    }

    #[test]
    fn test_gcm_round_trip_and_tamper() {
        let factory = AesGcmFactory { key_len: 16 };
        let mut enc = factory.create(&[9u8; 16], &[3u8; 12]).unwrap();
        let mut dec = factory.create(&[9u8; 16], &[3u8; 12]).unwrap();

        let plain = sample_packet();
        let mut wire = plain.clone();
        enc.seal(0, &mut wire).unwrap();
        assert_eq!(wire.len(), plain.len() + 16);
        assert_eq!(&wire[..4], &plain[..4]);
        assert_eq!(dec.peek_length(0, &wire).unwrap(), 28);
        dec.open(0, &mut wire).unwrap();
        assert_eq!(wire, plain);

        let mut tampered = plain.clone();
        enc.seal(1, &mut tampered).unwrap();
        tampered[10] ^= 0x01;
        assert!(matches!(
            dec.open(1, &mut tampered),
            Err(KestrelError::Integrity(_))
        ));
    }

    #[test]
    fn test_gcm_nonce_advances_per_packet() {
        let factory = AesGcmFactory { key_len: 32 };
        let mut enc = factory.create(&[4u8; 32], &[5u8; 12]).unwrap();
        let mut a = sample_packet();
        let mut b = sample_packet();
        enc.seal(0, &mut a).unwrap();
        enc.seal(1, &mut b).unwrap();
        assert_ne!(a, b);
    }
}
