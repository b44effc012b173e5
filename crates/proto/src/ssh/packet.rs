//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (or AEAD tag)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` excludes the MAC and the length field itself
//! - At least 4 bytes of random padding
//! - `packet_length + 4` is a multiple of `max(block size, 8)`; AEAD ciphers
//!   leave the length in clear and align `packet_length` alone
//! - Maximum packet size: 35000 bytes unless configured otherwise
//!
//! # Security
//!
//! - **Size Validation**: the length is checked before any buffering
//! - **Random Padding**: cryptographically secure RNG
//! - **MAC Verification**: constant time, before the payload is handed on
//! - **Sequence Numbers**: 32 bit, wrap around, never reset by rekeying
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use kestrel_proto::ssh::packet::{PacketOpener, PacketSealer};
//!
//! let mut sealer = PacketSealer::new();
//! let mut opener = PacketOpener::new();
//!
//! let mut wire = BytesMut::new();
//! sealer.seal(b"\x05payload", &mut wire).unwrap();
//!
//! let (sequence, payload) = opener.open(&mut wire).unwrap().unwrap();
//! assert_eq!(sequence, 0);
//! assert_eq!(payload, b"\x05payload");
//! ```

use super::algorithm::{Cipher, Compression, Mac};
use super::crypto::{NoCompression, NoneCipher};
use bytes::{BufMut, BytesMut};
use kestrel_platform::{KestrelError, KestrelResult};
use rand::RngCore;

/// Default maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Smallest block size used for alignment.
const MIN_BLOCK_SIZE: usize = 8;

/// Cipher, MAC and compression state for one direction.
pub struct DirectionalKeys {
    cipher: Box<dyn Cipher>,
    mac: Option<Box<dyn Mac>>,
    compression: Box<dyn Compression>,
}

impl DirectionalKeys {
    /// Bundles keyed primitives for one direction.
    pub fn new(
        cipher: Box<dyn Cipher>,
        mac: Option<Box<dyn Mac>>,
        compression: Box<dyn Compression>,
    ) -> Self {
        Self {
            cipher,
            mac,
            compression,
        }
    }

    /// No encryption, no MAC, no compression: the state before NEWKEYS.
    pub fn plaintext() -> Self {
        Self::new(Box::new(NoneCipher), None, Box::new(NoCompression))
    }

    fn block_size(&self) -> usize {
        self.cipher.block_size().max(MIN_BLOCK_SIZE)
    }

    fn trailer_len(&self) -> usize {
        if self.cipher.is_aead() {
            self.cipher.tag_len()
        } else {
            self.mac.as_ref().map_or(0, |m| m.mac_len())
        }
    }
}

impl std::fmt::Debug for DirectionalKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionalKeys")
            .field("block_size", &self.block_size())
            .field("aead", &self.cipher.is_aead())
            .field("mac", &self.mac.is_some())
            .finish_non_exhaustive()
    }
}

/// Outbound half of the packet codec.
#[derive(Debug)]
pub struct PacketSealer {
    sequence: u32,
    keys: DirectionalKeys,
}

impl Default for PacketSealer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSealer {
    /// Starts at sequence 0 with plaintext keys.
    pub fn new() -> Self {
        Self {
            sequence: 0,
            keys: DirectionalKeys::plaintext(),
        }
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Switches to new keys. The sequence number carries on.
    pub fn install(&mut self, keys: DirectionalKeys) {
        self.keys = keys;
    }

    /// Frames, encrypts and authenticates `payload`, appending the wire bytes
    /// to `out`. Returns the sequence number used and the bytes written.
    pub fn seal(&mut self, payload: &[u8], out: &mut BytesMut) -> KestrelResult<(u32, usize)> {
        let payload = self.keys.compression.compress(payload)?;
        let block = self.keys.block_size();
        let aead = self.keys.cipher.is_aead();

        let unpadded = if aead { 1 + payload.len() } else { 5 + payload.len() };
        let mut padding = block - unpadded % block;
        if padding < MIN_PADDING_LEN {
            padding += block;
        }
        let packet_length = 1 + payload.len() + padding;
        if packet_length + 4 > MAX_PACKET_SIZE {
            return Err(KestrelError::Protocol(format!(
                "payload of {} bytes exceeds maximum packet size",
                payload.len()
            )));
        }

        let mut packet = Vec::with_capacity(4 + packet_length + self.keys.trailer_len());
        packet.extend_from_slice(&(packet_length as u32).to_be_bytes());
        packet.push(padding as u8);
        packet.extend_from_slice(&payload);
        let start = packet.len();
        packet.resize(start + padding, 0);
        rand::thread_rng().fill_bytes(&mut packet[start..]);

        let sequence = self.sequence;
        let tag = match (&self.keys.mac, aead) {
            (Some(mac), false) => Some(mac.compute(sequence, &packet)),
            _ => None,
        };
        self.keys.cipher.seal(sequence, &mut packet)?;

        let written = packet.len() + tag.as_ref().map_or(0, Vec::len);
        out.reserve(written);
        out.put_slice(&packet);
        if let Some(tag) = tag {
            out.put_slice(&tag);
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok((sequence, written))
    }

    #[cfg(test)]
    pub(crate) fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }
}

/// Inbound half of the packet codec.
#[derive(Debug)]
pub struct PacketOpener {
    sequence: u32,
    keys: DirectionalKeys,
    max_packet_length: usize,
    pending_length: Option<usize>,
}

impl Default for PacketOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketOpener {
    /// Starts at sequence 0 with plaintext keys.
    pub fn new() -> Self {
        Self::with_max_packet_length(MAX_PACKET_SIZE)
    }

    /// Like [`new`](Self::new) with a custom size limit.
    pub fn with_max_packet_length(max_packet_length: usize) -> Self {
        Self {
            sequence: 0,
            keys: DirectionalKeys::plaintext(),
            max_packet_length,
            pending_length: None,
        }
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Switches to new keys. The sequence number carries on.
    pub fn install(&mut self, keys: DirectionalKeys) {
        self.keys = keys;
    }

    /// Removes one complete packet from `input`.
    ///
    /// Returns `Ok(None)` until enough bytes have arrived. On success the
    /// packet's sequence number and decompressed payload are returned.
    ///
    /// # Errors
    ///
    /// - [`KestrelError::Protocol`] for bad lengths or padding
    /// - [`KestrelError::Integrity`] for MAC or AEAD tag failures
    pub fn open(&mut self, input: &mut BytesMut) -> KestrelResult<Option<(u32, Vec<u8>)>> {
        let block = self.keys.block_size();
        let aead = self.keys.cipher.is_aead();

        let packet_length = match self.pending_length {
            Some(len) => len,
            None => {
                if input.len() < block {
                    return Ok(None);
                }
                let len = self.keys.cipher.peek_length(self.sequence, &input[..block])? as usize;
                self.check_length(len, block, aead)?;
                self.pending_length = Some(len);
                len
            }
        };

        let trailer = self.keys.trailer_len();
        let total = 4 + packet_length + trailer;
        if input.len() < total {
            return Ok(None);
        }
        self.pending_length = None;

        let sequence = self.sequence;
        let (mut packet, mac) = if aead {
            (input.split_to(total).to_vec(), None)
        } else {
            let packet = input.split_to(4 + packet_length).to_vec();
            (packet, Some(input.split_to(trailer)))
        };

        self.keys.cipher.open(sequence, &mut packet)?;
        if let (Some(mac_key), Some(tag)) = (&self.keys.mac, &mac) {
            if !aead && !mac_key.verify(sequence, &packet, tag) {
                return Err(KestrelError::Integrity(format!(
                    "MAC verification failed for packet {}",
                    sequence
                )));
            }
        }
        self.sequence = self.sequence.wrapping_add(1);

        let padding = packet[4] as usize;
        if padding < MIN_PADDING_LEN || padding + 1 > packet_length {
            return Err(KestrelError::Protocol(format!(
                "invalid padding length {} for packet length {}",
                padding, packet_length
            )));
        }
        let payload = &packet[5..4 + packet_length - padding];
        let payload = self.keys.compression.decompress(payload)?;
        Ok(Some((sequence, payload)))
    }

    fn check_length(&self, len: usize, block: usize, aead: bool) -> KestrelResult<()> {
        if len + 4 > self.max_packet_length {
            return Err(KestrelError::Protocol(format!(
                "packet length {} exceeds maximum {}",
                len, self.max_packet_length
            )));
        }
        if len < 1 + MIN_PADDING_LEN {
            return Err(KestrelError::Protocol(format!("packet length {} too small", len)));
        }
        let aligned = if aead { len } else { len + 4 };
        if aligned % block != 0 {
            return Err(KestrelError::Protocol(format!(
                "packet length {} not aligned to block size {}",
                len, block
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithm::AlgorithmRegistry;
    use proptest::prelude::*;

    fn keyed(cipher: &str, mac: Option<&str>) -> (DirectionalKeys, DirectionalKeys) {
        let registry = AlgorithmRegistry::with_defaults();
        let build = || {
            let factory = registry.cipher(cipher).unwrap();
            let key = vec![0x11; factory.key_len()];
            let iv = vec![0x22; factory.iv_len()];
            let mac = mac.map(|name| {
                let m = registry.mac(name).unwrap();
                m.create(&vec![0x33; m.key_len()]).unwrap()
            });
            DirectionalKeys::new(
                factory.create(&key, &iv).unwrap(),
                mac,
                registry.compression("none").unwrap().create(),
            )
        };
        (build(), build())
    }

    fn pair(cipher: &str, mac: Option<&str>) -> (PacketSealer, PacketOpener) {
        let (out, inp) = keyed(cipher, mac);
        let mut sealer = PacketSealer::new();
        let mut opener = PacketOpener::new();
        sealer.install(out);
        opener.install(inp);
        (sealer, opener)
    }

    #[test]
    fn test_plaintext_alignment_and_padding() {
        let mut sealer = PacketSealer::new();
        for len in 0..40 {
            let mut wire = BytesMut::new();
            let (_, written) = sealer.seal(&vec![7u8; len], &mut wire).unwrap();
            assert_eq!(written, wire.len());
            assert_eq!(wire.len() % 8, 0);
            let padding = wire[4] as usize;
            assert!(padding >= MIN_PADDING_LEN);
            let packet_length = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
            assert_eq!(packet_length, 1 + len + padding);
        }
    }

    #[test]
    fn test_partial_input_waits() {
        let mut sealer = PacketSealer::new();
        let mut opener = PacketOpener::new();
        let mut wire = BytesMut::new();
        sealer.seal(b"hello world", &mut wire).unwrap();

        let mut input = BytesMut::new();
        for byte in wire.iter() {
            assert!(opener.open(&mut input).unwrap().is_none());
            input.put_u8(*byte);
        }
        let (_, payload) = opener.open(&mut input).unwrap().unwrap();
        assert_eq!(payload, b"hello world");
        assert!(input.is_empty());
    }

    #[test]
    fn test_oversized_length_rejected_before_buffering() {
        let mut opener = PacketOpener::new();
        let mut input = BytesMut::new();
        input.put_u32(1_000_000);
        input.put_slice(&[4, 0, 0, 0]);
        assert!(matches!(opener.open(&mut input), Err(KestrelError::Protocol(_))));
    }

    #[test]
    fn test_misaligned_length_rejected() {
        let mut opener = PacketOpener::new();
        let mut input = BytesMut::new();
        input.put_u32(13);
        input.put_slice(&[4, 0, 0, 0]);
        assert!(opener.open(&mut input).is_err());
    }

    #[test]
    fn test_short_padding_rejected() {
        let mut opener = PacketOpener::new();
        let mut input = BytesMut::new();
        input.put_u32(12);
        input.put_u8(2);
        input.put_slice(&[0u8; 11]);
        assert!(opener.open(&mut input).is_err());
    }

    #[test]
    fn test_ctr_hmac_round_trip() {
        let (mut sealer, mut opener) = pair("aes256-ctr", Some("hmac-sha2-256"));
        let mut wire = BytesMut::new();
        for i in 0..5u8 {
            sealer.seal(&vec![i; 100 + i as usize], &mut wire).unwrap();
        }
        for i in 0..5u8 {
            let (seq, payload) = opener.open(&mut wire).unwrap().unwrap();
            assert_eq!(seq, i as u32);
            assert_eq!(payload, vec![i; 100 + i as usize]);
        }
        assert!(wire.is_empty());
    }

    #[test]
    fn test_gcm_round_trip_keeps_length_clear() {
        let (mut sealer, mut opener) = pair("aes128-gcm@openssh.com", None);
        let mut wire = BytesMut::new();
        sealer.seal(b"aead payload", &mut wire).unwrap();

        let packet_length = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(packet_length % 16, 0);
        assert_eq!(wire.len(), 4 + packet_length + 16);

        let (_, payload) = opener.open(&mut wire).unwrap().unwrap();
        assert_eq!(payload, b"aead payload");
    }

    #[test]
    fn test_sequence_wraps_and_survives_rekey() {
        let (mut sealer, mut opener) = pair("aes128-ctr", Some("hmac-sha2-512"));
        sealer.set_sequence(u32::MAX);
        opener.sequence = u32::MAX;

        let mut wire = BytesMut::new();
        assert_eq!(sealer.seal(b"last", &mut wire).unwrap().0, u32::MAX);
        assert_eq!(sealer.sequence(), 0);
        assert_eq!(opener.open(&mut wire).unwrap().unwrap().0, u32::MAX);

        let (out, inp) = keyed("aes256-gcm@openssh.com", None);
        sealer.install(out);
        opener.install(inp);
        sealer.seal(b"first", &mut wire).unwrap();
        let (seq, payload) = opener.open(&mut wire).unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(payload, b"first");
    }

    proptest! {
        #[test]
        fn prop_any_bit_flip_is_detected(byte in 0usize..64, bit in 0u8..8, gcm in any::<bool>()) {
            let (mut sealer, mut opener) = if gcm {
                pair("aes256-gcm@openssh.com", None)
            } else {
                pair("aes128-ctr", Some("hmac-sha2-256"))
            };
            let mut wire = BytesMut::new();
            sealer.seal(&[0xabu8; 20], &mut wire).unwrap();
            let index = byte % wire.len();
            wire[index] ^= 1 << bit;

            match opener.open(&mut wire) {
                Ok(Some(_)) => prop_assert!(false, "tampered packet accepted"),
                Ok(None) | Err(_) => {}
            }
        }
    }
}
