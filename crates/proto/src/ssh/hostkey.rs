//! SSH host and user keys (RFC 4253 Section 6.6, RFC 8709).
//!
//! A [`HostKey`] is a key pair able to sign: the server signs the exchange
//! hash with it, and a client signs its `publickey` authentication request
//! with the same trait. Signature checking is a registry concern
//! ([`SignatureVerifier`]), so the transport can verify any algorithm a
//! provider registers.
//!
//! Trust decisions belong to the caller: the client hands every received
//! host key to a [`HostKeyVerifier`] after the signature has been checked.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::hostkey::{fingerprint_sha256, Ed25519HostKey, HostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate()?;
//! let blob = hostkey.public_key_blob();
//! let signature = hostkey.sign(b"data to sign")?;
//! assert!(Ed25519HostKey::verify_blob(&blob, b"data to sign", &signature)?);
//! assert!(fingerprint_sha256(&blob).starts_with("SHA256:"));
//! # Ok(())
//! # }
//! ```

use super::algorithm::SignatureVerifier;
use super::wire::{put_string, Reader};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use kestrel_platform::{KestrelError, KestrelResult};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Algorithm name of Ed25519 keys.
pub const SSH_ED25519: &str = "ssh-ed25519";

/// Key pair able to produce SSH signatures.
pub trait HostKey: Send + Sync {
    /// Public key algorithm name, e.g. `ssh-ed25519`.
    fn algorithm(&self) -> &'static str;

    /// Public key blob: `string algorithm, algorithm-specific fields`.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data`, returning an SSH signature blob
    /// (`string algorithm, string signature`).
    fn sign(&self, data: &[u8]) -> KestrelResult<Vec<u8>>;
}

/// Ed25519 key pair.
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generates a fresh key pair.
    pub fn generate() -> KestrelResult<Self> {
        let secret: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(rand::Rng::gen(&mut rand::thread_rng()));
        Self::from_bytes(&secret[..])
    }

    /// Creates a key pair from a 32-byte secret.
    pub fn from_bytes(secret_bytes: &[u8]) -> KestrelResult<Self> {
        let key_bytes: [u8; SECRET_KEY_LENGTH] = secret_bytes.try_into().map_err(|_| {
            KestrelError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        let key_bytes = Zeroizing::new(key_bytes);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// The secret key bytes.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Verifies a signature blob against a public key blob.
    pub fn verify_blob(key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> KestrelResult<bool> {
        let mut key = Reader::new(key_blob);
        if key.read_string()? != SSH_ED25519.as_bytes() {
            return Err(KestrelError::Protocol("not an ssh-ed25519 key blob".to_string()));
        }
        let public_key: [u8; 32] = key.read_string()?.try_into().map_err(|_| {
            KestrelError::Protocol("Ed25519 public key must be 32 bytes".to_string())
        })?;

        let mut sig = Reader::new(signature_blob);
        if sig.read_string()? != SSH_ED25519.as_bytes() {
            return Ok(false);
        }
        let sig_bytes: [u8; 64] = match sig.read_string()?.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };

        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| KestrelError::Protocol(format!("Invalid Ed25519 public key: {}", e)))?;
        let signature = Signature::from_bytes(&sig_bytes);
        Ok(verifying_key.verify(data, &signature).is_ok())
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> &'static str {
        SSH_ED25519
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(51);
        put_string(&mut buf, SSH_ED25519.as_bytes());
        put_string(&mut buf, self.verifying_key.as_bytes());
        buf.to_vec()
    }

    fn sign(&self, data: &[u8]) -> KestrelResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut buf = BytesMut::with_capacity(83);
        put_string(&mut buf, SSH_ED25519.as_bytes());
        put_string(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &SSH_ED25519)
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Registry verifier for `ssh-ed25519` signatures.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, key_blob: &[u8], data: &[u8], signature: &[u8]) -> KestrelResult<bool> {
        Ed25519HostKey::verify_blob(key_blob, data, signature)
    }
}

/// OpenSSH style fingerprint: `SHA256:` + unpadded base64 of the blob hash.
pub fn fingerprint_sha256(key_blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key_blob)))
}

/// What the client learned about the server's host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyInfo {
    /// Negotiated host key algorithm
    pub algorithm: String,
    /// Public key blob `K_S`
    pub key_blob: Vec<u8>,
    /// SHA256 fingerprint of the blob
    pub fingerprint: String,
}

impl HostKeyInfo {
    /// Describes a received key blob.
    pub fn new(algorithm: &str, key_blob: &[u8]) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            key_blob: key_blob.to_vec(),
            fingerprint: fingerprint_sha256(key_blob),
        }
    }
}

/// Caller-supplied trust decision for server host keys.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns `true` to trust the key; `false` aborts the connection.
    fn verify(&self, key: &HostKeyInfo) -> bool;
}

impl<F> HostKeyVerifier for F
where
    F: Fn(&HostKeyInfo) -> bool + Send + Sync,
{
    fn verify(&self, key: &HostKeyInfo) -> bool {
        self(key)
    }
}

/// Trusts every host key. Intended for tests and trusted local links.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, _key: &HostKeyInfo) -> bool {
        true
    }
}

/// Trusts only keys whose SHA256 fingerprint is in the list.
#[derive(Debug, Default, Clone)]
pub struct FingerprintVerifier {
    fingerprints: Vec<String>,
}

impl FingerprintVerifier {
    /// Creates a verifier pinned to the given fingerprints.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }
}

impl HostKeyVerifier for FingerprintVerifier {
    fn verify(&self, key: &HostKeyInfo) -> bool {
        self.fingerprints.iter().any(|f| *f == key.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = Ed25519HostKey::generate().unwrap();
        let blob = key.public_key_blob();
        let sig = key.sign(b"exchange hash").unwrap();

        assert!(Ed25519HostKey::verify_blob(&blob, b"exchange hash", &sig).unwrap());
        assert!(!Ed25519HostKey::verify_blob(&blob, b"other data", &sig).unwrap());
    }

    #[test]
    fn test_blob_layout() {
        let key = Ed25519HostKey::from_bytes(&[1u8; 32]).unwrap();
        let blob = key.public_key_blob();
        assert_eq!(blob.len(), 4 + 11 + 4 + 32);
        assert_eq!(&blob[4..15], b"ssh-ed25519");

        let restored = Ed25519HostKey::from_bytes(&key.secret_bytes()[..]).unwrap();
        assert_eq!(restored.public_key_blob(), blob);
    }

    #[test]
    fn test_wrong_key_rejects() {
        let a = Ed25519HostKey::generate().unwrap();
        let b = Ed25519HostKey::generate().unwrap();
        let sig = a.sign(b"data").unwrap();
        assert!(!Ed25519Verifier
            .verify(&b.public_key_blob(), b"data", &sig)
            .unwrap());
    }

    #[test]
    fn test_fingerprint_pinning() {
        let key = Ed25519HostKey::generate().unwrap();
        let info = HostKeyInfo::new(SSH_ED25519, &key.public_key_blob());
        assert!(info.fingerprint.starts_with("SHA256:"));
        assert!(!info.fingerprint.ends_with('='));

        let pinned = FingerprintVerifier::new([info.fingerprint.clone()]);
        assert!(pinned.verify(&info));
        assert!(!FingerprintVerifier::new(["SHA256:nope"]).verify(&info));

        let closure = |k: &HostKeyInfo| k.algorithm == SSH_ED25519;
        assert!(closure.verify(&info));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(Ed25519HostKey::from_bytes(&[0u8; 16]).is_err());
    }
}
