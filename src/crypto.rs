//! # Cryptographic Primitives
//!
//! The handshake's asymmetric material and hash functions:
//! - Diffie-Hellman over the protocol's fixed 768-bit MODP group
//! - 1024-bit RSA client keypair (only the public modulus is transmitted)
//! - HMAC-SHA1 and SHA-1 (key derivation, key confirmation, puzzle)
//! - Secure random generation
//!
//! The symmetric session cipher lives in the transport layer; everything
//! here runs before the first encrypted packet.

use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use rand::{rngs::OsRng, CryptoRng, RngCore};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, ProtocolResult};
use crate::{DH_PUBLIC_SIZE, HMAC_SIZE, RSA_MODULUS_SIZE};

type HmacSha1 = Hmac<Sha1>;

/// The fixed 768-bit prime modulus shared with the server (Oakley group 1).
const DH_PRIME: [u8; 96] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2,
    0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67,
    0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e,
    0x34, 0x04, 0xdd, 0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5,
    0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x3a, 0x36, 0x20, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Group generator.
const DH_GENERATOR: u32 = 2;

/// Private exponent size in bytes.
const DH_PRIVATE_SIZE: usize = 95;

/// RSA client key size in bits; the public modulus serializes to 128 bytes.
const RSA_KEY_BITS: usize = 1024;

/// Left-pad a big-endian integer to a fixed width.
fn to_fixed_be(value: &BigUint, width: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    debug_assert!(bytes.len() <= width);
    let mut out = vec![0u8; width];
    out[width - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Diffie-Hellman keypair over the fixed group.
///
/// The private exponent is kept as a fixed byte buffer and zeroized on
/// drop; bignum form only exists transiently inside the exponentiations.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhKeypair {
    private: [u8; DH_PRIVATE_SIZE],
    public: [u8; DH_PUBLIC_SIZE],
}

impl DhKeypair {
    /// Generate a keypair from the OS random source.
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    /// Generate a keypair from the given random source.
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut private = [0u8; DH_PRIVATE_SIZE];
        rng.fill_bytes(&mut private);
        let keypair = Self::from_private_bytes(&private);
        private.zeroize();
        keypair
    }

    /// Build the keypair from raw private-exponent bytes (left-padded to
    /// the full exponent width). Used by tests that need a reproducible
    /// key.
    pub fn from_private_bytes(private: &[u8]) -> Self {
        debug_assert!(private.len() <= DH_PRIVATE_SIZE);
        let mut exponent = [0u8; DH_PRIVATE_SIZE];
        let len = private.len().min(DH_PRIVATE_SIZE);
        exponent[DH_PRIVATE_SIZE - len..].copy_from_slice(&private[private.len() - len..]);

        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let public =
            BigUint::from(DH_GENERATOR).modpow(&BigUint::from_bytes_be(&exponent), &prime);

        let mut serialized = [0u8; DH_PUBLIC_SIZE];
        serialized.copy_from_slice(&to_fixed_be(&public, DH_PUBLIC_SIZE));

        Self {
            private: exponent,
            public: serialized,
        }
    }

    /// The 96-byte public value transmitted in the client hello.
    pub fn public_bytes(&self) -> &[u8; DH_PUBLIC_SIZE] {
        &self.public
    }

    /// Agree on the 96-byte shared secret with the server's public value.
    pub fn shared_secret(&self, peer_public: &[u8; DH_PUBLIC_SIZE]) -> [u8; DH_PUBLIC_SIZE] {
        let peer = BigUint::from_bytes_be(peer_public);
        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let shared = peer.modpow(&BigUint::from_bytes_be(&self.private), &prime);

        let mut out = [0u8; DH_PUBLIC_SIZE];
        out.copy_from_slice(&to_fixed_be(&shared, DH_PUBLIC_SIZE));
        out
    }
}

/// RSA client keypair.
///
/// The protocol sends the raw public modulus during the handshake; the
/// private half never leaves the session.
pub struct RsaKeypair {
    key: RsaPrivateKey,
}

impl RsaKeypair {
    /// Generate a fresh 1024-bit keypair.
    pub fn generate() -> ProtocolResult<Self> {
        Self::generate_with(&mut OsRng)
    }

    /// Generate from the given random source.
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> ProtocolResult<Self> {
        let key = RsaPrivateKey::new(rng, RSA_KEY_BITS)
            .map_err(|e| ProtocolError::Crypto(format!("RSA key generation failed: {}", e)))?;
        Ok(Self { key })
    }

    /// The 128-byte public modulus transmitted in the client hello.
    pub fn public_modulus(&self) -> [u8; RSA_MODULUS_SIZE] {
        let n = self.key.n().to_bytes_be();
        let mut out = [0u8; RSA_MODULUS_SIZE];
        out[RSA_MODULUS_SIZE - n.len()..].copy_from_slice(&n);
        out
    }
}

impl Zeroize for RsaKeypair {
    fn zeroize(&mut self) {
        // RsaPrivateKey has no public Zeroize impl in this rsa version; it
        // zeroizes its internal state itself via its own Drop/ZeroizeOnDrop
        // impl, which still runs when this field is later dropped.
    }
}

/// Compute HMAC-SHA1 over a sequence of message parts.
pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> [u8; HMAC_SIZE] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Compute SHA-1 over a sequence of message parts.
pub fn sha1_digest(parts: &[&[u8]]) -> [u8; HMAC_SIZE] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_public_is_96_bytes_padded() {
        // A tiny private exponent produces a small public value that must
        // still serialize left-padded to the full width.
        let kp = DhKeypair::from_private_bytes(&[0x01]);
        assert_eq!(kp.public_bytes().len(), 96);
        assert_eq!(kp.public_bytes()[95], 0x02); // g^1 = 2
        assert!(kp.public_bytes()[..95].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dh_agreement() {
        let alice = DhKeypair::from_private_bytes(&[0xaa; 95]);
        let bob = DhKeypair::from_private_bytes(&[0xbb; 95]);

        let alice_shared = alice.shared_secret(bob.public_bytes());
        let bob_shared = bob.shared_secret(alice.public_bytes());

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_dh_distinct_keys() {
        let kp1 = DhKeypair::generate();
        let kp2 = DhKeypair::generate();
        assert_ne!(kp1.public_bytes(), kp2.public_bytes());
    }

    #[test]
    fn test_hmac_sha1_parts_equivalence() {
        // Splitting the message across parts must not change the digest.
        let whole = hmac_sha1(b"key", &[b"hello world"]);
        let split = hmac_sha1(b"key", &[b"hello ", b"world"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_sha1_known_vector() {
        // SHA-1("abc")
        let digest = sha1_digest(&[b"abc"]);
        assert_eq!(
            digest,
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }

    #[test]
    fn test_rsa_modulus_width() {
        let kp = RsaKeypair::generate().unwrap();
        let modulus = kp.public_modulus();
        assert_eq!(modulus.len(), 128);
        // 1024-bit modulus: top byte non-zero.
        assert_ne!(modulus[0], 0);
    }
}
