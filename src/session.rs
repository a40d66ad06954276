//! # Session State
//!
//! Everything the handshake accumulates: client identity, random material,
//! keypairs, the byte-for-byte transcripts of both hello packets, and the
//! puzzle parameters. Once the handshake completes, [`Session::derive_keys`]
//! turns the transcripts and the DH shared secret into the per-direction
//! cipher keys and the key-confirmation HMAC; after that the session only
//! exists as cipher state inside the transport.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{hmac_sha1, random_bytes, DhKeypair, RsaKeypair};
use crate::error::ProtocolResult;
use crate::{
    CIPHER_KEY_SIZE, DH_PUBLIC_SIZE, HMAC_SIZE, PUZZLE_SOLUTION_SIZE, RANDOM_SIZE, SALT_SIZE,
    SERVER_BLOB_SIZE,
};

/// Client identity supplied by the embedding application.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Account login; the server may replace it with a canonical form.
    pub username: String,
    /// 4-byte identifier of the client implementation.
    pub client_id: u32,
    /// 4-byte build number.
    pub client_revision: u32,
    /// Cache digest announced right after authentication.
    pub cache_hash: [u8; HMAC_SIZE],
}

impl SessionConfig {
    /// Config with the stock client identity.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            client_id: 0x0104_0101,
            client_revision: 99_999,
            cache_hash: [0u8; HMAC_SIZE],
        }
    }
}

/// Per-direction cipher keys produced by the key derivation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Keys the client encrypts with.
    pub send: [u8; CIPHER_KEY_SIZE],
    /// Keys the server encrypts with.
    pub recv: [u8; CIPHER_KEY_SIZE],
}

impl SessionKeys {
    /// Expand a DH shared secret and the handshake transcripts into the
    /// cipher keys and the key-confirmation HMAC.
    ///
    /// Five rounds of HMAC-SHA1 over `transcript || counter` produce a
    /// 100-byte pool: bytes 0..20 key the confirmation HMAC, 20..52 the
    /// send cipher, 52..84 the receive cipher; the tail is unused. Both
    /// sides of the connection run this with the same inputs.
    pub fn derive(
        shared: &[u8],
        client_packet: &[u8],
        server_packet: &[u8],
        salt: &[u8],
        username: &[u8],
    ) -> (Self, [u8; HMAC_SIZE]) {
        let mut pool = [0u8; 5 * HMAC_SIZE];
        for counter in 1u8..=5 {
            let chunk = hmac_sha1(
                shared,
                &[client_packet, server_packet, salt, username, &[counter]],
            );
            let at = (counter as usize - 1) * HMAC_SIZE;
            pool[at..at + HMAC_SIZE].copy_from_slice(&chunk);
        }

        let auth_hmac = hmac_sha1(
            &pool[..HMAC_SIZE],
            &[client_packet, server_packet, salt, username],
        );

        let mut keys = Self {
            send: [0u8; CIPHER_KEY_SIZE],
            recv: [0u8; CIPHER_KEY_SIZE],
        };
        keys.send
            .copy_from_slice(&pool[HMAC_SIZE..HMAC_SIZE + CIPHER_KEY_SIZE]);
        keys.recv
            .copy_from_slice(&pool[HMAC_SIZE + CIPHER_KEY_SIZE..HMAC_SIZE + 2 * CIPHER_KEY_SIZE]);

        pool.zeroize();
        (keys, auth_hmac)
    }
}

/// Handshake-phase state. Single-owner: it moves through the handshake
/// and is consumed when the cipher layer comes up.
pub struct Session {
    pub(crate) username: Vec<u8>,
    pub(crate) client_id: u32,
    pub(crate) client_revision: u32,
    pub(crate) cache_hash: [u8; HMAC_SIZE],

    pub(crate) client_random: [u8; RANDOM_SIZE],
    pub(crate) server_random: [u8; RANDOM_SIZE],

    pub(crate) dh_keypair: DhKeypair,
    pub(crate) dh_server_public: [u8; DH_PUBLIC_SIZE],
    pub(crate) rsa_keypair: RsaKeypair,

    pub(crate) server_blob: [u8; SERVER_BLOB_SIZE],
    pub(crate) salt: [u8; SALT_SIZE],

    pub(crate) puzzle_denominator: u8,
    pub(crate) puzzle_magic: u32,
    pub(crate) puzzle_solution: [u8; PUZZLE_SOLUTION_SIZE],

    /// Verbatim client hello, captured before it hits the socket.
    pub(crate) initial_client_packet: Vec<u8>,
    /// Every plaintext byte of the server hello, in receive order.
    pub(crate) initial_server_packet: Vec<u8>,

    pub(crate) auth_hmac: [u8; HMAC_SIZE],
}

impl Session {
    /// Construct a session with fresh random material and keypairs.
    pub fn new(config: &SessionConfig) -> ProtocolResult<Self> {
        Ok(Self {
            username: config.username.as_bytes().to_vec(),
            client_id: config.client_id,
            client_revision: config.client_revision,
            cache_hash: config.cache_hash,
            client_random: random_bytes(),
            server_random: [0u8; RANDOM_SIZE],
            dh_keypair: DhKeypair::generate(),
            dh_server_public: [0u8; DH_PUBLIC_SIZE],
            rsa_keypair: RsaKeypair::generate()?,
            server_blob: [0u8; SERVER_BLOB_SIZE],
            salt: [0u8; SALT_SIZE],
            puzzle_denominator: 0,
            puzzle_magic: 0,
            puzzle_solution: [0u8; PUZZLE_SOLUTION_SIZE],
            initial_client_packet: Vec::new(),
            initial_server_packet: Vec::new(),
            auth_hmac: [0u8; HMAC_SIZE],
        })
    }

    /// The login currently in effect (server-canonical after the server
    /// hello has been processed).
    pub fn username(&self) -> &[u8] {
        &self.username
    }

    /// Expand the DH shared secret and handshake transcripts into the
    /// session keys, filling in the key-confirmation HMAC on the way.
    pub(crate) fn derive_keys(&mut self) -> SessionKeys {
        let shared = self.dh_keypair.shared_secret(&self.dh_server_public);
        let (keys, auth_hmac) = SessionKeys::derive(
            &shared,
            &self.initial_client_packet,
            &self.initial_server_packet,
            &self.salt,
            &self.username,
        );
        self.auth_hmac = auth_hmac;
        keys
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.client_random.zeroize();
        self.server_random.zeroize();
        self.salt.zeroize();
        self.auth_hmac.zeroize();
        self.puzzle_solution.zeroize();
        self.initial_client_packet.zeroize();
        self.initial_server_packet.zeroize();
        self.dh_keypair.zeroize();
        self.rsa_keypair.zeroize();
    }
}
