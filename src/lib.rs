//! # notewire
//!
//! Client-side engine for a proprietary music-streaming wire protocol:
//! - Diffie-Hellman / RSA authenticated handshake with a proof-of-work puzzle
//! - Shannon stream-cipher session transport with per-packet nonces
//! - Channel multiplexing of many logical streams over one connection
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                                  Server
//!   |                                        |
//!   |------ ClientHello (DH pub, RSA) ------>|
//!   |<----- ServerHello (DH pub, puzzle) ----|
//!   |                                        |
//!   |  [derive keys, solve puzzle]           |
//!   |                                        |
//!   |------ Auth (HMAC, solution) ---------->|
//!   |<----- Auth status ---------------------|
//!   |                                        |
//!   |====== Shannon-encrypted packets ======>|
//!   |<====== Shannon-encrypted packets ======|
//! ```
//!
//! The handshake runs in plaintext; its transcript feeds the key derivation
//! that brings up the cipher layer. Every post-handshake packet is a
//! `command / length / payload / mac` record encrypted under a per-direction
//! key with a monotonically increasing 32-bit nonce.

pub mod channel;
pub mod command;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod protocol;
pub mod session;
pub mod transport;

pub use channel::{ChannelEvent, ChannelKind, ChannelRegistry};
pub use command::Command;
pub use error::{ProtocolError, ProtocolResult, RejectionCause};
pub use protocol::{CommandEvent, Protocol, ProtocolHandle};
pub use session::{Session, SessionConfig, SessionKeys};

/// Handshake protocol version sent in the client hello.
pub const PROTOCOL_VERSION: u16 = 3;

/// Serialized Diffie-Hellman public value size.
pub const DH_PUBLIC_SIZE: usize = 96;

/// Serialized RSA public modulus size.
pub const RSA_MODULUS_SIZE: usize = 128;

/// Client and server random size.
pub const RANDOM_SIZE: usize = 16;

/// Server blob (RSA signature material) size.
pub const SERVER_BLOB_SIZE: usize = 256;

/// Salt size in the server hello.
pub const SALT_SIZE: usize = 10;

/// HMAC-SHA1 output size.
pub const HMAC_SIZE: usize = 20;

/// Puzzle solution size.
pub const PUZZLE_SOLUTION_SIZE: usize = 8;

/// Per-direction cipher key size.
pub const CIPHER_KEY_SIZE: usize = 32;

/// Encrypted packet header size (command byte + payload length).
pub const PACKET_HEADER_SIZE: usize = 3;

/// Cipher MAC trailer size.
pub const MAC_SIZE: usize = 4;
