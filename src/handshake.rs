//! # Handshake Engine
//!
//! Drives the strict four-packet authentication sequence:
//!
//! 1. Client hello: identity, randoms, DH and RSA public material.
//! 2. Server hello: server random, DH public, signed blob, salt and the
//!    proof-of-work puzzle parameters. A status packet in its place
//!    aborts with the server's rejection cause.
//! 3. Key derivation from the DH shared secret and both hello
//!    transcripts, plus the puzzle brute-force.
//! 4. Auth packet (key-confirmation HMAC and puzzle solution), answered
//!    by a status packet.
//!
//! Everything here is plaintext; field offsets and widths are fixed and
//! any deviation is fatal. Both hello packets are captured verbatim
//! because the key derivation consumes them byte-for-byte.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::crypto::sha1_digest;
use crate::error::{ProtocolError, ProtocolResult, RejectionCause};
use crate::frame::{PacketBuilder, PacketReader};
use crate::session::{Session, SessionKeys};
use crate::transport::Transport;
use crate::{
    DH_PUBLIC_SIZE, PROTOCOL_VERSION, PUZZLE_SOLUTION_SIZE, RANDOM_SIZE, SALT_SIZE,
    SERVER_BLOB_SIZE,
};

/// Fixed-size prefix of the upgrade-URL region in an upgrade-required
/// status packet; its last byte is the length of the variable tail.
const UPGRADE_REGION_SIZE: usize = 282;

/// Brute-force ceiling for the puzzle search.
const MAX_PUZZLE_ATTEMPTS: u64 = 1 << 40;

/// Run the whole handshake over a plaintext transport. On success the
/// returned keys are ready to bring up the cipher layer; on any error
/// the session is unusable.
pub async fn authenticate(
    transport: &mut Transport,
    session: &mut Session,
) -> ProtocolResult<SessionKeys> {
    let hello = build_client_hello(session)?;
    session.initial_client_packet = hello.to_vec();
    transport.write_all(&hello).await?;
    debug!(len = hello.len(), "client hello sent");

    read_server_hello(transport, session).await?;
    debug!(
        username = %String::from_utf8_lossy(&session.username),
        puzzle_denominator = session.puzzle_denominator,
        "server hello received"
    );

    let keys = session.derive_keys();
    session.puzzle_solution = solve_puzzle(
        &session.server_random,
        session.puzzle_denominator,
        session.puzzle_magic,
    )?;
    trace!(solution = ?session.puzzle_solution, "puzzle solved");

    let auth = build_auth_packet(session);
    transport.write_all(&auth).await?;
    debug!(len = auth.len(), "auth packet sent");

    read_auth_status(transport).await?;
    debug!("authentication accepted");
    Ok(keys)
}

/// Build the client hello. The length field at offset 2 is back-patched
/// with the total packet size once the variable tail is in place.
pub(crate) fn build_client_hello(session: &Session) -> ProtocolResult<Bytes> {
    if session.username.len() > u8::MAX as usize {
        return Err(ProtocolError::InvalidArgument(format!(
            "username of {} bytes exceeds the 8-bit length field",
            session.username.len()
        )));
    }

    let mut pkt = PacketBuilder::with_capacity(277 + session.username.len());
    pkt.put_u16(PROTOCOL_VERSION);
    pkt.put_u16(0); // total length, patched below
    pkt.put_u32(0);
    pkt.put_u32(0x0003_0c00);
    pkt.put_u32(session.client_revision);
    pkt.put_u32(0);
    pkt.put_u32(0x0100_0000);
    pkt.put_u32(session.client_id);
    pkt.put_u32(0);
    pkt.put_slice(&session.client_random);
    pkt.put_slice(session.dh_keypair.public_bytes());
    pkt.put_slice(&session.rsa_keypair.public_modulus());
    pkt.put_u8(0); // random data length
    pkt.put_u8(session.username.len() as u8);
    pkt.put_u16(0x0100);
    pkt.put_slice(&session.username);
    pkt.put_u8(0x40);

    let total = pkt.len() as u16;
    pkt.patch_u16(2, total);
    Ok(pkt.freeze())
}

/// Reads from the transport while mirroring every byte into the server
/// hello transcript.
struct TranscriptReader<'a> {
    transport: &'a mut Transport,
    transcript: Vec<u8>,
}

impl<'a> TranscriptReader<'a> {
    fn new(transport: &'a mut Transport) -> Self {
        Self {
            transport,
            transcript: Vec::with_capacity(512),
        }
    }

    async fn read_vec(&mut self, count: usize) -> ProtocolResult<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.transport.read_exact(&mut buf).await?;
        self.transcript.extend_from_slice(&buf);
        Ok(buf)
    }

    async fn read_array<const N: usize>(&mut self) -> ProtocolResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.transport.read_exact(&mut buf).await?;
        self.transcript.extend_from_slice(&buf);
        Ok(buf)
    }

    async fn read_u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.read_array::<1>().await?[0])
    }
}

/// Parse the server hello, filling the session and capturing the
/// transcript. A nonzero first byte means the server sent a status
/// packet instead; its sub-code is mapped to a rejection cause.
async fn read_server_hello(transport: &mut Transport, session: &mut Session) -> ProtocolResult<()> {
    let mut first = [0u8; 2];
    transport.read_exact(&mut first).await?;

    if first[0] != 0 {
        return Err(read_rejection(transport, first[1]).await);
    }

    let mut reader = TranscriptReader::new(transport);
    // The two bytes already consumed are the start of the server random.
    reader.transcript.extend_from_slice(&first);
    session.server_random[..2].copy_from_slice(&first);

    let rest: [u8; RANDOM_SIZE - 2] = reader.read_array().await?;
    session.server_random[2..].copy_from_slice(&rest);

    session.dh_server_public = reader.read_array::<DH_PUBLIC_SIZE>().await?;
    session.server_blob = reader.read_array::<SERVER_BLOB_SIZE>().await?;
    session.salt = reader.read_array::<SALT_SIZE>().await?;

    let padding_length = reader.read_u8().await?;
    if padding_length == 0 {
        return Err(ProtocolError::Malformed(
            "padding length must be positive".to_string(),
        ));
    }
    let username_length = reader.read_u8().await?;

    let lengths: [u8; 8] = reader.read_array().await?;
    let mut lengths_reader = PacketReader::new(&lengths);
    let puzzle_challenge_length = lengths_reader.get_u16()?;
    let unknown1 = lengths_reader.get_u16()?;
    let unknown2 = lengths_reader.get_u16()?;
    let unknown3 = lengths_reader.get_u16()?;

    // Padding is random filler; it only matters to the transcript.
    let _padding = reader.read_vec(padding_length as usize).await?;

    // The server echoes the login in canonical form; it replaces ours
    // from here on, including in the key derivation.
    session.username = reader.read_vec(username_length as usize).await?;

    let block_length = puzzle_challenge_length as usize
        + unknown1 as usize
        + unknown2 as usize
        + unknown3 as usize;
    let block = reader.read_vec(block_length).await?;

    let mut puzzle = PacketReader::new(&block);
    puzzle.expect_u8(0x01, "puzzle challenge marker")?;
    session.puzzle_denominator = puzzle.get_u8()?;
    session.puzzle_magic = puzzle.get_u32()?;

    session.initial_server_packet = reader.transcript;
    Ok(())
}

/// Consume the remainder of a status packet and produce the rejection.
async fn read_rejection(transport: &mut Transport, code: u8) -> ProtocolError {
    let mut cause = RejectionCause::from_code(code);

    if let RejectionCause::UpgradeRequired(ref mut url) = cause {
        // The upgrade notice carries a fixed region whose final byte is
        // the length of the URL that follows.
        let mut region = [0u8; UPGRADE_REGION_SIZE];
        if transport.read_exact(&mut region).await.is_ok() {
            let tail_length = region[UPGRADE_REGION_SIZE - 1] as usize;
            let mut tail = vec![0u8; tail_length];
            if transport.read_exact(&mut tail).await.is_ok() {
                *url = String::from_utf8_lossy(&tail).into_owned();
            }
        }
    }

    ProtocolError::HandshakeRejected { cause }
}

/// Find an 8-byte solution whose SHA-1 over `server_random || solution`
/// satisfies the difficulty predicate: the low `denominator` bits of the
/// digest tail, folded with the server's magic constant, must be zero.
pub fn solve_puzzle(
    server_random: &[u8; RANDOM_SIZE],
    denominator: u8,
    magic: u32,
) -> ProtocolResult<[u8; PUZZLE_SOLUTION_SIZE]> {
    for attempt in 0..MAX_PUZZLE_ATTEMPTS {
        let solution = attempt.to_be_bytes();
        if verify_puzzle(server_random, &solution, denominator, magic) {
            return Ok(solution);
        }
    }
    Err(ProtocolError::Malformed(format!(
        "puzzle with denominator {} not satisfiable",
        denominator
    )))
}

/// The puzzle acceptance predicate.
pub fn verify_puzzle(
    server_random: &[u8; RANDOM_SIZE],
    solution: &[u8; PUZZLE_SOLUTION_SIZE],
    denominator: u8,
    magic: u32,
) -> bool {
    let digest = sha1_digest(&[server_random, solution]);
    let tail = u32::from_be_bytes([digest[16], digest[17], digest[18], digest[19]]);
    let mask = match 1u32.checked_shl(denominator as u32) {
        Some(threshold) => threshold - 1,
        None => u32::MAX,
    };
    (tail ^ magic) & mask == 0
}

/// Build the auth packet: confirmation HMAC plus puzzle solution.
pub(crate) fn build_auth_packet(session: &Session) -> Bytes {
    let mut pkt = PacketBuilder::with_capacity(36);
    pkt.put_slice(&session.auth_hmac);
    pkt.put_u8(0); // random data length
    pkt.put_u8(0);
    pkt.put_u16(session.puzzle_solution.len() as u16);
    pkt.put_u32(0);
    pkt.put_slice(&session.puzzle_solution);
    pkt.freeze()
}

/// Read the auth status packet. Its payload is opaque and discarded.
async fn read_auth_status(transport: &mut Transport) -> ProtocolResult<()> {
    let mut status = [0u8; 2];
    transport.read_exact(&mut status).await?;

    if status[0] != 0 {
        return Err(ProtocolError::AuthFailed(format!(
            "server rejected credentials (code 0x{:02x})",
            status[1]
        )));
    }

    let payload_length = status[1] as usize;
    if payload_length == 0 {
        return Err(ProtocolError::Malformed(
            "auth status payload length must be positive".to_string(),
        ));
    }

    let mut payload = vec![0u8; payload_length];
    transport.read_exact(&mut payload).await?;
    Ok(())
}
