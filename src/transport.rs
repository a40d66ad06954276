//! # Transport Layer
//!
//! TCP plumbing for both handshake and session phases. During the
//! handshake the [`Transport`] moves plaintext with exact-count reads;
//! [`Transport::into_encrypted`] then splits the stream into a
//! [`PacketWriter`] / [`PacketReader`] pair, each owning its own Shannon
//! cipher instance and 32-bit nonce.
//!
//! ## Frame Format (plaintext view)
//!
//! ```text
//! +---------+----------------+----------+--------+
//! | command | payload length | payload  | MAC    |
//! | 1 byte  | 2 bytes        | variable | 4 bytes|
//! +---------+----------------+----------+--------+
//! ```
//!
//! The whole record except the MAC trailer is transformed by the stream
//! cipher; the trailer is the cipher's own finalization value. Nonces
//! advance by exactly one per packet in each direction and are never
//! reused or skipped.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use constant_time_eq::constant_time_eq;
use shannon::Shannon;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{ProtocolError, ProtocolResult};
use crate::session::SessionKeys;
use crate::{MAC_SIZE, PACKET_HEADER_SIZE};

/// Connection timeout per server attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Plaintext-phase connection to one of the access points.
pub struct Transport {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Transport {
    /// Wrap an established stream.
    pub fn new(stream: TcpStream) -> ProtocolResult<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer_addr })
    }

    /// Connect to the first reachable server in the list.
    pub async fn connect(servers: &[SocketAddr]) -> ProtocolResult<Self> {
        for &addr in servers {
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(%addr, "connected");
                    return Self::new(stream);
                }
                Ok(Err(e)) => debug!(%addr, error = %e, "connect failed"),
                Err(_) => debug!(%addr, "connect timed out"),
            }
        }

        Err(ProtocolError::ConnectionLost(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no server reachable",
        )))
    }

    /// Remote address of the chosen server.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read exactly `buf.len()` bytes; EOF mid-buffer is a lost connection.
    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> ProtocolResult<()> {
        self.stream.read_exact(buf).await?;
        Ok(())
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> ProtocolResult<()> {
        self.stream.write_all(buf).await?;
        Ok(())
    }

    /// Bring up the cipher layer and split into the send and receive
    /// halves. No plaintext may cross the socket after this point.
    pub fn into_encrypted(self, keys: &SessionKeys) -> (PacketWriter, PacketReader) {
        let (read_half, write_half) = self.stream.into_split();
        (
            PacketWriter {
                half: write_half,
                cipher: Shannon::new(&keys.send),
                iv: 0,
            },
            PacketReader {
                half: read_half,
                cipher: Shannon::new(&keys.recv),
                iv: 0,
            },
        )
    }
}

/// Encrypting send half. Exactly one packet is in flight at a time; the
/// caller serializes access (the protocol facade wraps this in a mutex)
/// so the nonce sequence equals the wire order.
pub struct PacketWriter {
    half: OwnedWriteHalf,
    cipher: Shannon,
    iv: u32,
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter").field("iv", &self.iv).finish()
    }
}

impl PacketWriter {
    /// Encrypt and emit one `command / length / payload / mac` record.
    pub async fn send(&mut self, command: u8, payload: &[u8]) -> ProtocolResult<()> {
        if payload.len() > u16::MAX as usize {
            return Err(ProtocolError::InvalidArgument(format!(
                "payload of {} bytes exceeds the 16-bit length field",
                payload.len()
            )));
        }

        self.cipher.nonce(&self.iv.to_be_bytes());

        let mut frame = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len() + MAC_SIZE);
        frame.push(command);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);

        self.cipher.encrypt(&mut frame);
        let mut mac = [0u8; MAC_SIZE];
        self.cipher.finish(&mut mac);
        frame.extend_from_slice(&mac);

        self.half.write_all(&frame).await?;
        self.iv = self.iv.wrapping_add(1);
        trace!(command, payload_len = payload.len(), iv = self.iv, "packet sent");
        Ok(())
    }

    /// Packets sent so far; equals the next nonce value.
    pub fn packets_sent(&self) -> u32 {
        self.iv
    }
}

/// Decrypting receive half; single consumer.
pub struct PacketReader {
    half: OwnedReadHalf,
    cipher: Shannon,
    iv: u32,
}

impl std::fmt::Debug for PacketReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader").field("iv", &self.iv).finish()
    }
}

impl PacketReader {
    /// Read, decrypt and verify one record.
    pub async fn recv(&mut self) -> ProtocolResult<(u8, Bytes)> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        self.half.read_exact(&mut header).await?;

        self.cipher.nonce(&self.iv.to_be_bytes());
        self.cipher.decrypt(&mut header);

        let command = header[0];
        let payload_len = u16::from_be_bytes([header[1], header[2]]) as usize;

        let mut body = vec![0u8; payload_len + MAC_SIZE];
        self.half.read_exact(&mut body).await?;

        let (payload, mac) = body.split_at_mut(payload_len);
        self.cipher.decrypt(payload);

        let mut expected = [0u8; MAC_SIZE];
        self.cipher.finish(&mut expected);
        if !constant_time_eq(&expected, mac) {
            return Err(ProtocolError::AuthFailed("packet MAC mismatch".to_string()));
        }

        self.iv = self.iv.wrapping_add(1);
        body.truncate(payload_len);
        trace!(command, payload_len, iv = self.iv, "packet received");
        Ok((command, Bytes::from(body)))
    }

    /// Packets received so far; equals the next nonce value.
    pub fn packets_received(&self) -> u32 {
        self.iv
    }
}
