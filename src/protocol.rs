//! # Protocol Facade
//!
//! Ties the layers together: connect, authenticate, bring up the cipher
//! transport, then expose the request API and the receive loop.
//!
//! Ownership follows the traffic: the receive loop owns the decrypting
//! reader exclusively; any number of tasks send through a cloned
//! [`ProtocolHandle`], whose internal mutex makes the whole send path
//! (nonce, encrypt, MAC, write, nonce increment) atomic, so packets hit
//! the wire in lock-acquisition order. Inbound packets are routed by the
//! dispatcher: channel-addressed commands go to their channel queues,
//! everything else is fanned out to subscribers in subscription order.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::channel::{ChannelEvent, ChannelKind, ChannelRegistry};
use crate::command::Command;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::PacketBuilder;
use crate::handshake;
use crate::session::{Session, SessionConfig};
use crate::transport::{PacketReader, PacketWriter, Transport};
use crate::HMAC_SIZE;

/// Capacity of channel and subscriber queues.
const QUEUE_CAPACITY: usize = 32;

/// A non-channel command delivered to subscribers.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    /// Raw command byte; unknown values are passed through untouched.
    pub command: u8,
    pub payload: Bytes,
}

/// An authenticated connection. Owns the receive side; senders go
/// through [`Protocol::handle`].
#[derive(Debug)]
pub struct Protocol {
    handle: ProtocolHandle,
    reader: PacketReader,
    subscribers: Vec<mpsc::Sender<CommandEvent>>,
}

/// Cloneable send-side handle.
#[derive(Debug, Clone)]
pub struct ProtocolHandle {
    writer: Arc<Mutex<PacketWriter>>,
    channels: Arc<ChannelRegistry>,
    cache_hash: [u8; HMAC_SIZE],
}

impl Protocol {
    /// Connect to the first reachable server and authenticate.
    pub async fn connect(config: &SessionConfig, servers: &[SocketAddr]) -> ProtocolResult<Self> {
        let transport = Transport::connect(servers).await?;
        Self::from_transport(transport, config).await
    }

    /// Authenticate over an already-established stream.
    pub async fn from_stream(stream: TcpStream, config: &SessionConfig) -> ProtocolResult<Self> {
        Self::from_transport(Transport::new(stream)?, config).await
    }

    async fn from_transport(mut transport: Transport, config: &SessionConfig) -> ProtocolResult<Self> {
        let mut session = Session::new(config)?;
        let keys = handshake::authenticate(&mut transport, &mut session).await?;
        let (writer, reader) = transport.into_encrypted(&keys);
        debug!("session established");

        Ok(Self {
            handle: ProtocolHandle {
                writer: Arc::new(Mutex::new(writer)),
                channels: Arc::new(ChannelRegistry::new()),
                cache_hash: session.cache_hash,
            },
            reader,
            subscribers: Vec::new(),
        })
    }

    /// A send-side handle, cloneable across tasks.
    pub fn handle(&self) -> ProtocolHandle {
        self.handle.clone()
    }

    /// Subscribe to non-channel commands. Subscribers receive every
    /// event in subscription order; a full queue stalls the receive
    /// loop, so consumers define the back-pressure.
    pub fn subscribe(&mut self) -> mpsc::Receiver<CommandEvent> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    /// Packets received so far.
    pub fn packets_received(&self) -> u32 {
        self.reader.packets_received()
    }

    /// Receive and dispatch a single packet.
    pub async fn poll(&mut self) -> ProtocolResult<()> {
        let (command, payload) = self.reader.recv().await?;
        self.dispatch(command, payload).await
    }

    /// Drive the receive loop until the connection dies; returns the
    /// terminating error.
    pub async fn run(mut self) -> ProtocolError {
        loop {
            if let Err(e) = self.poll().await {
                return e;
            }
        }
    }

    async fn dispatch(&mut self, command: u8, payload: Bytes) -> ProtocolResult<()> {
        if let Ok(cmd) = Command::try_from(command) {
            if cmd.is_channel_bearing() {
                return self.dispatch_channel(cmd, payload).await;
            }
        }

        for tx in &self.subscribers {
            let event = CommandEvent {
                command,
                payload: payload.clone(),
            };
            // A dropped subscriber just stops receiving.
            let _ = tx.send(event).await;
        }
        Ok(())
    }

    async fn dispatch_channel(&self, cmd: Command, payload: Bytes) -> ProtocolResult<()> {
        if payload.len() < 2 {
            return Err(ProtocolError::Malformed(
                "channel packet shorter than its id".to_string(),
            ));
        }
        let id = u16::from_be_bytes([payload[0], payload[1]]);
        let data = payload.slice(2..);

        let Some((_kind, tx)) = self.handle.channels.sender_for(id) else {
            warn!(id, ?cmd, "fragment for unknown channel");
            return Ok(());
        };

        if cmd.is_channel_error() {
            self.handle.channels.retire(id);
            let _ = tx.send(ChannelEvent::Error).await;
        } else if data.is_empty() {
            self.handle.channels.retire(id);
            let _ = tx.send(ChannelEvent::End).await;
        } else {
            let _ = tx.send(ChannelEvent::Data(data)).await;
        }
        Ok(())
    }
}

impl ProtocolHandle {
    /// The channel registry shared with the receive loop.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Packets sent so far.
    pub async fn packets_sent(&self) -> u32 {
        self.writer.lock().await.packets_sent()
    }

    async fn send(&self, command: Command, payload: &[u8]) -> ProtocolResult<()> {
        self.writer.lock().await.send(command as u8, payload).await
    }

    fn open_channel(
        &self,
        kind: ChannelKind,
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        self.channels.register(kind, QUEUE_CAPACITY)
    }

    /// Announce the client cache digest.
    pub async fn send_cache_hash(&self) -> ProtocolResult<()> {
        let cache_hash = self.cache_hash;
        self.send(Command::CacheHash, &cache_hash).await
    }

    /// Reply to a server ping.
    pub async fn send_pong(&self) -> ProtocolResult<()> {
        let mut pkt = PacketBuilder::with_capacity(4);
        pkt.put_u32(0);
        self.send(Command::Pong, &pkt.freeze()).await
    }

    /// Notify the server that playback is about to start.
    pub async fn send_token_notify(&self) -> ProtocolResult<()> {
        self.send(Command::TokenNotify, &[]).await
    }

    /// Request an advertisement of the given type.
    pub async fn request_ad(
        &self,
        ad_type: u8,
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        let (id, rx) = self.open_channel(ChannelKind::Ad)?;
        let payload = ad_payload(id, ad_type);
        self.send_or_retire(Command::RequestAd, &payload, id).await?;
        Ok((id, rx))
    }

    /// Request cover art by its 20-byte image id.
    pub async fn request_image(
        &self,
        image_id: &[u8; 20],
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        let (id, rx) = self.open_channel(ChannelKind::Image)?;
        let payload = image_payload(id, image_id);
        self.send_or_retire(Command::Image, &payload, id).await?;
        Ok((id, rx))
    }

    /// Full-text search. `limit` is a result cap, or `-1` for unlimited.
    pub async fn search(
        &self,
        query: &str,
        offset: u32,
        limit: i32,
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        // Validate before allocating a channel; a bad argument must not
        // mutate the session.
        if limit == 0 || limit < -1 {
            return Err(ProtocolError::InvalidArgument(
                "limit must be positive or -1 for unlimited".to_string(),
            ));
        }
        if query.len() > u8::MAX as usize {
            return Err(ProtocolError::InvalidArgument(format!(
                "query of {} bytes exceeds the 8-bit length field",
                query.len()
            )));
        }

        let (id, rx) = self.open_channel(ChannelKind::Search)?;
        let payload = search_payload(id, offset, limit, query);
        self.send_or_retire(Command::Search, &payload, id).await?;
        Ok((id, rx))
    }

    /// Request the AES key for a media file.
    pub async fn request_key(
        &self,
        file_id: &[u8; 20],
        track_id: &[u8; 16],
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        let (id, rx) = self.open_channel(ChannelKind::AesKey)?;
        let payload = key_request_payload(file_id, track_id, id);
        self.send_or_retire(Command::RequestKey, &payload, id).await?;
        Ok((id, rx))
    }

    /// Announce playback intent, then request the file's AES key.
    pub async fn request_play(
        &self,
        file_id: &[u8; 20],
        track_id: &[u8; 16],
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        self.send(Command::RequestPlay, &[]).await?;
        self.request_key(file_id, track_id).await
    }

    /// Request a byte range of an encrypted media file. Offset and
    /// length must be multiples of 4096.
    pub async fn request_substream(
        &self,
        file_id: &[u8; 20],
        offset: u32,
        length: u32,
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        if offset % 4096 != 0 || length % 4096 != 0 {
            return Err(ProtocolError::InvalidArgument(
                "offset and length must be multiples of 4096".to_string(),
            ));
        }
        if offset.checked_add(length).is_none() {
            return Err(ProtocolError::InvalidArgument(
                "offset + length overflows the 32-bit range field".to_string(),
            ));
        }

        let (id, rx) = self.open_channel(ChannelKind::Substream)?;
        let payload = substream_payload(id, file_id, offset, length);
        self.send_or_retire(Command::GetSubStream, &payload, id).await?;
        Ok((id, rx))
    }

    /// Browse metadata: artist (type 1), album (type 2) or a list of
    /// tracks (type 3). Types 1 and 2 take exactly one id.
    pub async fn browse(
        &self,
        browse_type: u8,
        ids: &[[u8; 16]],
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        if !(1..=3).contains(&browse_type) {
            return Err(ProtocolError::InvalidArgument(
                "browse type must be 1, 2 or 3".to_string(),
            ));
        }
        if (browse_type == 1 || browse_type == 2) && ids.len() != 1 {
            return Err(ProtocolError::InvalidArgument(
                "browse types 1 and 2 take exactly one id".to_string(),
            ));
        }

        let (id, rx) = self.open_channel(ChannelKind::Browse)?;
        let payload = browse_payload(id, browse_type, ids);
        self.send_or_retire(Command::Browse, &payload, id).await?;
        Ok((id, rx))
    }

    /// Fetch the current revision of a playlist.
    pub async fn request_playlist(
        &self,
        playlist_id: &[u8; 17],
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        let (id, rx) = self.open_channel(ChannelKind::Playlist)?;
        let payload = playlist_payload(id, playlist_id);
        self.send_or_retire(Command::GetPlaylist, &payload, id).await?;
        Ok((id, rx))
    }

    /// Publish a playlist change as XML against a known revision.
    #[allow(clippy::too_many_arguments)]
    pub async fn change_playlist(
        &self,
        playlist_id: &[u8; 17],
        revision: u32,
        track_count: u32,
        checksum: u32,
        collaborative: bool,
        xml: &[u8],
    ) -> ProtocolResult<(u16, mpsc::Receiver<ChannelEvent>)> {
        let (id, rx) = self.open_channel(ChannelKind::Playlist)?;
        let payload = change_playlist_payload(
            id,
            playlist_id,
            revision,
            track_count,
            checksum,
            collaborative,
            xml,
        );
        self.send_or_retire(Command::ChangePlaylist, &payload, id).await?;
        Ok((id, rx))
    }

    /// Send a channel-creating request; a failed write retires the
    /// just-registered id so it does not leak.
    async fn send_or_retire(&self, command: Command, payload: &[u8], id: u16) -> ProtocolResult<()> {
        let result = self.send(command, payload).await;
        if result.is_err() {
            self.channels.retire(id);
        }
        result
    }
}

fn ad_payload(id: u16, ad_type: u8) -> Bytes {
    let mut pkt = PacketBuilder::with_capacity(3);
    pkt.put_u16(id).put_u8(ad_type);
    pkt.freeze()
}

fn image_payload(id: u16, image_id: &[u8; 20]) -> Bytes {
    let mut pkt = PacketBuilder::with_capacity(22);
    pkt.put_u16(id).put_slice(image_id);
    pkt.freeze()
}

fn search_payload(id: u16, offset: u32, limit: i32, query: &str) -> Bytes {
    let mut pkt = PacketBuilder::with_capacity(13 + query.len());
    pkt.put_u16(id)
        .put_u32(offset)
        .put_i32(limit)
        .put_u16(0)
        .put_u8(query.len() as u8)
        .put_slice(query.as_bytes());
    pkt.freeze()
}

fn key_request_payload(file_id: &[u8; 20], track_id: &[u8; 16], id: u16) -> Bytes {
    let mut pkt = PacketBuilder::with_capacity(40);
    pkt.put_slice(file_id)
        .put_slice(track_id)
        .put_u16(0)
        .put_u16(id);
    pkt.freeze()
}

fn substream_payload(id: u16, file_id: &[u8; 20], offset: u32, length: u32) -> Bytes {
    let mut pkt = PacketBuilder::with_capacity(44);
    pkt.put_u16(id)
        .put_u16(0x0800)
        .put_u16(0)
        .put_u16(0)
        .put_u16(0)
        .put_u16(0x4e20)
        .put_u32(200_000)
        .put_slice(file_id)
        .put_u32(offset / 4)
        .put_u32((offset + length) / 4);
    pkt.freeze()
}

fn browse_payload(id: u16, browse_type: u8, ids: &[[u8; 16]]) -> Bytes {
    let mut pkt = PacketBuilder::with_capacity(3 + ids.len() * 16 + 4);
    pkt.put_u16(id).put_u8(browse_type);
    for item in ids {
        pkt.put_slice(item);
    }
    if browse_type == 1 || browse_type == 2 {
        pkt.put_u32(0);
    }
    pkt.freeze()
}

fn playlist_payload(id: u16, playlist_id: &[u8; 17]) -> Bytes {
    let mut pkt = PacketBuilder::with_capacity(32);
    pkt.put_u16(id)
        .put_slice(playlist_id)
        .put_i32(-1) // current revision
        .put_u32(0)
        .put_i32(-1)
        .put_u8(0x01);
    pkt.freeze()
}

fn change_playlist_payload(
    id: u16,
    playlist_id: &[u8; 17],
    revision: u32,
    track_count: u32,
    checksum: u32,
    collaborative: bool,
    xml: &[u8],
) -> Bytes {
    let mut pkt = PacketBuilder::with_capacity(33 + xml.len());
    pkt.put_u16(id)
        .put_slice(playlist_id)
        .put_u32(revision)
        .put_u32(track_count)
        .put_u32(checksum)
        .put_u8(collaborative as u8)
        .put_u8(0x03)
        .put_slice(xml);
    pkt.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_payload_layout() {
        let payload = search_payload(5, 0, -1, "abba");
        assert_eq!(&payload[..2], &[0x00, 0x05]);
        assert_eq!(&payload[2..6], &0u32.to_be_bytes());
        assert_eq!(&payload[6..10], &(-1i32).to_be_bytes());
        assert_eq!(&payload[10..12], &[0x00, 0x00]);
        assert_eq!(payload[12], 4);
        assert_eq!(&payload[13..], b"abba");
    }

    #[test]
    fn test_substream_payload_scales_range_by_four() {
        let payload = substream_payload(7, &[0xfa; 20], 8192, 16384);
        assert_eq!(&payload[..2], &[0x00, 0x07]);
        assert_eq!(&payload[2..4], &[0x08, 0x00]);
        assert_eq!(&payload[10..12], &[0x4e, 0x20]);
        assert_eq!(&payload[12..16], &200_000u32.to_be_bytes());
        assert_eq!(&payload[16..36], &[0xfa; 20]);
        assert_eq!(&payload[36..40], &2048u32.to_be_bytes());
        assert_eq!(&payload[40..44], &6144u32.to_be_bytes());
    }

    #[test]
    fn test_substream_minimum_range() {
        let payload = substream_payload(0, &[0x00; 20], 4096, 4096);
        assert_eq!(&payload[36..40], &1024u32.to_be_bytes());
        assert_eq!(&payload[40..44], &2048u32.to_be_bytes());
    }

    #[test]
    fn test_browse_payload_trailing_zero_for_single_id_types() {
        let single = browse_payload(1, 2, &[[0xab; 16]]);
        assert_eq!(single.len(), 2 + 1 + 16 + 4);
        assert_eq!(&single[19..], &[0, 0, 0, 0]);

        let multi = browse_payload(1, 3, &[[0xab; 16], [0xcd; 16]]);
        assert_eq!(multi.len(), 2 + 1 + 32);
    }

    #[test]
    fn test_key_request_places_channel_id_last() {
        let payload = key_request_payload(&[0x01; 20], &[0x02; 16], 9);
        assert_eq!(payload.len(), 40);
        assert_eq!(&payload[..20], &[0x01; 20]);
        assert_eq!(&payload[20..36], &[0x02; 16]);
        assert_eq!(&payload[36..38], &[0x00, 0x00]);
        assert_eq!(&payload[38..], &[0x00, 0x09]);
    }

    #[test]
    fn test_playlist_payload_layout() {
        let payload = playlist_payload(3, &[0x10; 17]);
        assert_eq!(payload.len(), 32);
        assert_eq!(&payload[..2], &[0x00, 0x03]);
        assert_eq!(&payload[2..19], &[0x10; 17]);
        assert_eq!(&payload[19..23], &(-1i32).to_be_bytes());
        assert_eq!(&payload[23..27], &0u32.to_be_bytes());
        assert_eq!(&payload[27..31], &(-1i32).to_be_bytes());
        assert_eq!(payload[31], 0x01);
    }

    #[test]
    fn test_change_playlist_payload_layout() {
        let payload =
            change_playlist_payload(4, &[0x20; 17], 12, 7, 0xdead_beef, true, b"<xml/>");
        assert_eq!(&payload[..2], &[0x00, 0x04]);
        assert_eq!(&payload[19..23], &12u32.to_be_bytes());
        assert_eq!(&payload[23..27], &7u32.to_be_bytes());
        assert_eq!(&payload[27..31], &0xdead_beefu32.to_be_bytes());
        assert_eq!(payload[31], 0x01);
        assert_eq!(payload[32], 0x03);
        assert_eq!(&payload[33..], b"<xml/>");
    }

    #[test]
    fn test_channel_id_leads_channel_payloads() {
        for (payload, id) in [
            (ad_payload(0x0102, 1), 0x0102),
            (image_payload(0x0304, &[0u8; 20]), 0x0304),
            (search_payload(0x0506, 0, -1, "q"), 0x0506),
            (substream_payload(0x0708, &[0u8; 20], 0, 4096), 0x0708),
            (browse_payload(0x090a, 3, &[[0u8; 16]]), 0x090a),
            (playlist_payload(0x0b0c, &[0u8; 17]), 0x0b0c),
        ] {
            assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), id);
        }
    }
}
