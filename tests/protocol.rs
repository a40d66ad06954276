//! End-to-end tests against an in-process server that speaks the other
//! side of the protocol: it verifies the client's key-confirmation HMAC
//! and puzzle solution with its own key derivation, then talks through
//! the cipher layer like the real peer would.

use notewire::crypto::DhKeypair;
use notewire::handshake::verify_puzzle;
use notewire::transport::{PacketReader, PacketWriter, Transport};
use notewire::{ChannelEvent, Command, Protocol, ProtocolError, RejectionCause, SessionConfig, SessionKeys};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SERVER_RANDOM: [u8; 16] = [
    0x00, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2a, 0x2b, 0x2c, 0x2d, 0x2e,
    0x2f,
];
const SALT: [u8; 10] = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39];
const PUZZLE_DENOMINATOR: u8 = 8;
const PUZZLE_MAGIC: u32 = 0x0102_0304;

/// Read the client hello off the raw stream; returns the verbatim packet.
async fn read_client_hello(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(u16::from_be_bytes([head[0], head[1]]), 3);

    let total = u16::from_be_bytes([head[2], head[3]]) as usize;
    let mut rest = vec![0u8; total - 4];
    stream.read_exact(&mut rest).await.unwrap();

    let mut packet = head.to_vec();
    packet.extend_from_slice(&rest);
    packet
}

/// Build the server hello for a fixed set of parameters.
fn server_hello_bytes(dh_public: &[u8; 96], username: &[u8]) -> Vec<u8> {
    let padding = [0x5a; 4];
    let mut hello = Vec::new();
    hello.extend_from_slice(&SERVER_RANDOM);
    hello.extend_from_slice(dh_public);
    hello.extend_from_slice(&[0xbb; 256]); // server blob
    hello.extend_from_slice(&SALT);
    hello.push(padding.len() as u8);
    hello.push(username.len() as u8);
    hello.extend_from_slice(&6u16.to_be_bytes()); // puzzle challenge length
    hello.extend_from_slice(&0u16.to_be_bytes());
    hello.extend_from_slice(&0u16.to_be_bytes());
    hello.extend_from_slice(&0u16.to_be_bytes());
    hello.extend_from_slice(&padding);
    hello.extend_from_slice(username);
    hello.push(0x01); // puzzle marker
    hello.push(PUZZLE_DENOMINATOR);
    hello.extend_from_slice(&PUZZLE_MAGIC.to_be_bytes());
    hello
}

/// Serve the whole handshake, verifying the client's auth packet, and
/// hand back the server's cipher-layer halves.
async fn serve_handshake(mut stream: TcpStream) -> (PacketWriter, PacketReader) {
    let client_packet = read_client_hello(&mut stream).await;

    // The client's DH public value sits at a fixed offset.
    let mut client_dh = [0u8; 96];
    client_dh.copy_from_slice(&client_packet[48..144]);
    let username_len = client_packet[273] as usize;
    let username = client_packet[276..276 + username_len].to_vec();

    let server_dh = DhKeypair::from_private_bytes(&[0x24; 95]);
    let server_packet = server_hello_bytes(server_dh.public_bytes(), &username);
    stream.write_all(&server_packet).await.unwrap();

    let shared = server_dh.shared_secret(&client_dh);
    let (keys, expected_hmac) =
        SessionKeys::derive(&shared, &client_packet, &server_packet, &SALT, &username);

    // Auth packet: HMAC, two reserved bytes, solution length, reserved
    // word, then the 8-byte solution.
    let mut auth = [0u8; 36];
    stream.read_exact(&mut auth).await.unwrap();
    assert_eq!(&auth[..20], &expected_hmac, "key confirmation HMAC");
    assert_eq!(u16::from_be_bytes([auth[22], auth[23]]), 8);
    let mut solution = [0u8; 8];
    solution.copy_from_slice(&auth[28..36]);
    assert!(
        verify_puzzle(&SERVER_RANDOM, &solution, PUZZLE_DENOMINATOR, PUZZLE_MAGIC),
        "puzzle solution must satisfy the difficulty predicate"
    );

    stream.write_all(&[0x00, 0x01, 0x42]).await.unwrap();

    // The server encrypts with the client's receive key and vice versa.
    let server_keys = SessionKeys {
        send: keys.recv,
        recv: keys.send,
    };
    Transport::new(stream).unwrap().into_encrypted(&server_keys)
}

async fn connected_pair() -> (Protocol, (PacketWriter, PacketReader)) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve_handshake(stream).await
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut config = SessionConfig::new("alice");
    config.cache_hash = [0xff; 20];
    let protocol = Protocol::from_stream(stream, &config).await.unwrap();

    (protocol, server.await.unwrap())
}

#[tokio::test]
async fn handshake_establishes_fresh_session() {
    let (protocol, _server) = connected_pair().await;

    // No encrypted traffic yet: both nonces still at their initial value.
    assert_eq!(protocol.handle().packets_sent().await, 0);
    assert_eq!(protocol.packets_received(), 0);
}

#[tokio::test]
async fn first_encrypted_packet_is_cache_hash() {
    let (protocol, (_server_tx, mut server_rx)) = connected_pair().await;
    let handle = protocol.handle();

    handle.send_cache_hash().await.unwrap();

    let (command, payload) = server_rx.recv().await.unwrap();
    assert_eq!(command, Command::CacheHash as u8);
    assert_eq!(&payload[..], &[0xff; 20]);
    assert_eq!(handle.packets_sent().await, 1);
    assert_eq!(server_rx.packets_received(), 1);
}

#[tokio::test]
async fn rejected_handshake_surfaces_cause() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _hello = read_client_hello(&mut stream).await;
        // Status packet: nonzero status, sub-code 0x04.
        stream.write_all(&[0x02, 0x04]).await.unwrap();
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let err = Protocol::from_stream(stream, &SessionConfig::new("alice"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::HandshakeRejected {
            cause: RejectionCause::AccountDisabled
        }
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn substream_request_encodes_scaled_range() {
    let (protocol, (_server_tx, mut server_rx)) = connected_pair().await;
    let handle = protocol.handle();

    let (id, _rx) = handle
        .request_substream(&[0xfa; 20], 8192, 16384)
        .await
        .unwrap();

    let (command, payload) = server_rx.recv().await.unwrap();
    assert_eq!(command, Command::GetSubStream as u8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), id);
    assert_eq!(
        u32::from_be_bytes([payload[36], payload[37], payload[38], payload[39]]),
        2048
    );
    assert_eq!(
        u32::from_be_bytes([payload[40], payload[41], payload[42], payload[43]]),
        6144
    );
}

#[tokio::test]
async fn unaligned_substream_is_rejected_without_session_mutation() {
    let (protocol, _server) = connected_pair().await;
    let handle = protocol.handle();

    let err = handle
        .request_substream(&[0xfa; 20], 4095, 4096)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidArgument(_)));
    // Nothing was sent, no channel was registered.
    assert_eq!(handle.packets_sent().await, 0);
    assert!(handle.channels().is_empty());
}

#[tokio::test]
async fn search_dispatches_fragments_to_its_channel() {
    let (mut protocol, (mut server_tx, mut server_rx)) = connected_pair().await;
    let handle = protocol.handle();

    let (id, mut rx) = handle.search("abba", 0, -1).await.unwrap();

    // Server sees the query…
    let (command, payload) = server_rx.recv().await.unwrap();
    assert_eq!(command, Command::Search as u8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), id);
    assert_eq!(&payload[13..], b"abba");

    // …and streams a fragment back on the same channel.
    let mut fragment = id.to_be_bytes().to_vec();
    fragment.extend_from_slice(b"result");
    server_tx.send(Command::Search as u8, &fragment).await.unwrap();

    protocol.poll().await.unwrap();
    assert_eq!(
        rx.recv().await,
        Some(ChannelEvent::Data(bytes::Bytes::from_static(b"result")))
    );
    // The channel stays open until the empty end-of-channel marker.
    assert!(handle.channels().is_live(id));

    server_tx
        .send(Command::Search as u8, &id.to_be_bytes())
        .await
        .unwrap();
    protocol.poll().await.unwrap();
    assert_eq!(rx.recv().await, Some(ChannelEvent::End));
    assert!(!handle.channels().is_live(id));
}

#[tokio::test]
async fn channel_error_retires_the_channel() {
    let (mut protocol, (mut server_tx, mut server_rx)) = connected_pair().await;
    let handle = protocol.handle();

    let (id, mut rx) = handle.request_key(&[0x01; 20], &[0x02; 16]).await.unwrap();
    let (command, payload) = server_rx.recv().await.unwrap();
    assert_eq!(command, Command::RequestKey as u8);
    // The key request addresses its channel in the trailing word.
    assert_eq!(
        u16::from_be_bytes([payload[38], payload[39]]),
        id
    );

    server_tx
        .send(Command::AesKeyError as u8, &id.to_be_bytes())
        .await
        .unwrap();
    protocol.poll().await.unwrap();

    assert_eq!(rx.recv().await, Some(ChannelEvent::Error));
    assert!(!handle.channels().is_live(id));
}

#[tokio::test]
async fn ping_reaches_subscribers_and_pong_flows_back() {
    let (mut protocol, (mut server_tx, mut server_rx)) = connected_pair().await;
    let handle = protocol.handle();
    let mut events = protocol.subscribe();

    server_tx
        .send(Command::Ping as u8, &0u32.to_be_bytes())
        .await
        .unwrap();
    protocol.poll().await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.command, Command::Ping as u8);

    handle.send_pong().await.unwrap();
    let (command, payload) = server_rx.recv().await.unwrap();
    assert_eq!(command, Command::Pong as u8);
    assert_eq!(&payload[..], &[0, 0, 0, 0]);
}

#[tokio::test]
async fn concurrent_senders_never_reuse_a_nonce() {
    let (protocol, (_server_tx, mut server_rx)) = connected_pair().await;
    let handle = protocol.handle();

    let mut tasks = Vec::new();
    for i in 0..10u8 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            let (_id, _rx) = handle.request_ad(i).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Ten packets decrypt cleanly in wire order, which is only possible
    // if the nonce sequence advanced 0..10 without reuse or gaps.
    for _ in 0..10 {
        let (command, _payload) = server_rx.recv().await.unwrap();
        assert_eq!(command, Command::RequestAd as u8);
    }
    assert_eq!(handle.packets_sent().await, 10);
    assert_eq!(server_rx.packets_received(), 10);
}

#[tokio::test]
async fn browse_and_playlist_requests_reach_the_server() {
    let (protocol, (_server_tx, mut server_rx)) = connected_pair().await;
    let handle = protocol.handle();

    let (browse_id, _rx) = handle.browse(2, &[[0xab; 16]]).await.unwrap();
    let (command, payload) = server_rx.recv().await.unwrap();
    assert_eq!(command, Command::Browse as u8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), browse_id);
    assert_eq!(payload[2], 2);

    let err = handle.browse(1, &[[0xab; 16], [0xcd; 16]]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidArgument(_)));

    let (playlist_id, _rx) = handle.request_playlist(&[0x11; 17]).await.unwrap();
    let (command, payload) = server_rx.recv().await.unwrap();
    assert_eq!(command, Command::GetPlaylist as u8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), playlist_id);
    assert_eq!(payload[31], 0x01);
}
