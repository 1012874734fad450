mod common;

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use common::*;
use rstest::rstest;
use tcpeer::network::{PeerOptions, PeerState};
use tcpeer::protocol::WebSocketHandshake;
use tcpeer::AppError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const HANDSHAKE: &[u8] = b"GET /chat HTTP/1.1\r\n\
Host: server.example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

#[tokio::test]
async fn test_connect_then_ready() {
    let (_recorder, mut events, peer, _remote) = peer_on_duplex(PeerOptions::default());
    assert_eq!(next_event(&mut events).await, Event::Connect(peer.id()));
    assert_eq!(peer.state(), PeerState::Ready);
    assert!(peer.tcp_state().peer_live());
    peer.close();
}

#[tokio::test]
async fn test_frame_delivered_one_byte_at_a_time() {
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    let frame = length_frame(b"hello world");
    for byte in frame.iter() {
        remote.write_all(&[*byte]).await.unwrap();
        tokio::task::yield_now().await;
    }
    assert_eq!(next_event(&mut events).await, Event::Read(frame));
    assert!(peer.tcp_state().peer_active());
    assert_eq!(peer.stats().frames_read, 1);
    peer.close();
}

#[tokio::test]
async fn test_zero_length_body_is_a_frame() {
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    remote.write_all(&length_frame(b"")).await.unwrap();
    remote.write_all(&length_frame(b"next")).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Read(length_frame(b"")));
    assert_eq!(next_event(&mut events).await, Event::Read(length_frame(b"next")));
    assert_eq!(peer.stats().frames_read, 2);
    peer.close();
}

#[rstest]
#[case::too_large((MAX_FRAME as i32) + 1, CloseKind::TooLarge)]
#[case::negative(-1, CloseKind::Malformed)]
#[tokio::test]
async fn test_bad_length_closes_without_body_read(
    _logging: &Logging,
    #[case] length: i32,
    #[case] kind: CloseKind,
) {
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    let mut head = BytesMut::new();
    head.put_i32(length);
    remote.write_all(&head).await.unwrap();

    assert_eq!(next_event(&mut events).await, Event::Close(Some(kind)));
    assert_eq!(peer.state(), PeerState::Closed);
    // only the head read was ever issued
    assert_eq!(peer.stats().reads_issued, 1);
    assert_eq!(peer.stats().frames_read, 0);
}

#[tokio::test]
async fn test_partial_body_then_disconnect() {
    let (_recorder, mut events, _peer, mut remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    let mut partial = BytesMut::new();
    partial.put_i32(10);
    partial.put_slice(b"abc");
    remote.write_all(&partial).await.unwrap();
    drop(remote);

    assert_eq!(next_event(&mut events).await, Event::Close(Some(CloseKind::Io)));
}

#[tokio::test]
async fn test_remote_close_between_frames_is_orderly() {
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;
    remote.write_all(&length_frame(b"bye")).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Read(length_frame(b"bye")));
    drop(remote);
    assert_eq!(next_non_send(&mut events).await, Event::Close(None));
    assert_eq!(peer.state(), PeerState::Closed);
}

#[tokio::test]
async fn test_thousand_frames_in_order_one_read_in_flight() {
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    let writer = tokio::spawn(async move {
        for i in 0..1000u32 {
            remote
                .write_all(&length_frame(&i.to_be_bytes()))
                .await
                .unwrap();
        }
        remote
    });
    for i in 0..1000u32 {
        assert_eq!(
            next_event(&mut events).await,
            Event::Read(length_frame(&i.to_be_bytes()))
        );
    }
    let _remote = writer.await.unwrap();
    let stats = peer.stats();
    assert_eq!(stats.frames_read, 1000);
    assert_eq!(stats.max_reads_in_flight, 1);
    peer.close();
}

#[tokio::test]
async fn test_sends_arrive_in_order() {
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    let mut expected = Vec::new();
    for i in 0..100u32 {
        let frame = length_frame(format!("msg-{}", i).as_bytes());
        expected.extend_from_slice(&frame);
        peer.async_send(frame).unwrap();
    }
    let mut received = vec![0u8; expected.len()];
    remote.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);

    let mut written = 0;
    while written < expected.len() {
        match next_event(&mut events).await {
            Event::Send(n) => written += n,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(written, expected.len());
    assert_eq!(peer.stats().frames_written, 100);
    peer.close();
}

#[rstest]
#[tokio::test]
async fn test_handler_error_and_panic_keep_connection(_logging: &Logging) {
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    remote.write_all(&length_frame(b"fail")).await.unwrap();
    remote.write_all(&length_frame(b"panic")).await.unwrap();
    remote.write_all(&length_frame(b"ok")).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Read(length_frame(b"ok")));
    assert_eq!(peer.state(), PeerState::Ready);
    assert_eq!(peer.stats().frames_read, 3);
    peer.close();
}

#[tokio::test]
async fn test_graceful_close_flushes_queued_writes() {
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    let payload = Bytes::from(vec![7u8; 32 * 1024]);
    peer.async_send(payload.clone()).unwrap();
    peer.close();
    assert!(matches!(
        peer.async_send(Bytes::from_static(b"late")),
        Err(AppError::PeerClosed(_))
    ));

    let mut received = Vec::new();
    remote.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, payload);
    assert_eq!(next_non_send(&mut events).await, Event::Close(None));
}

#[tokio::test]
async fn test_on_close_fires_once() {
    let (_recorder, mut events, peer, _remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    peer.close();
    peer.close();
    peer.notify_close(AppError::HandlerError("late".to_string()));
    assert_eq!(next_non_send(&mut events).await, Event::Close(None));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(peer.state(), PeerState::Closed);
}

#[tokio::test]
async fn test_error_close_reports_reason() {
    let (_recorder, mut events, peer, _remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;
    peer.notify_close(AppError::HeartbeatTimeout(3));
    assert_eq!(
        next_event(&mut events).await,
        Event::Close(Some(CloseKind::Heartbeat))
    );
}

#[tokio::test]
async fn test_connection_data_lives_until_close() {
    let (_recorder, mut events, peer, _remote) = peer_on_duplex(PeerOptions::default());
    next_event(&mut events).await;

    peer.set_data(41u32);
    assert_eq!(
        peer.with_data(|count: &mut u32| {
            *count += 1;
            *count
        }),
        Some(42)
    );
    assert_eq!(peer.with_data(|_: &mut String| ()), None);

    peer.close();
    assert_eq!(next_non_send(&mut events).await, Event::Close(None));
    assert!(peer.take_data().is_none());
}

#[tokio::test]
async fn test_close_before_connect() {
    let (recorder, mut events) = Recorder::new();
    let peer = new_peer(&recorder, length_head(), PeerOptions::default());
    assert_eq!(peer.state(), PeerState::Connecting);
    peer.close();
    assert_eq!(next_event(&mut events).await, Event::Close(None));
    assert_eq!(peer.state(), PeerState::Closed);
}

#[tokio::test]
async fn test_websocket_handshake_then_frames() {
    let options = PeerOptions {
        websocket: true,
        ..PeerOptions::default()
    };
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(options);
    next_event(&mut events).await;
    assert_eq!(peer.state(), PeerState::WebSocketHandshake);

    remote.write_all(HANDSHAKE).await.unwrap();
    let expected = WebSocketHandshake::parse(HANDSHAKE).unwrap().response();
    let mut response = vec![0u8; expected.len()];
    remote.read_exact(&mut response).await.unwrap();
    assert_eq!(response, expected);
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 101"));
    assert!(text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    remote.write_all(&length_frame(b"after upgrade")).await.unwrap();
    assert_eq!(
        next_non_send(&mut events).await,
        Event::Read(length_frame(b"after upgrade"))
    );
    assert_eq!(peer.state(), PeerState::Ready);
    assert!(peer.tcp_state().websocket());
    peer.close();
}

#[tokio::test]
async fn test_handshake_and_first_frame_in_one_write() {
    let options = PeerOptions {
        websocket: true,
        ..PeerOptions::default()
    };
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(options);
    next_event(&mut events).await;

    let mut bytes = HANDSHAKE.to_vec();
    bytes.extend_from_slice(&length_frame(b"eager"));
    remote.write_all(&bytes).await.unwrap();
    assert_eq!(
        next_non_send(&mut events).await,
        Event::Read(length_frame(b"eager"))
    );
    peer.close();
}

#[tokio::test]
async fn test_writes_before_handshake_follow_the_upgrade_reply() {
    let options = PeerOptions {
        websocket: true,
        ..PeerOptions::default()
    };
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(options);
    assert!(matches!(next_event(&mut events).await, Event::Connect(_)));
    peer.async_send(length_frame(b"hello")).unwrap();

    // nothing is written while the upgrade request is outstanding
    let mut early = [0u8; 1];
    assert!(
        tokio::time::timeout(Duration::from_millis(100), remote.read(&mut early))
            .await
            .is_err()
    );

    remote.write_all(HANDSHAKE).await.unwrap();
    let expected = WebSocketHandshake::parse(HANDSHAKE).unwrap().response();
    let mut response = vec![0u8; expected.len()];
    remote.read_exact(&mut response).await.unwrap();
    assert_eq!(response, expected);

    let greeting = length_frame(b"hello");
    let mut frame = vec![0u8; greeting.len()];
    remote.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, greeting);
    peer.close();
}

#[rstest]
#[tokio::test]
async fn test_malformed_handshake_closes_without_response(_logging: &Logging) {
    let options = PeerOptions {
        websocket: true,
        ..PeerOptions::default()
    };
    let (_recorder, mut events, peer, mut remote) = peer_on_duplex(options);
    next_event(&mut events).await;
    // queued before the upgrade, never reaches a client that failed it
    peer.async_send(length_frame(b"early")).unwrap();

    remote
        .write_all(b"POST /chat HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::Close(Some(CloseKind::Malformed))
    );
    let mut received = Vec::new();
    remote.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_oversized_handshake_is_rejected() {
    let options = PeerOptions {
        websocket: true,
        max_handshake_size: 64,
        ..PeerOptions::default()
    };
    let (_recorder, mut events, _peer, mut remote) = peer_on_duplex(options);
    next_event(&mut events).await;

    remote.write_all(&[b'a'; 128]).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::Close(Some(CloseKind::TooLarge))
    );
}

#[tokio::test]
async fn test_async_connect_success() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (recorder, mut events) = Recorder::new();
    let peer = new_peer(&recorder, length_head(), PeerOptions::default());

    peer.async_connect(addr);
    let (mut server_side, _) = listener.accept().await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Connect(peer.id()));
    assert_eq!(peer.peer_addr(), Some(addr));

    server_side.write_all(&length_frame(b"tcp")).await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Read(length_frame(b"tcp")));
    peer.close();
    assert_eq!(next_non_send(&mut events).await, Event::Close(None));
}

#[tokio::test]
async fn test_async_connect_failure_reports_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (recorder, mut events) = Recorder::new();
    let options = PeerOptions {
        connect_timeout: Some(Duration::from_secs(2)),
        ..PeerOptions::default()
    };
    let peer = new_peer(&recorder, length_head(), options);
    peer.async_connect(addr);
    assert_eq!(
        next_event(&mut events).await,
        Event::Close(Some(CloseKind::Connect))
    );
    assert_eq!(peer.state(), PeerState::Closed);
}
