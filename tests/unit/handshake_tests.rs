use std::time::Duration;

use tokio::io::AsyncWriteExt;

use agent_tether::launch::handshake::{
    encode_handshake, read_handshake, read_handshake_within, MAX_KEY_BYTES,
};
use agent_tether::AppError;

#[tokio::test]
async fn decodes_encoded_frame() {
    let frame = encode_handshake("0123abcd", 40_123).expect("frame");
    let mut reader = frame.as_slice();

    let handshake = read_handshake(&mut reader).await.expect("decodes");

    assert_eq!(handshake.key.as_str(), "0123abcd");
    assert_eq!(handshake.port, 40_123);
    assert!(reader.is_empty(), "nothing past the frame is consumed");
}

#[tokio::test]
async fn trailing_bytes_are_left_unread() {
    let mut frame = encode_handshake("k", 7).expect("frame");
    frame.extend_from_slice(b"payload");
    let mut reader = frame.as_slice();

    read_handshake(&mut reader).await.expect("decodes");

    assert_eq!(reader, b"payload");
}

#[tokio::test]
async fn zero_length_key_is_protocol_error() {
    let frame = [0u8, 0, 0, 0, 0, 1];
    let result = read_handshake(&mut frame.as_slice()).await;
    assert!(matches!(result, Err(AppError::ProtocolAuth(_))));
}

#[tokio::test]
async fn oversized_key_length_is_protocol_error() {
    let len = u16::try_from(MAX_KEY_BYTES + 1).expect("fits");
    let frame = len.to_be_bytes();
    let result = read_handshake(&mut frame.as_slice()).await;
    assert!(matches!(result, Err(AppError::ProtocolAuth(_))));
}

#[tokio::test]
async fn non_utf8_key_is_protocol_error() {
    let frame = [0u8, 2, 0xff, 0xfe, 0, 0, 0, 1];
    let result = read_handshake(&mut frame.as_slice()).await;
    assert!(matches!(result, Err(AppError::ProtocolAuth(msg)) if msg.contains("utf-8")));
}

#[tokio::test]
async fn negative_port_is_protocol_error() {
    let mut frame = vec![0u8, 1, b'k'];
    frame.extend_from_slice(&(-1i32).to_be_bytes());
    let result = read_handshake(&mut frame.as_slice()).await;
    assert!(matches!(result, Err(AppError::ProtocolAuth(msg)) if msg.contains("-1")));
}

#[tokio::test]
async fn port_above_u16_is_protocol_error() {
    let mut frame = vec![0u8, 1, b'k'];
    frame.extend_from_slice(&70_000i32.to_be_bytes());
    let result = read_handshake(&mut frame.as_slice()).await;
    assert!(matches!(result, Err(AppError::ProtocolAuth(_))));
}

#[tokio::test]
async fn truncated_frame_is_stream_closed() {
    let frame = [0u8, 4, b'a', b'b'];
    let result = read_handshake(&mut frame.as_slice()).await;
    assert!(matches!(result, Err(AppError::StreamClosed(_))));
}

#[tokio::test]
async fn silent_peer_times_out() {
    let (mut host, mut worker) = tokio::io::duplex(64);
    worker.write_all(&[0, 3, b'a']).await.expect("partial write");

    let result = read_handshake_within(&mut host, Duration::from_millis(50)).await;

    assert!(matches!(result, Err(AppError::HandshakeTimeout(_))));
}

#[tokio::test]
async fn frame_over_duplex_arrives_within_deadline() {
    let (mut host, mut worker) = tokio::io::duplex(64);
    let frame = encode_handshake("abc", 5000).expect("frame");
    tokio::spawn(async move {
        worker.write_all(&frame).await.expect("write frame");
        worker
    });

    let handshake = read_handshake_within(&mut host, Duration::from_secs(2))
        .await
        .expect("frame arrives");
    assert_eq!(handshake.port, 5000);
}

#[test]
fn encode_rejects_oversized_key() {
    let key = "k".repeat(MAX_KEY_BYTES + 1);
    assert!(matches!(
        encode_handshake(&key, 1),
        Err(AppError::ProtocolAuth(_))
    ));
}

#[test]
fn encode_accepts_maximum_key() {
    let key = "k".repeat(MAX_KEY_BYTES);
    let frame = encode_handshake(&key, 65_535).expect("max frame");
    assert_eq!(frame.len(), 2 + MAX_KEY_BYTES + 4);
}
