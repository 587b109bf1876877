//! Integration tests for wiremux.
//!
//! Two multiplexers are joined over an in-memory duplex pipe and exercised
//! through the public API only.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{timeout, Instant};
use wiremux::{Configuration, Error, Multiplexer, Stream, StreamIo};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn pair_with(config: Configuration) -> (Multiplexer, Multiplexer) {
    let (left, right) = tokio::io::duplex(256 * 1024);
    let odd = Multiplexer::new(left, false, Some(config.clone()));
    let even = Multiplexer::new(right, true, Some(config));
    (odd, even)
}

fn pair() -> (Multiplexer, Multiplexer) {
    pair_with(Configuration::default())
}

/// Open a stream on `opener` and accept it on `acceptor`.
async fn connect(opener: &Multiplexer, acceptor: &Multiplexer) -> (Stream, Stream) {
    let acceptor = acceptor.clone();
    let accepted = tokio::spawn(async move { acceptor.accept_stream().await });
    let opened = timeout(TEST_TIMEOUT, opener.open_stream())
        .await
        .expect("open timed out")
        .expect("open failed");
    let accepted = timeout(TEST_TIMEOUT, accepted)
        .await
        .expect("accept timed out")
        .unwrap()
        .expect("accept failed");
    (opened, accepted)
}

async fn read_to_end(stream: &Stream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = timeout(TEST_TIMEOUT, stream.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[tokio::test]
async fn test_hello_round_trip() {
    let (odd, even) = pair();
    let (client, server) = connect(&odd, &even).await;

    assert_eq!(client.id(), 1);
    assert_eq!(server.id(), 1);
    assert_eq!(client.local_addr().to_string(), "local:1");
    assert_eq!(server.remote_addr().to_string(), "remote:1");
    assert_eq!(odd.local_addr().to_string(), "odd");
    assert_eq!(even.local_addr().to_string(), "even");

    client.write_all(b"hello").await.unwrap();
    client.close_write().await.unwrap();
    assert_eq!(read_to_end(&server).await, b"hello");

    server.write_all(b"world").await.unwrap();
    server.close_write().await.unwrap();
    assert_eq!(read_to_end(&client).await, b"world");

    client.close().await.unwrap();
    server.close().await.unwrap();
    assert!(client.is_closed());
    assert!(odd.internal_error().is_none());
    assert!(even.internal_error().is_none());
}

#[tokio::test]
async fn test_both_sides_open_streams() {
    let (odd, even) = pair();

    let (a, b) = connect(&odd, &even).await;
    let (c, d) = connect(&even, &odd).await;
    let (e, _f) = connect(&odd, &even).await;

    assert_eq!(a.id(), 1);
    assert_eq!(b.id(), 1);
    assert_eq!(c.id(), 2);
    assert_eq!(d.id(), 2);
    assert_eq!(e.id(), 3);

    c.write_all(b"from even").await.unwrap();
    c.close_write().await.unwrap();
    assert_eq!(read_to_end(&d).await, b"from even");
}

#[tokio::test]
async fn test_many_concurrent_streams() {
    let (odd, even) = pair_with(Configuration::default().with_accept_backlog(32));

    let server = {
        let even = even.clone();
        tokio::spawn(async move {
            let mut echoes = Vec::new();
            for _ in 0..16 {
                let stream = even.accept_stream().await.unwrap();
                echoes.push(tokio::spawn(async move {
                    let data = read_to_end(&stream).await;
                    stream.write_all(&data).await.unwrap();
                    stream.close().await.unwrap();
                }));
            }
            for echo in echoes {
                echo.await.unwrap();
            }
        })
    };

    let mut clients = Vec::new();
    for i in 0..16u8 {
        let odd = odd.clone();
        clients.push(tokio::spawn(async move {
            let stream = odd.open_stream().await.unwrap();
            let message = vec![i; 1000 + usize::from(i)];
            stream.write_all(&message).await.unwrap();
            stream.close_write().await.unwrap();
            assert_eq!(read_to_end(&stream).await, message);
        }));
    }

    for client in clients {
        timeout(TEST_TIMEOUT, client).await.unwrap().unwrap();
    }
    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_flow_control_with_small_window() {
    let config = Configuration::default().with_stream_receive_window(64);
    let (odd, even) = pair_with(config);
    let (client, server) = connect(&odd, &even).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        client.write_all(&payload).await.unwrap();
        client.close_write().await.unwrap();
        client
    });

    assert_eq!(read_to_end(&server).await, expected);
    timeout(TEST_TIMEOUT, writer).await.unwrap().unwrap();
    assert!(odd.internal_error().is_none());
    assert!(even.internal_error().is_none());
}

#[tokio::test]
async fn test_large_writes_split_into_blocks() {
    let config = Configuration::default().with_stream_receive_window(1 << 20);
    let (odd, even) = pair_with(config);
    let (client, server) = connect(&odd, &even).await;

    let payload = vec![0x5Au8; 300_000];
    let written = {
        let payload = payload.clone();
        tokio::spawn(async move {
            let n = client.write(&payload).await.unwrap();
            client.close_write().await.unwrap();
            n
        })
    };

    assert_eq!(read_to_end(&server).await, payload);
    assert_eq!(written.await.unwrap(), 300_000);
}

#[tokio::test]
async fn test_accept_backlog_overflow_rejects() {
    let config = Configuration::default().with_accept_backlog(1);
    let (odd, even) = pair_with(config);

    // Fills the single backlog slot; nobody accepts yet.
    let first = {
        let odd = odd.clone();
        tokio::spawn(async move { odd.open_stream().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = timeout(TEST_TIMEOUT, odd.open_stream()).await.unwrap();
    assert!(matches!(second, Err(Error::Rejected)));

    let accepted = timeout(TEST_TIMEOUT, even.accept_stream())
        .await
        .unwrap()
        .unwrap();
    let first = timeout(TEST_TIMEOUT, first).await.unwrap().unwrap().unwrap();
    assert_eq!(accepted.id(), first.id());

    // Rejection is not fatal for either side.
    assert!(!odd.is_closed());
    assert!(!even.is_closed());
    let (_c, _d) = connect(&odd, &even).await;
}

#[tokio::test]
async fn test_stale_backlog_entry_is_skipped() {
    let (odd, even) = pair();

    let abandoned = {
        let odd = odd.clone();
        tokio::spawn(async move { odd.open_stream().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Cancelling the open after it was sent closes the stream remotely.
    abandoned.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (client, server) = connect(&odd, &even).await;
    assert_eq!(client.id(), 3);
    assert_eq!(server.id(), 3);
}

#[tokio::test]
async fn test_half_close() {
    let (odd, even) = pair();
    let (client, server) = connect(&odd, &even).await;

    client.close_write().await.unwrap();
    client.close_write().await.unwrap();
    assert!(matches!(client.write(b"late").await, Err(Error::WriteClosed)));
    assert!(matches!(
        client.set_write_deadline(None),
        Err(Error::WriteClosed)
    ));

    // The remote sees end of stream but can still write back.
    assert!(read_to_end(&server).await.is_empty());
    server.write_all(b"still open").await.unwrap();
    server.close_write().await.unwrap();
    assert_eq!(read_to_end(&client).await, b"still open");
}

#[tokio::test]
async fn test_remote_close() {
    let (odd, even) = pair();
    let (client, server) = connect(&odd, &even).await;

    server.write_all(b"bye").await.unwrap();
    server.close().await.unwrap();

    // Buffered data is still delivered before end of stream.
    assert_eq!(read_to_end(&client).await, b"bye");
    assert!(matches!(client.write(b"x").await, Err(Error::RemoteClosed)));

    client.close().await.unwrap();
    assert!(matches!(client.read(&mut [0u8; 4]).await, Err(Error::Closed)));
    assert!(matches!(client.write(b"x").await, Err(Error::Closed)));
    assert!(matches!(client.set_read_deadline(None), Err(Error::Closed)));
}

#[tokio::test]
async fn test_dropped_stream_closes_remotely() {
    let (odd, even) = pair();
    let (client, server) = connect(&odd, &even).await;

    drop(client);
    assert!(read_to_end(&server).await.is_empty());
    assert!(matches!(server.write(b"x").await, Err(Error::RemoteClosed)));
}

#[tokio::test]
async fn test_close_unblocks_pending_read() {
    let (odd, even) = pair();
    let (client, _server) = connect(&odd, &even).await;
    let client = Arc::new(client);

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(&mut [0u8; 16]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await.unwrap();
    let result = timeout(TEST_TIMEOUT, reader).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Closed)));
}

#[tokio::test]
async fn test_read_deadline() {
    let (odd, even) = pair();
    let (client, server) = connect(&odd, &even).await;
    let mut buf = [0u8; 16];

    client
        .set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
        .unwrap();
    let result = timeout(TEST_TIMEOUT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(result, Err(Error::Timeout)));

    // Expiry is sticky until the deadline changes.
    assert!(matches!(client.read(&mut buf).await, Err(Error::Timeout)));

    client.set_read_deadline(None).unwrap();
    server.write_all(b"late data").await.unwrap();
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"late data");
}

#[tokio::test]
async fn test_deadline_set_while_blocked() {
    let (odd, even) = pair();
    let (client, _server) = connect(&odd, &even).await;
    let client = Arc::new(client);

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(&mut [0u8; 16]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A past deadline wakes the blocked reader.
    client
        .set_deadline(Some(Instant::now() - Duration::from_secs(1)))
        .unwrap();
    let result = timeout(TEST_TIMEOUT, reader).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn test_write_deadline_with_exhausted_window() {
    let config = Configuration::default().with_stream_receive_window(16);
    let (odd, even) = pair_with(config);
    let (client, _server) = connect(&odd, &even).await;

    client
        .set_write_deadline(Some(Instant::now() + Duration::from_millis(100)))
        .unwrap();

    // The first 16 bytes fit the window; the rest cannot be sent in time.
    let written = timeout(TEST_TIMEOUT, client.write(&[1u8; 64]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(written, 16);

    let result = timeout(TEST_TIMEOUT, client.write(&[1u8; 64])).await.unwrap();
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn test_multiplexer_close_fails_streams() {
    let (odd, even) = pair();
    let (client, _server) = connect(&odd, &even).await;
    let client = Arc::new(client);

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read(&mut [0u8; 16]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    odd.close();
    let result = timeout(TEST_TIMEOUT, reader).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::MultiplexerClosed)));
    assert!(matches!(client.write(b"x").await, Err(Error::MultiplexerClosed)));
    assert!(odd.internal_error().is_none());

    // The remote loses its carrier and fails with a read error.
    timeout(TEST_TIMEOUT, even.closed()).await.unwrap();
    assert!(matches!(
        even.internal_error().as_deref(),
        Some(Error::Read(_)) | Some(Error::Write(_))
    ));
}

#[tokio::test]
async fn test_stream_io_adapter() {
    let (odd, even) = pair();
    let (client, server) = connect(&odd, &even).await;

    let mut client = StreamIo::new(client);
    let mut server = StreamIo::from(server);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i * 7) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();
        client
    });

    let mut received = Vec::new();
    timeout(TEST_TIMEOUT, server.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, expected);

    let mut client = writer.await.unwrap();
    server.write_all(b"ack").await.unwrap();
    server.shutdown().await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"ack");
}

#[tokio::test]
async fn test_stream_io_copy() {
    let (odd, even) = pair();
    let (client, server) = connect(&odd, &even).await;
    let mut client = StreamIo::new(client);
    let mut server = StreamIo::new(server);

    // Echo server built from tokio::io::copy on a split adapter.
    let echo = tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(&mut server);
        tokio::io::copy(&mut reader, &mut writer).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    client.write_all(b"echo me").await.unwrap();
    client.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"echo me");
    echo.await.unwrap();
}

// Raw peer: one multiplexer (odd side) driven by hand-written frames.

fn quiet() -> Configuration {
    Configuration::default()
        .with_heartbeat_transmit_interval(Duration::ZERO)
        .with_maximum_heartbeat_receive_interval(Duration::ZERO)
        .with_stream_receive_window(64)
}

fn raw_peer(config: Configuration) -> (Multiplexer, DuplexStream) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    (Multiplexer::new(local, false, Some(config)), remote)
}

async fn assert_violation(mux: &Multiplexer, expected: &str) {
    timeout(TEST_TIMEOUT, mux.closed())
        .await
        .expect("multiplexer stayed open");
    let error = mux.internal_error().expect("no internal error recorded");
    match &*error {
        Error::Read(inner) => match &**inner {
            Error::Protocol(message) => assert_eq!(message, expected),
            other => panic!("expected protocol error, got {other:?}"),
        },
        other => panic!("expected read error, got {other:?}"),
    }
}

/// Start an outbound open and consume its Open frame from the wire.
async fn pending_open(
    mux: &Multiplexer,
    remote: &mut DuplexStream,
) -> tokio::task::JoinHandle<wiremux::Result<Stream>> {
    let opener = tokio::spawn({
        let mux = mux.clone();
        async move { mux.open_stream().await }
    });
    let mut open = [0u8; 3];
    timeout(TEST_TIMEOUT, remote.read_exact(&mut open))
        .await
        .expect("open frame not sent")
        .unwrap();
    assert_eq!(open, [1, 1, 64]);
    opener
}

/// Have the remote open stream 2 and accept it locally.
async fn accepted_inbound(mux: &Multiplexer, remote: &mut DuplexStream, window: u8) -> Stream {
    remote.write_all(&[1, 2, window]).await.unwrap();
    timeout(TEST_TIMEOUT, mux.accept_stream())
        .await
        .expect("accept timed out")
        .expect("accept failed")
}

#[tokio::test]
async fn test_violations_without_open_streams() {
    let cases: [(&[u8], &str); 6] = [
        (
            &[1, 4, 10, 1, 2, 10],
            "remote stream identifiers not monotonically increasing",
        ),
        (
            &[2, 2, 10],
            "inbound stream identifier used by remote to accept stream",
        ),
        (
            &[3, 2, 0, 1, b'x'],
            "message (0x03) received for unopened inbound stream identifier",
        ),
        (
            &[5, 2],
            "message (0x05) received for unopened inbound stream identifier",
        ),
        (
            &[6, 2],
            "message (0x06) received for unopened inbound stream identifier",
        ),
        (
            &[4, 1, 5],
            "message (0x04) received for unused outbound stream identifier",
        ),
    ];

    for (frames, expected) in cases {
        let (mux, mut remote) = raw_peer(quiet());
        remote.write_all(frames).await.unwrap();
        assert_violation(&mux, expected).await;
    }
}

#[tokio::test]
async fn test_second_accept_is_violation() {
    let (mux, mut remote) = raw_peer(quiet());
    let opener = pending_open(&mux, &mut remote).await;

    remote.write_all(&[2, 1, 64]).await.unwrap();
    let stream = timeout(TEST_TIMEOUT, opener).await.unwrap().unwrap().unwrap();

    remote.write_all(&[2, 1, 64]).await.unwrap();
    assert_violation(&mux, "remote accepted the same stream twice").await;
    drop(stream);
}

#[tokio::test]
async fn test_accept_after_close_is_violation() {
    let (mux, mut remote) = raw_peer(quiet());
    let opener = pending_open(&mux, &mut remote).await;

    // Both frames are routed before the opener observes the rejection.
    remote.write_all(&[6, 1, 2, 1, 64]).await.unwrap();
    assert_violation(&mux, "remote accepted stream after closing it").await;
    assert!(opener.await.unwrap().is_err());
}

#[tokio::test]
async fn test_window_increment_before_accept_is_violation() {
    let (mux, mut remote) = raw_peer(quiet());
    let _opener = pending_open(&mux, &mut remote).await;

    remote.write_all(&[4, 1, 5]).await.unwrap();
    assert_violation(
        &mux,
        "window increment received for partially established outbound stream",
    )
    .await;
}

#[tokio::test]
async fn test_data_after_remote_close_write_is_violation() {
    let (mux, mut remote) = raw_peer(quiet());
    let _stream = accepted_inbound(&mux, &mut remote, 64).await;

    remote.write_all(&[5, 2, 3, 2, 0, 1, b'x']).await.unwrap();
    assert_violation(&mux, "data received for write-closed stream").await;
}

#[tokio::test]
async fn test_duplicate_close_write_is_violation() {
    let (mux, mut remote) = raw_peer(quiet());
    let _stream = accepted_inbound(&mux, &mut remote, 64).await;

    remote.write_all(&[5, 2, 5, 2]).await.unwrap();
    assert_violation(&mux, "close write received for the same stream twice").await;
}

#[tokio::test]
async fn test_duplicate_close_is_violation() {
    let (mux, mut remote) = raw_peer(quiet());
    let _stream = accepted_inbound(&mux, &mut remote, 64).await;

    remote.write_all(&[6, 2, 6, 2]).await.unwrap();
    assert_violation(&mux, "close received the same stream twice").await;
}

#[tokio::test]
async fn test_data_beyond_receive_window_is_violation() {
    let (mux, mut remote) = raw_peer(quiet().with_stream_receive_window(8));
    let _stream = accepted_inbound(&mux, &mut remote, 64).await;

    let mut frame = vec![3, 2, 0, 9];
    frame.extend_from_slice(&[0xAA; 9]);
    remote.write_all(&frame).await.unwrap();
    assert_violation(&mux, "remote violated stream receive window").await;
}

#[tokio::test]
async fn test_close_write_fails_blocked_write() {
    let (mux, mut remote) = raw_peer(quiet());
    // The remote grants no send window, so any write blocks.
    let stream = Arc::new(accepted_inbound(&mux, &mut remote, 0).await);

    let writer = tokio::spawn({
        let stream = stream.clone();
        async move { stream.write(b"blocked").await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!writer.is_finished());

    timeout(TEST_TIMEOUT, stream.close_write())
        .await
        .expect("close write timed out")
        .unwrap();
    let result = timeout(TEST_TIMEOUT, writer).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::WriteClosed)));

    // Accept for stream 2 with our window, then the close write.
    let mut wire = [0u8; 5];
    timeout(TEST_TIMEOUT, remote.read_exact(&mut wire))
        .await
        .expect("close write not sent")
        .unwrap();
    assert_eq!(wire, [2, 2, 64, 5, 2]);
    assert!(mux.internal_error().is_none());
}

#[tokio::test]
async fn test_buffered_data_readable_after_local_close_write() {
    let (odd, even) = pair();
    let (client, server) = connect(&odd, &even).await;

    client.write_all(b"buffered").await.unwrap();
    client.close_write().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.close_write().await.unwrap();
    assert!(matches!(server.write(b"x").await, Err(Error::WriteClosed)));

    assert_eq!(read_to_end(&server).await, b"buffered");
    let mut buf = [0u8; 8];
    assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    assert!(read_to_end(&client).await.is_empty());
}
