use std::time::{Duration, Instant};

use h3_duplex::{
    quiche, CloseMode, Client, ClientConfig, Connection, Error, Header, Listener, ServerConfig,
    Strategy, Upgrader,
};
use tempfile::TempDir;

const LOCATOR: &str = "https://example.test:4433/tunnel";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Listener on loopback with a fresh self-signed certificate. The directory
/// holding the PEM files has to live as long as the listener is bound.
fn listener() -> (TempDir, Listener) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["example.test".to_string()]).unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    std::fs::write(&cert, certified.cert.pem()).unwrap();
    std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
    let listener = Listener::bind("127.0.0.1:0", &ServerConfig::new(cert, key)).unwrap();
    (dir, listener)
}

fn client(listener: &Listener, strategy: Strategy) -> Client {
    Client::new(
        ClientConfig::default()
            .with_strategy(strategy)
            .resolve("example.test", listener.local_addr()),
    )
}

async fn echo_round_trip(strategy: Strategy) {
    let (_dir, mut listener) = listener();
    let client = client(&listener, strategy);

    let server = monoio::spawn(async move {
        let exchange = listener.next().await.unwrap();
        assert_eq!(exchange.method(), Some(&b"POST"[..]));
        assert_eq!(exchange.path(), Some(&b"/tunnel"[..]));
        assert_eq!(exchange.header(b"X-Id"), Some(&b"1"[..]));
        let stream = h3_duplex::accept(&exchange).await.unwrap();
        assert_eq!(stream.strategy(), strategy);
        assert_eq!(stream.local_addr(), listener.local_addr());

        let mut buf = [0; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"world").await.unwrap();
        // keep the endpoint and the stream alive until the client is done
        (buf, listener, stream)
    });

    let headers = [Header::new(b"X-Id", b"1")];
    let (stream, response) = client
        .connect(LOCATOR, &headers, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(stream.strategy(), strategy);
    assert_ne!(stream.peer_addr(), h3_duplex::UNKNOWN_ADDR);

    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    let (received, _listener, _server_stream) = server.await;
    assert_eq!(&received, b"hello");
}

#[monoio::test(timer_enabled = true)]
async fn split_stream_echo() {
    echo_round_trip(Strategy::Split).await;
}

#[monoio::test(timer_enabled = true)]
async fn native_stream_echo() {
    echo_round_trip(Strategy::Native).await;
}

#[monoio::test(timer_enabled = true)]
async fn rejected_handshake_returns_response() {
    let (_dir, mut listener) = listener();
    let client = client(&listener, Strategy::Split);

    let server = monoio::spawn(async move {
        let exchange = listener.next().await.unwrap();
        exchange.respond(403).await.unwrap();
        assert!(exchange.responded());
        // answered exchanges cannot be upgraded anymore
        let err = h3_duplex::accept(&exchange).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        listener
    });

    let err = client
        .connect::<Header>(LOCATOR, &[], Duration::from_secs(2))
        .await
        .unwrap_err();
    match err {
        Error::HandshakeRejected { status, response } => {
            assert_eq!(status, 403);
            assert_eq!(response.status(), 403);
            assert!(!response.is_success());
        }
        other => panic!("unexpected error {other:?}"),
    }
    let _listener = server.await;
}

#[monoio::test(timer_enabled = true)]
async fn silent_server_times_out() {
    for strategy in [Strategy::Split, Strategy::Native] {
        let (_dir, mut listener) = listener();
        let client = client(&listener, strategy);

        let server = monoio::spawn(async move {
            // take the exchange and never answer it
            let exchange = listener.next().await.unwrap();
            monoio::time::sleep(Duration::from_millis(500)).await;
            (exchange, listener)
        });

        let err = client
            .connect::<Header>(LOCATOR, &[], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StreamAcquisitionTimeout));
        let _ = server.await;
    }
}

#[monoio::test(timer_enabled = true)]
async fn accepted_without_native_stream_times_out() {
    let (_dir, mut listener) = listener();
    let client = client(&listener, Strategy::Native);

    let server = monoio::spawn(async move {
        // a success status, but the native stream never comes
        let exchange = listener.next().await.unwrap();
        exchange.respond(200).await.unwrap();
        monoio::time::sleep(Duration::from_millis(500)).await;
        (exchange, listener)
    });

    let started = Instant::now();
    let err = client
        .connect::<Header>(LOCATOR, &[], Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StreamAcquisitionTimeout));
    assert!(started.elapsed() < Duration::from_secs(2));
    let _ = server.await;
}

#[monoio::test(timer_enabled = true)]
async fn zero_timeout_never_hangs() {
    let (_dir, listener) = listener();
    for strategy in [Strategy::Split, Strategy::Native] {
        let client = client(&listener, strategy);
        for _ in 0..5 {
            let err = client
                .connect::<Header>(LOCATOR, &[], Duration::ZERO)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::StreamAcquisitionTimeout));
        }
    }
}

#[monoio::test(timer_enabled = true)]
async fn close_is_idempotent_and_final() {
    let (_dir, mut listener) = listener();
    let client = client(&listener, Strategy::Split);

    let server = monoio::spawn(async move {
        let exchange = listener.next().await.unwrap();
        let stream = Upgrader::new().accept(&exchange).await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0; 16];
        loop {
            match stream.read(&mut buf).await.unwrap() {
                0 => break,
                n => received.extend_from_slice(&buf[..n]),
            }
        }
        (received, listener)
    });

    let (stream, _) = client
        .connect::<Header>(LOCATOR, &[], Duration::from_secs(2))
        .await
        .unwrap();
    stream.write_all(b"bye").await.unwrap();
    stream.close().await.unwrap();
    stream.close().await.unwrap();
    assert!(stream.is_closed());
    assert!(stream.write(b"more").await.is_err());
    assert!(stream.read(&mut [0; 4]).await.is_err());

    // the server sees the bytes followed by a clean end of stream
    let (received, _listener) = server.await;
    assert_eq!(received, b"bye");
}

#[monoio::test(timer_enabled = true)]
async fn unresolvable_host_fails_to_dial() {
    init_tracing();
    let err = Client::default()
        .connect::<Header>("https://nowhere.invalid/", &[], Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DialFailed(_)));
}

#[monoio::test(timer_enabled = true)]
async fn native_close_is_idempotent_and_final() {
    let (_dir, mut listener) = listener();
    let client = client(&listener, Strategy::Native);

    let server = monoio::spawn(async move {
        let exchange = listener.next().await.unwrap();
        let stream = h3_duplex::accept(&exchange).await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0; 16];
        loop {
            match stream.read(&mut buf).await.unwrap() {
                0 => break,
                n => received.extend_from_slice(&buf[..n]),
            }
        }
        (received, listener)
    });

    let (stream, _) = client
        .connect::<Header>(LOCATOR, &[], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(stream.strategy(), Strategy::Native);
    stream.write_all(b"bye").await.unwrap();
    stream.close().await.unwrap();
    stream.close().await.unwrap();
    assert!(stream.is_closed());
    assert!(stream.write(b"more").await.is_err());
    assert!(stream.read(&mut [0; 4]).await.is_err());

    let (received, _listener) = server.await;
    assert_eq!(received, b"bye");
}

#[monoio::test(timer_enabled = true)]
async fn connection_close_mode_tears_down_the_peer() {
    let (_dir, mut listener) = listener();
    let client = client(&listener, Strategy::Split);

    let server = monoio::spawn(async move {
        let exchange = listener.next().await.unwrap();
        let stream = Upgrader::new()
            .with_close_mode(CloseMode::Connection)
            .accept(&exchange)
            .await
            .unwrap();
        stream.write_all(b"x").await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.is_closed());
        listener
    });

    let (stream, _) = client
        .connect::<Header>(LOCATOR, &[], Duration::from_secs(2))
        .await
        .unwrap();
    let mut buf = [0; 1];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"x");

    // no FIN was sent, only CONNECTION_CLOSE: the read fails and takes the
    // whole stream down with it
    assert!(stream.read(&mut buf).await.is_err());
    assert!(stream.is_closed());
    assert!(stream.write(b"y").await.is_err());
    assert!(stream.close().await.is_ok());

    let _listener = server.await;
}

#[monoio::test(timer_enabled = true)]
async fn dialed_connection_closes_locally() {
    let (_dir, listener) = listener();

    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION).unwrap();
    config.verify_peer(false);
    config
        .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
        .unwrap();
    config.set_max_idle_timeout(5000);
    config.set_initial_max_data(1_000_000);
    config.set_initial_max_stream_data_bidi_local(100_000);
    config.set_initial_max_stream_data_bidi_remote(100_000);
    config.set_initial_max_stream_data_uni(100_000);
    config.set_initial_max_streams_bidi(10);
    config.set_initial_max_streams_uni(10);

    let conn = Connection::connect(
        listener.local_addr(),
        Some("example.test"),
        &quiche::ConnectionId::from_ref(&[3; 20]),
        &mut config,
    )
    .await
    .unwrap();
    assert_eq!(conn.peer_addr(), listener.local_addr());
    assert!(!conn.is_closed());

    conn.close(0, b"done").await.unwrap();
    assert!(conn.is_closed());
}
