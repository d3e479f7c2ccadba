use std::time::Duration;

use h3_duplex::{Client, ClientConfig, Header, Listener, ServerConfig, Strategy};
use tracing_subscriber::prelude::*;

#[monoio::main(timer_enabled = true)]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let strategy = match std::env::args().nth(1).as_deref() {
        Some("native") => Strategy::Native,
        _ => Strategy::Split,
    };

    // self-signed certificate for a throwaway local server
    let dir = tempfile::tempdir().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["echo.test".to_string()]).unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    std::fs::write(&cert, certified.cert.pem()).unwrap();
    std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

    let mut listener = Listener::bind("127.0.0.1:0", &ServerConfig::new(cert, key)).unwrap();
    let addr = listener.local_addr();
    tracing::info!("echo server listening on {addr}");

    monoio::spawn(async move {
        while let Some(exchange) = listener.next().await {
            tracing::info!("exchange from {}: {exchange:?}", exchange.peer_addr());
            let stream = match h3_duplex::accept(&exchange).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("upgrade failed: {e}");
                    let _ = exchange.respond(400).await;
                    continue;
                }
            };
            monoio::spawn(async move {
                let mut buf = [0; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = stream.close().await;
            });
        }
    });

    let client = Client::new(
        ClientConfig::default()
            .with_strategy(strategy)
            .resolve("echo.test", addr),
    );
    let headers = [Header::new(b"user-agent", b"h3-duplex-echo")];
    let (stream, response) = client
        .connect("https://echo.test/echo", &headers, Duration::from_secs(3))
        .await
        .unwrap();
    tracing::info!(
        "{strategy:?} duplex stream up, status {}",
        response.status()
    );

    for line in ["ping", "hello over h3"] {
        stream.write_all(line.as_bytes()).await.unwrap();
        let mut echoed = vec![0; line.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        println!("{}", String::from_utf8_lossy(&echoed));
    }
    stream.close().await.unwrap();
}
