//! A connection that drops mid-pipeline (served one call, then vanished before replying to the
//! next) should have its still-pending call resent on a fresh connection rather than failed
//! outright, since GET is idempotent under the default reconnect policy.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use pipewire_http::{Call, Pipeline, PipelineOptions, QueueOptions, StatusCode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

#[tokio::test]
async fn crashed_connection_is_retried_on_a_fresh_one() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    let server = {
        let accepts = accepts.clone();
        tokio::spawn(async move {
            // First connection: the engine doesn't know it can pipeline until it has seen an
            // HTTP/1.1 response, so it sends /first alone and waits for its reply before sending
            // /second. Answer /first, then vanish instead of answering /second — simulating the
            // peer crashing partway through the batch.
            let (mut socket, _) = listener.accept().await.unwrap();
            accepts.fetch_add(1, Ordering::SeqCst);
            let mut received = Vec::new();
            let mut chunk = [0u8; 4096];
            while !received.ends_with(b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "peer closed before sending the first request");
                received.extend_from_slice(&chunk[..n]);
            }
            assert!(std::str::from_utf8(&received).unwrap().starts_with("GET /first HTTP/1.1"));
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfirst")
                .await
                .unwrap();

            // Now the engine believes it can pipeline and sends /second; read it, then vanish.
            let mut received = Vec::new();
            while !received.ends_with(b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "peer closed before sending the second request");
                received.extend_from_slice(&chunk[..n]);
            }
            assert!(std::str::from_utf8(&received).unwrap().starts_with("GET /second HTTP/1.1"));
            drop(socket);

            // Second connection: the retried /second arrives here, on a brand new socket.
            let (mut socket, _) = listener.accept().await.unwrap();
            accepts.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = std::str::from_utf8(&buf[..n]).unwrap();
            assert!(request.starts_with("GET /second HTTP/1.1"));
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecond")
                .await
                .unwrap();
        })
    };

    let mut options = PipelineOptions::default();
    options.queue = QueueOptions {
        number_of_parallel_connections: 1,
        ..QueueOptions::default()
    };
    let mut pipeline = Pipeline::new(options);

    let bodies: Arc<Mutex<Vec<(String, StatusCode)>>> = Arc::new(Mutex::new(Vec::new()));

    for path in ["/first", "/second"] {
        let bodies = bodies.clone();
        pipeline.add_with_callback(
            Call::get(format!("http://127.0.0.1:{}{path}", addr.port()).parse().unwrap()),
            move |call| {
                let response = call.response().unwrap();
                let body = std::str::from_utf8(response.body().as_bytes().unwrap()).unwrap().to_owned();
                bodies.lock().unwrap().push((body, response.status()));
            },
        );
    }

    pipeline.run().await;
    server.await.unwrap();

    assert_eq!(accepts.load(Ordering::SeqCst), 2, "the retry must dial a fresh connection");

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    assert!(bodies.iter().any(|(b, s)| b == "first" && *s == StatusCode::OK));
    assert!(bodies.iter().any(|(b, s)| b == "second" && *s == StatusCode::OK));

    let counters = pipeline.counters();
    assert_eq!(counters.new_connections, 2);
    // The server closed its socket outright rather than sending garbage, so this is classified
    // as a peer EOF rather than an opaque "crash".
    assert_eq!(counters.server_eof_connections, 1);
    assert_eq!(counters.successful_connections, 1);
}
