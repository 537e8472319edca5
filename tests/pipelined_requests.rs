//! Pipelined GETs: several requests to the same origin should ride one connection and come
//! back matched to the right call, in the order the server actually wrote them.

use std::sync::{Arc, Mutex};

use pipewire_http::{Call, Pipeline, PipelineOptions, QueueOptions, StatusCode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

#[tokio::test]
async fn three_pipelined_gets_share_one_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];
        while received.windows(4).filter(|w| w == b"\r\n\r\n").count() < 3 {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed before sending all three requests");
            received.extend_from_slice(&chunk[..n]);
        }
        let request = std::str::from_utf8(&received).unwrap();
        // Three requests pipelined onto the same read: the server never wrote a response in
        // between, so a non-pipelining client could never have produced this.
        assert_eq!(request.matches("GET /").count(), 3);
        assert!(request.contains("GET /one "));
        assert!(request.contains("GET /two "));
        assert!(request.contains("GET /three "));

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none\
                  HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\ntwo\
                  HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nthree",
            )
            .await
            .unwrap();
    });

    let mut options = PipelineOptions::default();
    options.queue = QueueOptions {
        number_of_parallel_connections: 1,
        ..QueueOptions::default()
    };
    let mut pipeline = Pipeline::new(options);

    let bodies: Arc<Mutex<Vec<(String, StatusCode)>>> = Arc::new(Mutex::new(Vec::new()));

    for path in ["/one", "/two", "/three"] {
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

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 3);
    // Responses are matched FIFO to the calls that produced them, regardless of delivery order.
    assert!(bodies.iter().any(|(b, s)| b == "one" && *s == StatusCode::OK));
    assert!(bodies.iter().any(|(b, s)| b == "two" && *s == StatusCode::OK));
    assert!(bodies.iter().any(|(b, s)| b == "three" && *s == StatusCode::OK));

    let counters = pipeline.counters();
    assert_eq!(counters.new_connections, 1);
    assert_eq!(counters.successful_connections, 1);
}
