//! Redirect handling: a multi-hop chain across distinct origins is followed to completion, and
//! a chain exceeding `maximum_redirections` terminates as a protocol error rather than looping
//! forever, while still exposing the last redirect response it received.

use std::sync::{Arc, Mutex};

use pipewire_http::{Call, CondensedStatus, Pipeline, PipelineOptions, StatusCode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

#[tokio::test]
async fn three_hop_chain_is_followed_to_the_final_origin() {
    let hop1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hop1_addr = hop1.local_addr().unwrap();
    let hop2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hop2_addr = hop2.local_addr().unwrap();
    let hop3 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hop3_addr = hop3.local_addr().unwrap();

    let hop1_task = tokio::spawn(async move {
        let (mut socket, _) = hop1.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        socket.read(&mut buf).await.unwrap();
        let location = format!("http://127.0.0.1:{}/hop2", hop2_addr.port());
        socket
            .write_all(format!("HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n").as_bytes())
            .await
            .unwrap();
    });
    let hop2_task = tokio::spawn(async move {
        let (mut socket, _) = hop2.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = socket.read(&mut buf).await.unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("GET /hop2"));
        let location = format!("http://127.0.0.1:{}/hop3", hop3_addr.port());
        socket
            .write_all(format!("HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n").as_bytes())
            .await
            .unwrap();
    });
    let hop3_task = tokio::spawn(async move {
        let (mut socket, _) = hop3.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = socket.read(&mut buf).await.unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("GET /hop3"));
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nfinal-hop")
            .await
            .unwrap();
    });

    let mut pipeline = Pipeline::new(PipelineOptions::default());
    let result: Arc<Mutex<Option<(StatusCode, String)>>> = Arc::new(Mutex::new(None));
    let result_clone = result.clone();
    pipeline.add_with_callback(
        Call::get(format!("http://127.0.0.1:{}/hop1", hop1_addr.port()).parse().unwrap()),
        move |call| {
            let response = call.response().unwrap();
            let body = std::str::from_utf8(response.body().as_bytes().unwrap()).unwrap().to_owned();
            *result_clone.lock().unwrap() = Some((response.status(), body));
        },
    );

    pipeline.run().await;
    hop1_task.await.unwrap();
    hop2_task.await.unwrap();
    hop3_task.await.unwrap();

    let (status, body) = result.lock().unwrap().clone().unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "final-hop");
}

#[tokio::test]
async fn chain_exceeding_the_limit_is_delivered_unfollowed() {
    // A redirect-to-itself loop: every hit comes back to the same listener with a fresh 302,
    // so without loop protection this would never terminate.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let port = addr.port();

    let server = tokio::spawn(async move {
        // Every 302 keeps the connection alive and points back at the same origin, so the
        // engine reuses one cached connection across every hop rather than reconnecting.
        let (mut socket, _) = listener.accept().await.unwrap();
        // `maximum_redirections` defaults to 5, so this call is served at most 6 times
        // (the original request plus five followed hops) before the engine gives up.
        for _ in 0..6 {
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "engine closed the connection before exhausting the redirect limit");
            let location = format!("http://127.0.0.1:{port}/loop");
            socket
                .write_all(format!("HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n").as_bytes())
                .await
                .unwrap();
        }
    });

    let mut pipeline = Pipeline::new(PipelineOptions::default());
    let status: Arc<Mutex<Option<StatusCode>>> = Arc::new(Mutex::new(None));
    let gave_up: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));
    let status_clone = status.clone();
    let gave_up_clone = gave_up.clone();
    pipeline.add_with_callback(
        Call::get(format!("http://127.0.0.1:{port}/loop").parse().unwrap()),
        move |call| {
            // The limit is enforced as a terminal protocol error (`too_many_redirections`),
            // not by delivering the final 302 as-is; the 302 is still reachable via `response()`.
            *status_clone.lock().unwrap() = call.response().map(|r| r.status());
            *gave_up_clone.lock().unwrap() = matches!(
                call.status(),
                CondensedStatus::ProtocolError(e) if e.is_too_many_redirections()
            );
        },
    );

    pipeline.run().await;
    server.await.unwrap();

    assert_eq!(*status.lock().unwrap(), Some(StatusCode::FOUND));
    assert!(*gave_up.lock().unwrap(), "call should terminate with too_many_redirections past the limit");
}
