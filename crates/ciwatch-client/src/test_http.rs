//! One-shot HTTP server for transport tests.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

/// Client that ignores proxy settings from the environment.
pub(crate) fn local_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client")
}

/// Accepts one connection, writes `response` verbatim and closes. Resolves
/// to the request head the client sent.
pub(crate) async fn serve_once(response: &'static str) -> (Url, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|window| window == b"\r\n\r\n") {
            let read = socket.read(&mut buf).await.expect("read");
            if read == 0 {
                break;
            }
            request.extend_from_slice(&buf[..read]);
        }
        socket.write_all(response.as_bytes()).await.expect("write");
        let _ = socket.shutdown().await;
        String::from_utf8_lossy(&request).into_owned()
    });
    let base = Url::parse(&format!("http://{addr}/")).expect("url");
    (base, server)
}
