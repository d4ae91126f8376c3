use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};

use wrangler_rt::config::ListenerConfig;
use wrangler_rt::context::RequestContext;
use wrangler_rt::error::HandlerError;
use wrangler_rt::handler::{Handler, HandlerOutcome};
use wrangler_rt::net::address::InterfaceAddress;
use wrangler_rt::wrangler::Wrangler;
use wrangler_rt::Component;

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(
        &self,
        request: Request<h2::RecvStream>,
        _context: Arc<RequestContext>,
    ) -> Result<HandlerOutcome, HandlerError> {
        let path = request.uri().path().to_string();
        Ok(HandlerOutcome::Handled(
            Response::builder()
                .status(200)
                .body(Bytes::from(path))
                .unwrap(),
        ))
    }
}

async fn start_plaintext_wrangler() -> (Arc<Wrangler>, std::net::SocketAddr) {
    let config = ListenerConfig::new("test", InterfaceAddress::Tcp("127.0.0.1:0".parse().unwrap()));
    let wrangler = Arc::new(Wrangler::new(config, Arc::new(EchoHandler)).unwrap());
    wrangler.start(false).await.unwrap();
    let addr = wrangler.local_addr().unwrap();
    (wrangler, addr)
}

#[tokio::test]
async fn serves_one_request_over_plaintext_http2() {
    let (wrangler, addr) = start_plaintext_wrangler().await;

    let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut client, connection) = h2::client::handshake(tcp).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = Request::builder()
        .uri("https://example.com/hello")
        .body(())
        .unwrap();
    let (response, _) = client.send_request(request, true).unwrap();
    let response = response.await.unwrap();
    assert_eq!(response.status(), 200);

    let mut body = response.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, b"/hello");

    wrangler.stop(false).await.unwrap();
}

#[tokio::test]
async fn graceful_shutdown_succeeds_when_client_closes_promptly() {
    let (wrangler, addr) = start_plaintext_wrangler().await;

    {
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_client, connection) = h2::client::handshake(tcp).await.unwrap();
        tokio::spawn(async move {
            let _ = connection.await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // give the accept loop a moment to register and then tear the
    // connection down on its own before we ask the wrangler to stop.
    tokio::time::sleep(Duration::from_millis(50)).await;
    wrangler.stop(false).await.unwrap();
}
