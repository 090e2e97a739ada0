//! In-process WebSocket provider shared by the adapter tests.

#![allow(dead_code)]

use futures_util::StreamExt;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// One connection the adapter under test opened.
pub struct Accepted {
    pub uri: String,
    pub headers: HeaderMap,
    pub socket: WebSocketStream<TcpStream>,
}

/// Accepts provider connections on a local port and hands each to the test.
pub async fn start_provider() -> (String, mpsc::UnboundedReceiver<Accepted>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut seen = None;
                let record = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    seen = Some((req.uri().to_string(), req.headers().clone()));
                    Ok(resp)
                };
                let socket = tokio_tungstenite::accept_hdr_async(tcp, record).await.unwrap();
                let (uri, headers) = seen.unwrap();
                let _ = tx.send(Accepted {
                    uri,
                    headers,
                    socket,
                });
            });
        }
    });
    (format!("ws://{}", addr), rx)
}

/// An address nothing is listening on.
pub async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

pub async fn accept(connections: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
    tokio::time::timeout(WAIT, connections.recv())
        .await
        .expect("adapter never connected")
        .expect("provider stopped")
}

/// Next data or close message from the adapter, skipping pings.
pub async fn next_message(socket: &mut WebSocketStream<TcpStream>) -> Option<Message> {
    loop {
        let message = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for the adapter")?;
        match message {
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(message) => return Some(message),
            Err(_) => return None,
        }
    }
}

pub async fn next_text(socket: &mut WebSocketStream<TcpStream>) -> String {
    match next_message(socket).await {
        Some(Message::Text(text)) => text.to_string(),
        other => panic!("expected a text message, got {:?}", other),
    }
}

/// Reads until the adapter's close frame, failing on anything but data.
pub async fn expect_close(socket: &mut WebSocketStream<TcpStream>) {
    loop {
        match next_message(socket).await {
            Some(Message::Close(_)) => return,
            Some(Message::Text(_)) | Some(Message::Binary(_)) => continue,
            other => panic!("expected a close frame, got {:?}", other),
        }
    }
}
