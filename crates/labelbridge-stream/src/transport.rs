// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Event-stream transport.
//
// `StreamTransport::connect` completes the full handshake before returning,
// so a `StreamConnection` is always a live, accepted session.  The session
// manager owns the connection from then on and drives it from a single
// reader task.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use labelbridge_core::error::{BridgeError, Result};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frame::{Command, Frame};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// What a live connection can yield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Body of one delivered message.
    Frame(Vec<u8>),
    /// Broker-reported or socket-level failure.  The connection is unusable.
    Error(String),
    /// The peer closed the connection.
    Closed,
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a connection to `url` and complete the protocol handshake.
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>>;
}

#[async_trait]
pub trait StreamConnection: Send {
    async fn subscribe(&mut self, destination: &str) -> Result<()>;

    /// Wait for the next delivered message or terminal event.
    async fn next_event(&mut self) -> TransportEvent;

    /// Leave the session politely and close the socket.
    async fn disconnect(&mut self) -> Result<()>;
}

/// STOMP 1.2 over a WebSocket.
#[derive(Debug, Clone, Default)]
pub struct StompWsTransport;

impl StompWsTransport {
    pub fn new() -> Self {
        Self
    }
}

fn host_of(url: &str) -> String {
    url.parse::<Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_owned))
        .unwrap_or_else(|| "localhost".to_string())
}

fn to_message(frame: &Frame) -> Message {
    match String::from_utf8(frame.encode()) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}

#[async_trait]
impl StreamTransport for StompWsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>> {
        let (mut ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BridgeError::ConnectionFailed(format!("{url}: {e}")))?;

        ws.send(to_message(&Frame::connect(&host_of(url))))
            .await
            .map_err(|e| BridgeError::ConnectionFailed(format!("sending CONNECT: {e}")))?;

        loop {
            let frame = match ws.next().await {
                Some(Ok(Message::Text(text))) => Frame::decode(text.as_bytes())?,
                Some(Ok(Message::Binary(bytes))) => Frame::decode(&bytes)?,
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(BridgeError::ConnectionFailed(
                        "connection closed during handshake".into(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(BridgeError::ConnectionFailed(e.to_string())),
            };

            match frame {
                Some(f) if f.command == Command::Connected => {
                    debug!(
                        version = f.header("version").unwrap_or("?"),
                        server = f.header("server").unwrap_or("?"),
                        "STOMP session established"
                    );
                    return Ok(Box::new(StompConnection {
                        ws,
                        subscription: None,
                    }));
                }
                Some(f) if f.command == Command::Error => {
                    return Err(BridgeError::ConnectionFailed(
                        f.header("message").unwrap_or("broker rejected CONNECT").to_string(),
                    ));
                }
                Some(f) => debug!(command = %f.command, "ignoring frame before CONNECTED"),
                None => {}
            }
        }
    }
}

struct StompConnection {
    ws: WsStream,
    subscription: Option<String>,
}

impl StompConnection {
    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.ws
            .send(to_message(frame))
            .await
            .map_err(|e| BridgeError::Transport(format!("sending {}: {e}", frame.command)))
    }
}

/// Map one incoming frame to a connection event.  Heart-beats, receipts
/// and malformed frames yield nothing.
fn classify_frame(raw: &[u8]) -> Option<TransportEvent> {
    let frame = match Frame::decode(raw) {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "dropping malformed STOMP frame");
            return None;
        }
    };

    match frame.command {
        Command::Message => Some(TransportEvent::Frame(frame.body)),
        Command::Error => {
            let message = frame.header("message").unwrap_or("unspecified broker error");
            Some(TransportEvent::Error(format!(
                "{message}: {}",
                String::from_utf8_lossy(&frame.body)
            )))
        }
        other => {
            debug!(command = %other, "ignoring STOMP frame");
            None
        }
    }
}

#[async_trait]
impl StreamConnection for StompConnection {
    async fn subscribe(&mut self, destination: &str) -> Result<()> {
        let id = format!("sub-{}", Uuid::new_v4());
        self.send_frame(&Frame::subscribe(&id, destination)).await?;
        debug!(destination, subscription = %id, "subscribed");
        self.subscription = Some(id);
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            let event = match self.ws.next().await {
                Some(Ok(Message::Text(text))) => classify_frame(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => classify_frame(&bytes),
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                    None
                }
                Some(Ok(Message::Close(_))) | None => Some(TransportEvent::Closed),
                Some(Ok(_)) => None,
                Some(Err(e)) => Some(TransportEvent::Error(e.to_string())),
            };
            if let Some(event) = event {
                return event;
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(id) = self.subscription.take() {
            let unsubscribe = Frame::new(Command::Unsubscribe).with_header("id", id);
            self.send_frame(&unsubscribe).await?;
        }
        self.send_frame(&Frame::disconnect(&format!("bye-{}", Uuid::new_v4())))
            .await?;
        self.ws
            .close(None)
            .await
            .map_err(|e| BridgeError::Transport(format!("closing socket: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_taken_from_url() {
        assert_eq!(host_of("ws://broker.example:8080/ws"), "broker.example");
        assert_eq!(host_of("wss://10.0.0.5/stomp"), "10.0.0.5");
        assert_eq!(host_of("not a url"), "localhost");
    }

    #[test]
    fn text_frames_become_text_messages() {
        let message = to_message(&Frame::subscribe("sub-1", "/topic/print/3"));
        assert!(matches!(message, Message::Text(_)));

        let binary = Frame::new(Command::Send).with_body(vec![0xff, 0xfe]);
        assert!(matches!(to_message(&binary), Message::Binary(_)));
    }

    #[test]
    fn only_messages_and_errors_surface() {
        let message = Frame::new(Command::Message)
            .with_header("destination", "/topic/print/3")
            .with_body("{}")
            .encode();
        assert_eq!(classify_frame(&message), Some(TransportEvent::Frame(b"{}".to_vec())));

        let error = Frame::new(Command::Error)
            .with_header("message", "access denied")
            .with_body("tenant 3")
            .encode();
        assert_eq!(
            classify_frame(&error),
            Some(TransportEvent::Error("access denied: tenant 3".into()))
        );

        let receipt = Frame::new(Command::Receipt).with_header("receipt-id", "r1").encode();
        assert_eq!(classify_frame(&receipt), None);
        assert_eq!(classify_frame(b"\n"), None);
        assert_eq!(classify_frame(b"garbage"), None);
    }
}
