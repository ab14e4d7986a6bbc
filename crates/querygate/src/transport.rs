use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use querygate_core::GatewayError;
use tokio::sync::mpsc;

/// One inbound transport event, normalized across adapters.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Pong,
    Close,
}

/// Write half of a connection's transport.
#[async_trait]
pub trait TransportSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError>;

    async fn send_ping(&mut self) -> Result<(), GatewayError>;

    async fn close(&mut self);
}

/// Read half of a connection's transport. `None` means the peer is gone.
#[async_trait]
pub trait TransportStream: Send {
    async fn recv(&mut self) -> Option<Inbound>;
}

/// Split an upgraded WebSocket into the transport halves.
pub fn ws_transport(socket: WebSocket) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
    let (sink, stream) = socket.split();
    (Box::new(WsSink(sink)), Box::new(WsStream(stream)))
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl TransportSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::Io(std::io::Error::other(e)))
    }

    async fn send_ping(&mut self) -> Result<(), GatewayError> {
        self.0
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| GatewayError::Io(std::io::Error::other(e)))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

struct WsStream(SplitStream<WebSocket>);

#[async_trait]
impl TransportStream for WsStream {
    async fn recv(&mut self) -> Option<Inbound> {
        loop {
            return match self.0.next().await? {
                Ok(Message::Text(text)) => Some(Inbound::Text(text.as_str().to_string())),
                Ok(Message::Binary(bytes)) => {
                    Some(Inbound::Text(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Pong(_)) => Some(Inbound::Pong),
                // The websocket layer answers pings itself.
                Ok(Message::Ping(_)) => continue,
                Ok(Message::Close(_)) => Some(Inbound::Close),
                Err(_) => Some(Inbound::Close),
            };
        }
    }
}

/// In-memory duplex transport for exercising the connection state machine
/// without a socket. The returned [`TransportPeer`] plays the client side.
pub fn memory_transport(buffer: usize) -> (TransportPeer, Box<dyn TransportSink>, Box<dyn TransportStream>) {
    let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
    let (outbound_tx, outbound_rx) = mpsc::channel(buffer);

    let peer = TransportPeer {
        to_server: inbound_tx,
        from_server: outbound_rx,
    };
    (
        peer,
        Box::new(MemorySink(outbound_tx)),
        Box::new(MemoryStream(inbound_rx)),
    )
}

/// Client-side handle of a [`memory_transport`] pair.
pub struct TransportPeer {
    to_server: mpsc::Sender<Inbound>,
    from_server: mpsc::Receiver<MemoryOutbound>,
}

#[derive(Debug)]
pub enum MemoryOutbound {
    Text(String),
    Ping,
    Closed,
}

impl TransportPeer {
    pub async fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_server.send(Inbound::Text(text.into())).await;
    }

    pub async fn send_pong(&self) {
        let _ = self.to_server.send(Inbound::Pong).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.to_server.send(Inbound::Close).await;
    }

    /// Next outbound event from the server, pings included.
    pub async fn recv(&mut self) -> Option<MemoryOutbound> {
        self.from_server.recv().await
    }

    /// Next outbound text frame, skipping pings. `None` once the server
    /// side closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.from_server.recv().await? {
                MemoryOutbound::Text(text) => return Some(text),
                MemoryOutbound::Ping => continue,
                MemoryOutbound::Closed => return None,
            }
        }
    }
}

struct MemorySink(mpsc::Sender<MemoryOutbound>);

#[async_trait]
impl TransportSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        self.0
            .send(MemoryOutbound::Text(text))
            .await
            .map_err(|_| GatewayError::Io(std::io::Error::other("peer gone")))
    }

    async fn send_ping(&mut self) -> Result<(), GatewayError> {
        self.0
            .send(MemoryOutbound::Ping)
            .await
            .map_err(|_| GatewayError::Io(std::io::Error::other("peer gone")))
    }

    async fn close(&mut self) {
        let _ = self.0.send(MemoryOutbound::Closed).await;
    }
}

struct MemoryStream(mpsc::Receiver<Inbound>);

#[async_trait]
impl TransportStream for MemoryStream {
    async fn recv(&mut self) -> Option<Inbound> {
        self.0.recv().await
    }
}
