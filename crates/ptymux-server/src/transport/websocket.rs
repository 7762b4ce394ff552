//! WebSocket listener using tokio-tungstenite.
//!
//! Clients speak JSON text frames. Binary frames are not part of the protocol
//! and are skipped; pings are answered inline.

use futures_util::{SinkExt, StreamExt};
use ptymux_core::codec::MAX_FRAME_SIZE;
use ptymux_core::{MuxError, MuxResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// What a read from the socket produced.
#[derive(Debug, PartialEq, Eq)]
pub enum WsInbound {
    /// A text frame carrying one client message.
    Text(String),
    /// A frame that only proves the peer is alive (pong, binary, ping).
    Alive,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> MuxResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| MuxError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| MuxError::Transport(format!("WS local address: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send one text frame.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> MuxResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| MuxError::Transport(format!("WS send failed: {e}")))
}

/// Send a keep-alive ping.
pub async fn ws_send_ping(ws: &mut WebSocketStream<TcpStream>) -> MuxResult<()> {
    ws.send(Message::Ping(Default::default()))
        .await
        .map_err(|e| MuxError::Transport(format!("WS ping failed: {e}")))
}

/// Receive the next frame.
///
/// Returns `None` once the peer closes. Oversized text frames are rejected.
pub async fn ws_recv(ws: &mut WebSocketStream<TcpStream>) -> MuxResult<Option<WsInbound>> {
    match ws.next().await {
        Some(Ok(Message::Text(text))) => {
            if text.len() > MAX_FRAME_SIZE {
                return Err(MuxError::InvalidMessage(format!(
                    "WS frame too large: {} bytes (max {})",
                    text.len(),
                    MAX_FRAME_SIZE
                )));
            }
            Ok(Some(WsInbound::Text(text.to_string())))
        }
        Some(Ok(Message::Close(_))) => Ok(None),
        Some(Ok(Message::Ping(payload))) => {
            let _ = ws.send(Message::Pong(payload)).await;
            Ok(Some(WsInbound::Alive))
        }
        Some(Ok(_)) => Ok(Some(WsInbound::Alive)),
        Some(Err(e)) => Err(MuxError::Transport(format!("WS recv failed: {e}"))),
        None => Ok(None),
    }
}
