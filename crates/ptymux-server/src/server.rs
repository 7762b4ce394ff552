//! Core server: binds the WebSocket listener and pumps each connection.
//!
//! A connection task owns its socket. It forwards decoded client requests to
//! the hub and writes whatever the hub puts in its outbox; it never touches
//! sessions directly.

use crate::config::ServerConfig;
use crate::hub::{Hub, HubEvent, HubHandle};
use crate::router::ConnectionId;
use crate::session::PtySpawner;
use crate::transport::websocket::{self, WebSocketConnection, WsInbound};
use ptymux_core::{decode_client, encode_server, MuxError, MuxResult, ServerMessage};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-connection transport settings.
#[derive(Debug, Clone, Copy)]
struct LinkSettings {
    outbound_queue: usize,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
}

/// The ptymux server instance.
pub struct MuxServer {
    config: ServerConfig,
    hub: Hub,
    events: mpsc::Receiver<HubEvent>,
}

impl MuxServer {
    pub fn new(config: ServerConfig, spawner: Box<dyn PtySpawner>) -> Self {
        let (hub, events) = Hub::new(&config, spawner);
        Self {
            config,
            hub,
            events,
        }
    }

    /// Handle to the hub, usable before and after `run`.
    pub fn hub_handle(&self) -> HubHandle {
        self.hub.handle()
    }

    /// Serve until the listener goes away.
    pub async fn run(self) -> MuxResult<()> {
        let (_addr, accept_loop) = self.start().await?;
        accept_loop
            .await
            .map_err(|e| MuxError::Other(format!("accept loop failed: {e}")))
    }

    /// Bind, start the hub, create the initial session and spawn the accept
    /// loop. Returns the bound address.
    pub async fn start(self) -> MuxResult<(SocketAddr, JoinHandle<()>)> {
        let bind_addr = SocketAddr::new(self.config.bind, self.config.port);
        let (local_addr, mut ws_rx) = websocket::start_listener(bind_addr).await?;

        let hub = self.hub.handle();
        tokio::spawn(self.hub.run(self.events));

        match hub.create_session(true).await? {
            Some(session) => info!(session_id = %session.id, name = %session.name, "initial session started"),
            None => warn!("initial session could not be started"),
        }

        let link = LinkSettings {
            outbound_queue: self.config.outbound_queue,
            keepalive_interval: self.config.keepalive_interval,
            keepalive_timeout: self.config.keepalive_timeout,
        };

        info!(addr = %local_addr, max_sessions = self.config.max_sessions, "ptymux-server ready");

        let accept_loop = tokio::spawn(async move {
            let mut next_conn_id: ConnectionId = 1;
            while let Some(conn) = ws_rx.recv().await {
                let conn_id = next_conn_id;
                next_conn_id += 1;
                let hub = hub.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn_id, conn, hub, link).await {
                        warn!(conn_id, error = %e, "WebSocket connection error");
                    }
                });
            }
            info!("listener closed");
        });

        Ok((local_addr, accept_loop))
    }
}

async fn handle_connection(
    conn_id: ConnectionId,
    mut conn: WebSocketConnection,
    hub: HubHandle,
    link: LinkSettings,
) -> MuxResult<()> {
    let (outbox, mut outbox_rx) = mpsc::channel(link.outbound_queue);
    hub.send(HubEvent::Connected { conn_id, outbox }).await?;
    info!(conn_id, remote = %conn.remote_addr, "client connected");

    let result = connection_loop(conn_id, &mut conn, &hub, &mut outbox_rx, link).await;

    let _ = hub.send(HubEvent::Disconnected { conn_id }).await;
    let _ = conn.ws_stream.close(None).await;
    info!(conn_id, "client disconnected");
    result
}

async fn connection_loop(
    conn_id: ConnectionId,
    conn: &mut WebSocketConnection,
    hub: &HubHandle,
    outbox_rx: &mut mpsc::Receiver<ServerMessage>,
    link: LinkSettings,
) -> MuxResult<()> {
    let idle_limit = link.keepalive_interval + link.keepalive_timeout;
    let mut ping = tokio::time::interval_at(
        Instant::now() + link.keepalive_interval,
        link.keepalive_interval,
    );
    let idle = tokio::time::sleep(idle_limit);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            msg = outbox_rx.recv() => {
                let Some(msg) = msg else {
                    debug!(conn_id, "hub dropped connection");
                    break;
                };
                let text = encode_server(&msg)?;
                websocket::ws_send_text(&mut conn.ws_stream, text).await?;
            }

            inbound = websocket::ws_recv(&mut conn.ws_stream) => {
                match inbound {
                    Ok(Some(frame)) => {
                        idle.as_mut().reset(Instant::now() + idle_limit);
                        if let WsInbound::Text(text) = frame {
                            match decode_client(&text) {
                                Ok(message) => hub.send(HubEvent::Client { conn_id, message }).await?,
                                Err(e) => debug!(conn_id, error = %e, "malformed client message ignored"),
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(conn_id, "peer closed");
                        break;
                    }
                    Err(MuxError::InvalidMessage(e)) => {
                        idle.as_mut().reset(Instant::now() + idle_limit);
                        debug!(conn_id, error = %e, "oversized frame ignored");
                    }
                    Err(e) => {
                        debug!(conn_id, error = %e, "WebSocket session ended");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                websocket::ws_send_ping(&mut conn.ws_stream).await?;
            }

            _ = &mut idle => {
                info!(conn_id, "keep-alive timeout, dropping connection");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, ConfigFile};
    use crate::session::pty::fake::FakeSpawner;
    use futures_util::{SinkExt, StreamExt};
    use ptymux_core::SessionSummary;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    fn test_config() -> ServerConfig {
        let cli = CliOverrides {
            bind: Some("127.0.0.1".into()),
            port: Some(0),
            ..Default::default()
        };
        ServerConfig::resolve(ConfigFile::default(), &cli).unwrap()
    }

    async fn start(config: ServerConfig) -> (SocketAddr, HubHandle, FakeSpawner) {
        let spawner = FakeSpawner::default();
        let server = MuxServer::new(config, Box::new(spawner.clone()));
        let hub = server.hub_handle();
        let (addr, _accept) = server.start().await.unwrap();
        (addr, hub, spawner)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        ws
    }

    async fn next_message(ws: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for server message")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send_json(ws: &mut Client, json: &str) {
        ws.send(Message::Text(json.to_string().into())).await.unwrap();
    }

    #[tokio::test]
    async fn new_client_sees_initial_session() {
        let (addr, _hub, spawner) = start(test_config()).await;
        let mut ws = connect(addr).await;

        let ServerMessage::SessionsList { sessions } = next_message(&mut ws).await else {
            panic!("expected sessions-list first");
        };
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "Session 1");
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn create_switch_and_stream() {
        let (addr, hub, spawner) = start(test_config()).await;
        let mut ws = connect(addr).await;
        next_message(&mut ws).await;

        send_json(&mut ws, "this is not json").await;
        send_json(&mut ws, r#"{"type":"create-session","requestId":7}"#).await;

        let ServerMessage::SessionCreated(created) = next_message(&mut ws).await else {
            panic!("expected session-created");
        };
        assert_eq!(created.name, "Session 2");
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::CreateSessionAck {
                request_id: Some(7),
                session: Some(SessionSummary {
                    id: created.id.clone(),
                    name: created.name.clone(),
                }),
            }
        );

        send_json(
            &mut ws,
            &format!(r#"{{"type":"input","sessionId":"{}","data":"ls\r"}}"#, created.id),
        )
        .await;
        hub.send(HubEvent::PtyOutput {
            session_id: created.id.clone(),
            data: b"file.txt\r\n".to_vec(),
        })
        .await
        .unwrap();

        // The switch is queued behind both the input and the output above.
        send_json(
            &mut ws,
            &format!(r#"{{"type":"switch-session","sessionId":"{}"}}"#, created.id),
        )
        .await;
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::History {
                session_id: created.id.clone(),
                data: "file.txt\r\n".into(),
            }
        );

        hub.send(HubEvent::PtyOutput {
            session_id: created.id.clone(),
            data: b"$ ".to_vec(),
        })
        .await
        .unwrap();
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::Output {
                session_id: created.id.clone(),
                data: "$ ".into(),
            }
        );
        assert_eq!(spawner.state(&created.id).lock().unwrap().written(), b"ls\r");
    }

    #[tokio::test]
    async fn lifecycle_events_reach_every_client() {
        let (addr, hub, _spawner) = start(test_config()).await;
        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        let ServerMessage::SessionsList { sessions } = next_message(&mut a).await else {
            panic!("expected sessions-list");
        };
        next_message(&mut b).await;
        let first = sessions[0].clone();

        send_json(
            &mut a,
            &format!(r#"{{"type":"close-session","sessionId":"{}"}}"#, first.id),
        )
        .await;
        hub.send(HubEvent::PtyExited {
            session_id: first.id.clone(),
            exit_code: Some(0),
        })
        .await
        .unwrap();

        assert_eq!(next_message(&mut a).await, ServerMessage::SessionClosed(first.clone()));
        assert_eq!(next_message(&mut b).await, ServerMessage::SessionClosed(first));
    }

    #[tokio::test]
    async fn overflowing_outbox_closes_the_socket() {
        let mut config = test_config();
        config.outbound_queue = 1;
        let (addr, _hub, _spawner) = start(config).await;
        let mut ws = connect(addr).await;

        // A create answers the requester twice in one hub step: the broadcast,
        // then the ack. The second cannot fit in a one-slot outbox.
        send_json(&mut ws, r#"{"type":"create-session","requestId":1}"#).await;

        let mut seen = Vec::new();
        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(frame)) = ws.next().await {
                match frame {
                    Message::Text(text) => {
                        seen.push(serde_json::from_str::<ServerMessage>(&text).unwrap())
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "socket stayed open after overflow");
        assert!(!seen
            .iter()
            .any(|m| matches!(m, ServerMessage::CreateSessionAck { .. })));
    }

    #[tokio::test]
    async fn silent_client_is_dropped() {
        let mut config = test_config();
        config.keepalive_interval = Duration::from_millis(50);
        config.keepalive_timeout = Duration::from_millis(50);
        let (addr, _hub, _spawner) = start(config).await;
        let mut ws = connect(addr).await;

        // Not polling means no pongs go back.
        tokio::time::sleep(Duration::from_millis(400)).await;

        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(drained.is_ok());
    }
}
