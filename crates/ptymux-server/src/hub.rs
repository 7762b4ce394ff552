//! The hub: single owner of the session registry and the broadcast router.
//!
//! Connection tasks, PTY reader threads and timers never touch shared state;
//! they post [`HubEvent`]s to one queue and the hub applies them in order.
//! That queue is the only serialization point, so per-session output order
//! and "history before live output" on switch fall out of FIFO delivery.

use crate::config::ServerConfig;
use crate::router::{BroadcastRouter, ConnectionId};
use crate::session::{PtySpawner, SessionRegistry};
use ptymux_core::{ClientMessage, MuxError, MuxResult, ServerMessage, SessionSummary};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Hub queue depth. PTY readers block when it is full.
const HUB_QUEUE: usize = 1024;

/// Everything the hub reacts to.
#[derive(Debug)]
pub enum HubEvent {
    /// A transport connection is up; `outbox` carries its outbound messages.
    Connected {
        conn_id: ConnectionId,
        outbox: mpsc::Sender<ServerMessage>,
    },
    Disconnected {
        conn_id: ConnectionId,
    },
    /// A decoded client request.
    Client {
        conn_id: ConnectionId,
        message: ClientMessage,
    },
    /// Create a session outside of any client request (the first session).
    CreateSession {
        initial: bool,
        reply: oneshot::Sender<Option<SessionSummary>>,
    },
    PtyOutput {
        session_id: String,
        data: Vec<u8>,
    },
    PtyExited {
        session_id: String,
        exit_code: Option<u32>,
    },
    /// Deferred write of the configured startup command.
    StartupCommand {
        session_id: String,
    },
    /// Terminate every PTY; replies with how many were signalled.
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

impl HubEvent {
    fn kind(&self) -> &'static str {
        match self {
            HubEvent::Connected { .. } => "connected",
            HubEvent::Disconnected { .. } => "disconnected",
            HubEvent::Client { .. } => "client",
            HubEvent::CreateSession { .. } => "create-session",
            HubEvent::PtyOutput { .. } => "pty-output",
            HubEvent::PtyExited { .. } => "pty-exited",
            HubEvent::StartupCommand { .. } => "startup-command",
            HubEvent::Shutdown { .. } => "shutdown",
        }
    }
}

/// Cloneable sender side of the hub queue.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    pub async fn send(&self, event: HubEvent) -> MuxResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| MuxError::Other("hub stopped".into()))
    }

    /// Create a session and wait for the outcome.
    pub async fn create_session(&self, initial: bool) -> MuxResult<Option<SessionSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::CreateSession { initial, reply }).await?;
        rx.await
            .map_err(|_| MuxError::Other("hub dropped create-session reply".into()))
    }

    /// Ask the hub to terminate every PTY.
    pub async fn shutdown(&self) -> MuxResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::Shutdown { reply }).await?;
        rx.await
            .map_err(|_| MuxError::Other("hub dropped shutdown reply".into()))
    }
}

/// Hub-level settings that are not owned by the registry or router.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub startup_command: Option<String>,
    pub startup_delay: Duration,
}

pub struct Hub {
    registry: SessionRegistry,
    router: BroadcastRouter,
    settings: HubSettings,
    events: mpsc::Sender<HubEvent>,
}

impl Hub {
    /// Build a hub and the queue it drains.
    pub fn new(config: &ServerConfig, spawner: Box<dyn PtySpawner>) -> (Self, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(HUB_QUEUE);
        let hub = Self {
            registry: SessionRegistry::new(config.registry_settings(), spawner, tx.clone()),
            router: BroadcastRouter::new(config.rate_limit),
            settings: HubSettings {
                startup_command: config.startup_command.clone(),
                startup_delay: config.startup_delay,
            },
            events: tx,
        };
        (hub, rx)
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            tx: self.events.clone(),
        }
    }

    /// Drain the queue forever. A panicking handler is logged and skipped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<HubEvent>) {
        info!("hub running");
        while let Some(event) = rx.recv().await {
            let kind = event.kind();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.dispatch(event))) {
                error!(event = kind, "hub handler panicked: {}", panic_message(&*panic));
            }
        }
        info!("hub stopped");
    }

    /// Apply one event.
    pub fn dispatch(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { conn_id, outbox } => {
                let sessions = self.registry.list();
                self.router.connect(conn_id, outbox, sessions);
            }
            HubEvent::Disconnected { conn_id } => {
                if self.router.disconnect(conn_id) {
                    debug!(conn_id, remaining = self.router.connection_count(), "connection detached");
                }
            }
            HubEvent::Client { conn_id, message } => self.on_client(conn_id, message),
            HubEvent::CreateSession { initial, reply } => {
                let created = self.create_session(initial);
                let _ = reply.send(created);
            }
            HubEvent::PtyOutput { session_id, data } => self.on_output(&session_id, &data),
            HubEvent::PtyExited {
                session_id,
                exit_code,
            } => self.on_exit(&session_id, exit_code),
            HubEvent::StartupCommand { session_id } => self.write_startup_command(&session_id),
            HubEvent::Shutdown { reply } => {
                let signalled = if self.registry.is_empty() {
                    info!("no sessions to terminate");
                    0
                } else {
                    let signalled = self.registry.shutdown();
                    info!(signalled, live = self.registry.len(), "terminating all sessions");
                    signalled
                };
                let _ = reply.send(signalled);
            }
        }
    }

    fn on_client(&mut self, conn_id: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::SwitchSession { session_id } => {
                self.router.subscribe(conn_id, &self.registry, &session_id);
            }
            ClientMessage::CreateSession { request_id } => {
                let session = self.create_session(false);
                self.router.send_to(
                    conn_id,
                    ServerMessage::CreateSessionAck {
                        request_id,
                        session,
                    },
                );
            }
            ClientMessage::CloseSession { session_id } => {
                self.registry.close_session(&session_id);
            }
            ClientMessage::Input { session_id, data } => {
                self.router
                    .submit_input(conn_id, &mut self.registry, &session_id, &data);
            }
            ClientMessage::Resize {
                session_id,
                cols,
                rows,
            } => {
                self.router
                    .resize(conn_id, &mut self.registry, &session_id, cols, rows);
            }
        }
    }

    /// Spawn a session and announce it. `None` on failure, which is only logged.
    fn create_session(&mut self, initial: bool) -> Option<SessionSummary> {
        match self.registry.create_session() {
            Ok(summary) => {
                self.router
                    .announce(ServerMessage::SessionCreated(summary.clone()));
                if initial {
                    self.schedule_startup_command(&summary.id);
                }
                Some(summary)
            }
            Err(e) => {
                warn!(error = %e, initial, "session creation failed");
                None
            }
        }
    }

    fn on_output(&mut self, session_id: &str, data: &[u8]) {
        match self.registry.handle_output(session_id, data) {
            Some(text) if !text.is_empty() => self.router.publish(session_id, &text),
            Some(_) => {}
            None => debug!(session_id, bytes = data.len(), "output for unknown session"),
        }
    }

    fn on_exit(&mut self, session_id: &str, exit_code: Option<u32>) {
        let Some(summary) = self.registry.handle_exit(session_id) else {
            debug!(session_id, "exit for unknown session");
            return;
        };
        info!(session_id, name = %summary.name, code = ?exit_code, "session exited");
        self.router.forget_session(session_id);
        self.router.announce(ServerMessage::SessionClosed(summary));
    }

    fn schedule_startup_command(&self, session_id: &str) {
        if self.settings.startup_command.is_none() {
            return;
        }
        let tx = self.events.clone();
        let delay = self.settings.startup_delay;
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(HubEvent::StartupCommand { session_id }).await;
        });
    }

    fn write_startup_command(&mut self, session_id: &str) {
        let Some(command) = &self.settings.startup_command else {
            return;
        };
        let Some(session) = self.registry.get_mut(session_id) else {
            debug!(session_id, "session gone before startup command");
            return;
        };
        let line = format!("{command}\r");
        match session.pty_mut().write(line.as_bytes()) {
            Ok(()) => info!(session_id, command = %command, "startup command sent"),
            Err(e) => warn!(session_id, error = %e, "startup command write failed"),
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
