//! Connection ↔ session binding and event fan-out.
//!
//! Each connection holds at most one subscription. PTY output goes only to
//! the subscribers of its session; lifecycle events go to everyone. Outbound
//! messages are pushed into each connection's bounded outbox without ever
//! waiting: a connection whose outbox is full (or whose transport is gone) is
//! dropped on the spot.

use super::rate_limit::{RateLimitConfig, TokenBucket};
use crate::session::SessionRegistry;
use ptymux_core::{ServerMessage, SessionSummary};
use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Transport-assigned connection identifier.
pub type ConnectionId = u64;

/// Accepted terminal widths.
pub const COLS_RANGE: RangeInclusive<u32> = 40..=1000;
/// Accepted terminal heights.
pub const ROWS_RANGE: RangeInclusive<u32> = 10..=400;

/// Router-side state of one client link.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    active_session: Option<String>,
    limiter: TokenBucket,
    outbox: mpsc::Sender<ServerMessage>,
}

impl Connection {
    #[cfg(test)]
    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }

    /// Queue a message without waiting. `false` means the connection must go.
    fn deliver(&self, msg: ServerMessage) -> bool {
        match self.outbox.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = self.id, "outbox full, dropping slow connection");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn_id = self.id, "outbox closed");
                false
            }
        }
    }
}

/// Routes events between connections and sessions.
#[derive(Debug)]
pub struct BroadcastRouter {
    connections: HashMap<ConnectionId, Connection>,
    /// Session id → subscribed connections.
    subscribers: HashMap<String, BTreeSet<ConnectionId>>,
    limits: RateLimitConfig,
}

impl BroadcastRouter {
    pub fn new(limits: RateLimitConfig) -> Self {
        Self {
            connections: HashMap::new(),
            subscribers: HashMap::new(),
            limits,
        }
    }

    /// Register a connection and send it the current session listing.
    pub fn connect(
        &mut self,
        conn_id: ConnectionId,
        outbox: mpsc::Sender<ServerMessage>,
        sessions: Vec<SessionSummary>,
    ) {
        let conn = Connection {
            id: conn_id,
            active_session: None,
            limiter: TokenBucket::new(self.limits),
            outbox,
        };
        if !conn.deliver(ServerMessage::SessionsList { sessions }) {
            return;
        }
        info!(conn_id, connections = self.connections.len() + 1, "connection registered");
        self.connections.insert(conn_id, conn);
    }

    /// Forget a connection and its subscription. Sessions are unaffected.
    pub fn disconnect(&mut self, conn_id: ConnectionId) -> bool {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return false;
        };
        if let Some(session_id) = conn.active_session {
            self.unsubscribe(conn_id, &session_id);
        }
        info!(conn_id, connections = self.connections.len(), "connection removed");
        true
    }

    /// Switch a connection to `session_id`, replaying its history first.
    ///
    /// Unknown connections or sessions leave everything unchanged.
    pub fn subscribe(
        &mut self,
        conn_id: ConnectionId,
        registry: &SessionRegistry,
        session_id: &str,
    ) -> bool {
        let Some(session) = registry.get(session_id) else {
            debug!(conn_id, session_id, "switch to unknown session ignored");
            return false;
        };
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };

        let previous = conn.active_session.replace(session_id.to_string());
        if let Some(prev) = previous {
            self.unsubscribe(conn_id, &prev);
        }
        self.subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(conn_id);

        let snapshot = session.published_history();
        if !snapshot.is_empty() {
            let msg = ServerMessage::History {
                session_id: session_id.to_string(),
                data: String::from_utf8_lossy(&snapshot).into_owned(),
            };
            if !self.send_to(conn_id, msg) {
                return false;
            }
        }
        debug!(conn_id, session_id, history_bytes = snapshot.len(), "subscribed");
        true
    }

    /// Deliver output to the subscribers of `session_id` only.
    pub fn publish(&mut self, session_id: &str, data: &str) {
        let Some(subs) = self.subscribers.get(session_id) else {
            return;
        };
        let mut dead = Vec::new();
        for conn_id in subs {
            let Some(conn) = self.connections.get(conn_id) else {
                continue;
            };
            let msg = ServerMessage::Output {
                session_id: session_id.to_string(),
                data: data.to_string(),
            };
            if !conn.deliver(msg) {
                dead.push(*conn_id);
            }
        }
        self.drop_all(dead);
    }

    /// Deliver an event to every connection.
    pub fn announce(&mut self, msg: ServerMessage) {
        let dead: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| !conn.deliver(msg.clone()))
            .map(|conn| conn.id)
            .collect();
        self.drop_all(dead);
    }

    /// Deliver an event to a single connection.
    pub fn send_to(&mut self, conn_id: ConnectionId, msg: ServerMessage) -> bool {
        let Some(conn) = self.connections.get(&conn_id) else {
            return false;
        };
        if conn.deliver(msg) {
            true
        } else {
            self.disconnect(conn_id);
            false
        }
    }

    /// Write keystrokes to a session's PTY if the connection's bucket allows.
    ///
    /// Refused input is dropped silently. Returns whether bytes were written.
    pub fn submit_input(
        &mut self,
        conn_id: ConnectionId,
        registry: &mut SessionRegistry,
        session_id: &str,
        data: &str,
    ) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        let Some(session) = registry.get_mut(session_id) else {
            debug!(conn_id, session_id, "input for unknown session ignored");
            return false;
        };
        if !conn.limiter.admit(data.len()) {
            debug!(conn_id, session_id, bytes = data.len(), "input rate limited, dropped");
            return false;
        }
        if let Err(e) = session.pty_mut().write(data.as_bytes()) {
            warn!(conn_id, session_id, error = %e, "PTY write failed");
            return false;
        }
        true
    }

    /// Apply a geometry change if both dimensions are in range.
    ///
    /// Out-of-range requests are ignored outright, not clamped.
    pub fn resize(
        &mut self,
        conn_id: ConnectionId,
        registry: &mut SessionRegistry,
        session_id: &str,
        cols: u32,
        rows: u32,
    ) -> bool {
        if !self.connections.contains_key(&conn_id) {
            return false;
        }
        if !COLS_RANGE.contains(&cols) || !ROWS_RANGE.contains(&rows) {
            debug!(conn_id, session_id, cols, rows, "resize out of bounds ignored");
            return false;
        }
        let Some(session) = registry.get_mut(session_id) else {
            return false;
        };
        debug!(conn_id, session_id, from = ?session.pty_size(), cols, rows, "resizing PTY");
        // Both ranges sit well inside u16.
        match session.pty_mut().resize(cols as u16, rows as u16) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn_id, session_id, error = %e, "PTY resize failed");
                false
            }
        }
    }

    /// Drop all routing state for a removed session.
    pub fn forget_session(&mut self, session_id: &str) {
        let Some(subs) = self.subscribers.remove(session_id) else {
            return;
        };
        for conn_id in subs {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                if conn.active_session.as_deref() == Some(session_id) {
                    conn.active_session = None;
                }
            }
        }
    }

    #[cfg(test)]
    pub fn connection(&self, conn_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections currently subscribed to `session_id`.
    #[cfg(test)]
    pub fn subscribers(&self, session_id: &str) -> Vec<ConnectionId> {
        self.subscribers
            .get(session_id)
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default()
    }

    fn unsubscribe(&mut self, conn_id: ConnectionId, session_id: &str) {
        if let Some(subs) = self.subscribers.get_mut(session_id) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                self.subscribers.remove(session_id);
            }
        }
    }

    fn drop_all(&mut self, dead: Vec<ConnectionId>) {
        for conn_id in dead {
            self.disconnect(conn_id);
        }
    }
}
