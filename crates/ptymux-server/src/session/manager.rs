//! Session lifecycle management.
//!
//! Tracks all live sessions, assigns their display names, owns each session's
//! PTY and scrollback, and performs two-phase removal: a close request only
//! marks the session as closing; the PTY's exit event removes it.

use super::pty::{PtyEventSink, PtyProcess, PtySpawner, SpawnRequest};
use super::ring_buffer::ScrollbackBuffer;
use crate::hub::HubEvent;
use ptymux_core::{MuxError, MuxResult, SessionSummary, Utf8Stream};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Prefix shared by every generated session name.
const NAME_PREFIX: &str = "Session ";

/// Externally observable lifecycle of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    /// Termination requested; still registered until the exit event.
    Closing,
}

/// A single live session.
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// "Session N" display label.
    pub name: String,
    pub state: SessionState,
    /// When the session was created.
    pub created_at: Instant,
    pty: Box<dyn PtyProcess>,
    history: ScrollbackBuffer,
    /// Carries split UTF-8 sequences between output chunks.
    decoder: Utf8Stream,
}

impl Session {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    #[cfg(test)]
    pub fn history(&self) -> &ScrollbackBuffer {
        &self.history
    }

    /// Scrollback without the tail of a character still being decoded.
    ///
    /// Those held-back bytes go out with the next live chunk, so a snapshot
    /// that included them would show them twice.
    pub fn published_history(&self) -> Vec<u8> {
        if self.history.is_empty() {
            return Vec::new();
        }
        let mut snapshot = self.history.to_snapshot();
        let held = self.decoder.pending().min(snapshot.len());
        snapshot.truncate(snapshot.len() - held);
        snapshot
    }

    pub fn pty_mut(&mut self) -> &mut dyn PtyProcess {
        self.pty.as_mut()
    }

    pub fn pty_size(&self) -> (u16, u16) {
        self.pty.size()
    }
}

/// Limits and spawn defaults applied to every new session.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    pub history_capacity: usize,
    pub spawn: SpawnRequest,
}

/// Manages all live sessions.
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    /// Session ids in creation order.
    order: Vec<String>,
    /// Every id handed out by this process, so none is ever reused.
    issued: HashSet<String>,
    spawner: Box<dyn PtySpawner>,
    events: mpsc::Sender<HubEvent>,
    settings: RegistrySettings,
}

impl SessionRegistry {
    pub fn new(
        settings: RegistrySettings,
        spawner: Box<dyn PtySpawner>,
        events: mpsc::Sender<HubEvent>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            order: Vec::new(),
            issued: HashSet::new(),
            spawner,
            events,
            settings,
        }
    }

    /// Spawn and register a new session.
    ///
    /// Nothing is registered if the limit is reached or the spawn fails.
    pub fn create_session(&mut self) -> MuxResult<SessionSummary> {
        if self.sessions.len() >= self.settings.max_sessions {
            return Err(MuxError::SessionLimit(self.settings.max_sessions));
        }

        let id = self.fresh_id();
        let name = next_session_name(self.sessions.values().map(|s| s.name.as_str()));
        let sink = PtyEventSink::new(id.clone(), self.events.clone());
        let pty = self.spawner.spawn(&self.settings.spawn, sink)?;

        let session = Session {
            id: id.clone(),
            name,
            state: SessionState::Running,
            created_at: Instant::now(),
            pty,
            history: ScrollbackBuffer::new(self.settings.history_capacity),
            decoder: Utf8Stream::new(),
        };
        let summary = session.summary();

        info!(
            session_id = %id,
            name = %summary.name,
            history_capacity = session.history.capacity(),
            "session created"
        );
        self.issued.insert(id.clone());
        self.order.push(id.clone());
        self.sessions.insert(id, session);

        Ok(summary)
    }

    /// Ask a session's process to exit. Removal waits for the exit event.
    ///
    /// Returns `false` for unknown sessions and sessions already closing.
    pub fn close_session(&mut self, session_id: &str) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            debug!(session_id, "close for unknown session ignored");
            return false;
        };
        if session.state == SessionState::Closing {
            return false;
        }
        session.state = SessionState::Closing;
        if let Err(e) = session.pty.kill() {
            warn!(session_id, error = %e, "failed to signal PTY");
        }
        info!(session_id, "session closing");
        true
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    /// Snapshot of all live sessions in creation order.
    pub fn list(&self) -> Vec<SessionSummary> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(Session::summary)
            .collect()
    }

    /// Record PTY output in the session's history.
    ///
    /// Returns the text to publish (complete characters only), or `None` if
    /// the session is not registered.
    pub fn handle_output(&mut self, session_id: &str, data: &[u8]) -> Option<String> {
        let session = self.sessions.get_mut(session_id)?;
        session.history.append(data);
        Some(session.decoder.push(data))
    }

    /// Deregister a session whose process has exited.
    pub fn handle_exit(&mut self, session_id: &str) -> Option<SessionSummary> {
        let session = self.sessions.remove(session_id)?;
        self.order.retain(|id| id != session_id);
        info!(
            session_id,
            name = %session.name,
            lived_secs = session.created_at.elapsed().as_secs(),
            history_bytes = session.history.total_appended(),
            retained_bytes = session.history.len(),
            "session removed"
        );
        Some(session.summary())
    }

    /// Request termination of every live session. Returns how many were asked.
    pub fn shutdown(&mut self) -> usize {
        let ids: Vec<String> = self.order.clone();
        ids.iter().filter(|id| self.close_session(id)).count()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = generate_session_id();
            if !self.issued.contains(&id) {
                return id;
            }
        }
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

/// Numeric suffix of a generated name ("Session 7" → 7).
fn session_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(NAME_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|n| *n > 0)
}

/// Smallest "Session N" whose N is not used by any of `names`.
pub fn next_session_name<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let mut taken: Vec<u32> = names.into_iter().filter_map(session_number).collect();
    taken.sort_unstable();
    taken.dedup();

    let mut candidate = 1u32;
    for n in taken {
        if n == candidate {
            candidate += 1;
        } else if n > candidate {
            break;
        }
    }
    format!("{NAME_PREFIX}{candidate}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::fake::FakeSpawner;

    fn registry(spawner: &FakeSpawner) -> (SessionRegistry, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let settings = RegistrySettings {
            max_sessions: 8,
            history_capacity: 16,
            spawn: SpawnRequest {
                shell: "/bin/sh".into(),
                cwd: None,
                env: HashMap::new(),
                cols: 80,
                rows: 30,
            },
        };
        (SessionRegistry::new(settings, Box::new(spawner.clone()), tx), rx)
    }

    fn names(reg: &SessionRegistry) -> Vec<String> {
        reg.list().into_iter().map(|s| s.name).collect()
    }

    #[test]
    fn name_gap_filling() {
        assert_eq!(next_session_name([]), "Session 1");
        assert_eq!(next_session_name(["Session 1", "Session 3"]), "Session 2");
        assert_eq!(next_session_name(["Session 2", "Session 1"]), "Session 3");
        assert_eq!(next_session_name(["Session 2"]), "Session 1");
        assert_eq!(
            next_session_name(["Session 1", "scratch", "Session 0", "Session +2", "Session x"]),
            "Session 2"
        );
    }

    #[test]
    fn closed_number_is_reused() {
        let spawner = FakeSpawner::default();
        let (mut reg, _rx) = registry(&spawner);
        let s1 = reg.create_session().unwrap();
        let s2 = reg.create_session().unwrap();
        let s3 = reg.create_session().unwrap();
        assert_eq!(
            names(&reg),
            vec!["Session 1", "Session 2", "Session 3"]
        );

        assert!(reg.close_session(&s2.id));
        reg.handle_exit(&s2.id).unwrap();

        let s4 = reg.create_session().unwrap();
        assert_eq!(s4.name, "Session 2");
        assert_ne!(s4.id, s2.id);
        // Insertion order, not name order.
        assert_eq!(
            reg.list().into_iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![s1.id, s3.id, s4.id]
        );
    }

    #[test]
    fn removal_waits_for_exit() {
        let spawner = FakeSpawner::default();
        let (mut reg, _rx) = registry(&spawner);
        let s = reg.create_session().unwrap();

        assert!(reg.close_session(&s.id));
        assert_eq!(spawner.state(&s.id).lock().unwrap().kills, 1);
        assert_eq!(reg.get(&s.id).unwrap().state, SessionState::Closing);
        assert_eq!(reg.list().len(), 1);

        // Repeated close is a no-op while closing.
        assert!(!reg.close_session(&s.id));
        assert_eq!(spawner.state(&s.id).lock().unwrap().kills, 1);

        assert_eq!(reg.handle_exit(&s.id), Some(s.clone()));
        assert!(reg.get(&s.id).is_none());
        assert!(reg.list().is_empty());

        // And after exit.
        assert!(!reg.close_session(&s.id));
        assert_eq!(reg.handle_exit(&s.id), None);
    }

    #[test]
    fn spawn_failure_registers_nothing() {
        let spawner = FakeSpawner::default();
        let (mut reg, _rx) = registry(&spawner);
        spawner.set_failing(true);
        assert!(matches!(reg.create_session(), Err(MuxError::Spawn(_))));
        assert!(reg.is_empty());

        spawner.set_failing(false);
        assert_eq!(reg.create_session().unwrap().name, "Session 1");
    }

    #[test]
    fn session_limit() {
        let spawner = FakeSpawner::default();
        let (mut reg, _rx) = registry(&spawner);
        for _ in 0..8 {
            reg.create_session().unwrap();
        }
        assert!(matches!(reg.create_session(), Err(MuxError::SessionLimit(8))));
        assert_eq!(spawner.spawn_count(), 8);
    }

    #[test]
    fn output_lands_in_history_even_while_closing() {
        let spawner = FakeSpawner::default();
        let (mut reg, _rx) = registry(&spawner);
        let s = reg.create_session().unwrap();

        assert_eq!(reg.handle_output(&s.id, b"hello ").as_deref(), Some("hello "));
        reg.close_session(&s.id);
        assert_eq!(reg.handle_output(&s.id, b"bye").as_deref(), Some("bye"));
        assert_eq!(reg.get(&s.id).unwrap().history().to_snapshot(), b"hello bye");

        assert_eq!(reg.handle_output("missing", b"x"), None);
    }

    #[test]
    fn shutdown_signals_every_session() {
        let spawner = FakeSpawner::default();
        let (mut reg, _rx) = registry(&spawner);
        let a = reg.create_session().unwrap();
        let b = reg.create_session().unwrap();
        reg.close_session(&a.id);

        assert_eq!(reg.shutdown(), 1);
        assert_eq!(spawner.state(&a.id).lock().unwrap().kills, 1);
        assert_eq!(spawner.state(&b.id).lock().unwrap().kills, 1);
    }

    #[test]
    fn spawned_with_initial_geometry() {
        let spawner = FakeSpawner::default();
        let (mut reg, _rx) = registry(&spawner);
        let s = reg.create_session().unwrap();
        assert_eq!(reg.get(&s.id).unwrap().pty_size(), (80, 30));
        assert_eq!(s.id.len(), 32);
    }
}
