//! Pseudo-terminal capability and its portable-pty implementation.
//!
//! The hub only ever sees [`PtyProcess`]: write, resize, kill. Output and exit
//! notifications flow back as [`HubEvent`]s through a [`PtyEventSink`], so
//! every PTY callback is serialized through the hub's queue.

use crate::hub::HubEvent;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use ptymux_core::{MuxError, MuxResult};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Read chunk size for PTY output.
const READ_BUF_SIZE: usize = 8192;

/// How long the exit watcher waits for the reader to drain after the child exits.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How to start a session's process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub shell: String,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// A running pseudo-terminal process, exclusively owned by its session.
pub trait PtyProcess: Send {
    /// Queue bytes for the process's stdin.
    fn write(&mut self, data: &[u8]) -> MuxResult<()>;

    fn resize(&mut self, cols: u16, rows: u16) -> MuxResult<()>;

    /// Request termination. The exit event arrives later through the sink.
    fn kill(&mut self) -> MuxResult<()>;

    /// Current terminal geometry as (cols, rows).
    fn size(&self) -> (u16, u16);
}

/// Factory for PTY processes.
pub trait PtySpawner: Send {
    fn spawn(&self, request: &SpawnRequest, sink: PtyEventSink) -> MuxResult<Box<dyn PtyProcess>>;
}

/// Where a PTY reports its output and exit, tagged with the owning session.
#[derive(Debug, Clone)]
pub struct PtyEventSink {
    session_id: String,
    tx: mpsc::Sender<HubEvent>,
}

impl PtyEventSink {
    pub fn new(session_id: String, tx: mpsc::Sender<HubEvent>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Forward an output chunk. Call from a blocking thread.
    /// Blocks while the hub queue is full. Returns `false` once the hub is gone.
    pub fn output_blocking(&self, data: Vec<u8>) -> bool {
        self.tx
            .blocking_send(HubEvent::PtyOutput {
                session_id: self.session_id.clone(),
                data,
            })
            .is_ok()
    }

    /// Report process exit. Call from a blocking thread.
    pub fn exited_blocking(&self, exit_code: Option<u32>) {
        let _ = self.tx.blocking_send(HubEvent::PtyExited {
            session_id: self.session_id.clone(),
            exit_code,
        });
    }
}

/// Spawns real pseudo-terminals through portable-pty.
#[derive(Debug, Default)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, request: &SpawnRequest, sink: PtyEventSink) -> MuxResult<Box<dyn PtyProcess>> {
        Ok(Box::new(PtyHandle::spawn(request, sink)?))
    }
}

/// A managed PTY instance.
pub struct PtyHandle {
    /// The master for resize operations.
    master: Box<dyn MasterPty + Send>,
    /// Kill switch detached from the child (the reader thread owns the child).
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Feeds the writer thread.
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    cols: u16,
    rows: u16,
}

impl PtyHandle {
    /// Spawn the configured shell and start its reader and writer threads.
    pub fn spawn(request: &SpawnRequest, sink: PtyEventSink) -> MuxResult<Self> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| MuxError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&request.shell);
        if let Some(cwd) = &request.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        // Take both ends of the master first so a failure here leaves no child behind.
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| MuxError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| MuxError::Spawn(format!("failed to take PTY writer: {e}")))?;

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| MuxError::Spawn(format!("failed to spawn {}: {e}", request.shell)))?;
        drop(pair.slave);
        let killer = child.clone_killer();
        let short_id: String = sink.session_id().chars().take(8).collect();

        let (reader_done_tx, reader_done_rx) = std_mpsc::channel::<()>();
        let reader_sink = sink.clone();
        let reader_thread = thread::Builder::new()
            .name(format!("pty-reader-{short_id}"))
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    pump_output(reader, &reader_sink);
                }));
                if let Err(e) = result {
                    error!(session_id = %reader_sink.session_id(), "PTY reader panicked: {:?}", e);
                }
                let _ = reader_done_tx.send(());
            });
        if let Err(e) = reader_thread {
            reap(child.as_mut(), sink.session_id());
            return Err(MuxError::Spawn(format!("failed to start PTY reader: {e}")));
        }

        info!(
            session_id = %sink.session_id(),
            pid = ?child.process_id(),
            cols = request.cols,
            rows = request.rows,
            "PTY spawned"
        );

        // Exit is tied to the child, not to reader EOF: a leftover background
        // process can hold the slave open long after the shell is gone.
        let waiter_sink = sink.clone();
        let waiter_thread = thread::Builder::new()
            .name(format!("pty-wait-{short_id}"))
            .spawn(move || {
                let exit_code = match child.wait() {
                    Ok(status) => Some(status.exit_code()),
                    Err(e) => {
                        warn!(session_id = %waiter_sink.session_id(), error = %e, "wait on PTY child failed");
                        None
                    }
                };
                info!(session_id = %waiter_sink.session_id(), code = ?exit_code, "PTY child exited");
                // Let trailing output reach the hub before the exit event.
                let _ = reader_done_rx.recv_timeout(EXIT_DRAIN_GRACE);
                waiter_sink.exited_blocking(exit_code);
            });
        if let Err(e) = waiter_thread {
            // The child went into the failed closure; signal it through the killer.
            let mut killer = killer;
            let _ = killer.kill();
            return Err(MuxError::Spawn(format!("failed to start PTY exit watcher: {e}")));
        }

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        spawn_writer(sink.session_id().to_string(), writer, input_rx);

        Ok(Self {
            master: pair.master,
            killer,
            input_tx,
            cols: request.cols,
            rows: request.rows,
        })
    }
}

impl PtyProcess for PtyHandle {
    fn write(&mut self, data: &[u8]) -> MuxResult<()> {
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| MuxError::Pty("PTY writer closed".into()))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> MuxResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .resize(size)
            .map_err(|e| MuxError::Pty(format!("PTY resize failed: {e}")))?;
        self.cols = cols;
        self.rows = rows;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&mut self) -> MuxResult<()> {
        self.killer
            .kill()
            .map_err(|e| MuxError::Pty(format!("kill failed: {e}")))
    }

    fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

/// Read until EOF (or the EIO Linux reports once the child is gone).
fn pump_output(mut reader: Box<dyn Read + Send>, sink: &PtyEventSink) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if !sink.output_blocking(buf[..n].to_vec()) {
                    debug!(session_id = %sink.session_id(), "hub gone, stopping PTY reader");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(session_id = %sink.session_id(), error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Kill and reap a child whose session never got off the ground.
fn reap(child: &mut (dyn Child + Send + Sync), session_id: &str) {
    if let Err(e) = child.kill() {
        warn!(session_id, error = %e, "failed to kill half-started PTY child");
    }
    let _ = child.wait();
}

fn spawn_writer(
    session_id: String,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    warn!(session_id = %session_id, error = %e, "PTY write failed");
                    break;
                }
            }
        }));
        if let Err(e) = result {
            error!(session_id = %session_id, "PTY writer panicked: {:?}", e);
        }
    });
}


#[cfg(all(test, unix))]
mod native_tests {
    use super::*;
    use std::time::Duration;

    fn sh_request() -> SpawnRequest {
        SpawnRequest {
            shell: "/bin/sh".into(),
            cwd: None,
            env: HashMap::new(),
            cols: 80,
            rows: 30,
        }
    }

    /// Collect output until the exit event arrives. Returns (output, exit code).
    async fn run_until_exit(
        rx: &mut mpsc::Receiver<HubEvent>,
        within: Duration,
    ) -> (String, Option<u32>) {
        let mut output = Vec::new();
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("no exit event before deadline")
                .expect("event channel closed");
            match event {
                HubEvent::PtyOutput { data, .. } => output.extend_from_slice(&data),
                HubEvent::PtyExited { exit_code, .. } => {
                    return (String::from_utf8_lossy(&output).into_owned(), exit_code)
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn shell_output_precedes_exit() {
        let (tx, mut rx) = mpsc::channel(256);
        let mut pty = NativePtySpawner
            .spawn(&sh_request(), PtyEventSink::new("native-1".into(), tx))
            .unwrap();
        assert_eq!(pty.size(), (80, 30));

        pty.write(b"echo ptymux-$((40+2)); exit 3\r").unwrap();
        let (output, code) = run_until_exit(&mut rx, Duration::from_secs(10)).await;

        assert!(output.contains("ptymux-42"), "output was {output:?}");
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn exit_is_reported_while_a_leftover_process_holds_the_terminal() {
        let (tx, mut rx) = mpsc::channel(256);
        let mut pty = NativePtySpawner
            .spawn(&sh_request(), PtyEventSink::new("native-2".into(), tx))
            .unwrap();

        pty.write(b"(trap '' HUP; exec sleep 15) & sleep 0.3; echo leaving; exit 0\r")
            .unwrap();
        let (output, code) = run_until_exit(&mut rx, Duration::from_secs(5)).await;

        assert!(output.contains("leaving"), "output was {output:?}");
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn kill_ends_the_session() {
        let (tx, mut rx) = mpsc::channel(256);
        let mut pty = NativePtySpawner
            .spawn(&sh_request(), PtyEventSink::new("native-3".into(), tx))
            .unwrap();
        pty.resize(100, 40).unwrap();
        assert_eq!(pty.size(), (100, 40));

        pty.kill().unwrap();
        let (_, code) = run_until_exit(&mut rx, Duration::from_secs(5)).await;
        assert_ne!(code, Some(0));
    }
}
