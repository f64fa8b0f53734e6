use chrono::{DateTime, Local};
use futures::future::join_all;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::control::{resolve_process_group, signal_group};
use crate::parse::ProcessSpec;
use crate::runtime::SupervisorEvent;

/// How long `start` waits for stdout/stderr to drain after the leader exits.
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// How a single launch attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Clean,
    Crashed,
    /// Terminated because `stop` was requested.
    Killed,
    /// The executable could not be started at all.
    SpawnFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Exited(ExitKind),
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: String,
    stderr: String,
}

/// Runtime record of one launch attempt of a [`ProcessSpec`].
///
/// A fresh `Worker` is built for the first launch and for every restart; the
/// restart count is carried forward by the supervisor. Once the attempt is
/// over the value stays around only as a record of its captured output.
#[derive(Debug)]
pub struct Worker {
    spec: Arc<ProcessSpec>,
    slot: usize,
    attempt: u64,
    restarts: usize,
    // cleared only by `stop`
    restart_eligible: AtomicBool,
    // set by whichever of the exit path / stop path reports the attempt's terminal event
    reported: AtomicBool,
    pid: OnceLock<u32>,
    pgid: OnceLock<Pid>,
    // output pipes still held open by some member of the group
    open_streams: AtomicUsize,
    group_signalled: AtomicBool,
    state: watch::Sender<WorkerState>,
    output: Mutex<CapturedOutput>,
    started_at: OnceLock<DateTime<Local>>,
    exited_at: OnceLock<DateTime<Local>>,
}

impl Worker {
    pub fn new(spec: Arc<ProcessSpec>, slot: usize, restarts: usize, attempt: u64) -> Self {
        let (state, _) = watch::channel(WorkerState::NotStarted);
        Self {
            spec,
            slot,
            attempt,
            restarts,
            restart_eligible: AtomicBool::new(true),
            reported: AtomicBool::new(false),
            pid: OnceLock::new(),
            pgid: OnceLock::new(),
            open_streams: AtomicUsize::new(0),
            group_signalled: AtomicBool::new(false),
            state,
            output: Mutex::new(CapturedOutput::default()),
            started_at: OnceLock::new(),
            exited_at: OnceLock::new(),
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub(crate) fn shared_spec(&self) -> &Arc<ProcessSpec> {
        &self.spec
    }

    pub fn executable(&self) -> &str {
        &self.spec.executable
    }

    /// Index of the supervisor slot this attempt occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Supervisor-wide launch sequence number, increasing in creation order.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub fn is_restart_eligible(&self) -> bool {
        self.restart_eligible.load(Ordering::SeqCst)
    }

    /// OS pid, available once the process has been spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// True while a member of the process group (the leader or a descendant
    /// that inherited its stdout/stderr) still holds the output pipes.
    pub fn output_open(&self) -> bool {
        self.open_streams.load(Ordering::SeqCst) > 0
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at.get().copied()
    }

    pub fn exited_at(&self) -> Option<DateTime<Local>> {
        self.exited_at.get().copied()
    }

    pub fn stdout(&self) -> String {
        self.captured().stdout.clone()
    }

    pub fn stderr(&self) -> String {
        self.captured().stderr.clone()
    }

    fn captured(&self) -> std::sync::MutexGuard<'_, CapturedOutput> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, stream: Stream, text: &str) {
        let mut out = self.captured();
        match stream {
            Stream::Stdout => out.stdout.push_str(text),
            Stream::Stderr => out.stderr.push_str(text),
        }
    }

    // Returns true for exactly one caller per attempt.
    fn claim_report(&self) -> bool {
        !self.reported.swap(true, Ordering::SeqCst)
    }

    fn finish(&self, kind: ExitKind) {
        let _ = self.exited_at.set(Local::now());
        self.state.send_replace(WorkerState::Exited(kind));
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.executable);
        cmd.args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(env) = &self.spec.env {
            cmd.env_clear().envs(env);
        }
        cmd
    }

    async fn report(&self, events: &mpsc::Sender<SupervisorEvent>, event: SupervisorEvent) {
        if events.send(event).await.is_err() {
            debug!(program = %self.spec.executable, slot = self.slot, "supervisor no longer listening; event dropped");
        }
    }



    /*
        @@@
        @start();
        . Spawns the process in its own process group and streams stdout/stderr into memory.
        . A spawn failure is reported as a completion, never as a crash.
        . Waits for the exit, then reports it once: clean exit -> Completed, abnormal exit while eligible -> Crashed.
        . If `stop` already reported this attempt, the exit is recorded and nothing is sent.
    */
    pub async fn start(self: Arc<Self>, events: mpsc::Sender<SupervisorEvent>) {
        let spawned = self.command().spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(
                    program = %self.spec.executable,
                    slot = self.slot,
                    error = %e,
                    "failed to spawn process"
                );
                self.finish(ExitKind::SpawnFailed);
                if self.claim_report() {
                    self.report(&events, SupervisorEvent::Completed { slot: self.slot }).await;
                }
                return;
            }
        };

        if let Some(pid) = child.id() {
            let _ = self.pid.set(pid);
            // spawned with process_group(0): the group id is the leader's pid
            let pgid = resolve_process_group(pid).unwrap_or_else(|_| Pid::from_raw(pid as i32));
            let _ = self.pgid.set(pgid);
        }
        let _ = self.started_at.set(Local::now());

        let readers: Vec<_> = [
            child.stdout.take().map(|out| self.spawn_capture(out, Stream::Stdout)),
            child.stderr.take().map(|err| self.spawn_capture(err, Stream::Stderr)),
        ]
        .into_iter()
        .flatten()
        .collect();

        self.state.send_replace(WorkerState::Running);
        info!(
            program = %self.spec,
            pid = ?self.pid(),
            slot = self.slot,
            restarts = self.restarts,
            "process started"
        );

        let status = child.wait().await;
        if timeout(OUTPUT_DRAIN, join_all(readers)).await.is_err() {
            // readers keep running detached until the group lets go of the pipes
            warn!(
                program = %self.spec.executable,
                pid = ?self.pid(),
                "output still held open by other group members; reporting leader exit"
            );
        }

        let clean = match &status {
            Ok(status) => {
                info!(
                    program = %self.spec.executable,
                    pid = ?self.pid(),
                    exit_code = ?status.code(),
                    signal = ?status.signal().and_then(|s| Signal::try_from(s).ok()),
                    "process exited"
                );
                status.success()
            }
            Err(e) => {
                error!(program = %self.spec.executable, pid = ?self.pid(), error = %e, "failed waiting for process");
                false
            }
        };

        if !self.claim_report() {
            debug!(program = %self.spec.executable, slot = self.slot, "exit after deliberate stop; already reported");
            self.finish(ExitKind::Killed);
            return;
        }

        if clean {
            self.finish(ExitKind::Clean);
            self.report(&events, SupervisorEvent::Completed { slot: self.slot }).await;
        } else if self.is_restart_eligible() {
            warn!(program = %self.spec.executable, slot = self.slot, restarts = self.restarts, "process crashed");
            self.finish(ExitKind::Crashed);
            self.report(&events, SupervisorEvent::Crashed(Arc::clone(&self))).await;
        } else {
            // stop was requested but the exit was observed first
            self.finish(ExitKind::Killed);
            self.report(&events, SupervisorEvent::Completed { slot: self.slot }).await;
        }
    }



    /*
        @@@
        @stop();
        . Waits until `start` has at least attempted the spawn, then clears restart eligibility.
        . SIGTERMs the whole process group (at most once) while the attempt is unreported or any group member still holds its output.
        . Reports completion only if the exit path has not already reported this attempt.
    */
    pub async fn stop(&self, events: &mpsc::Sender<SupervisorEvent>) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s != WorkerState::NotStarted).await;
        self.restart_eligible.store(false, Ordering::SeqCst);

        let Some(&pgid) = self.pgid.get() else {
            debug!(program = %self.spec.executable, slot = self.slot, "never spawned; nothing to stop");
            return;
        };

        let owns_report = self.claim_report();
        if !owns_report && !self.output_open() {
            debug!(program = %self.spec.executable, pgid = pgid.as_raw(), "exit already reported and group drained; not signalling");
            return;
        }

        if !self.group_signalled.swap(true, Ordering::SeqCst) {
            match signal_group(pgid, Signal::SIGTERM) {
                Ok(()) => info!(program = %self.spec.executable, pgid = pgid.as_raw(), "KILLED"),
                Err(_) => warn!(program = %self.spec.executable, pgid = pgid.as_raw(), "process group already gone"),
            }
        }

        if owns_report {
            self.report(events, SupervisorEvent::Completed { slot: self.slot }).await;
        }
    }

    fn spawn_capture<R>(self: &Arc<Self>, reader: R, stream: Stream) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(capture(reader, Arc::clone(self), stream))
    }
}

async fn capture<R>(reader: R, worker: Arc<Worker>, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => worker.append(stream, &String::from_utf8_lossy(&line)),
            Err(e) => {
                debug!(program = %worker.spec.executable, ?stream, error = %e, "output stream closed");
                break;
            }
        }
    }
    worker.open_streams.fetch_sub(1, Ordering::SeqCst);
}


#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn worker(spec: ProcessSpec) -> Arc<Worker> {
        Arc::new(Worker::new(Arc::new(spec), 0, 0, 0))
    }

    async fn next(rx: &mut mpsc::Receiver<SupervisorEvent>) -> SupervisorEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within 5s")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn clean_exit_reports_completion_and_keeps_output() {
        let (tx, mut rx) = mpsc::channel(4);
        let w = worker(ProcessSpec::new("sh", ["-c", "echo hello; echo oops >&2"]));

        Arc::clone(&w).start(tx).await;

        assert!(matches!(next(&mut rx).await, SupervisorEvent::Completed { slot: 0 }));
        assert_eq!(w.state(), WorkerState::Exited(ExitKind::Clean));
        assert_eq!(w.stdout(), "hello\n");
        assert_eq!(w.stderr(), "oops\n");
        assert!(w.pid().is_some());
        assert!(w.started_at().is_some() && w.exited_at().is_some());
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_crash() {
        let (tx, mut rx) = mpsc::channel(4);
        let w = worker(ProcessSpec::new("sh", ["-c", "echo partial; exit 3"]));

        Arc::clone(&w).start(tx).await;

        match next(&mut rx).await {
            SupervisorEvent::Crashed(crashed) => assert!(Arc::ptr_eq(&crashed, &w)),
            other => panic!("expected crash, got {:?}", other),
        }
        assert_eq!(w.state(), WorkerState::Exited(ExitKind::Crashed));
        assert_eq!(w.stdout(), "partial\n");
        assert!(w.is_restart_eligible());
    }

    #[tokio::test]
    #[traced_test]
    async fn spawn_failure_is_a_completion() {
        let (tx, mut rx) = mpsc::channel(4);
        let w = worker(ProcessSpec::new("definitely-not-a-real-binary-4711", ["x"]));

        Arc::clone(&w).start(tx.clone()).await;

        assert!(matches!(next(&mut rx).await, SupervisorEvent::Completed { slot: 0 }));
        assert_eq!(w.state(), WorkerState::Exited(ExitKind::SpawnFailed));
        assert!(w.pid().is_none());
        assert!(logs_contain("failed to spawn process"));

        // stop must not hang on an attempt that never started
        timeout(Duration::from_secs(1), w.stop(&tx)).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!w.is_restart_eligible());
    }

    #[tokio::test]
    async fn stop_reclaims_background_member_after_leader_exit() {
        let (tx, mut rx) = mpsc::channel(4);
        let w = worker(ProcessSpec::new("sh", ["-c", "sleep 20 & echo up"]));

        // returns once the leader is reaped even though `sleep` keeps the pipes
        timeout(Duration::from_secs(5), Arc::clone(&w).start(tx.clone())).await.unwrap();
        assert!(matches!(next(&mut rx).await, SupervisorEvent::Completed { slot: 0 }));
        assert_eq!(w.state(), WorkerState::Exited(ExitKind::Clean));
        assert!(w.output_open());

        w.stop(&tx).await;
        assert!(!w.is_restart_eligible());
        assert!(rx.try_recv().is_err());

        timeout(Duration::from_secs(5), async {
            while w.output_open() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("background sleep survived stop");
        assert_eq!(w.stdout(), "up\n");
    }

    #[tokio::test]
    async fn stop_reports_once_and_suppresses_crash() {
        let (tx, mut rx) = mpsc::channel(4);
        let w = worker(ProcessSpec::new("sleep", ["30"]));

        let running = tokio::spawn(Arc::clone(&w).start(tx.clone()));
        w.stop(&tx).await;

        assert!(matches!(next(&mut rx).await, SupervisorEvent::Completed { slot: 0 }));
        assert!(!w.is_restart_eligible());

        timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert_eq!(w.state(), WorkerState::Exited(ExitKind::Killed));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_after_exit_is_a_no_op() {
        let (tx, mut rx) = mpsc::channel(4);
        let w = worker(ProcessSpec::new("true", Vec::<String>::new()));

        Arc::clone(&w).start(tx.clone()).await;
        assert!(matches!(next(&mut rx).await, SupervisorEvent::Completed { .. }));

        w.stop(&tx).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(w.state(), WorkerState::Exited(ExitKind::Clean));
    }

    #[tokio::test]
    async fn env_replaces_inherited_environment() {
        let (tx, mut rx) = mpsc::channel(4);
        let w = worker(
            ProcessSpec::new("/bin/sh", ["-c", "echo \"$GREETING:${HOME:-unset}\""])
                .with_env([("GREETING", "hi")]),
        );

        Arc::clone(&w).start(tx).await;

        assert!(matches!(next(&mut rx).await, SupervisorEvent::Completed { .. }));
        assert_eq!(w.stdout(), "hi:unset\n");
    }
}
