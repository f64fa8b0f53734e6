use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::control::trap_host_signals;
use crate::parse::ProcessSpec;
use crate::worker::Worker;

/// Terminal notifications sent by workers to the coordinator.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// A clean exit, a deliberate stop, or a spawn failure.
    Completed { slot: usize },
    /// Abnormal exit of a worker that was still eligible for restart.
    Crashed(Arc<Worker>),
}

/// Restart policy: a lineage may be relaunched at most `max_restarts` times.
///
/// The crashed attempt's `restarts` is compared with `<`, so a lineage is
/// retired once `restarts >= max_restarts`: `max_restarts` relaunches and
/// `max_restarts + 1` attempts in total. `max_restarts == 0` never relaunches.
pub fn should_restart(restarts: usize, max_restarts: usize) -> bool {
    restarts < max_restarts
}

/// Outcome of applying one event to the registry.
#[derive(Debug)]
pub struct Step {
    /// Replacement worker already installed in its slot, to be started.
    pub launch: Option<Arc<Worker>>,
    pub keep_running: bool,
}

/// All mutable supervisor state. Only the coordinator task writes to it.
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Arc<Worker>>,
    retired: Vec<Arc<Worker>>,
    total: usize,
    successes: usize,
    crashes: usize,
    exhausted: usize,
    next_attempt: u64,
    done: bool,
}

impl Registry {
    pub fn new(specs: Vec<Arc<ProcessSpec>>) -> Self {
        let total = specs.len();
        let mut registry = Registry {
            slots: Vec::with_capacity(total),
            retired: Vec::new(),
            total,
            successes: 0,
            crashes: 0,
            exhausted: 0,
            next_attempt: 0,
            done: false,
        };
        for (slot, spec) in specs.into_iter().enumerate() {
            let attempt = registry.next_attempt();
            registry.slots.push(Arc::new(Worker::new(spec, slot, 0, attempt)));
        }
        registry
    }

    fn next_attempt(&mut self) -> u64 {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        attempt
    }

    /// Every lineage has either completed or exhausted its restart budget.
    pub fn is_settled(&self) -> bool {
        self.successes + self.exhausted >= self.total
    }

    pub fn slots(&self) -> &[Arc<Worker>] {
        &self.slots
    }

    fn settle_step(&self) -> Step {
        Step { launch: None, keep_running: !self.is_settled() }
    }



    /*
        @@@
        @step();
        . Completed: counts a success; the run is over once successes + exhausted lineages reach the total.
        . Crashed: counts the crash and applies the restart policy to the crashed worker's slot.
    */
    pub fn step(&mut self, event: SupervisorEvent, max_restarts: usize, stopping: bool) -> Step {
        match event {
            SupervisorEvent::Completed { slot } => {
                self.successes += 1;
                debug!(slot, successes = self.successes, total = self.total, "process completed");
                self.settle_step()
            }
            SupervisorEvent::Crashed(worker) => self.restart(worker, max_restarts, stopping),
        }
    }

    fn restart(&mut self, worker: Arc<Worker>, max_restarts: usize, stopping: bool) -> Step {
        self.crashes += 1;
        let slot = worker.slot();

        match self.slots.get(slot) {
            Some(current) if Arc::ptr_eq(current, &worker) => {}
            _ => {
                warn!(program = worker.executable(), slot, "crash reported by a worker no longer in its slot; ignored");
                return Step { launch: None, keep_running: true };
            }
        }

        if stopping {
            info!(program = worker.executable(), slot, "crashed while stopping; not restarting");
            self.successes += 1;
            return self.settle_step();
        }

        if !should_restart(worker.restarts(), max_restarts) {
            warn!(
                program = worker.executable(),
                slot,
                restarts = worker.restarts(),
                max_restarts,
                "restart budget exhausted; retiring process"
            );
            self.exhausted += 1;
            return self.settle_step();
        }

        let attempt = self.next_attempt();
        let replacement = Arc::new(Worker::new(
            Arc::clone(worker.shared_spec()),
            slot,
            worker.restarts() + 1,
            attempt,
        ));
        let previous = std::mem::replace(&mut self.slots[slot], Arc::clone(&replacement));
        self.retired.push(previous);

        info!(
            program = worker.executable(),
            slot,
            restarts = replacement.restarts(),
            "restarting crashed process"
        );
        Step { launch: Some(replacement), keep_running: true }
    }

    // Every attempt ever made, in launch order.
    fn attempts(&self) -> Vec<&Arc<Worker>> {
        let mut all: Vec<_> = self.retired.iter().chain(self.slots.iter()).collect();
        all.sort_by_key(|w| w.attempt());
        all
    }

    fn aggregate<F>(&self, read: F) -> HashMap<String, String>
    where
        F: Fn(&Worker) -> String,
    {
        let mut result: HashMap<String, String> = HashMap::new();
        for worker in self.attempts() {
            let text = read(&**worker);
            if !text.is_empty() {
                result.entry(worker.executable().to_string()).or_default().push_str(&text);
            }
        }
        result
    }
}

struct Inner {
    max_restarts: usize,
    total: usize,
    registry: RwLock<Registry>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SupervisorEvent>>>,
    stopping: AtomicBool,
    trap_signals: AtomicBool,
    interrupted: AtomicBool,
}

/// Launches a fixed set of processes and restarts the ones that crash.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(specs: Vec<ProcessSpec>, max_restarts: usize) -> Self {
        let total = specs.len();
        // one in-flight event per slot at most, so senders never wait on the coordinator
        let (events_tx, events_rx) = mpsc::channel(total.max(1));
        let specs = specs.into_iter().map(Arc::new).collect();

        Supervisor {
            inner: Arc::new(Inner {
                max_restarts,
                total,
                registry: RwLock::new(Registry::new(specs)),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                stopping: AtomicBool::new(false),
                trap_signals: AtomicBool::new(true),
                interrupted: AtomicBool::new(false),
            }),
        }
    }

    /// Whether `start_all` installs the SIGINT/SIGTERM/SIGQUIT trap. On by default.
    pub fn set_signal_trap(&self, enabled: bool) {
        self.inner.trap_signals.store(enabled, Ordering::SeqCst);
    }

    /// True once the host signal trap has fired. The binary exits non-zero in that case.
    pub fn was_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_interrupted(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn total(&self) -> usize {
        self.inner.total
    }

    pub fn max_restarts(&self) -> usize {
        self.inner.max_restarts
    }



    /*
        @@@
        @start_all();
        . Installs the host signal trap (unless disabled).
        . Starts every worker as its own task and spawns the single coordinator task.
        . Returns a receiver that resolves once all processes are terminal.
    */
    pub async fn start_all(&self) -> Result<oneshot::Receiver<()>> {
        let events = {
            let mut pending = self.inner.events_rx.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.take() {
                Some(events) => events,
                None => bail!("supervisor already started"),
            }
        };

        if self.inner.trap_signals.load(Ordering::SeqCst) {
            trap_host_signals(self.clone())?;
        }

        let workers = self.workers().await;
        for worker in workers {
            tokio::spawn(worker.start(self.inner.events_tx.clone()));
        }

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(coordinate(Arc::clone(&self.inner), events, done_tx));

        info!(total = self.inner.total, max_restarts = self.inner.max_restarts, "started all processes");
        Ok(done_rx)
    }



    /*
        @@@
        @stop_all();
        . Marks the supervisor as stopping so later crashes are not restarted.
        . Stops every current worker in slot order; does not wait for the done signal.
    */
    pub async fn stop_all(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let workers = self.workers().await;
        info!(count = workers.len(), "stopping all processes");
        for worker in workers {
            worker.stop(&self.inner.events_tx).await;
        }
    }

    pub async fn success_count(&self) -> usize {
        self.inner.registry.read().await.successes
    }

    pub async fn crash_count(&self) -> usize {
        self.inner.registry.read().await.crashes
    }

    /// Lineages retired because their restart budget ran out.
    pub async fn exhausted_count(&self) -> usize {
        self.inner.registry.read().await.exhausted
    }

    pub async fn is_done(&self) -> bool {
        self.inner.registry.read().await.done
    }

    /// Current occupant of every slot, in original process order.
    pub async fn workers(&self) -> Vec<Arc<Worker>> {
        self.inner.registry.read().await.slots.clone()
    }

    /// Captured stdout per executable name, across all attempts in launch order.
    pub async fn read_stdout(&self) -> HashMap<String, String> {
        self.inner.registry.read().await.aggregate(Worker::stdout)
    }

    /// Captured stderr per executable name, across all attempts in launch order.
    pub async fn read_stderr(&self) -> HashMap<String, String> {
        self.inner.registry.read().await.aggregate(Worker::stderr)
    }
}



/*
    @@@
    @coordinate();
    . Sole writer of the registry: consumes events one at a time in arrival order.
    . Starts replacement workers returned by the restart policy.
    . Once settled, marks the run done, publishes the done signal and closes the queue.
*/
async fn coordinate(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<SupervisorEvent>,
    done: oneshot::Sender<()>,
) {
    let mut keep_running = inner.total > 0;

    while keep_running {
        let Some(event) = events.recv().await else {
            break;
        };

        let step = {
            let mut registry = inner.registry.write().await;
            registry.step(event, inner.max_restarts, inner.stopping.load(Ordering::SeqCst))
        };

        if let Some(worker) = step.launch {
            tokio::spawn(worker.start(inner.events_tx.clone()));
        }
        keep_running = step.keep_running;
    }

    inner.registry.write().await.done = true;
    info!(total = inner.total, "all processes reached a terminal state");
    let _ = done.send(());
    events.close();
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;

    fn registry(n: usize) -> Registry {
        let specs = (0..n)
            .map(|i| Arc::new(ProcessSpec::new("sh", ["-c".to_string(), format!("exit {}", i)])))
            .collect();
        Registry::new(specs)
    }

    fn crash(reg: &Registry, slot: usize) -> SupervisorEvent {
        SupervisorEvent::Crashed(Arc::clone(&reg.slots[slot]))
    }

    #[test]
    fn should_restart_respects_budget() {
        assert!(should_restart(0, 2));
        assert!(should_restart(1, 2));
        assert!(!should_restart(2, 2));
        assert!(!should_restart(0, 0));
    }

    #[test]
    fn new_registry_has_one_fresh_worker_per_spec() {
        let reg = registry(3);
        assert_eq!(reg.slots().len(), 3);
        for (i, w) in reg.slots().iter().enumerate() {
            assert_eq!(w.slot(), i);
            assert_eq!(w.attempt(), i as u64);
            assert_eq!(w.restarts(), 0);
            assert!(w.is_restart_eligible());
            assert_eq!(w.state(), WorkerState::NotStarted);
        }
        assert!(!reg.is_settled());
    }

    #[test]
    fn completions_settle_the_run() {
        let mut reg = registry(2);
        assert!(reg.step(SupervisorEvent::Completed { slot: 0 }, 2, false).keep_running);
        let step = reg.step(SupervisorEvent::Completed { slot: 1 }, 2, false);
        assert!(!step.keep_running);
        assert!(step.launch.is_none());
        assert_eq!(reg.successes, 2);
    }

    #[test]
    fn crash_replaces_slot_with_next_restart() {
        let mut reg = registry(2);
        let original = Arc::clone(&reg.slots[1]);

        let event = crash(&reg, 1);
        let step = reg.step(event, 2, false);

        let launched = step.launch.expect("replacement");
        assert!(step.keep_running);
        assert_eq!(launched.restarts(), 1);
        assert_eq!(launched.slot(), 1);
        assert_eq!(launched.attempt(), 2);
        assert!(Arc::ptr_eq(&reg.slots[1], &launched));
        assert_eq!(launched.spec(), original.spec());
        assert_eq!(reg.retired.len(), 1);
        assert!(Arc::ptr_eq(&reg.retired[0], &original));
        assert_eq!(reg.crashes, 1);
    }

    #[test]
    fn lineage_gets_max_restarts_plus_one_attempts() {
        let max_restarts = 3;
        let mut reg = registry(1);
        let mut launches = 1;

        loop {
            let event = crash(&reg, 0);
            let step = reg.step(event, max_restarts, false);
            match step.launch {
                Some(_) => launches += 1,
                None => {
                    assert!(!step.keep_running);
                    break;
                }
            }
        }

        assert_eq!(launches, max_restarts + 1);
        assert_eq!(reg.crashes, max_restarts + 1);
        assert_eq!(reg.exhausted, 1);
        assert_eq!(reg.successes, 0);
        assert!(reg.is_settled());
    }

    #[test]
    fn stale_crash_is_ignored() {
        let mut reg = registry(1);
        let stale = Arc::clone(&reg.slots[0]);
        let event = crash(&reg, 0);
        reg.step(event, 5, false);

        let step = reg.step(SupervisorEvent::Crashed(stale), 5, false);
        assert!(step.launch.is_none());
        assert!(step.keep_running);
        assert_eq!(reg.slots[0].restarts(), 1);
    }

    #[test]
    fn crash_while_stopping_is_not_restarted() {
        let mut reg = registry(1);
        let event = crash(&reg, 0);
        let step = reg.step(event, 5, true);
        assert!(step.launch.is_none());
        assert!(!step.keep_running);
        assert_eq!(reg.successes, 1);
        assert_eq!(reg.crashes, 1);
        assert!(reg.retired.is_empty());
    }

    #[tokio::test]
    async fn start_all_twice_fails() {
        let sup = Supervisor::new(vec![ProcessSpec::new("true", Vec::<String>::new())], 0);
        sup.set_signal_trap(false);
        let done = sup.start_all().await.unwrap();
        assert!(sup.start_all().await.is_err());
        done.await.unwrap();
    }

    #[tokio::test]
    async fn empty_process_list_is_done_immediately() {
        let sup = Supervisor::new(Vec::new(), 2);
        sup.set_signal_trap(false);
        let done = sup.start_all().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), done)
            .await
            .unwrap()
            .unwrap();
        assert!(sup.is_done().await);
        assert_eq!(sup.success_count().await, 0);
    }
}
