//! Virtual-time barrier synchronization (§4.6).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::wire::{NextSimTask, ReceiverIndex};

/// Receiver index `NextSimTask` frames are addressed to, on the `MwMsg`
/// channel (middleware control traffic, distinct from `SimMsg` user
/// payloads and from the registry's reserved status-report index).
pub const NEXT_SIM_TASK_RECEIVER_IDX: ReceiverIndex = ReceiverIndex(0);

struct TimeState {
    now_ns: i64,
    synchronized_peers: HashSet<String>,
    last_received: HashMap<String, i64>,
    last_sent: Option<NextSimTask>,
    /// The timepoint the local participant is currently blocked on, set
    /// while waiting for the barrier to release.
    pending_timepoint: Option<i64>,
    other_peers_done_notified: bool,
    /// Async step handler bookkeeping: whether the handler for the current
    /// step has fired, and the completion channel it's waiting on.
    step_handler_invoked: bool,
    awaiting_completion: Option<oneshot::Sender<()>>,
}

/// Per-participant barrier state and handler-invocation loop. `broadcast`
/// sends a freshly computed `NextSimTask` to every synchronized peer.
pub struct TimeConfiguration {
    step_size_ns: i64,
    /// `k`; `0` disables wall-clock coupling.
    animation_factor: f64,
    state: Mutex<TimeState>,
    barrier_notify: Notify,
    /// Invoked with the freshly computed task and the current synchronized
    /// peer names; the caller (the participant facade) owns actually
    /// addressing and sending it.
    broadcast: Box<dyn Fn(NextSimTask, &[String]) + Send + Sync>,
    other_steps_completed_handlers: Mutex<Vec<Box<dyn FnMut() + Send>>>,
}

impl TimeConfiguration {
    pub fn new(
        step_size: Duration,
        animation_factor: f64,
        broadcast: impl Fn(NextSimTask, &[String]) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(TimeConfiguration {
            step_size_ns: step_size.as_nanos() as i64,
            animation_factor,
            state: Mutex::new(TimeState {
                now_ns: 0,
                synchronized_peers: HashSet::new(),
                last_received: HashMap::new(),
                last_sent: None,
                pending_timepoint: None,
                other_peers_done_notified: false,
                step_handler_invoked: false,
                awaiting_completion: None,
            }),
            barrier_notify: Notify::new(),
            broadcast: Box::new(broadcast),
            other_steps_completed_handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn now_ns(&self) -> i64 {
        self.state.lock().now_ns
    }

    /// Adds `name` to the synchronized set. Dynamic membership: emits a
    /// fresh `NextSimTask` at the current logical time so a participant
    /// joining mid-simulation is immediately included in the barrier.
    pub fn add_synchronized_peer(&self, name: impl Into<String>) {
        let name = name.into();
        let (task, peers) = {
            let mut state = self.state.lock();
            state.synchronized_peers.insert(name);
            let task = NextSimTask { timepoint_ns: state.now_ns, duration_ns: self.step_size_ns };
            state.last_sent = Some(task);
            (task, state.synchronized_peers.iter().cloned().collect::<Vec<_>>())
        };
        (self.broadcast)(task, &peers);
    }

    pub fn synchronized_peer_names(&self) -> Vec<String> {
        self.state.lock().synchronized_peers.iter().cloned().collect()
    }

    pub fn remove_synchronized_peer(&self, name: &str) {
        let mut state = self.state.lock();
        state.synchronized_peers.remove(name);
        state.last_received.remove(name);
        drop(state);
        self.barrier_notify.notify_waiters();
    }

    /// Records an incoming `NextSimTask` from `peer_name`. Fires the
    /// "other steps completed" hook exactly once per pending step, when
    /// this update makes every synchronized peer caught up to the
    /// currently awaited timepoint while the local step is still pending.
    pub fn on_next_sim_task(&self, peer_name: &str, task: NextSimTask) {
        let fire = {
            let mut state = self.state.lock();
            state.last_received.insert(peer_name.to_string(), task.timepoint_ns);
            match state.pending_timepoint {
                Some(t_k) if !state.other_peers_done_notified && barrier_satisfied(&state, t_k) => {
                    state.other_peers_done_notified = true;
                    true
                }
                _ => false,
            }
        };
        self.barrier_notify.notify_waiters();
        if fire {
            for cb in self.other_steps_completed_handlers.lock().iter_mut() {
                cb();
            }
        }
    }

    pub fn add_other_simulation_steps_completed_handler(&self, cb: impl FnMut() + Send + 'static) {
        self.other_steps_completed_handlers.lock().push(Box::new(cb));
    }

    async fn wait_for_barrier(&self, t_k: i64) {
        loop {
            if self.barrier_satisfied(t_k) {
                return;
            }
            self.barrier_notify.notified().await;
        }
    }

    fn barrier_satisfied(&self, t_k: i64) -> bool {
        barrier_satisfied(&self.state.lock(), t_k)
    }

    async fn apply_animation_wait(&self) {
        if self.animation_factor > 0.0 {
            let wall_ns = (self.step_size_ns as f64 / self.animation_factor).max(0.0) as u64;
            if wall_ns > 0 {
                tokio::time::sleep(Duration::from_nanos(wall_ns)).await;
            }
        }
    }

    fn begin_step(&self, t_k: i64) {
        let mut state = self.state.lock();
        state.pending_timepoint = Some(t_k);
        state.other_peers_done_notified = false;
        state.step_handler_invoked = false;
    }

    fn advance_and_broadcast(&self, t_k: i64) -> NextSimTask {
        let next = NextSimTask { timepoint_ns: t_k + self.step_size_ns, duration_ns: self.step_size_ns };
        let peers = {
            let mut state = self.state.lock();
            state.now_ns = next.timepoint_ns;
            state.last_sent = Some(next);
            state.pending_timepoint = None;
            state.synchronized_peers.iter().cloned().collect::<Vec<_>>()
        };
        (self.broadcast)(next, &peers);
        next
    }

    /// Runs one barrier-gated step with a synchronous handler: blocks the
    /// caller for the duration of `handler`, then advances and broadcasts.
    pub async fn run_synchronous_step(&self, handler: impl FnOnce(i64, i64)) {
        let t_k = self.now_ns();
        self.begin_step(t_k);
        self.wait_for_barrier(t_k).await;
        self.apply_animation_wait().await;
        handler(t_k, self.step_size_ns);
        self.advance_and_broadcast(t_k);
    }

    /// Runs one barrier-gated step with an asynchronous handler: `handler`
    /// must return promptly, and the step only advances once
    /// `complete_simulation_step` is called.
    pub async fn run_asynchronous_step(&self, handler: impl FnOnce(i64, i64)) {
        let t_k = self.now_ns();
        self.begin_step(t_k);
        self.wait_for_barrier(t_k).await;
        self.apply_animation_wait().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.awaiting_completion = Some(tx);
            state.step_handler_invoked = true;
        }
        handler(t_k, self.step_size_ns);
        let _ = rx.await;
        self.advance_and_broadcast(t_k);
    }

    /// Idempotent. A call before any asynchronous handler has fired this
    /// step is tolerated with only a debug log (preserved ambiguity, §9); a
    /// repeat call after the step already completed warns and is a no-op.
    pub fn complete_simulation_step(&self) {
        let mut state = self.state.lock();
        if !state.step_handler_invoked {
            tracing::debug!("complete_simulation_step called before an asynchronous step handler fired");
            return;
        }
        match state.awaiting_completion.take() {
            Some(tx) => {
                drop(state);
                let _ = tx.send(());
            }
            None => tracing::warn!("complete_simulation_step called again after the step already completed"),
        }
    }
}

fn barrier_satisfied(state: &TimeState, t_k: i64) -> bool {
    state
        .synchronized_peers
        .iter()
        .all(|p| state.last_received.get(p).copied().unwrap_or(i64::MIN) >= t_k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn no_op_broadcast() -> impl Fn(NextSimTask, &[String]) + Send + Sync + 'static {
        |_, _| {}
    }

    #[test]
    fn barrier_unsatisfied_until_every_peer_catches_up() {
        let tc = TimeConfiguration::new(Duration::from_millis(1), 0.0, no_op_broadcast());
        tc.add_synchronized_peer("b");
        tc.add_synchronized_peer("c");
        assert!(!tc.barrier_satisfied(1_000_000));
        tc.on_next_sim_task("b", NextSimTask { timepoint_ns: 2_000_000, duration_ns: 1_000_000 });
        assert!(!tc.barrier_satisfied(1_000_000));
        tc.on_next_sim_task("c", NextSimTask { timepoint_ns: 2_000_000, duration_ns: 1_000_000 });
        assert!(tc.barrier_satisfied(1_000_000));
    }

    #[tokio::test]
    async fn synchronous_step_advances_time_and_broadcasts() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent2 = sent.clone();
        let tc = TimeConfiguration::new(Duration::from_millis(1), 0.0, move |t, _peers| sent2.lock().push(t));
        tc.run_synchronous_step(|_now, _dur| {}).await;
        assert_eq!(tc.now_ns(), 1_000_000);
        assert_eq!(sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn asynchronous_step_waits_for_explicit_completion() {
        let tc = Arc::new(TimeConfiguration::new(Duration::from_millis(1), 0.0, no_op_broadcast()));
        let tc2 = tc.clone();
        let handle = tokio::spawn(async move {
            tc2.run_asynchronous_step(|_now, _dur| {}).await;
        });
        tokio::task::yield_now().await;
        tc.complete_simulation_step();
        handle.await.unwrap();
        assert_eq!(tc.now_ns(), 1_000_000);
    }

    #[test]
    fn complete_simulation_step_before_handler_fires_is_tolerated() {
        let tc = TimeConfiguration::new(Duration::from_millis(1), 0.0, no_op_broadcast());
        tc.complete_simulation_step();
    }

    #[test]
    fn other_steps_completed_handler_fires_once_per_step() {
        let tc = TimeConfiguration::new(Duration::from_millis(1), 0.0, no_op_broadcast());
        tc.add_synchronized_peer("b");
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        tc.add_other_simulation_steps_completed_handler(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        tc.begin_step(0);
        tc.on_next_sim_task("b", NextSimTask { timepoint_ns: 1_000_000, duration_ns: 1_000_000 });
        tc.on_next_sim_task("b", NextSimTask { timepoint_ns: 2_000_000, duration_ns: 1_000_000 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
