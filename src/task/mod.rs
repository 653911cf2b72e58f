//! Task correlation.
//!
//! Every command carries a 16-bit task id. The server answers with a stream of
//! `Task` envelopes for that id (`Start`, `Update`, then `Succeed`/`Failed`, or
//! a single `ArgError`). The [`TaskCorrelator`] matches those envelopes back to
//! the caller waiting on the command.
//!
//! Waits are interruptible: each active task owns a `watch` channel that the
//! router updates, and every wait also watches the session's purge signal, so
//! an emergency abort resolves all pending waits to [`Outcome::Failed`] at once.
//!
//! Ids wrap at 65536. Collisions are possible only if that many commands are
//! outstanding at once, which the protocol does not expect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::abort::{AbortState, PurgeSignal};
use crate::logging::{LogLevel, LogSink};
use crate::protocol::{Outcome, TaskState, TaskUpdate};

/// Correlation state of one in-flight command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRecord {
    /// Task id.
    pub id: u16,
    /// The server acknowledged the task (any response arrived).
    pub sent: bool,
    /// Last reported state.
    pub state: TaskState,
    /// The task started.
    pub started: bool,
    /// The task reached a terminal state.
    pub stopped: bool,
    /// When the wait was registered.
    pub created_at: Instant,
}

impl TaskRecord {
    fn new(id: u16) -> Self {
        Self {
            id,
            sent: false,
            state: TaskState::Unknown,
            started: false,
            stopped: false,
            created_at: Instant::now(),
        }
    }

    /// Applies an inbound state.
    fn apply(&mut self, state: TaskState) {
        self.state = state;
        if state.is_ack() {
            self.sent = true;
        }
        if state.is_started() {
            self.started = true;
        }
        if state.is_terminal() {
            self.stopped = true;
        }
    }
}

struct ActiveTask {
    serial: u64,
    record: watch::Sender<TaskRecord>,
}

/// Matches asynchronous task updates to waiting callers.
pub struct TaskCorrelator {
    next_id: AtomicU16,
    next_serial: AtomicU64,
    active: Mutex<HashMap<u16, ActiveTask>>,
    purge: watch::Receiver<PurgeSignal>,
    log: Arc<dyn LogSink>,
}

impl TaskCorrelator {
    /// Creates a correlator bound to the session's abort state.
    ///
    /// The first id is derived from the clock so that restarted clients do not
    /// reuse the ids of a previous session.
    #[must_use]
    pub fn new(abort: &AbortState, log: Arc<dyn LogSink>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or(0);
        Self::with_initial_id(abort, log, seed)
    }

    /// Creates a correlator whose first allocated id is `initial_id`.
    #[must_use]
    pub fn with_initial_id(abort: &AbortState, log: Arc<dyn LogSink>, initial_id: u16) -> Self {
        Self {
            next_id: AtomicU16::new(initial_id),
            next_serial: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            purge: abort.subscribe(),
            log,
        }
    }

    /// Allocates the next task id, wrapping at 65536.
    pub fn allocate_task_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a wait for `task_id`.
    ///
    /// Register before sending the command: an update that arrives before the
    /// wait exists is dropped.
    pub fn register(&self, task_id: u16) -> PendingTask<'_> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(TaskRecord::new(task_id));

        let previous = self.active.lock().insert(
            task_id,
            ActiveTask {
                serial,
                record: tx,
            },
        );
        if previous.is_some() {
            tracing::warn!(task_id, "task id reused while a previous wait was active");
        }

        let mut purge = self.purge.clone();
        let epoch = purge.borrow_and_update().epoch();

        PendingTask {
            correlator: self,
            id: task_id,
            serial,
            record: rx,
            purge,
            epoch,
        }
    }

    /// Registers a wait and resolves once the task started.
    pub async fn await_ack(&self, task_id: u16, timeout: Duration) -> Outcome {
        self.register(task_id).ack(timeout).await
    }

    /// Registers a wait and resolves once the task terminated.
    pub async fn await_completion(&self, task_id: u16, timeout: Duration) -> Outcome {
        self.register(task_id).completion(timeout).await
    }

    /// Applies a `Task` envelope.
    ///
    /// Updates for ids with no active wait are ignored, including late or
    /// duplicate responses for tasks that already resolved.
    pub fn on_message(&self, update: &TaskUpdate) {
        {
            let active = self.active.lock();
            let Some(task) = active.get(&update.task_id) else {
                tracing::trace!(task_id = update.task_id, "ignoring update for inactive task");
                return;
            };
            if !update.sub_task {
                task.record.send_modify(|record| record.apply(update.state));
                tracing::debug!(
                    task_id = update.task_id,
                    state = ?update.state,
                    "task state updated"
                );
            }
        }

        if let Some(message) = &update.message {
            self.log
                .log_code(update.level, &format!("{}: {message}", update.device), true);
        }
    }

    /// Returns the number of tasks with an active wait.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Returns a copy of an active task's record.
    #[must_use]
    pub fn record(&self, task_id: u16) -> Option<TaskRecord> {
        self.active
            .lock()
            .get(&task_id)
            .map(|task| *task.record.borrow())
    }

    fn release(&self, task_id: u16, serial: u64) {
        let mut active = self.active.lock();
        if active.get(&task_id).is_some_and(|task| task.serial == serial) {
            active.remove(&task_id);
        }
    }
}

/// A registered wait on one task.
///
/// The task leaves the active set as soon as a wait resolves, or when the
/// handle is dropped.
pub struct PendingTask<'a> {
    correlator: &'a TaskCorrelator,
    id: u16,
    serial: u64,
    record: watch::Receiver<TaskRecord>,
    purge: watch::Receiver<PurgeSignal>,
    epoch: u64,
}

impl PendingTask<'_> {
    /// Returns the task id.
    #[must_use]
    pub const fn id(&self) -> u16 {
        self.id
    }

    /// Returns the latest record.
    #[must_use]
    pub fn record(&self) -> TaskRecord {
        *self.record.borrow()
    }

    /// Waits for the task to start.
    ///
    /// Resolves [`Outcome::Lost`] if nothing arrives within `timeout`,
    /// [`Outcome::Failed`] on `ArgError` or purge, and [`Outcome::Succeeded`]
    /// once the task started.
    pub async fn ack(&mut self, timeout: Duration) -> Outcome {
        let outcome = match self.wait_sent(timeout).await {
            Err(outcome) => outcome,
            Ok(()) => {
                tokio::select! {
                    biased;
                    () = purged(&mut self.purge, self.epoch) => Outcome::Failed,
                    started = self.record.wait_for(|record| record.started) => {
                        if started.is_ok() { Outcome::Succeeded } else { Outcome::Failed }
                    }
                }
            }
        };
        self.finish(outcome)
    }

    /// Waits for the task to terminate.
    ///
    /// Only the ack phase is bounded by `timeout`; once the server answered,
    /// the wait lasts until a terminal state or a purge.
    pub async fn completion(&mut self, timeout: Duration) -> Outcome {
        let outcome = match self.wait_sent(timeout).await {
            Err(outcome) => outcome,
            Ok(()) => {
                tokio::select! {
                    biased;
                    () = purged(&mut self.purge, self.epoch) => Outcome::Failed,
                    done = self.record.wait_for(|record| record.started && record.stopped) => {
                        match done.map(|record| record.state) {
                            Ok(TaskState::Succeed) => Outcome::Succeeded,
                            _ => Outcome::Failed,
                        }
                    }
                }
            }
        };
        self.finish(outcome)
    }

    /// Ack phase shared by both waits. `Ok` means acknowledged without
    /// argument error.
    async fn wait_sent(&mut self, timeout: Duration) -> Result<(), Outcome> {
        let deadline = Instant::now() + timeout;
        tokio::select! {
            biased;
            () = purged(&mut self.purge, self.epoch) => Err(Outcome::Failed),
            sent = self.record.wait_for(|record| record.sent) => {
                match sent.map(|record| record.state) {
                    Ok(TaskState::ArgError) | Err(_) => Err(Outcome::Failed),
                    Ok(_) => Ok(()),
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                self.correlator.log.log(
                    LogLevel::Warning,
                    &format!("Client: task {} timed out, the datagram may be lost", self.id),
                    false,
                );
                Err(Outcome::Lost)
            }
        }
    }

    fn finish(&self, outcome: Outcome) -> Outcome {
        self.correlator.release(self.id, self.serial);
        tracing::debug!(task_id = self.id, ?outcome, "task resolved");
        outcome
    }
}

impl Drop for PendingTask<'_> {
    fn drop(&mut self) {
        self.correlator.release(self.id, self.serial);
    }
}

/// Resolves once the purge signal covers a wait registered at `epoch`.
///
/// A dropped abort state counts as a purge: the session is gone.
async fn purged(purge: &mut watch::Receiver<PurgeSignal>, epoch: u64) {
    let _ = purge.wait_for(|signal| signal.purges(epoch)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use crate::logging::tests::RecordingSink;

    fn correlator(abort: &AbortState) -> TaskCorrelator {
        TaskCorrelator::with_initial_id(abort, Arc::new(RecordingSink::default()), 0)
    }

    fn update(task_id: u16, state: TaskState) -> TaskUpdate {
        TaskUpdate {
            device: "Hand".into(),
            task_id,
            sub_task: false,
            state,
            message: None,
            level: 20,
        }
    }

    #[test]
    fn test_allocate_wraps() {
        let abort = AbortState::new();
        let correlator = TaskCorrelator::with_initial_id(
            &abort,
            Arc::new(RecordingSink::default()),
            u16::MAX - 1,
        );
        assert_eq!(correlator.allocate_task_id(), u16::MAX - 1);
        assert_eq!(correlator.allocate_task_id(), u16::MAX);
        assert_eq!(correlator.allocate_task_id(), 0);
        assert_eq!(correlator.allocate_task_id(), 1);
    }

    #[test]
    fn test_allocate_concurrent_unique() {
        let abort = AbortState::new();
        let correlator = Arc::new(correlator(&abort));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let correlator = Arc::clone(&correlator);
                std::thread::spawn(move || {
                    let mut ids: Vec<u16> = (0..1000).map(|_| correlator.allocate_task_id()).collect();
                    // Each caller sees its own ids in increasing order.
                    assert!(ids.windows(2).all(|w| w[0] < w[1]));
                    ids.sort_unstable();
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} allocated twice");
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn test_record_transitions() {
        let mut record = TaskRecord::new(1);
        record.apply(TaskState::ArgError);
        assert!(record.sent && !record.started && !record.stopped);

        let mut record = TaskRecord::new(2);
        record.apply(TaskState::Start);
        assert!(record.sent && record.started && !record.stopped);
        record.apply(TaskState::Update);
        assert!(record.started && !record.stopped);
        record.apply(TaskState::Succeed);
        assert!(record.stopped);
        assert_eq!(record.state, TaskState::Succeed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_succeeds() {
        let abort = AbortState::new();
        let correlator = correlator(&abort);
        let mut pending = correlator.register(7);

        correlator.on_message(&update(7, TaskState::Start));
        correlator.on_message(&update(7, TaskState::Succeed));

        assert_eq!(
            pending.completion(Duration::from_secs(1)).await,
            Outcome::Succeeded
        );
        assert!(pending.record().stopped);
        assert_eq!(correlator.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_update_succeed_in_flight() {
        let abort = AbortState::new();
        let correlator = Arc::new(correlator(&abort));

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                let mut pending = correlator.register(40);
                let outcome = pending.completion(Duration::from_secs(1)).await;
                (outcome, pending.record())
            })
        };
        tokio::task::yield_now().await;

        for state in [TaskState::Start, TaskState::Update, TaskState::Succeed] {
            tokio::time::sleep(Duration::from_millis(300)).await;
            correlator.on_message(&update(40, state));
        }

        let (outcome, record) = waiter.await.unwrap();
        assert_eq!(outcome, Outcome::Succeeded);
        assert!(record.started && record.stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arg_error_fails_without_start() {
        let abort = AbortState::new();
        let correlator = correlator(&abort);
        let mut pending = correlator.register(12);

        correlator.on_message(&update(12, TaskState::ArgError));

        assert_eq!(
            pending.completion(Duration::from_secs(1)).await,
            Outcome::Failed
        );
        assert!(!pending.record().started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_terminal_state() {
        let abort = AbortState::new();
        let correlator = correlator(&abort);
        let mut pending = correlator.register(5);

        correlator.on_message(&update(5, TaskState::Start));
        correlator.on_message(&update(5, TaskState::Failed));

        assert_eq!(
            pending.completion(Duration::from_secs(1)).await,
            Outcome::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_lost_after_timeout() {
        let abort = AbortState::new();
        let correlator = correlator(&abort);

        let start = Instant::now();
        let outcome = correlator.await_ack(3, Duration::from_secs(1)).await;
        let elapsed = start.elapsed();

        assert_eq!(outcome, Outcome::Lost);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1050));
        assert_eq!(correlator.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_resolves_on_start() {
        let abort = AbortState::new();
        let correlator = correlator(&abort);
        let mut pending = correlator.register(9);

        correlator.on_message(&update(9, TaskState::Start));

        assert_eq!(pending.ack(Duration::from_secs(1)).await, Outcome::Succeeded);
        assert!(!pending.record().stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_but_never_terminated_blocks() {
        let abort = AbortState::new();
        let correlator = correlator(&abort);
        let mut pending = correlator.register(21);

        correlator.on_message(&update(21, TaskState::Start));

        // No bound applies after the ack phase.
        let result = tokio::time::timeout(
            Duration::from_secs(60),
            pending.completion(Duration::from_secs(1)),
        )
        .await;
        assert!(result.is_err());
        assert!(pending.record().started && !pending.record().stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_fails_blocked_waits() {
        let abort = AbortState::new();
        let correlator = Arc::new(correlator(&abort));

        let waiters: Vec<_> = (0..5u16)
            .map(|id| {
                let correlator = Arc::clone(&correlator);
                tokio::spawn(async move {
                    let mut pending = correlator.register(id);
                    if id % 2 == 0 {
                        correlator.on_message(&update(id, TaskState::Start));
                    }
                    pending.completion(Duration::from_secs(1)).await
                })
            })
            .collect();
        tokio::task::yield_now().await;

        let start = Instant::now();
        abort.purge_once();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Outcome::Failed);
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        // A purge is transient: new waits are not affected.
        let mut pending = correlator.register(100);
        correlator.on_message(&update(100, TaskState::Succeed));
        assert_eq!(
            pending.completion(Duration::from_secs(1)).await,
            Outcome::Succeeded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sealed_purge_fails_new_waits_immediately() {
        let abort = AbortState::new();
        let correlator = correlator(&abort);
        abort.seal();

        let start = Instant::now();
        assert_eq!(
            correlator.await_completion(1, Duration::from_secs(1)).await,
            Outcome::Failed
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_updates_ignored() {
        let abort = AbortState::new();
        let correlator = correlator(&abort);

        correlator.on_message(&update(77, TaskState::Succeed));
        assert_eq!(correlator.active_count(), 0);

        let mut pending = correlator.register(77);
        assert!(!pending.record().sent);
        correlator.on_message(&update(77, TaskState::Start));
        correlator.on_message(&update(77, TaskState::Succeed));
        assert_eq!(
            pending.completion(Duration::from_secs(1)).await,
            Outcome::Succeeded
        );

        // Duplicate after resolution is a no-op.
        correlator.on_message(&update(77, TaskState::Failed));
        assert!(correlator.record(77).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_task_forwards_message_only() {
        let abort = AbortState::new();
        let sink = Arc::new(RecordingSink::default());
        let correlator = TaskCorrelator::with_initial_id(&abort, sink.clone(), 0);
        let _pending = correlator.register(4);

        let mut sub = update(4, TaskState::Succeed);
        sub.sub_task = true;
        sub.message = Some("finger closed".into());
        sub.level = 30;
        correlator.on_message(&sub);

        let record = correlator.record(4).unwrap();
        assert!(!record.sent);
        let lines = sink.lines.lock();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], (LogLevel::Warning, "Hand: finger closed".into(), true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_wait_leaves_active_set() {
        let abort = AbortState::new();
        let correlator = correlator(&abort);
        {
            let _pending = correlator.register(8);
            assert_eq!(correlator.active_count(), 1);
        }
        assert_eq!(correlator.active_count(), 0);
    }
}
