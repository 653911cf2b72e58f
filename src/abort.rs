//! Emergency abort.
//!
//! An abort stops the hand and hands control back to the server before the
//! session ends. It can be triggered by a shutdown signal, a panic, an explicit
//! request, or race with the watchdog; whichever arrives first runs the
//! sequence and every later trigger is a no-op.
//!
//! The sequence:
//! 1. skip if the client never acquired the hand, or an abort is running
//! 2. enter emergency mode: only `Halt` and `Release` may be sent from now on
//! 3. purge: every blocked task wait resolves `Failed`
//! 4. send `Halt`, then `Release`, each waited to completion
//! 5. seal: any wait registered from now on fails immediately
//! 6. close the session (and optionally exit the process)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::commands::CommandHandler;
use crate::error::Result;
use crate::event::{Event, EventDispatcher};
use crate::liveness::Liveness;
use crate::protocol::Outcome;
use crate::transport::Transport;

/// Purge signal observed by every task wait.
///
/// A brief purge bumps the epoch, failing the waits registered before it. A
/// sealed signal fails every wait, including ones registered later. Waits
/// compare epochs instead of watching a flag, so a purge cannot be missed by
/// a waiter that was not scheduled while it was raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSignal {
    epoch: u64,
    sealed: bool,
}

impl PurgeSignal {
    /// Current epoch.
    #[must_use]
    pub const fn epoch(self) -> u64 {
        self.epoch
    }

    /// Returns true once the signal is permanent.
    #[must_use]
    pub const fn is_sealed(self) -> bool {
        self.sealed
    }

    /// Returns true if a wait registered at `epoch` must resolve `Failed`.
    #[must_use]
    pub const fn purges(self, epoch: u64) -> bool {
        self.sealed || self.epoch != epoch
    }
}

/// Shared abort state.
pub struct AbortState {
    in_emergency: AtomicBool,
    purge: watch::Sender<PurgeSignal>,
}

impl Default for AbortState {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortState {
    /// Creates a state with no abort in progress.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_emergency: AtomicBool::new(false),
            purge: watch::Sender::new(PurgeSignal::default()),
        }
    }

    /// Returns true once an abort started.
    #[must_use]
    pub fn in_emergency(&self) -> bool {
        self.in_emergency.load(Ordering::Acquire)
    }

    /// Enters emergency mode. Returns false if it was already entered.
    pub fn begin(&self) -> bool {
        self.in_emergency
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Fails every wait registered so far.
    pub fn purge_once(&self) {
        self.purge.send_modify(|signal| signal.epoch = signal.epoch.wrapping_add(1));
    }

    /// Fails every current and future wait.
    pub fn seal(&self) {
        self.purge.send_modify(|signal| signal.sealed = true);
    }

    /// Returns true once sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.purge.borrow().sealed
    }

    /// Subscribes to the purge signal.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PurgeSignal> {
        self.purge.subscribe()
    }
}

/// Why an abort was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The session's shutdown token was cancelled (signal, panic, or the
    /// application).
    Shutdown,
    /// Explicit call to [`EmergencyAbort::trigger`].
    Requested,
    /// The watchdog fired.
    LivenessFailure,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shutdown"),
            Self::Requested => f.write_str("requested"),
            Self::LivenessFailure => f.write_str("liveness failure"),
        }
    }
}

/// Result of a trigger.
#[derive(Debug)]
pub enum AbortOutcome {
    /// The client never held control; nothing to stop.
    NotOwned,
    /// Another trigger already ran or is running the sequence.
    AlreadyAborting,
    /// The sequence ran.
    Completed {
        /// Outcome of `Halt`.
        halt: Result<Outcome>,
        /// Outcome of `Release`.
        release: Result<Outcome>,
    },
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The watchdog fired.
    LivenessFailure { ticks: u32 },
    /// An emergency abort ran.
    Aborted(AbortReason),
    /// The session was closed without an abort.
    Closed,
}

/// Runs the abort sequence and ends the session.
pub struct EmergencyAbort<T> {
    state: Arc<AbortState>,
    liveness: Arc<Liveness>,
    commands: Arc<CommandHandler<T>>,
    dispatcher: EventDispatcher,
    closed: CancellationToken,
    end: Mutex<Option<SessionEnd>>,
    exit_process: bool,
}

impl<T: Transport> EmergencyAbort<T> {
    /// Creates a coordinator.
    ///
    /// `closed` is cancelled when the session ends. With `exit_process` set,
    /// the process exits once the sequence finished.
    #[must_use]
    pub fn new(
        state: Arc<AbortState>,
        liveness: Arc<Liveness>,
        commands: Arc<CommandHandler<T>>,
        dispatcher: EventDispatcher,
        closed: CancellationToken,
        exit_process: bool,
    ) -> Self {
        Self {
            state,
            liveness,
            commands,
            dispatcher,
            closed,
            end: Mutex::new(None),
            exit_process,
        }
    }

    /// Runs the abort sequence.
    ///
    /// Safe to call from any number of tasks at once; exactly one runs the
    /// sequence.
    pub async fn trigger(&self, reason: AbortReason) -> AbortOutcome {
        tracing::info!(%reason, "emergency abort requested");

        if !self.liveness.is_owned() {
            tracing::info!("hand not acquired, nothing to stop");
            return AbortOutcome::NotOwned;
        }
        if !self.state.begin() {
            tracing::debug!("emergency abort already running");
            return AbortOutcome::AlreadyAborting;
        }

        self.state.purge_once();

        let halt = self.commands.halt().await;
        if !matches!(halt, Ok(Outcome::Succeeded)) {
            tracing::error!(?halt, "halt during emergency abort did not succeed");
        }
        let release = self.commands.release_hand().await;
        if !matches!(release, Ok(Outcome::Succeeded)) {
            tracing::error!(?release, "release during emergency abort did not succeed");
        }

        self.dispatcher.dispatch(Event::Aborted { reason });
        self.terminate(SessionEnd::Aborted(reason));

        if self.exit_process {
            tracing::info!("exiting process after emergency abort");
            std::process::exit(0);
        }

        AbortOutcome::Completed { halt, release }
    }

    /// Ends the session without the halt/release sequence.
    ///
    /// Seals the purge signal and closes the session. Only the first call
    /// records `end`.
    pub fn terminate(&self, end: SessionEnd) {
        {
            let mut recorded = self.end.lock();
            if recorded.is_none() {
                *recorded = Some(end);
            }
        }
        self.state.seal();
        self.closed.cancel();
    }

    /// Returns how the session ended, once it did.
    #[must_use]
    pub fn session_end(&self) -> Option<SessionEnd> {
        *self.end.lock()
    }

    /// Returns the shared abort state.
    #[must_use]
    pub fn state(&self) -> &Arc<AbortState> {
        &self.state
    }
}

/// Returns a token cancelled on the first termination signal.
///
/// On Unix this covers SIGINT, SIGTERM and SIGHUP; elsewhere Ctrl-C. Must be
/// called from within a Tokio runtime.
#[must_use]
pub fn shutdown_on_signals() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("termination signal received");
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut streams = Vec::new();
    for kind in [SignalKind::interrupt(), SignalKind::terminate(), SignalKind::hangup()] {
        match signal(kind) {
            Ok(stream) => streams.push(stream),
            Err(e) => tracing::warn!("cannot install signal handler: {e}"),
        }
    }
    if streams.is_empty() {
        return std::future::pending().await;
    }

    let waits = streams
        .iter_mut()
        .map(|stream| Box::pin(stream.recv()))
        .collect::<Vec<_>>();
    futures::future::select_all(waits).await;
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("cannot install signal handler: {e}");
        std::future::pending::<()>().await;
    }
}

/// Cancels `token` when any thread panics, then runs the previous hook.
pub fn cancel_on_panic(token: CancellationToken) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        token.cancel();
        previous(info);
    }));
}
