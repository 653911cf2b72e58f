//! Command handlers for DexHand operations.
//!
//! Every command follows the same path: allocate a task id, register a wait,
//! send the datagram, then wait for an ack or for completion depending on the
//! command. Ownership-gated commands additionally wait for a fresh heartbeat so
//! they are only issued while the link is known to be up.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::abort::AbortState;
use crate::error::{Error, Result};
use crate::liveness::Liveness;
use crate::logging::{LogLevel, LogSink};
use crate::protocol::{Args, CommandEnvelope, CommandKind, Device, Outcome, WaitMode};
use crate::task::TaskCorrelator;
use crate::transport::Transport;

/// Default homing speed in mm/s.
pub const DEFAULT_HOME_SPEED: f64 = 4.0;
/// Default contact speed in mm/s.
pub const DEFAULT_CONTACT_SPEED: f64 = 8.0;
/// Default contact preload force in N.
pub const DEFAULT_PRELOAD_FORCE: f64 = 1.0;
/// Default grasp force in N.
pub const DEFAULT_GRASP_FORCE: f64 = 5.0;
/// Default grasp load time in s.
pub const DEFAULT_LOAD_TIME: f64 = 1.0;
/// Default `Goto` speed limit in mm/s.
pub const DEFAULT_MAX_SPEED: f64 = 16.0;
/// Default `Goto` acceleration limit in mm/s².
pub const DEFAULT_MAX_ACC: f64 = 20.0;
/// Default contact force limit while moving, in N.
pub const DEFAULT_MAX_FORCE: f64 = 1.0;
/// Default stiffness when the estimator is off, in N/mm.
pub const DEFAULT_STIFFNESS: f64 = 0.04;

/// Mass/spring/damper parameters for [`CommandHandler::impedance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpedanceParams {
    /// Mass in kg, `[0, 300)`.
    pub mass: f64,
    /// Damping in N/(mm/s), `[0, 0.15)`.
    pub damping: f64,
    /// Stiffness in N/mm, `[0, 1.5)`.
    pub stiffness: f64,
    /// Spring rest position in mm, `[0, 50]`.
    pub rest_position: f64,
}

impl Default for ImpedanceParams {
    fn default() -> Self {
        Self {
            mass: 1.0,
            damping: 0.001,
            stiffness: 0.06,
            rest_position: 10.0,
        }
    }
}

/// Force PID gains for [`CommandHandler::set_pid_param`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidParams {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Integral clamp.
    pub max_integral: f64,
}

impl Default for PidParams {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.0016,
            max_integral: 60.0,
        }
    }
}

/// Optional fast approach before a [`CommandHandler::contact`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuickMove {
    /// Approach speed in mm/s.
    pub speed: f64,
    /// Approach end position in mm.
    pub position: f64,
}

/// Command handler for DexHand operations.
pub struct CommandHandler<T> {
    transport: Arc<T>,
    correlator: Arc<TaskCorrelator>,
    liveness: Arc<Liveness>,
    abort: Arc<AbortState>,
    log: Arc<dyn LogSink>,
    closed: CancellationToken,
    ack_timeout: Duration,
}

impl<T: Transport> CommandHandler<T> {
    /// Creates a new command handler.
    #[must_use]
    pub fn new(
        transport: Arc<T>,
        correlator: Arc<TaskCorrelator>,
        liveness: Arc<Liveness>,
        abort: Arc<AbortState>,
        log: Arc<dyn LogSink>,
        closed: CancellationToken,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            correlator,
            liveness,
            abort,
            log,
            closed,
            ack_timeout,
        }
    }

    /// Returns the transport.
    #[must_use]
    pub const fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Sends a command and waits according to its kind.
    pub async fn submit(&self, device: Device, kind: CommandKind, args: Args) -> Result<Outcome> {
        self.submit_with(device, kind, args, kind.wait_mode()).await
    }

    /// Sends a command and waits in the given mode.
    ///
    /// During an emergency abort only `Halt` and `Release` are sent; anything
    /// else resolves [`Outcome::Failed`] without touching the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LivenessFailure`] once the watchdog fired,
    /// [`Error::SessionClosed`] once the session ended, and transport errors
    /// from the send itself.
    pub async fn submit_with(
        &self,
        device: Device,
        kind: CommandKind,
        args: Args,
        mode: WaitMode,
    ) -> Result<Outcome> {
        let in_emergency = self.abort.in_emergency();
        if self.refused_in_emergency(kind) {
            return Ok(Outcome::Failed);
        }
        if !in_emergency {
            if let Some(ticks) = self.liveness.failure() {
                return Err(Error::LivenessFailure { ticks });
            }
            if self.closed.is_cancelled() {
                return Err(Error::SessionClosed);
            }
        }

        // The abort path must not stall on heartbeats; the link state no
        // longer matters once the hand is being stopped.
        if kind.requires_heartbeat() && !in_emergency {
            tokio::select! {
                () = self.liveness.await_recent_heartbeat() => {}
                () = self.closed.cancelled() => return Err(Error::SessionClosed),
            }
        }

        let task_id = self.correlator.allocate_task_id();
        let mut pending = self.correlator.register(task_id);
        let data = CommandEnvelope::new(device, kind, args, task_id).encode()?;

        // An abort may have started while this call waited at the gate.
        if self.refused_in_emergency(kind) {
            return Ok(Outcome::Failed);
        }

        tracing::debug!(task_id, %device, %kind, "sending command");
        self.transport.send(data).await?;

        let outcome = match mode {
            WaitMode::Ack => pending.ack(self.ack_timeout).await,
            WaitMode::Completion => pending.completion(self.ack_timeout).await,
        };
        if outcome != Outcome::Succeeded {
            tracing::debug!(task_id, %kind, ?outcome, "command did not succeed");
        }
        Ok(outcome)
    }

    /// Logs and returns true if `kind` may not be sent during an abort.
    fn refused_in_emergency(&self, kind: CommandKind) -> bool {
        if !self.abort.in_emergency() || kind.allowed_in_emergency() {
            return false;
        }
        self.log.log(
            LogLevel::Warning,
            &format!("Client: {kind} was not sent, an emergency abort is in progress"),
            false,
        );
        true
    }

    /// Sends a keep-alive without waiting for its task.
    ///
    /// Nothing is sent once an emergency abort started, so a late keep-alive
    /// cannot take back the hand the abort releases. Returns whether it was
    /// sent.
    pub(crate) async fn send_heartbeat(&self) -> Result<bool> {
        if self.abort.in_emergency() {
            return Ok(false);
        }
        let task_id = self.correlator.allocate_task_id();
        let data =
            CommandEnvelope::new(Device::Hand, CommandKind::Acquire, Args::new(), task_id).encode()?;
        self.transport.send(data).await?;
        Ok(true)
    }

    // ==================== Server Commands ====================

    /// Starts the server.
    pub async fn start_server(&self) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Try to start DexHand server.", false);
        self.submit(Device::Server, CommandKind::Start, Args::new()).await
    }

    /// Stops the server. The server halts and releases the hand itself.
    pub async fn stop_server(&self) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Stop DexHand and server.", false);
        self.submit(Device::Server, CommandKind::Stop, Args::new()).await
    }

    // ==================== Ownership ====================

    /// Acquires control of the hand.
    ///
    /// On first use the server initializes the hardware (homing and force
    /// calibration). Fails while another client holds control.
    pub async fn acquire_hand(&self) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Acquire DexHand control.", false);
        let outcome = self
            .submit(Device::Hand, CommandKind::Acquire, Args::new())
            .await?;
        if outcome.is_success() {
            self.liveness.set_owned(true);
        }
        Ok(outcome)
    }

    /// Releases control of the hand.
    ///
    /// Resolves `Failed` without sending anything if control is not held.
    pub async fn release_hand(&self) -> Result<Outcome> {
        if !self.liveness.is_owned() {
            self.log.log(
                LogLevel::Warning,
                "Client has not acquired DexHand control access.",
                false,
            );
            return Ok(Outcome::Failed);
        }
        self.log.log(LogLevel::Warning, "Client: Release DexHand.", false);
        let outcome = self
            .submit(Device::Hand, CommandKind::Release, Args::new())
            .await?;
        if outcome.is_success() {
            self.liveness.set_owned(false);
        }
        Ok(outcome)
    }

    // ==================== Hand Commands ====================

    /// Finds the gripper zero point.
    pub async fn set_home(&self, goal_speed: f64) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Set DexHand's position zeropoint.", false);
        self.submit(
            Device::Hand,
            CommandKind::SetHome,
            args([("goal_speed", goal_speed.into())]),
        )
        .await
    }

    /// Calibrates the force sensor zero points.
    pub async fn calibrate_force_zero(&self) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Calibrate DexHand force zeropoints.", false);
        self.submit(Device::Hand, CommandKind::CalibrateZero, Args::new())
            .await
    }

    /// Closes until an object is contacted with `preload_force`.
    ///
    /// With `quick_move`, the gripper first moves fast to the given position.
    pub async fn contact(
        &self,
        contact_speed: f64,
        preload_force: f64,
        quick_move: Option<QuickMove>,
    ) -> Result<Outcome> {
        self.submit(
            Device::Hand,
            CommandKind::Contact,
            args([
                ("contact_speed", contact_speed.into()),
                ("preload_force", preload_force.into()),
                ("quick_move_speed", quick_move.map_or(Value::Null, |q| q.speed.into())),
                ("quick_move_pos", quick_move.map_or(Value::Null, |q| q.position.into())),
            ]),
        )
        .await
    }

    /// Ramps the grip force to `goal_force` over `load_time` seconds.
    pub async fn grasp(&self, goal_force: f64, load_time: f64) -> Result<Outcome> {
        self.submit(
            Device::Hand,
            CommandKind::Grasp,
            args([
                ("goal_force", goal_force.into()),
                ("load_time", load_time.into()),
            ]),
        )
        .await
    }

    /// Sets the grip force directly. Returns once the servo started.
    pub async fn force_servo(&self, goal_force: f64) -> Result<Outcome> {
        self.submit(
            Device::Hand,
            CommandKind::ForceServo,
            args([("goal_force", goal_force.into())]),
        )
        .await
    }

    /// Planned move to `goal_pos`, stopping if contact force exceeds `max_f`.
    pub async fn goto(&self, goal_pos: f64, max_speed: f64, max_acc: f64, max_f: f64) -> Result<Outcome> {
        self.submit(
            Device::Hand,
            CommandKind::Goto,
            args([
                ("goal_pos", goal_pos.into()),
                ("max_speed", max_speed.into()),
                ("max_acc", max_acc.into()),
                ("max_f", max_f.into()),
            ]),
        )
        .await
    }

    /// Unplanned position servo. Returns once the servo started.
    pub async fn pos_servo(&self, goal_pos: f64, max_f: f64) -> Result<Outcome> {
        self.submit(
            Device::Hand,
            CommandKind::PosServo,
            args([("goal_pos", goal_pos.into()), ("max_f", max_f.into())]),
        )
        .await
    }

    /// Emulates a mass/spring/damper system.
    pub async fn impedance(&self, params: ImpedanceParams) -> Result<Outcome> {
        self.submit(
            Device::Hand,
            CommandKind::Impedance,
            args([
                ("M", params.mass.into()),
                ("B", params.damping.into()),
                ("K", params.stiffness.into()),
                ("x0", params.rest_position.into()),
            ]),
        )
        .await
    }

    /// Moves at constant speed.
    pub async fn set_speed(&self, goal_speed: f64) -> Result<Outcome> {
        self.submit(
            Device::Hand,
            CommandKind::SetSpeed,
            args([("goal_speed", goal_speed.into())]),
        )
        .await
    }

    /// Sets the force weighting gains. The second gain defaults to the first.
    pub async fn set_weight_param(&self, gain1: f64, gain2: Option<f64>) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Setting DexHand force weight parameters.", false);
        self.submit(
            Device::Hand,
            CommandKind::SetWeightParam,
            args([
                ("weightgain1", gain1.into()),
                ("weightgain2", gain2.unwrap_or(gain1).into()),
            ]),
        )
        .await
    }

    /// Sets the force PID gains.
    pub async fn set_pid_param(&self, params: PidParams) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Setting DexHand force PID parameters.", false);
        self.submit(
            Device::Hand,
            CommandKind::SetPidParam,
            args([
                ("Kp", params.kp.into()),
                ("Ki", params.ki.into()),
                ("maxi", params.max_integral.into()),
            ]),
        )
        .await
    }

    /// Switches stiffness estimation on or off.
    pub async fn switch_k_mode(&self, use_estimator: bool, default_k: f64) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Switch stiffness estimation mode.", false);
        self.submit(
            Device::Hand,
            CommandKind::SwitchKMode,
            args([
                ("use_estimator", use_estimator.into()),
                ("default_k", default_k.into()),
            ]),
        )
        .await
    }

    /// Stops all motion and drops the server's queued tasks. Any client may
    /// send it.
    pub async fn halt(&self) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Halt DexHand.", false);
        self.submit(Device::Hand, CommandKind::Halt, Args::new()).await
    }

    /// Clears a latched hardware error.
    pub async fn clear_hand_error(&self) -> Result<Outcome> {
        self.log.log(LogLevel::Info, "Client: Clear Hand error signal.", false);
        self.submit(Device::Hand, CommandKind::ClearError, Args::new())
            .await
    }
}

fn args<const N: usize>(pairs: [(&str, Value); N]) -> Args {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::logging::tests::RecordingSink;
    use crate::protocol::{TaskState, TaskUpdate};
    use crate::transport::tests::RecordingTransport;

    struct Fixture {
        commands: Arc<CommandHandler<RecordingTransport>>,
        transport: Arc<RecordingTransport>,
        correlator: Arc<TaskCorrelator>,
        liveness: Arc<Liveness>,
        abort: Arc<AbortState>,
        closed: CancellationToken,
    }

    fn fixture() -> Fixture {
        let abort = Arc::new(AbortState::new());
        let sink = Arc::new(RecordingSink::default());
        let liveness = Arc::new(Liveness::new(10, Duration::from_millis(500)));
        let correlator = Arc::new(TaskCorrelator::with_initial_id(&abort, sink.clone(), 7));
        let transport = Arc::new(RecordingTransport::default());
        let closed = CancellationToken::new();
        let commands = Arc::new(CommandHandler::new(
            Arc::clone(&transport),
            Arc::clone(&correlator),
            Arc::clone(&liveness),
            Arc::clone(&abort),
            sink,
            closed.clone(),
            Duration::from_secs(1),
        ));
        Fixture {
            commands,
            transport,
            correlator,
            liveness,
            abort,
            closed,
        }
    }

    fn respond(correlator: &TaskCorrelator, task_id: u16, states: &[TaskState]) {
        for state in states {
            correlator.on_message(&TaskUpdate {
                device: "Hand".into(),
                task_id,
                sub_task: false,
                state: *state,
                message: None,
                level: 20,
            });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sets_ownership() {
        let f = fixture();
        let waiter = {
            let commands = Arc::clone(&f.commands);
            tokio::spawn(async move { commands.acquire_hand().await })
        };

        let sent = f.transport.wait_for_sent(1).await;
        let command = &sent[0].command;
        assert_eq!(command.device, Device::Hand);
        assert_eq!(command.kind, CommandKind::Acquire);
        assert_eq!(command.task_id, 7);

        respond(&f.correlator, 7, &[TaskState::Start, TaskState::Succeed]);
        assert_eq!(waiter.await.unwrap().unwrap(), Outcome::Succeeded);
        assert!(f.liveness.is_owned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_command_times_out() {
        let f = fixture();
        let start = tokio::time::Instant::now();
        assert_eq!(f.commands.halt().await.unwrap(), Outcome::Lost);
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(!f.liveness.is_owned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arg_error_is_failed() {
        let f = fixture();
        let waiter = {
            let commands = Arc::clone(&f.commands);
            tokio::spawn(async move { commands.grasp(DEFAULT_GRASP_FORCE, -1.0).await })
        };
        let sent = f.transport.wait_for_sent(1).await;
        assert_eq!(sent[0].command.args["load_time"], -1.0);

        respond(&f.correlator, sent[0].command.task_id, &[TaskState::ArgError]);
        assert_eq!(waiter.await.unwrap().unwrap(), Outcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_servo_commands_return_on_start() {
        let f = fixture();
        let waiter = {
            let commands = Arc::clone(&f.commands);
            tokio::spawn(async move { commands.pos_servo(12.0, DEFAULT_MAX_FORCE).await })
        };
        let sent = f.transport.wait_for_sent(1).await;
        respond(&f.correlator, sent[0].command.task_id, &[TaskState::Start]);
        assert_eq!(waiter.await.unwrap().unwrap(), Outcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_argument_encoding() {
        let f = fixture();
        let commands = Arc::clone(&f.commands);
        tokio::spawn(async move {
            let _ = commands.contact(DEFAULT_CONTACT_SPEED, DEFAULT_PRELOAD_FORCE, None).await;
            let _ = commands.set_weight_param(0.5, None).await;
            let _ = commands.impedance(ImpedanceParams::default()).await;
            let _ = commands.set_pid_param(PidParams::default()).await;
        });

        let sent = loop {
            let sent = f.transport.wait_for_sent(f.transport.commands().len() + 1).await;
            if let Some(last) = sent.last() {
                respond(&f.correlator, last.command.task_id, &[TaskState::Start, TaskState::Succeed]);
            }
            if sent.len() == 4 {
                break sent;
            }
        };

        let contact = &sent[0].command.args;
        assert_eq!(contact["contact_speed"], 8.0);
        assert!(contact["quick_move_pos"].is_null());
        assert_eq!(sent[1].command.args["weightgain2"], 0.5);
        assert_eq!(sent[2].command.args["x0"], 10.0);
        assert_eq!(sent[3].command.kind, CommandKind::SetPidParam);
        assert_eq!(sent[3].command.args["maxi"], 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gated_command_waits_for_heartbeat() {
        let f = fixture();
        f.liveness.set_owned(true);

        let waiter = {
            let commands = Arc::clone(&f.commands);
            tokio::spawn(async move { commands.set_speed(5.0).await })
        };
        tokio::task::yield_now().await;
        assert!(f.transport.commands().is_empty());

        f.liveness.record_heartbeat(tokio::time::Instant::now());
        let sent = f.transport.wait_for_sent(1).await;
        respond(&f.correlator, sent[0].command.task_id, &[TaskState::Start]);
        assert_eq!(waiter.await.unwrap().unwrap(), Outcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_without_ownership() {
        let f = fixture();
        assert_eq!(f.commands.release_hand().await.unwrap(), Outcome::Failed);
        assert!(f.transport.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_blocks_motion_commands() {
        let f = fixture();
        assert!(f.abort.begin());
        assert_eq!(f.commands.goto(1.0, 1.0, 1.0, 1.0).await.unwrap(), Outcome::Failed);
        assert!(f.transport.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_failure_is_an_error() {
        let f = fixture();
        let liveness = Liveness::new(1, Duration::from_millis(500));
        liveness.tick();
        assert!(liveness.failure().is_some());

        // Same checks, through a handler bound to the failed state.
        let commands = CommandHandler::new(
            Arc::clone(&f.transport),
            Arc::clone(&f.correlator),
            Arc::new(liveness),
            Arc::clone(&f.abort),
            Arc::new(RecordingSink::default()),
            f.closed.clone(),
            Duration::from_secs(1),
        );
        assert!(matches!(
            commands.halt().await,
            Err(Error::LivenessFailure { ticks: 1 })
        ));

        f.closed.cancel();
        assert!(matches!(f.commands.halt().await, Err(Error::SessionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_is_fire_and_forget() {
        let f = fixture();
        assert!(f.commands.send_heartbeat().await.unwrap());
        let sent = f.transport.commands();
        assert_eq!(sent[0].command.kind, CommandKind::Acquire);
        assert_eq!(f.correlator.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_during_emergency() {
        let f = fixture();
        f.liveness.set_owned(true);
        assert!(f.abort.begin());
        assert!(!f.commands.send_heartbeat().await.unwrap());
        assert!(f.transport.commands().is_empty());
    }
}
