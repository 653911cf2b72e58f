//! Main [`DexHand`] session implementation.
//!
//! A session owns the two sockets and the background tasks that make the
//! protocol work:
//! - a receive loop per socket, feeding the router
//! - the telemetry worker, applying queued frames to snapshots
//! - the heartbeat/watchdog ticker
//! - a supervisor that runs the emergency abort when the shutdown token fires
//!
//! The session ends on liveness failure, after an emergency abort, or on
//! [`DexHand::disconnect`]. Dropping the session stops every task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::abort::{AbortOutcome, AbortReason, AbortState, EmergencyAbort, SessionEnd};
use crate::commands::CommandHandler;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::event::{Event, EventDispatcher, EventFilter, Subscription};
use crate::liveness::{self, Liveness};
use crate::logging::{LogSink, TracingSink};
use crate::router::Router;
use crate::task::TaskCorrelator;
use crate::telemetry::{Category, Snapshot, SnapshotCallback, SnapshotKey, TelemetryUnpacker};
use crate::transport::{self, MulticastReceiver, Transport, UdpTransport};

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 256;

/// Optional hooks installed when a session starts.
#[derive(Default, Clone)]
pub struct SessionHooks {
    /// Called once per accepted telemetry frame.
    pub on_snapshot: Option<SnapshotCallback>,
    /// Destination for device and client log lines. Defaults to `tracing`.
    pub log: Option<Arc<dyn LogSink>>,
}

/// Client session for a DexHand gripper.
pub struct DexHand<T> {
    config: ClientConfig,
    dispatcher: EventDispatcher,
    commands: Arc<CommandHandler<T>>,
    correlator: Arc<TaskCorrelator>,
    liveness: Arc<Liveness>,
    unpacker: Arc<TelemetryUnpacker>,
    router: Arc<Router>,
    abort: Arc<EmergencyAbort<T>>,
    closed: CancellationToken,

    // Keeps the group membership for the session's lifetime.
    telemetry: Option<MulticastReceiver>,

    // Background tasks
    tasks: Vec<JoinHandle<()>>,
}

impl DexHand<UdpTransport> {
    /// Connects to a server over UDP.
    ///
    /// Cancelling `shutdown` runs the emergency abort and ends the session;
    /// see [`crate::abort::shutdown_on_signals`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a socket cannot
    /// be set up.
    pub async fn connect(config: ClientConfig, shutdown: CancellationToken) -> Result<Self> {
        Self::connect_with(config, shutdown, SessionHooks::default()).await
    }

    /// Connects to a server over UDP with custom hooks.
    pub async fn connect_with(
        config: ClientConfig,
        shutdown: CancellationToken,
        hooks: SessionHooks,
    ) -> Result<Self> {
        config.validate()?;

        let transport =
            UdpTransport::bind(&config.host, config.port, config.recv_buffer_size).await?;
        let telemetry = MulticastReceiver::join(
            config.multicast_group,
            config.telemetry_port,
            transport.peer(),
            config.recv_buffer_size,
        )
        .await?;

        let unicast = transport.socket();
        let multicast = telemetry.socket();

        let mut hand = Self::start(transport, config, shutdown, hooks)?;
        hand.spawn_receive_loop(unicast, "unicast");
        hand.spawn_receive_loop(multicast, "multicast");
        hand.telemetry = Some(telemetry);

        tracing::info!(host = %hand.config.host, port = hand.config.port, "connected");
        Ok(hand)
    }

    /// Returns the joined telemetry receiver.
    #[must_use]
    pub const fn telemetry_receiver(&self) -> Option<&MulticastReceiver> {
        self.telemetry.as_ref()
    }
}

impl<T: Transport + 'static> DexHand<T> {
    /// Starts a session over a custom transport.
    ///
    /// No receive loops are spawned; inbound datagrams are fed through
    /// [`DexHand::route_datagram`]. Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn start(
        transport: T,
        config: ClientConfig,
        shutdown: CancellationToken,
        hooks: SessionHooks,
    ) -> Result<Self> {
        config.validate()?;

        let log: Arc<dyn LogSink> = hooks
            .log
            .unwrap_or_else(|| Arc::new(TracingSink::new(config.ignore_own_info)));
        let dispatcher = EventDispatcher::new(EVENT_CAPACITY);
        let closed = CancellationToken::new();

        let abort_state = Arc::new(AbortState::new());
        let liveness = Arc::new(Liveness::new(
            config.watchdog_threshold,
            config.heartbeat_freshness,
        ));
        let correlator = Arc::new(TaskCorrelator::new(&abort_state, Arc::clone(&log)));

        let commands = Arc::new(CommandHandler::new(
            Arc::new(transport),
            Arc::clone(&correlator),
            Arc::clone(&liveness),
            Arc::clone(&abort_state),
            Arc::clone(&log),
            closed.clone(),
            config.ack_timeout,
        ));
        let abort = Arc::new(EmergencyAbort::new(
            abort_state,
            Arc::clone(&liveness),
            Arc::clone(&commands),
            dispatcher.clone(),
            closed.clone(),
            config.exit_process_on_abort,
        ));

        let unpacker = Arc::new(TelemetryUnpacker::new(
            config.telemetry,
            Arc::clone(&liveness),
            Arc::clone(&log),
            Some(snapshot_events(dispatcher.clone(), hooks.on_snapshot)),
        ));
        let (telemetry_tx, telemetry_rx) = broadcast::channel(config.telemetry_queue);
        let router = Arc::new(Router::new(
            Arc::clone(&correlator),
            telemetry_tx,
            log,
            dispatcher.clone(),
        ));

        let mut tasks = Vec::with_capacity(5);

        tasks.push(tokio::spawn(
            Arc::clone(&unpacker).run(telemetry_rx, closed.clone()),
        ));

        // Heartbeat/watchdog
        {
            let liveness = Arc::clone(&liveness);
            let commands = Arc::clone(&commands);
            let abort = Arc::clone(&abort);
            let dispatcher = dispatcher.clone();
            let closed = closed.clone();
            let period = config.heartbeat_period;
            tasks.push(tokio::spawn(async move {
                if let Some(ticks) = liveness::run_heartbeat(liveness, commands, period, closed).await {
                    dispatcher.dispatch(Event::LivenessLost { ticks });
                    abort.terminate(SessionEnd::LivenessFailure { ticks });
                }
            }));
        }

        // Supervisor
        {
            let abort = Arc::clone(&abort);
            let dispatcher = dispatcher.clone();
            let closed = closed.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        if matches!(
                            abort.trigger(AbortReason::Shutdown).await,
                            AbortOutcome::NotOwned
                        ) {
                            abort.terminate(SessionEnd::Closed);
                        }
                    }
                    () = closed.cancelled() => {}
                }
                tracing::info!(end = ?abort.session_end(), "session ended");
                dispatcher.dispatch(Event::Disconnected);
            }));
        }

        dispatcher.dispatch(Event::Connected);

        Ok(Self {
            config,
            dispatcher,
            commands,
            correlator,
            liveness,
            unpacker,
            router,
            abort,
            closed,
            telemetry: None,
            tasks,
        })
    }

    fn spawn_receive_loop(&mut self, socket: Arc<UdpSocket>, channel: &'static str) {
        let router = Arc::clone(&self.router);
        let closed = self.closed.clone();
        self.tasks.push(tokio::spawn(async move {
            // Errors are logged by the loop itself.
            let _ = transport::receive_loop(socket, channel, closed, |data, from| {
                router.handle(data, from);
            })
            .await;
        }));
    }

    /// Routes one inbound datagram as if it arrived on a socket.
    pub fn route_datagram(&self, data: &[u8], from: SocketAddr) {
        self.router.handle(data, from);
    }

    /// Returns the session configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the command handler.
    #[must_use]
    pub fn commands(&self) -> &CommandHandler<T> {
        &self.commands
    }

    /// Returns the task correlator.
    #[must_use]
    pub fn correlator(&self) -> &TaskCorrelator {
        &self.correlator
    }

    /// Returns the liveness state.
    #[must_use]
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Returns true while the client holds control of the hand.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.liveness.is_owned()
    }

    /// Returns the latest hand snapshot.
    #[must_use]
    pub fn hand_info(&self) -> Option<Arc<Snapshot>> {
        self.unpacker.snapshot(&SnapshotKey::hand())
    }

    /// Returns the latest snapshot of a tactile sensor.
    #[must_use]
    pub fn tactile_info(&self, serial: &str) -> Option<Arc<Snapshot>> {
        self.unpacker.snapshot(&SnapshotKey::tactile(serial))
    }

    /// Returns the serial numbers of all tactile sensors seen so far.
    #[must_use]
    pub fn tactile_serials(&self) -> Vec<String> {
        self.unpacker.tactile_serials()
    }

    /// Subscribes to all session events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.dispatcher.subscribe(None)
    }

    /// Subscribes to session events matching `filter`.
    #[must_use]
    pub fn subscribe_filtered(&self, filter: EventFilter) -> Subscription {
        self.dispatcher.subscribe(Some(filter))
    }

    /// Runs the emergency abort now.
    pub async fn emergency_stop(&self) -> AbortOutcome {
        self.abort.trigger(AbortReason::Requested).await
    }

    /// Returns how the session ended, once it did.
    #[must_use]
    pub fn session_end(&self) -> Option<SessionEnd> {
        self.abort.session_end()
    }

    /// Returns true once the session ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits for the session to end.
    pub async fn closed(&self) -> SessionEnd {
        self.closed.cancelled().await;
        self.abort.session_end().unwrap_or(SessionEnd::Closed)
    }

    /// Ends the session.
    ///
    /// If the client holds control, the hand is halted and released first.
    pub async fn disconnect(mut self) -> SessionEnd {
        if matches!(
            self.abort.trigger(AbortReason::Requested).await,
            AbortOutcome::NotOwned
        ) {
            self.abort.terminate(SessionEnd::Closed);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.abort.session_end().unwrap_or(SessionEnd::Closed)
    }
}

/// Turns accepted snapshots into events, then runs the user hook.
fn snapshot_events(
    dispatcher: EventDispatcher,
    hook: Option<SnapshotCallback>,
) -> SnapshotCallback {
    Arc::new(move |snapshot: &Arc<Snapshot>| {
        let event = match (snapshot.key.category, &snapshot.key.instance) {
            (Category::Tactile, Some(serial)) => Event::TactileUpdated {
                serial: serial.clone(),
                snapshot: Arc::clone(snapshot),
            },
            _ => Event::HandUpdated(Arc::clone(snapshot)),
        };
        dispatcher.dispatch(event);

        if let Some(hook) = &hook {
            hook(snapshot);
        }
    })
}

impl<T> Drop for DexHand<T> {
    fn drop(&mut self) {
        self.closed.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
