//! # dexhand
//!
//! A Rust client runtime for DexHand grippers.
//!
//! The server speaks JSON over UDP: commands and their task updates travel on
//! a unicast socket, telemetry is published to a multicast group.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Task correlation with ack and completion timeouts
//! - Heartbeat and telemetry watchdog
//! - Emergency abort on shutdown signals, with halt and release
//! - Typed hand and tactile telemetry snapshots
//!
//! ## Quick Start
//!
//! ```no_run
//! use dexhand::{ClientConfig, DexHand, Outcome, shutdown_on_signals};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dexhand::Error> {
//!     let config = ClientConfig::new("192.168.2.100");
//!     let hand = DexHand::connect(config, shutdown_on_signals()).await?;
//!
//!     let commands = hand.commands();
//!     if commands.acquire_hand().await? == Outcome::Succeeded {
//!         commands.set_home(dexhand::commands::DEFAULT_HOME_SPEED).await?;
//!         commands.goto(20.0, 8.0, 20.0, 1.0).await?;
//!     }
//!
//!     if let Some(snapshot) = hand.hand_info() {
//!         println!("{:?}", snapshot.hand().map(dexhand::HandState::summary));
//!     }
//!
//!     hand.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - Unicast command socket and multicast telemetry receiver
//! - [`protocol`] - Wire envelopes, commands and task states
//! - [`router`] - Dispatches inbound datagrams by type
//! - [`task`] - Correlates task updates with waiting commands
//! - [`commands`] - Command handler for gripper operations
//! - [`liveness`] - Heartbeat sender and telemetry watchdog
//! - [`abort`] - Emergency abort and session termination
//! - [`telemetry`] - Telemetry snapshots
//! - [`event`] - Async event system
//! - [`client`] - High-level [`DexHand`] session

pub mod abort;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod liveness;
pub mod logging;
pub mod protocol;
pub mod router;
pub mod task;
pub mod telemetry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use abort::{
    AbortOutcome, AbortReason, SessionEnd, cancel_on_panic, shutdown_on_signals,
};
pub use client::{DexHand, SessionHooks};
pub use commands::{CommandHandler, ImpedanceParams, PidParams, QuickMove};
pub use config::{ClientConfig, HandComponents, TelemetryConfig};
pub use error::{Error, ProtocolError, Result, TransportError};
pub use event::{Event, EventDispatcher, EventFilter, EventKind, Subscription};
pub use logging::{LogLevel, LogSink, TracingSink};
pub use protocol::{CommandKind, Device, Outcome, TaskState};
pub use telemetry::{Category, Snapshot, SnapshotCallback, SnapshotKey};
pub use transport::{MulticastReceiver, Transport, UdpTransport};
pub use types::{Contact, Ego, Force, HandState, Imu, TactileFrame, TaskInfo};
