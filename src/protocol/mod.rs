//! Protocol definitions for DexHand communication.
//!
//! This module contains the wire-level types:
//! - Outbound command envelopes and the command vocabulary
//! - Inbound envelopes (`Message`, `Task`, `Data`)
//! - Task states and wait outcomes

pub mod command;
pub mod envelope;
pub mod task;

pub use command::{Args, Command, CommandEnvelope, CommandKind, Device, WaitMode};
pub use envelope::{DataFrame, DeviceMessage, Envelope, TaskUpdate};
pub use task::{Outcome, TaskState};
