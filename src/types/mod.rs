//! Data types for DexHand telemetry.
//!
//! This module contains the decoded telemetry payloads:
//! - Hand state (ego, force, IMU, contact components)
//! - Tac3D tactile frames

pub mod hand;
pub mod tactile;

pub use hand::{Contact, Ego, Force, HandState, Imu, TaskInfo};
pub use tactile::TactileFrame;
