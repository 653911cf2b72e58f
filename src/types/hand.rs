//! Hand telemetry payload.
//!
//! The hand publishes one flat JSON object per frame. Which keys are present
//! depends on the components the server was configured with; the client only
//! extracts the components it enabled, leaving the others unset.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::config::HandComponents;

/// Task status reported inside the `Ego` component.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskInfo {
    /// Task the hand is executing.
    pub now_task: Option<String>,
    /// Most recently finished task.
    pub recent_task: Option<String>,
    /// Status of the most recently finished task.
    pub recent_task_status: Option<String>,
    /// Latched hardware error.
    #[serde(deserialize_with = "flag")]
    pub error_flag: bool,
}

/// Position, speed, current and task state.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Ego {
    /// Current opening in mm.
    pub now_pos: f64,
    /// Target opening in mm.
    pub goal_pos: f64,
    /// Current speed in mm/s.
    pub now_speed: f64,
    /// Target speed in mm/s.
    pub goal_speed: f64,
    /// Motor current in A.
    pub now_current: f64,
    /// Target motor current in A.
    pub goal_current: f64,
    /// Task status.
    pub task_info: TaskInfo,
}

/// Finger forces.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Force {
    /// Per-finger force in N.
    pub now_force: Vec<f64>,
    /// Mean force in N.
    pub avg_force: f64,
    /// Target force in N.
    pub goal_force: f64,
    /// Estimated stiffness of the grasped object.
    pub stiffness: f64,
}

/// Inertial measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Imu {
    /// Linear acceleration.
    pub imu_acc: [f64; 3],
    /// Angular rate.
    pub imu_gyr: [f64; 3],
}

/// Contact flags.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Contact {
    /// One flag per finger.
    #[serde(deserialize_with = "flags")]
    pub is_contact: Vec<bool>,
}

/// Decoded hand frame. Disabled components are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandState {
    /// Ego component.
    pub ego: Option<Ego>,
    /// Force component.
    pub force: Option<Force>,
    /// IMU component.
    pub imu: Option<Imu>,
    /// Contact component.
    pub contact: Option<Contact>,
}

impl HandState {
    /// Extracts the enabled components from a frame payload.
    ///
    /// # Errors
    ///
    /// Returns an error if an enabled component is missing or malformed.
    pub fn extract(components: HandComponents, data: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            ego: components.ego.then(|| Ego::deserialize(data)).transpose()?,
            force: components
                .force
                .then(|| Force::deserialize(data))
                .transpose()?,
            imu: components.imu.then(|| Imu::deserialize(data)).transpose()?,
            contact: components
                .contact
                .then(|| Contact::deserialize(data))
                .transpose()?,
        })
    }

    /// Current opening in mm.
    #[must_use]
    pub fn now_pos(&self) -> Option<f64> {
        self.ego.as_ref().map(|e| e.now_pos)
    }

    /// Target opening in mm.
    #[must_use]
    pub fn goal_pos(&self) -> Option<f64> {
        self.ego.as_ref().map(|e| e.goal_pos)
    }

    /// Current speed in mm/s.
    #[must_use]
    pub fn now_speed(&self) -> Option<f64> {
        self.ego.as_ref().map(|e| e.now_speed)
    }

    /// Target speed in mm/s.
    #[must_use]
    pub fn goal_speed(&self) -> Option<f64> {
        self.ego.as_ref().map(|e| e.goal_speed)
    }

    /// Motor current in A.
    #[must_use]
    pub fn now_current(&self) -> Option<f64> {
        self.ego.as_ref().map(|e| e.now_current)
    }

    /// Target motor current in A.
    #[must_use]
    pub fn goal_current(&self) -> Option<f64> {
        self.ego.as_ref().map(|e| e.goal_current)
    }

    /// Task the hand is executing.
    #[must_use]
    pub fn now_task(&self) -> Option<&str> {
        self.ego.as_ref()?.task_info.now_task.as_deref()
    }

    /// Most recently finished task.
    #[must_use]
    pub fn recent_task(&self) -> Option<&str> {
        self.ego.as_ref()?.task_info.recent_task.as_deref()
    }

    /// Status of the most recently finished task.
    #[must_use]
    pub fn recent_task_status(&self) -> Option<&str> {
        self.ego.as_ref()?.task_info.recent_task_status.as_deref()
    }

    /// Latched hardware error.
    #[must_use]
    pub fn error_flag(&self) -> Option<bool> {
        self.ego.as_ref().map(|e| e.task_info.error_flag)
    }

    /// Per-finger force in N.
    #[must_use]
    pub fn now_force(&self) -> Option<&[f64]> {
        self.force.as_ref().map(|f| f.now_force.as_slice())
    }

    /// Mean force in N.
    #[must_use]
    pub fn avg_force(&self) -> Option<f64> {
        self.force.as_ref().map(|f| f.avg_force)
    }

    /// Target force in N.
    #[must_use]
    pub fn goal_force(&self) -> Option<f64> {
        self.force.as_ref().map(|f| f.goal_force)
    }

    /// Estimated object stiffness.
    #[must_use]
    pub fn stiffness(&self) -> Option<f64> {
        self.force.as_ref().map(|f| f.stiffness)
    }

    /// Linear acceleration.
    #[must_use]
    pub fn imu_acc(&self) -> Option<[f64; 3]> {
        self.imu.map(|i| i.imu_acc)
    }

    /// Angular rate.
    #[must_use]
    pub fn imu_gyr(&self) -> Option<[f64; 3]> {
        self.imu.map(|i| i.imu_gyr)
    }

    /// Per-finger contact flags.
    #[must_use]
    pub fn is_contact(&self) -> Option<&[bool]> {
        self.contact.as_ref().map(|c| c.is_contact.as_slice())
    }

    /// One-line summary used for periodic debug logging.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut line = String::new();
        if let Some(ego) = &self.ego {
            let info = &ego.task_info;
            line.push_str(&format!(
                "error:{}, {} ({},{}) Pos:{:.2}/{:.2} Speed:{:.2}/{:.2}, Current:{:.2} ",
                info.error_flag,
                info.now_task.as_deref().unwrap_or("-"),
                info.recent_task.as_deref().unwrap_or("-"),
                info.recent_task_status.as_deref().unwrap_or("-"),
                ego.now_pos,
                ego.goal_pos,
                ego.now_speed,
                ego.goal_speed,
                ego.now_current,
            ));
        }
        if let Some(force) = &self.force {
            line.push_str(&format!("Force:{:.3}/{:.3}", force.avg_force, force.goal_force));
        }
        line
    }
}

/// Accepts `true`/`false` or a number (non-zero is set).
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    to_flag(&value).ok_or_else(|| serde::de::Error::custom(format!("expected a flag, got {value}")))
}

fn flags<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<bool>, D::Error> {
    let values = Vec::<Value>::deserialize(deserializer)?;
    values
        .iter()
        .map(|value| {
            to_flag(value)
                .ok_or_else(|| serde::de::Error::custom(format!("expected a flag, got {value}")))
        })
        .collect()
}

fn to_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn frame() -> Value {
        json!({
            "now_pos": 42.5, "goal_pos": 40.0,
            "now_speed": 1.0, "goal_speed": 4.0,
            "now_current": 0.3, "goal_current": 0.5,
            "task_info": {
                "now_task": "Goto", "recent_task": "SetHome",
                "recent_task_status": "Succeed", "error_flag": 0
            },
            "now_force": [0.5, 0.7], "avg_force": 0.6, "goal_force": 1.0, "stiffness": 0.05,
            "imu_acc": [0.0, 0.0, 9.8], "imu_gyr": [0.1, 0.2, 0.3],
            "is_contact": [1, 0]
        })
    }

    #[test]
    fn test_extract_all_components() {
        let state = HandState::extract(HandComponents::ALL, &frame()).unwrap();
        assert_eq!(state.now_pos(), Some(42.5));
        assert_eq!(state.recent_task(), Some("SetHome"));
        assert_eq!(state.error_flag(), Some(false));
        assert_eq!(state.now_force(), Some(&[0.5, 0.7][..]));
        assert_eq!(state.imu_acc(), Some([0.0, 0.0, 9.8]));
        assert_eq!(state.is_contact(), Some(&[true, false][..]));
        assert!(state.summary().contains("Pos:42.50/40.00"));
    }

    #[test]
    fn test_disabled_components_stay_unset() {
        let components = HandComponents {
            ego: false,
            force: true,
            imu: false,
            contact: false,
        };
        let state = HandState::extract(components, &json!({
            "now_force": [1.0], "avg_force": 1.0, "goal_force": 2.0, "stiffness": 0.1
        }))
        .unwrap();
        assert!(state.now_pos().is_none());
        assert!(state.imu_gyr().is_none());
        assert_eq!(state.goal_force(), Some(2.0));
    }

    #[test]
    fn test_missing_enabled_component_fails() {
        assert!(HandState::extract(HandComponents::ALL, &json!({"now_pos": 1.0})).is_err());
    }
}
