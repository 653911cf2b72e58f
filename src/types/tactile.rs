//! Tac3D tactile sensor payload.
//!
//! Each sensor publishes its own frames, keyed by serial number. The client
//! keeps the payload as delivered and offers typed views over the standard
//! fields; interpreting the marker geometry is left to the application.

use serde_json::{Map, Value};

/// Marker positions.
pub const POSITIONS: &str = "3D_Positions";
/// Marker displacements.
pub const DISPLACEMENTS: &str = "3D_Displacements";
/// Per-marker forces.
pub const FORCES: &str = "3D_Forces";
/// Resultant force on the sensor.
pub const RESULTANT_FORCE: &str = "3D_ResultantForce";
/// Resultant moment on the sensor.
pub const RESULTANT_MOMENT: &str = "3D_ResultantMoment";

/// One tactile frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TactileFrame {
    fields: Map<String, Value>,
}

impl TactileFrame {
    /// Wraps a frame payload. Non-object payloads yield an empty frame.
    #[must_use]
    pub fn new(data: Value) -> Self {
        match data {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }

    /// Returns a raw field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns a field as a list of 3-vectors.
    ///
    /// Nested arrays are flattened in row-major order, so both `[[x,y,z],...]`
    /// and a flat `[x,y,z,...]` are accepted. Returns `None` if the field is
    /// missing, contains non-numbers, or its length is not a multiple of three.
    #[must_use]
    pub fn vectors(&self, name: &str) -> Option<Vec<[f64; 3]>> {
        let mut flat = Vec::new();
        flatten(self.fields.get(name)?, &mut flat)?;
        if flat.len() % 3 != 0 {
            return None;
        }
        Some(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
    }

    /// Marker positions.
    #[must_use]
    pub fn positions(&self) -> Option<Vec<[f64; 3]>> {
        self.vectors(POSITIONS)
    }

    /// Marker displacements.
    #[must_use]
    pub fn displacements(&self) -> Option<Vec<[f64; 3]>> {
        self.vectors(DISPLACEMENTS)
    }

    /// Per-marker forces.
    #[must_use]
    pub fn forces(&self) -> Option<Vec<[f64; 3]>> {
        self.vectors(FORCES)
    }

    /// Resultant force.
    #[must_use]
    pub fn resultant_force(&self) -> Option<[f64; 3]> {
        single(self.vectors(RESULTANT_FORCE)?)
    }

    /// Resultant moment.
    #[must_use]
    pub fn resultant_moment(&self) -> Option<[f64; 3]> {
        single(self.vectors(RESULTANT_MOMENT)?)
    }
}

fn single(vectors: Vec<[f64; 3]>) -> Option<[f64; 3]> {
    match vectors.as_slice() {
        [v] => Some(*v),
        _ => None,
    }
}

fn flatten(value: &Value, out: &mut Vec<f64>) -> Option<()> {
    match value {
        Value::Number(n) => out.push(n.as_f64()?),
        Value::Array(items) => {
            for item in items {
                flatten(item, out)?;
            }
        }
        _ => return None,
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_nested_and_flat_vectors() {
        let frame = TactileFrame::new(json!({
            "3D_Positions": [[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]],
            "3D_ResultantForce": [[0.1, 0.2, 0.3]],
            "3D_ResultantMoment": [1.0, 2.0, 3.0],
        }));
        assert_eq!(
            frame.positions(),
            Some(vec![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]])
        );
        assert_eq!(frame.resultant_force(), Some([0.1, 0.2, 0.3]));
        assert_eq!(frame.resultant_moment(), Some([1.0, 2.0, 3.0]));
        assert!(frame.forces().is_none());
    }

    #[test]
    fn test_malformed_vectors() {
        let frame = TactileFrame::new(json!({
            "3D_Forces": [1.0, 2.0],
            "3D_Displacements": [[1.0, "x", 2.0]],
        }));
        assert!(frame.forces().is_none());
        assert!(frame.displacements().is_none());
        assert!(TactileFrame::new(json!(3)).field(POSITIONS).is_none());
    }
}
