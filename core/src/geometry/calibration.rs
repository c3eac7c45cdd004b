use crate::geometry::topology::ModuleTopology;
use crate::geometry::{GeometryError, GeometryResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Measured quadrant positions, (x, y) in mm with y pointing up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeometryCalibration {
    quad_positions: [[f64; 2]; 4],
}

impl GeometryCalibration {
    pub fn new(quad_positions: [[f64; 2]; 4]) -> GeometryResult<Self> {
        if quad_positions.iter().flatten().any(|v| !v.is_finite()) {
            return Err(GeometryError::InvalidCalibration(format!(
                "non-finite quadrant position in {quad_positions:?}"
            )));
        }
        Ok(Self { quad_positions })
    }

    /// Build from a list that is expected to hold 4 entries of 2 coordinates.
    pub fn from_positions(positions: &[Vec<f64>]) -> GeometryResult<Self> {
        if positions.len() != 4 {
            return Err(GeometryError::InvalidCalibration(format!(
                "expected 4 quadrant positions, got {}",
                positions.len()
            )));
        }
        let mut quad_positions = [[0.0; 2]; 4];
        for (slot, position) in quad_positions.iter_mut().zip(positions) {
            match position.as_slice() {
                [x, y] => *slot = [*x, *y],
                other => {
                    return Err(GeometryError::InvalidCalibration(format!(
                        "quadrant position must have 2 coordinates, got {}",
                        other.len()
                    )))
                }
            }
        }
        Self::new(quad_positions)
    }

    /// Read `{"quad_positions": [[x, y], ...]}` from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> GeometryResult<Self> {
        #[derive(Deserialize)]
        struct CalibrationFile {
            quad_positions: Vec<Vec<f64>>,
        }

        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| GeometryError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        let file: CalibrationFile =
            serde_json::from_str(&contents).map_err(|err| GeometryError::Io {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        Self::from_positions(&file.quad_positions)
    }

    /// The calibration under which the topology's nominal layout applies.
    pub fn reference(topology: &ModuleTopology) -> Self {
        Self {
            quad_positions: topology.reference_positions,
        }
    }

    pub fn quad_positions(&self) -> &[[f64; 2]; 4] {
        &self.quad_positions
    }

    /// Pixel shift (rows, cols) of quadrant `quadrant` away from its nominal origin.
    pub fn quadrant_shift(&self, topology: &ModuleTopology, quadrant: usize) -> (i64, i64) {
        let [x, y] = self.quad_positions[quadrant];
        let [x_ref, y_ref] = topology.reference_positions[quadrant];
        let (pitch_y, pitch_x) = topology.pixel_size;
        let rows = ((y_ref - y) / pitch_y).round() as i64;
        let cols = ((x - x_ref) / pitch_x).round() as i64;
        (rows, cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn reference_calibration_has_no_shift() {
        let topology = ModuleTopology::dssc_1m();
        let calibration = GeometryCalibration::reference(&topology);
        for quadrant in 0..4 {
            assert_eq!(calibration.quadrant_shift(&topology, quadrant), (0, 0));
        }
    }

    #[test]
    fn shift_uses_pixel_pitch_and_upward_y() {
        let topology = ModuleTopology::dssc_1m();
        let mut positions = topology.reference_positions;
        positions[1][0] += 2.0 * 0.236;
        positions[1][1] += 0.204;
        let calibration = GeometryCalibration::new(positions).unwrap();
        assert_eq!(calibration.quadrant_shift(&topology, 1), (-1, 2));
    }

    #[test]
    fn rejects_wrong_arity() {
        let err = GeometryCalibration::from_positions(&vec![vec![0.0, 0.0]; 3]).unwrap_err();
        assert!(matches!(err, GeometryError::InvalidCalibration(_)));
        let err = GeometryCalibration::from_positions(&vec![vec![0.0, 0.0, 1.0]; 4]).unwrap_err();
        assert!(matches!(err, GeometryError::InvalidCalibration(_)));
    }

    #[test]
    fn rejects_non_finite() {
        let mut positions = [[0.0; 2]; 4];
        positions[2][1] = f64::NAN;
        assert!(GeometryCalibration::new(positions).is_err());
    }

    #[test]
    fn loads_json_file() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(br#"{"quad_positions": [[1, 2], [3, 4], [5, 6], [7, 8]]}"#)
            .unwrap();
        let calibration = GeometryCalibration::load(temp.path()).unwrap();
        assert_eq!(calibration.quad_positions()[3], [7.0, 8.0]);
    }
}
