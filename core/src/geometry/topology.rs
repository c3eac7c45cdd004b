use crate::geometry::{GeometryError, GeometryResult};
use serde::{Deserialize, Serialize};

/// Detector families with a built-in topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorFamily {
    Dssc1M,
    Lpd1M,
}

impl DetectorFamily {
    pub fn topology(self) -> ModuleTopology {
        match self {
            DetectorFamily::Dssc1M => ModuleTopology::dssc_1m(),
            DetectorFamily::Lpd1M => ModuleTopology::lpd_1m(),
        }
    }
}

/// One rectangular sensor tile inside a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    /// First (row, col) of the tile in the module's data array.
    pub source: (usize, usize),
    pub shape: (usize, usize),
    /// Position of the tile in the module's physical layout, in pixels.
    pub offset: (usize, usize),
}

/// Flips applied to every module of a quadrant when it is mounted rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Orientation {
    pub flip_rows: bool,
    pub flip_cols: bool,
}

impl Orientation {
    pub const UPRIGHT: Orientation = Orientation {
        flip_rows: false,
        flip_cols: false,
    };
    pub const ROTATED: Orientation = Orientation {
        flip_rows: true,
        flip_cols: true,
    };
}

/// Fixed layout of a four-quadrant detector family.
///
/// Modules are numbered quadrant by quadrant: module `m` lives in quadrant
/// `m / modules_per_quadrant`. Quadrant origins are the canvas positions (row,
/// col) of each quadrant when the quadrants sit exactly at
/// `reference_positions`; a calibration moves every quadrant by its deviation
/// from that reference, converted with `pixel_size`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleTopology {
    pub name: String,
    pub n_modules: usize,
    pub module_shape: (usize, usize),
    pub tiles: Vec<TileSpec>,
    pub modules_per_quadrant: usize,
    /// Module origins inside an upright quadrant, in pixels.
    pub module_offsets: Vec<(usize, usize)>,
    pub quadrant_orientations: [Orientation; 4],
    pub quadrant_origins: [(i64, i64); 4],
    /// Physical (x, y) positions in mm that map onto `quadrant_origins`.
    pub reference_positions: [[f64; 2]; 4],
    /// Pixel pitch (y, x) in mm.
    pub pixel_size: (f64, f64),
    pub expected_shapes: Vec<(usize, usize)>,
}

impl ModuleTopology {
    pub fn dssc_1m() -> Self {
        Self {
            name: "DSSC-1M".into(),
            n_modules: 16,
            module_shape: (128, 512),
            tiles: vec![
                TileSpec {
                    source: (0, 0),
                    shape: (128, 256),
                    offset: (0, 0),
                },
                TileSpec {
                    source: (0, 256),
                    shape: (128, 256),
                    offset: (0, 256),
                },
            ],
            modules_per_quadrant: 4,
            module_offsets: vec![(0, 0), (128, 0), (256, 0), (384, 0)],
            quadrant_orientations: [
                Orientation::UPRIGHT,
                Orientation::UPRIGHT,
                Orientation::ROTATED,
                Orientation::ROTATED,
            ],
            quadrant_origins: [(0, 0), (512, 0), (512, 512), (0, 512)],
            reference_positions: [
                [-124.100, 3.112],
                [-133.068, -110.604],
                [0.988, -125.236],
                [4.528, -4.912],
            ],
            pixel_size: (0.204, 0.236),
            expected_shapes: vec![(1024, 1024)],
        }
    }

    pub fn lpd_1m() -> Self {
        let tiles = (0..2)
            .flat_map(|col| {
                (0..8).map(move |row| TileSpec {
                    source: (row * 32, col * 128),
                    shape: (32, 128),
                    offset: (row * 32, col * 128),
                })
            })
            .collect();

        Self {
            name: "LPD-1M".into(),
            n_modules: 16,
            module_shape: (256, 256),
            tiles,
            modules_per_quadrant: 4,
            module_offsets: vec![(0, 0), (256, 0), (256, 256), (0, 256)],
            quadrant_orientations: [Orientation::UPRIGHT; 4],
            quadrant_origins: [(0, 0), (512, 0), (512, 512), (0, 512)],
            reference_positions: [[11.4, 299.0], [-11.5, 8.0], [254.5, -16.0], [278.5, 275.0]],
            pixel_size: (0.5, 0.5),
            expected_shapes: vec![(1024, 1024)],
        }
    }

    #[must_use]
    pub fn with_expected_shapes(mut self, shapes: Vec<(usize, usize)>) -> Self {
        self.expected_shapes = shapes;
        self
    }

    pub fn quadrant_of(&self, module: usize) -> usize {
        module / self.modules_per_quadrant
    }

    /// Extent (rows, cols) of one upright quadrant.
    pub fn quadrant_extent(&self) -> (usize, usize) {
        let (tile_rows, tile_cols) = self.tiles.iter().fold((0, 0), |(r, c), tile| {
            (
                r.max(tile.offset.0 + tile.shape.0),
                c.max(tile.offset.1 + tile.shape.1),
            )
        });
        self.module_offsets
            .iter()
            .fold((0, 0), |(r, c), &(row, col)| {
                (r.max(row + tile_rows), c.max(col + tile_cols))
            })
    }

    pub fn validate(&self) -> GeometryResult<()> {
        let invalid = |reason: String| GeometryError::InvalidTopology {
            name: self.name.clone(),
            reason,
        };

        if self.modules_per_quadrant == 0 || self.n_modules != 4 * self.modules_per_quadrant {
            return Err(invalid(format!(
                "{} modules cannot be split into 4 quadrants of {}",
                self.n_modules, self.modules_per_quadrant
            )));
        }
        if self.module_offsets.len() != self.modules_per_quadrant {
            return Err(invalid(format!(
                "{} module offsets for {} modules per quadrant",
                self.module_offsets.len(),
                self.modules_per_quadrant
            )));
        }
        if self.tiles.is_empty() {
            return Err(invalid("no tiles".into()));
        }
        for (index, tile) in self.tiles.iter().enumerate() {
            let fits = tile.source.0 + tile.shape.0 <= self.module_shape.0
                && tile.source.1 + tile.shape.1 <= self.module_shape.1;
            if !fits || tile.shape.0 == 0 || tile.shape.1 == 0 {
                return Err(invalid(format!(
                    "tile {index} {:?}+{:?} does not fit module shape {:?}",
                    tile.source, tile.shape, self.module_shape
                )));
            }
        }
        if !(self.pixel_size.0 > 0.0 && self.pixel_size.1 > 0.0) {
            return Err(invalid(format!("pixel size {:?}", self.pixel_size)));
        }
        if self.expected_shapes.is_empty() {
            return Err(invalid("no expected canvas shape".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_topologies_are_valid() {
        for family in [DetectorFamily::Dssc1M, DetectorFamily::Lpd1M] {
            let topology = family.topology();
            topology.validate().unwrap();
            assert_eq!(topology.quadrant_extent(), (512, 512));
        }
    }

    #[test]
    fn lpd_tiles_cover_module() {
        let topology = ModuleTopology::lpd_1m();
        let area: usize = topology.tiles.iter().map(|t| t.shape.0 * t.shape.1).sum();
        assert_eq!(area, 256 * 256);
    }

    #[test]
    fn rejects_tile_outside_module() {
        let mut topology = ModuleTopology::dssc_1m();
        topology.tiles[1].source = (0, 300);
        assert!(matches!(
            topology.validate(),
            Err(GeometryError::InvalidTopology { .. })
        ));
    }

    #[test]
    fn rejects_uneven_quadrants() {
        let mut topology = ModuleTopology::dssc_1m();
        topology.n_modules = 15;
        assert!(topology.validate().is_err());
    }
}
