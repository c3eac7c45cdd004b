use crate::geometry::calibration::GeometryCalibration;
use crate::geometry::pixel::Pixel;
use crate::geometry::stacked::{ModuleAxis, StackedModuleView};
use crate::geometry::topology::ModuleTopology;
use crate::geometry::{AssemblyError, GeometryError, GeometryResult};
use ndarray::{s, Array2, Array3, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;
use std::ops::Range;

/// Stitched `(pulses, H, W)` image stack.
pub type AssembledCanvas<U = f32> = Array3<U>;

/// Module stacks for one train, dense or stacked, optionally restricted to a
/// window of pulses.
#[derive(Debug, Clone)]
pub struct ModuleData<'a, T> {
    source: ModuleSource<'a, T>,
    pulses: Range<usize>,
}

#[derive(Debug, Clone)]
enum ModuleSource<'a, T> {
    Dense {
        data: ArrayView4<'a, T>,
        order: ModuleAxis,
    },
    Stacked(&'a StackedModuleView<T>),
}

impl<'a, T: Pixel> ModuleData<'a, T> {
    pub fn dense(data: ArrayView4<'a, T>, order: ModuleAxis) -> Self {
        let pulses = 0..data.len_of(order.pulse_axis());
        Self {
            source: ModuleSource::Dense { data, order },
            pulses,
        }
    }

    /// A view holding every module is read through its dense buffer, which
    /// is materialized on first use and shared by later assemblies of the
    /// same view. Views with gaps are read module by module without copying.
    pub fn stacked(view: &'a StackedModuleView<T>) -> Self {
        if view.is_complete() {
            return Self::dense(view.materialize().view(), view.order());
        }
        Self {
            pulses: 0..view.pulse_count(),
            source: ModuleSource::Stacked(view),
        }
    }

    pub fn total_pulses(&self) -> usize {
        match &self.source {
            ModuleSource::Dense { data, order } => data.len_of(order.pulse_axis()),
            ModuleSource::Stacked(view) => view.pulse_count(),
        }
    }

    /// Restrict to `window`, given in pulse indices of the full train.
    pub fn select_pulses(mut self, window: Range<usize>) -> Result<Self, AssemblyError> {
        let available = self.total_pulses();
        if window.start > window.end || window.end > available {
            return Err(AssemblyError::PulseWindow {
                start: window.start,
                end: window.end,
                available,
            });
        }
        self.pulses = window;
        Ok(self)
    }

    pub fn pulse_window(&self) -> Range<usize> {
        self.pulses.clone()
    }

    pub fn pulse_count(&self) -> usize {
        self.pulses.len()
    }

    pub fn module_count(&self) -> usize {
        match &self.source {
            ModuleSource::Dense { data, order } => data.len_of(order.module_axis()),
            ModuleSource::Stacked(view) => view.n_modules(),
        }
    }

    pub fn module_shape(&self) -> (usize, usize) {
        match &self.source {
            ModuleSource::Dense { data, .. } => (data.shape()[2], data.shape()[3]),
            ModuleSource::Stacked(view) => view.module_shape(),
        }
    }

    pub fn fill(&self) -> T {
        match &self.source {
            ModuleSource::Dense { .. } => T::FILL,
            ModuleSource::Stacked(view) => view.fill(),
        }
    }

    /// `(pulses, h, w)` view of one module over the selected window.
    pub fn module(&self, index: usize) -> Option<ArrayView3<'a, T>> {
        if index >= self.module_count() {
            return None;
        }
        let stack = match &self.source {
            ModuleSource::Dense { data, order } => {
                data.clone().index_axis_move(order.module_axis(), index)
            }
            ModuleSource::Stacked(view) => view.module(index)?,
        };
        Some(stack.slice_move(s![self.pulses.clone(), .., ..]))
    }
}

impl<'a, T: Pixel> From<&'a StackedModuleView<T>> for ModuleData<'a, T> {
    fn from(view: &'a StackedModuleView<T>) -> Self {
        ModuleData::stacked(view)
    }
}

/// Construction options for [`GeometryAssembler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerOptions {
    /// Accept only this canvas shape instead of any the topology declares.
    pub canvas_shape: Option<(usize, usize)>,
    /// Leave the outermost pixel ring of every tile at the fill value. The
    /// canvas shape and tile positions do not change.
    pub ignore_tile_edges: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TilePlacement {
    module: usize,
    src_rows: Range<usize>,
    src_cols: Range<usize>,
    dst_row: usize,
    dst_col: usize,
    flip_rows: bool,
    flip_cols: bool,
}

struct RawPlacement {
    module: usize,
    src: (usize, usize),
    shape: (usize, usize),
    dst: (i64, i64),
    flip_rows: bool,
    flip_cols: bool,
}

/// Places module tiles into a single canvas using offsets fixed at construction.
#[derive(Debug, Clone)]
pub struct GeometryAssembler {
    topology: ModuleTopology,
    canvas_shape: (usize, usize),
    placements: Vec<TilePlacement>,
}

impl GeometryAssembler {
    pub fn new(topology: ModuleTopology, calibration: &GeometryCalibration) -> GeometryResult<Self> {
        Self::with_options(topology, calibration, AssemblerOptions::default())
    }

    pub fn with_canvas_shape(
        topology: ModuleTopology,
        calibration: &GeometryCalibration,
        canvas_shape: (usize, usize),
    ) -> GeometryResult<Self> {
        let options = AssemblerOptions {
            canvas_shape: Some(canvas_shape),
            ..Default::default()
        };
        Self::with_options(topology, calibration, options)
    }

    pub fn with_options(
        topology: ModuleTopology,
        calibration: &GeometryCalibration,
        options: AssemblerOptions,
    ) -> GeometryResult<Self> {
        topology.validate()?;

        let candidates = match options.canvas_shape {
            Some(shape) if topology.expected_shapes.contains(&shape) => vec![shape],
            Some(shape) => {
                return Err(GeometryError::UnsupportedShape {
                    requested: shape,
                    expected: topology.expected_shapes.clone(),
                })
            }
            None => topology.expected_shapes.clone(),
        };

        let raw = raw_placements(&topology, calibration);
        let min_row = raw.iter().map(|p| p.dst.0).min().unwrap_or(0);
        let min_col = raw.iter().map(|p| p.dst.1).min().unwrap_or(0);
        let max_row = raw.iter().map(|p| p.dst.0 + p.shape.0 as i64).max().unwrap_or(0);
        let max_col = raw.iter().map(|p| p.dst.1 + p.shape.1 as i64).max().unwrap_or(0);
        let footprint = ((max_row - min_row) as usize, (max_col - min_col) as usize);

        let canvas_shape = candidates
            .iter()
            .copied()
            .find(|&(rows, cols)| {
                footprint.0.abs_diff(rows) <= 1 && footprint.1.abs_diff(cols) <= 1
            })
            .ok_or(GeometryError::OutOfBounds {
                footprint,
                expected: candidates.clone(),
            })?;

        let margin = usize::from(options.ignore_tile_edges);
        let placements = raw
            .into_iter()
            .filter_map(|p| p.inset(margin))
            .filter_map(|p| {
                let dst_row = (p.dst.0 - min_row) as usize;
                let dst_col = (p.dst.1 - min_col) as usize;
                let rows = p.shape.0.min(canvas_shape.0.saturating_sub(dst_row));
                let cols = p.shape.1.min(canvas_shape.1.saturating_sub(dst_col));
                if rows == 0 || cols == 0 {
                    return None;
                }
                Some(TilePlacement {
                    module: p.module,
                    src_rows: clipped_source(p.src.0, p.shape.0, rows, p.flip_rows),
                    src_cols: clipped_source(p.src.1, p.shape.1, cols, p.flip_cols),
                    dst_row,
                    dst_col,
                    flip_rows: p.flip_rows,
                    flip_cols: p.flip_cols,
                })
            })
            .collect();

        Ok(Self {
            topology,
            canvas_shape,
            placements,
        })
    }

    pub fn topology(&self) -> &ModuleTopology {
        &self.topology
    }

    pub fn canvas_shape(&self) -> (usize, usize) {
        self.canvas_shape
    }

    /// Fill-initialized canvas for `pulse_count` pulses.
    pub fn allocate_canvas<U: Pixel>(&self, pulse_count: usize) -> AssembledCanvas<U> {
        Array3::from_elem(
            (pulse_count, self.canvas_shape.0, self.canvas_shape.1),
            U::FILL,
        )
    }

    /// Canvas pixels written by at least one tile.
    pub fn footprint(&self) -> Array2<bool> {
        let mut covered = Array2::from_elem(self.canvas_shape, false);
        for tile in &self.placements {
            covered
                .slice_mut(s![
                    tile.dst_row..tile.dst_row + tile.src_rows.len(),
                    tile.dst_col..tile.dst_col + tile.src_cols.len()
                ])
                .fill(true);
        }
        covered
    }

    /// Copy every module of every selected pulse into `canvas`.
    ///
    /// Pixels outside all tiles are not touched. Source pixels holding the
    /// fill value of `T` become the fill value of `U`. Pulses are processed
    /// in parallel; each pulse owns a disjoint canvas plane.
    pub fn assemble<T, U>(
        &self,
        modules: &ModuleData<'_, T>,
        canvas: &mut AssembledCanvas<U>,
    ) -> Result<(), AssemblyError>
    where
        T: Pixel + Into<U>,
        U: Pixel,
    {
        if modules.module_count() != self.topology.n_modules {
            return Err(AssemblyError::ModuleCount {
                expected: self.topology.n_modules,
                found: modules.module_count(),
            });
        }
        if modules.module_shape() != self.topology.module_shape {
            return Err(AssemblyError::ModuleShape {
                expected: self.topology.module_shape,
                found: modules.module_shape(),
            });
        }
        let expected = [modules.pulse_count(), self.canvas_shape.0, self.canvas_shape.1];
        if canvas.shape() != expected {
            return Err(AssemblyError::CanvasShape {
                expected,
                found: canvas.shape().to_vec(),
            });
        }

        let sources: Vec<Option<ArrayView3<'_, T>>> = (0..self.topology.n_modules)
            .map(|index| modules.module(index))
            .collect();
        let fill: U = if modules.fill().is_fill() {
            U::FILL
        } else {
            modules.fill().into()
        };

        canvas
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(pulse, mut plane)| {
                for tile in &self.placements {
                    let mut dst = plane.slice_mut(s![
                        tile.dst_row..tile.dst_row + tile.src_rows.len(),
                        tile.dst_col..tile.dst_col + tile.src_cols.len()
                    ]);
                    match &sources[tile.module] {
                        Some(stack) => {
                            let mut src = stack.slice(s![
                                pulse,
                                tile.src_rows.clone(),
                                tile.src_cols.clone()
                            ]);
                            if tile.flip_rows {
                                src.invert_axis(Axis(0));
                            }
                            if tile.flip_cols {
                                src.invert_axis(Axis(1));
                            }
                            dst.zip_mut_with(&src, |d, &s| {
                                *d = if s.is_fill() { U::FILL } else { s.into() };
                            });
                        }
                        None => dst.fill(fill),
                    }
                }
            });

        Ok(())
    }
}

impl RawPlacement {
    /// Shrink the tile by `margin` pixels on every side. Flips map the ring
    /// onto itself, so source and destination shrink alike.
    fn inset(self, margin: usize) -> Option<Self> {
        if margin == 0 {
            return Some(self);
        }
        if self.shape.0 <= 2 * margin || self.shape.1 <= 2 * margin {
            return None;
        }
        Some(Self {
            src: (self.src.0 + margin, self.src.1 + margin),
            shape: (self.shape.0 - 2 * margin, self.shape.1 - 2 * margin),
            dst: (self.dst.0 + margin as i64, self.dst.1 + margin as i64),
            ..self
        })
    }
}

fn raw_placements(topology: &ModuleTopology, calibration: &GeometryCalibration) -> Vec<RawPlacement> {
    let (quad_rows, quad_cols) = topology.quadrant_extent();
    let mut placements = Vec::with_capacity(topology.n_modules * topology.tiles.len());

    for module in 0..topology.n_modules {
        let quadrant = topology.quadrant_of(module);
        let orientation = topology.quadrant_orientations[quadrant];
        let (origin_row, origin_col) = topology.quadrant_origins[quadrant];
        let (shift_row, shift_col) = calibration.quadrant_shift(topology, quadrant);
        let (module_row, module_col) =
            topology.module_offsets[module % topology.modules_per_quadrant];

        for tile in &topology.tiles {
            let shape = tile.shape;
            let mut row = module_row + tile.offset.0;
            let mut col = module_col + tile.offset.1;
            if orientation.flip_rows {
                row = quad_rows - row - shape.0;
            }
            if orientation.flip_cols {
                col = quad_cols - col - shape.1;
            }
            placements.push(RawPlacement {
                module,
                src: tile.source,
                shape,
                dst: (
                    origin_row + shift_row + row as i64,
                    origin_col + shift_col + col as i64,
                ),
                flip_rows: orientation.flip_rows,
                flip_cols: orientation.flip_cols,
            });
        }
    }
    placements
}

/// Source range feeding the first `kept` destination pixels of a tile.
///
/// A flipped tile is read back to front, so its leading destination pixels
/// come from the end of the source window.
fn clipped_source(start: usize, len: usize, kept: usize, flipped: bool) -> Range<usize> {
    if flipped {
        start + len - kept..start + len
    } else {
        start..start + kept
    }
}
