use crate::config::{AzimuthalConfig, PipelineConfig};
use crate::math::stats::StatsHelper;
use crate::pipeline::record::{AzimuthalProfiles, TrainRecord};
use crate::prelude::{ProcessingStage, StageError, StageResult};
use crate::processing::buffer_pool::BufferPool;
use crate::telemetry::log::LogManager;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use std::f64::consts::PI;

/// hc in keV·Å.
const HC_KEV_ANGSTROM: f64 = 12.39842;

pub fn wavelength_angstrom(energy_kev: f64) -> f64 {
    HC_KEV_ANGSTROM / energy_kev
}

/// Geometry and binning of a 1-D azimuthal integration.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationSetup {
    /// Beam centre (x, y) in pixels.
    pub center: (f64, f64),
    /// Pixel pitch (y, x) in metres.
    pub pixel_size: (f64, f64),
    pub distance: f64,
    pub wavelength: f64,
    pub n_points: usize,
    /// Momentum-transfer range in 1/Å; the full image range when unset.
    pub q_range: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AzimuthalCurve {
    pub momentum: Vec<f64>,
    pub intensity: Vec<f64>,
}

/// Integrates one image into an intensity-versus-q curve. NaN pixels carry
/// no data and must be ignored.
pub trait AzimuthalIntegrator: Send {
    fn integrate(&mut self, image: ArrayView2<'_, f32>) -> StageResult<AzimuthalCurve>;
}

const OUTSIDE: u32 = u32::MAX;

struct BinMap {
    shape: (usize, usize),
    bins: Array2<u32>,
    momentum: Vec<f64>,
}

/// Averages pixel values in equal-width q bins. Empty bins read 0.
pub struct RadialBinIntegrator {
    setup: IntegrationSetup,
    bin_map: Option<BinMap>,
    pool: BufferPool<f64>,
}

impl RadialBinIntegrator {
    pub fn new(setup: IntegrationSetup) -> Self {
        Self {
            setup,
            bin_map: None,
            pool: BufferPool::with_capacity(2),
        }
    }

    fn q_of(&self, row: usize, col: usize) -> f64 {
        let (cx, cy) = self.setup.center;
        let (py, px) = self.setup.pixel_size;
        let dy = (row as f64 - cy) * py;
        let dx = (col as f64 - cx) * px;
        let two_theta = dx.hypot(dy).atan2(self.setup.distance);
        4.0 * PI / self.setup.wavelength * (two_theta / 2.0).sin()
    }

    fn build_bin_map(&self, shape: (usize, usize)) -> BinMap {
        let q = Array2::from_shape_fn(shape, |(r, c)| self.q_of(r, c));
        let (low, high) = self.setup.q_range.unwrap_or_else(|| {
            q.iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
        });
        let n = self.setup.n_points;
        let width = (high - low) / n as f64;
        let bins = q.mapv(|v| {
            if !(width > 0.0) || v < low || v > high {
                OUTSIDE
            } else {
                (((v - low) / width) as usize).min(n - 1) as u32
            }
        });
        let momentum = (0..n).map(|i| low + (i as f64 + 0.5) * width).collect();
        BinMap {
            shape,
            bins,
            momentum,
        }
    }
}

impl AzimuthalIntegrator for RadialBinIntegrator {
    fn integrate(&mut self, image: ArrayView2<'_, f32>) -> StageResult<AzimuthalCurve> {
        if self.bin_map.as_ref().map(|m| m.shape) != Some(image.dim()) {
            self.bin_map = Some(self.build_bin_map(image.dim()));
        }
        let n = self.setup.n_points;
        let mut sums = self.pool.checkout(n)?;
        let mut counts = self.pool.checkout(n)?;

        let map = self
            .bin_map
            .as_ref()
            .ok_or_else(|| StageError::Internal("bin map missing".into()))?;
        for (&bin, &value) in map.bins.iter().zip(image.iter()) {
            if bin != OUTSIDE && !value.is_nan() {
                sums[bin as usize] += value as f64;
                counts[bin as usize] += 1.0;
            }
        }
        let intensity = sums
            .iter()
            .zip(&counts)
            .map(|(&s, &c)| if c > 0.0 { s / c } else { 0.0 })
            .collect();
        let momentum = map.momentum.clone();

        self.pool.release(sums);
        self.pool.release(counts);
        Ok(AzimuthalCurve {
            momentum,
            intensity,
        })
    }
}

/// Integrates every pulse and records a per-pulse FOM.
pub struct AzimuthalStage {
    pixel_size_mm: (f64, f64),
    canvas_shape: (usize, usize),
    integrator: Option<Box<dyn AzimuthalIntegrator>>,
    injected: bool,
    fom_range: Option<(f64, f64)>,
    logger: LogManager,
}

impl AzimuthalStage {
    pub fn new(pixel_size_mm: (f64, f64), canvas_shape: (usize, usize), logger: LogManager) -> Self {
        Self {
            pixel_size_mm,
            canvas_shape,
            integrator: None,
            injected: false,
            fom_range: None,
            logger,
        }
    }

    /// Use `integrator` instead of the built-in radial binning.
    pub fn with_integrator(mut self, integrator: Box<dyn AzimuthalIntegrator>) -> Self {
        self.integrator = Some(integrator);
        self.injected = true;
        self
    }

    fn setup(&self, config: &AzimuthalConfig) -> IntegrationSetup {
        let (rows, cols) = self.canvas_shape;
        IntegrationSetup {
            center: config
                .center
                .unwrap_or((cols as f64 / 2.0, rows as f64 / 2.0)),
            pixel_size: (self.pixel_size_mm.0 * 1e-3, self.pixel_size_mm.1 * 1e-3),
            distance: config.sample_distance_m,
            wavelength: wavelength_angstrom(config.energy_kev),
            n_points: config.n_points,
            q_range: config.q_range,
        }
    }
}

impl ProcessingStage for AzimuthalStage {
    fn name(&self) -> &'static str {
        "azimuthal"
    }

    fn initialize(&mut self, config: &PipelineConfig) -> StageResult<()> {
        let az = &config.azimuthal;
        self.fom_range = az.fom_range;
        if !az.enabled {
            self.integrator = None;
            return Ok(());
        }
        if !self.injected {
            let setup = self.setup(az);
            self.logger.debug(&format!(
                "radial integration: wavelength {:.4} Å, {} points",
                setup.wavelength, setup.n_points
            ));
            self.integrator = Some(Box::new(RadialBinIntegrator::new(setup)));
        }
        Ok(())
    }

    fn process(&mut self, record: &mut TrainRecord) -> StageResult<()> {
        let Some(integrator) = self.integrator.as_mut() else {
            return Ok(());
        };
        let images = record
            .assembled
            .as_ref()
            .ok_or_else(|| StageError::Internal("no assembled images".into()))?;

        let curves = images
            .axis_iter(Axis(0))
            .map(|image| integrator.integrate(image))
            .collect::<StageResult<Vec<_>>>()?;
        let Some(first) = curves.first() else {
            return Ok(());
        };

        let momentum = first.momentum.clone();
        let mut intensities = Array2::zeros((curves.len(), momentum.len()));
        let mut fom = Vec::with_capacity(curves.len());
        for (mut row, curve) in intensities.axis_iter_mut(Axis(0)).zip(&curves) {
            if curve.intensity.len() != momentum.len() {
                return Err(StageError::Internal(format!(
                    "integrator returned {} points, expected {}",
                    curve.intensity.len(),
                    momentum.len()
                )));
            }
            row.assign(&ArrayView1::from(curve.intensity.as_slice()));
            fom.push(StatsHelper::trapz(&momentum, &curve.intensity, self.fom_range));
        }

        record.pulses.azimuthal = Some(AzimuthalProfiles {
            momentum,
            intensities,
            fom,
        });
        Ok(())
    }

    fn cleanup(&mut self) {
        if !self.injected {
            self.integrator = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn setup() -> IntegrationSetup {
        IntegrationSetup {
            center: (5.0, 5.0),
            pixel_size: (1e-3, 1e-3),
            distance: 0.1,
            wavelength: wavelength_angstrom(12.39842),
            n_points: 4,
            q_range: None,
        }
    }

    #[test]
    fn wavelength_from_energy() {
        assert_relative_eq!(wavelength_angstrom(12.39842), 1.0);
    }

    #[test]
    fn uniform_image_gives_flat_curve() {
        let mut integrator = RadialBinIntegrator::new(setup());
        let image = Array2::from_elem((11, 11), 3.0f32);
        let curve = integrator.integrate(image.view()).unwrap();
        assert_eq!(curve.momentum.len(), 4);
        assert!(curve.momentum.windows(2).all(|w| w[0] < w[1]));
        for value in curve.intensity {
            assert_relative_eq!(value, 3.0);
        }
    }

    #[test]
    fn nan_pixels_are_ignored_and_empty_bins_read_zero() {
        let mut integrator = RadialBinIntegrator::new(setup());
        let mut image = Array2::from_elem((11, 11), f32::NAN);
        image[[5, 5]] = 7.0;
        let curve = integrator.integrate(image.view()).unwrap();
        assert_relative_eq!(curve.intensity[0], 7.0);
        assert!(curve.intensity[1..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn q_grows_with_radius() {
        let integrator = RadialBinIntegrator::new(setup());
        assert_eq!(integrator.q_of(5, 5), 0.0);
        assert!(integrator.q_of(5, 10) > integrator.q_of(5, 7));
    }
}
