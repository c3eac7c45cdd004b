use crate::config::{AggregationConfig, LaserMode, PipelineConfig};
use crate::math::stats::StatsHelper;
use crate::pipeline::record::{AzimuthalProfiles, PumpProbeResult, TrainRecord, TrainResults};
use crate::prelude::{ProcessingStage, StageError, StageResult};
use std::collections::VecDeque;

/// Train-level results: mean image, reference difference, ROI and profile
/// means, FOM with its moving average, and pump-probe difference curves.
#[derive(Default)]
pub struct AggregationStage {
    config: AggregationConfig,
    fom_history: VecDeque<f64>,
    on_history: VecDeque<Vec<f64>>,
    off_history: VecDeque<Vec<f64>>,
    /// Profile of the last pumped train while waiting for its partner.
    pending_on: Option<(u64, Vec<f64>)>,
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T, window: usize) {
    history.push_back(value);
    while history.len() > window {
        history.pop_front();
    }
}

fn mean_curve(curves: &VecDeque<Vec<f64>>) -> Vec<f64> {
    let len = curves.front().map_or(0, Vec::len);
    let mut mean = vec![0.0; len];
    for curve in curves {
        for (m, v) in mean.iter_mut().zip(curve) {
            *m += v;
        }
    }
    let n = curves.len().max(1) as f64;
    mean.iter_mut().for_each(|m| *m /= n);
    mean
}

/// Mean profile over `pulses` (indices into the window) that survived filtering.
fn pulse_mean(profiles: &AzimuthalProfiles, kept: &[bool], pulses: &[usize]) -> Option<Vec<f64>> {
    let selected: Vec<usize> = pulses
        .iter()
        .copied()
        .filter(|&p| kept.get(p).copied().unwrap_or(false))
        .collect();
    if selected.is_empty() {
        return None;
    }
    let mut mean = vec![0.0; profiles.momentum.len()];
    for &pulse in &selected {
        for (m, v) in mean.iter_mut().zip(profiles.intensities.row(pulse)) {
            *m += v;
        }
    }
    mean.iter_mut().for_each(|m| *m /= selected.len() as f64);
    Some(mean)
}

impl AggregationStage {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalized(&self, momentum: &[f64], curve: &[f64]) -> Vec<f64> {
        let norm = StatsHelper::trapz(momentum, curve, self.config.normalization_range);
        if norm.is_finite() && norm != 0.0 {
            curve.iter().map(|v| v / norm).collect()
        } else {
            curve.to_vec()
        }
    }

    fn pump_probe(
        &mut self,
        train_id: u64,
        profiles: &AzimuthalProfiles,
        kept: &[bool],
    ) -> Option<PumpProbeResult> {
        let on_train_id = match self.config.laser_mode {
            LaserMode::Disabled => return None,
            LaserMode::SameTrain => {
                let on = pulse_mean(profiles, kept, &self.config.on_pulses)?;
                let off = pulse_mean(profiles, kept, &self.config.off_pulses)?;
                self.push_pair(on, off);
                train_id
            }
            mode => {
                if mode.is_on_train(train_id) == Some(true) {
                    self.pending_on = pulse_mean(profiles, kept, &self.config.on_pulses)
                        .map(|on| (train_id, on));
                    return None;
                }
                // The reference must directly follow its pumped train.
                let (on_id, on) = self.pending_on.take()?;
                if on_id + 1 != train_id {
                    return None;
                }
                let off = pulse_mean(profiles, kept, &self.config.off_pulses)?;
                self.push_pair(on, off);
                on_id
            }
        };

        let momentum = profiles.momentum.clone();
        let on = self.normalized(&momentum, &mean_curve(&self.on_history));
        let off = self.normalized(&momentum, &mean_curve(&self.off_history));
        let difference: Vec<f64> = on.iter().zip(&off).map(|(a, b)| a - b).collect();
        let magnitude: Vec<f64> = difference.iter().map(|v| v.abs()).collect();
        let fom = StatsHelper::trapz(&momentum, &magnitude, self.config.fom_range);
        Some(PumpProbeResult {
            on_train_id,
            momentum,
            on,
            off,
            difference,
            fom,
        })
    }

    fn push_pair(&mut self, on: Vec<f64>, off: Vec<f64>) {
        let window = self.config.moving_average_window;
        push_bounded(&mut self.on_history, on, window);
        push_bounded(&mut self.off_history, off, window);
    }
}

impl ProcessingStage for AggregationStage {
    fn name(&self) -> &'static str {
        "aggregation"
    }

    fn initialize(&mut self, config: &PipelineConfig) -> StageResult<()> {
        self.config = config.aggregation.clone();
        Ok(())
    }

    fn process(&mut self, record: &mut TrainRecord) -> StageResult<()> {
        let images = record
            .assembled
            .as_ref()
            .ok_or_else(|| StageError::Internal("no assembled images".into()))?;
        let kept = &record.pulses.kept;

        let mean_image = StatsHelper::nanmean_pulses(images.view(), kept);
        let reference_difference = match &record.control.reference {
            Some(reference) if reference.dim() != mean_image.dim() => {
                return Err(StageError::InvalidInput(format!(
                    "reference image has shape {:?}, images are {:?}",
                    reference.dim(),
                    mean_image.dim()
                )))
            }
            Some(reference) => Some(&mean_image - &**reference),
            None => None,
        };

        let roi_means = record
            .pulses
            .roi
            .iter()
            .map(|series| {
                let values = series
                    .values
                    .iter()
                    .zip(kept)
                    .filter(|(_, keep)| **keep)
                    .map(|(v, _)| *v);
                (series.name.clone(), StatsHelper::nanmean(values))
            })
            .collect();

        let mut results = TrainResults {
            mean_image: Some(mean_image),
            reference_difference,
            roi_means,
            ..Default::default()
        };

        if let Some(profiles) = &record.pulses.azimuthal {
            let all: Vec<usize> = (0..kept.len()).collect();
            if let Some(mean_profile) = pulse_mean(profiles, kept, &all) {
                let fom = StatsHelper::trapz(&profiles.momentum, &mean_profile, self.config.fom_range);
                push_bounded(&mut self.fom_history, fom, self.config.moving_average_window);
                results.moving_fom =
                    Some(self.fom_history.iter().sum::<f64>() / self.fom_history.len() as f64);
                results.fom = Some(fom);
                results.mean_profile = Some(mean_profile);
            }
            results.pump_probe = self.pump_probe(record.train_id, profiles, kept);
        }

        record.train = results;
        Ok(())
    }

    fn cleanup(&mut self) {
        self.fom_history.clear();
        self.on_history.clear();
        self.off_history.clear();
        self.pending_on = None;
    }
}
