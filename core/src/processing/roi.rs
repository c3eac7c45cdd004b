use crate::config::{PipelineConfig, RoiConfig, RoiFom};
use crate::math::stats::StatsHelper;
use crate::pipeline::record::{RoiSeries, TrainRecord};
use crate::prelude::{ProcessingStage, StageError, StageResult};
use ndarray::{s, Axis};

/// Per-pulse sum or mean over rectangular regions. NaN pixels do not count.
pub struct RoiStage {
    rois: Vec<RoiConfig>,
}

impl RoiStage {
    pub fn new() -> Self {
        Self { rois: Vec::new() }
    }
}

impl Default for RoiStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingStage for RoiStage {
    fn name(&self) -> &'static str {
        "roi"
    }

    fn initialize(&mut self, config: &PipelineConfig) -> StageResult<()> {
        self.rois = config.rois.clone();
        Ok(())
    }

    fn process(&mut self, record: &mut TrainRecord) -> StageResult<()> {
        if self.rois.is_empty() {
            return Ok(());
        }
        let images = record
            .images()
            .ok_or_else(|| StageError::Internal("no assembled images".into()))?;
        let (_, rows, cols) = images.dim();

        let series = self
            .rois
            .iter()
            .map(|roi| {
                let values = images
                    .axis_iter(Axis(0))
                    .map(|image| match roi.rect.clip((rows, cols)) {
                        Some((r, c)) => {
                            let region = image.slice(s![r, c]);
                            match roi.fom {
                                RoiFom::Sum => StatsHelper::nansum(region.iter().copied()),
                                RoiFom::Mean => StatsHelper::nanmean(region.iter().copied()),
                            }
                        }
                        None => match roi.fom {
                            RoiFom::Sum => 0.0,
                            RoiFom::Mean => f32::NAN,
                        },
                    })
                    .collect();
                RoiSeries {
                    name: roi.name.clone(),
                    values,
                }
            })
            .collect();
        record.pulses.roi = series;
        Ok(())
    }

    fn cleanup(&mut self) {
        self.rois.clear();
    }
}
