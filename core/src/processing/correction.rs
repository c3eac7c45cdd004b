use crate::config::{ImageConfig, PipelineConfig};
use crate::control::CalConstants;
use crate::pipeline::record::TrainRecord;
use crate::prelude::{ProcessingStage, StageError, StageResult};
use ndarray::{Array3, Axis};

/// Per-pulse image correction: offset and gain per memory cell, constant
/// background, then masking. Masked pixels become NaN.
pub struct CorrectionStage {
    image: ImageConfig,
}

impl CorrectionStage {
    pub fn new() -> Self {
        Self {
            image: ImageConfig::default(),
        }
    }
}

impl Default for CorrectionStage {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_constants(
    images: &mut Array3<f32>,
    constants: &CalConstants,
    first_cell: usize,
    kind: &str,
    op: impl Fn(&mut f32, f32),
) -> StageResult<()> {
    let (_, rows, cols) = images.dim();
    if constants.image_shape() != (rows, cols) {
        return Err(StageError::InvalidInput(format!(
            "{kind} constants have shape {:?}, images are {:?}",
            constants.image_shape(),
            (rows, cols)
        )));
    }
    for (i, mut image) in images.axis_iter_mut(Axis(0)).enumerate() {
        let cell = first_cell + i;
        let values = constants.for_cell(cell).ok_or_else(|| {
            StageError::InvalidInput(format!("no {kind} constants for memory cell {cell}"))
        })?;
        image.zip_mut_with(&values, |v, &c| op(v, c));
    }
    Ok(())
}

impl ProcessingStage for CorrectionStage {
    fn name(&self) -> &'static str {
        "correction"
    }

    fn initialize(&mut self, config: &PipelineConfig) -> StageResult<()> {
        self.image = config.image;
        Ok(())
    }

    fn process(&mut self, record: &mut TrainRecord) -> StageResult<()> {
        let images = record
            .assembled
            .as_mut()
            .ok_or_else(|| StageError::Internal("no assembled images".into()))?;
        let control = &record.control;
        let first_cell = record.pulse_window.start;

        if let Some(offset) = &control.offset {
            apply_constants(images, offset, first_cell, "offset", |v, c| *v -= c)?;
        }
        if let Some(gain) = &control.gain {
            apply_constants(images, gain, first_cell, "gain", |v, c| *v *= c)?;
        }
        if self.image.background != 0.0 {
            let background = self.image.background;
            images.mapv_inplace(|v| v - background);
        }

        if let Some(mask) = &control.mask {
            let (_, rows, cols) = images.dim();
            if mask.dim() != (rows, cols) {
                return Err(StageError::InvalidInput(format!(
                    "mask has shape {:?}, images are {:?}",
                    mask.dim(),
                    (rows, cols)
                )));
            }
            for mut image in images.axis_iter_mut(Axis(0)) {
                image.zip_mut_with(&**mask, |v, &masked| {
                    if masked {
                        *v = f32::NAN;
                    }
                });
            }
        }
        if let Some((low, high)) = self.image.threshold {
            images.mapv_inplace(|v| if v < low || v > high { f32::NAN } else { v });
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.image = ImageConfig::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlSnapshot;
    use crate::geometry::ModuleAxis;
    use crate::pipeline::record::{ModuleStack, RawImages, RawTrain};
    use ndarray::{Array2, Array4};
    use std::sync::Arc;

    fn record(control: ControlSnapshot) -> TrainRecord {
        let train = RawTrain {
            train_id: 1,
            images: RawImages::F32(ModuleStack::Dense {
                data: Array4::zeros((1, 1, 1, 1)),
                order: ModuleAxis::PulsesFirst,
            }),
        };
        let mut record = TrainRecord::new(train, control);
        record.raw = None;
        record.pulse_window = 1..3;
        record.assembled = Some(Array3::from_elem((2, 2, 2), 10.0));
        record
    }

    fn stage(image: ImageConfig) -> CorrectionStage {
        let mut stage = CorrectionStage::new();
        let mut config = PipelineConfig::default();
        config.image = image;
        stage.initialize(&config).unwrap();
        stage
    }

    #[test]
    fn per_cell_constants_follow_original_pulse_index() {
        let offset = Array3::from_shape_fn((4, 2, 2), |(cell, _, _)| cell as f32);
        let control = ControlSnapshot {
            offset: Some(Arc::new(CalConstants::PerCell(offset))),
            gain: Some(Arc::new(CalConstants::PerPixel(Array2::from_elem((2, 2), 2.0)))),
            ..Default::default()
        };
        let mut rec = record(control);
        stage(ImageConfig::default()).process(&mut rec).unwrap();
        let images = rec.assembled.unwrap();
        // window starts at pulse 1: (10 - 1) * 2 and (10 - 2) * 2
        assert_eq!(images[[0, 0, 0]], 18.0);
        assert_eq!(images[[1, 1, 1]], 16.0);
    }

    #[test]
    fn too_few_memory_cells_invalidate() {
        let control = ControlSnapshot {
            gain: Some(Arc::new(CalConstants::PerCell(Array3::ones((2, 2, 2))))),
            ..Default::default()
        };
        let mut rec = record(control);
        assert!(stage(ImageConfig::default()).process(&mut rec).is_err());
    }

    #[test]
    fn mask_background_and_threshold() {
        let mut mask = Array2::from_elem((2, 2), false);
        mask[[0, 1]] = true;
        let control = ControlSnapshot {
            mask: Some(Arc::new(mask)),
            ..Default::default()
        };
        let mut rec = record(control);
        rec.assembled.as_mut().unwrap()[[1, 1, 0]] = 100.0;
        let image = ImageConfig {
            background: 1.0,
            threshold: Some((0.0, 50.0)),
        };
        stage(image).process(&mut rec).unwrap();
        let images = rec.assembled.unwrap();
        assert_eq!(images[[0, 0, 0]], 9.0);
        assert!(images[[0, 0, 1]].is_nan());
        assert!(images[[1, 0, 1]].is_nan());
        assert!(images[[1, 1, 0]].is_nan());
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let control = ControlSnapshot {
            mask: Some(Arc::new(Array2::from_elem((3, 3), false))),
            ..Default::default()
        };
        let mut rec = record(control);
        assert!(stage(ImageConfig::default()).process(&mut rec).is_err());
    }
}
