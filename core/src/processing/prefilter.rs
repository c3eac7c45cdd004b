use crate::config::{PipelineConfig, PulseConfig};
use crate::pipeline::record::TrainRecord;
use crate::prelude::{ProcessingStage, StageError, StageResult};

/// Rejects trains with the wrong module layout and selects the pulse window.
pub struct PreFilterStage {
    n_modules: usize,
    module_shape: (usize, usize),
    pulses: PulseConfig,
}

impl PreFilterStage {
    pub fn new(n_modules: usize, module_shape: (usize, usize)) -> Self {
        Self {
            n_modules,
            module_shape,
            pulses: PulseConfig::default(),
        }
    }
}

impl ProcessingStage for PreFilterStage {
    fn name(&self) -> &'static str {
        "prefilter"
    }

    fn initialize(&mut self, config: &PipelineConfig) -> StageResult<()> {
        self.pulses = config.pulses;
        Ok(())
    }

    fn process(&mut self, record: &mut TrainRecord) -> StageResult<()> {
        let raw = record
            .raw
            .as_ref()
            .ok_or_else(|| StageError::InvalidInput("train carries no image data".into()))?;

        if raw.module_count() != self.n_modules {
            return Err(StageError::InvalidInput(format!(
                "expected {} modules, found {}",
                self.n_modules,
                raw.module_count()
            )));
        }
        if raw.module_shape() != self.module_shape {
            return Err(StageError::InvalidInput(format!(
                "expected module shape {:?}, found {:?}",
                self.module_shape,
                raw.module_shape()
            )));
        }

        let available = raw.pulse_count();
        if self.pulses.start >= available {
            return Err(StageError::InvalidInput(format!(
                "pulse window starts at {} but the train has {} pulses",
                self.pulses.start, available
            )));
        }
        let end = self
            .pulses
            .end
            .map_or(available, |last| (last + 1).min(available));
        record.pulse_window = self.pulses.start..end;
        Ok(())
    }

    fn cleanup(&mut self) {
        self.pulses = PulseConfig::default();
    }
}
