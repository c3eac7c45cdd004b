use crate::config::PipelineConfig;
use crate::pipeline::record::TrainRecord;
use crate::prelude::{ProcessingStage, StageError, StageResult};

/// Drops pulses whose azimuthal FOM lies outside the configured range.
#[derive(Default)]
pub struct PostFilterStage {
    fom_range: Option<(f64, f64)>,
}

impl PostFilterStage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessingStage for PostFilterStage {
    fn name(&self) -> &'static str {
        "postfilter"
    }

    fn initialize(&mut self, config: &PipelineConfig) -> StageResult<()> {
        self.fom_range = config.post_filter.fom_range;
        Ok(())
    }

    fn process(&mut self, record: &mut TrainRecord) -> StageResult<()> {
        let (Some((low, high)), Some(profiles)) = (self.fom_range, &record.pulses.azimuthal) else {
            return Ok(());
        };
        for (kept, &fom) in record.pulses.kept.iter_mut().zip(&profiles.fom) {
            *kept &= fom >= low && fom <= high;
        }
        if !record.pulses.kept.is_empty() && record.pulses.kept_count() == 0 {
            return Err(StageError::InvalidInput(format!(
                "no pulse has a FOM within [{low}, {high}]"
            )));
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.fom_range = None;
    }
}
