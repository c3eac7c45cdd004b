use crate::config::PipelineConfig;
use crate::geometry::{GeometryAssembler, ModuleData, Pixel};
use crate::pipeline::record::{RawImages, TrainRecord};
use crate::prelude::{ProcessingStage, StageError, StageResult};
use ndarray::Array3;
use std::ops::Range;

/// Stitches the selected pulses of every module into one canvas per pulse.
pub struct AssemblyStage {
    assembler: GeometryAssembler,
}

impl AssemblyStage {
    pub fn new(assembler: GeometryAssembler) -> Self {
        Self { assembler }
    }

    pub fn assembler(&self) -> &GeometryAssembler {
        &self.assembler
    }

    fn assemble<T>(&self, modules: ModuleData<'_, T>, window: Range<usize>) -> StageResult<Array3<f32>>
    where
        T: Pixel + Into<f32>,
    {
        let modules = modules.select_pulses(window)?;
        let mut canvas = self.assembler.allocate_canvas::<f32>(modules.pulse_count());
        self.assembler.assemble(&modules, &mut canvas)?;
        Ok(canvas)
    }
}

impl ProcessingStage for AssemblyStage {
    fn name(&self) -> &'static str {
        "assembly"
    }

    fn initialize(&mut self, _config: &PipelineConfig) -> StageResult<()> {
        Ok(())
    }

    fn process(&mut self, record: &mut TrainRecord) -> StageResult<()> {
        let raw = record
            .raw
            .take()
            .ok_or_else(|| StageError::InvalidInput("train carries no image data".into()))?;
        let window = record.pulse_window.clone();
        let canvas = match &raw {
            RawImages::F32(stack) => self.assemble(stack.as_module_data(), window)?,
            RawImages::U16(stack) => self.assemble(stack.as_module_data(), window)?,
        };
        record.pulses.kept = vec![true; canvas.len_of(ndarray::Axis(0))];
        record.assembled = Some(canvas);
        Ok(())
    }

    fn cleanup(&mut self) {}
}
