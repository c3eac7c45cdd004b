use crate::control::ControlSnapshot;
use crate::geometry::{ModuleAxis, ModuleData, Pixel, StackedModuleView};
use ndarray::{Array2, Array3, Array4};
use std::ops::Range;

/// Module stacks of one train as delivered by the inbound source.
#[derive(Debug)]
pub enum ModuleStack<T> {
    Dense { data: Array4<T>, order: ModuleAxis },
    Stacked(StackedModuleView<T>),
}

impl<T: Pixel> ModuleStack<T> {
    pub fn as_module_data(&self) -> ModuleData<'_, T> {
        match self {
            ModuleStack::Dense { data, order } => ModuleData::dense(data.view(), *order),
            ModuleStack::Stacked(view) => ModuleData::stacked(view),
        }
    }
}

/// Raw image data in the dtypes the bridge is known to deliver.
#[derive(Debug)]
pub enum RawImages {
    F32(ModuleStack<f32>),
    U16(ModuleStack<u16>),
}

impl RawImages {
    pub fn module_count(&self) -> usize {
        match self {
            RawImages::F32(stack) => stack.as_module_data().module_count(),
            RawImages::U16(stack) => stack.as_module_data().module_count(),
        }
    }

    pub fn pulse_count(&self) -> usize {
        match self {
            RawImages::F32(stack) => stack.as_module_data().pulse_count(),
            RawImages::U16(stack) => stack.as_module_data().pulse_count(),
        }
    }

    pub fn module_shape(&self) -> (usize, usize) {
        match self {
            RawImages::F32(stack) => stack.as_module_data().module_shape(),
            RawImages::U16(stack) => stack.as_module_data().module_shape(),
        }
    }
}

/// One train pulled from the inbound source.
#[derive(Debug)]
pub struct RawTrain {
    pub train_id: u64,
    pub images: RawImages,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RecordStatus {
    #[default]
    Valid,
    Invalid { stage: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoiSeries {
    pub name: String,
    /// One value per pulse in the window.
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AzimuthalProfiles {
    /// Bin centres in 1/Å.
    pub momentum: Vec<f64>,
    /// `(pulses, bins)`.
    pub intensities: Array2<f64>,
    pub fom: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PulseResults {
    pub kept: Vec<bool>,
    pub roi: Vec<RoiSeries>,
    pub azimuthal: Option<AzimuthalProfiles>,
}

impl PulseResults {
    pub fn kept_count(&self) -> usize {
        self.kept.iter().filter(|&&k| k).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PumpProbeResult {
    /// Train whose on pulses were used.
    pub on_train_id: u64,
    pub momentum: Vec<f64>,
    pub on: Vec<f64>,
    pub off: Vec<f64>,
    pub difference: Vec<f64>,
    pub fom: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainResults {
    pub mean_image: Option<Array2<f32>>,
    pub reference_difference: Option<Array2<f32>>,
    pub roi_means: Vec<(String, f32)>,
    pub mean_profile: Option<Vec<f64>>,
    pub fom: Option<f64>,
    pub moving_fom: Option<f64>,
    pub pump_probe: Option<PumpProbeResult>,
}

/// Per-train state threaded through the stage chain.
#[derive(Debug)]
pub struct TrainRecord {
    pub train_id: u64,
    /// Taken by the assembly stage.
    pub raw: Option<RawImages>,
    /// Selected pulses, as indices into the full train.
    pub pulse_window: Range<usize>,
    pub assembled: Option<Array3<f32>>,
    pub control: ControlSnapshot,
    pub pulses: PulseResults,
    pub train: TrainResults,
    pub status: RecordStatus,
}

impl TrainRecord {
    pub fn new(train: RawTrain, control: ControlSnapshot) -> Self {
        let pulse_count = train.images.pulse_count();
        Self {
            train_id: train.train_id,
            raw: Some(train.images),
            pulse_window: 0..pulse_count,
            assembled: None,
            control,
            pulses: PulseResults::default(),
            train: TrainResults::default(),
            status: RecordStatus::Valid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == RecordStatus::Valid
    }

    /// Mark the record unusable; the first reason is kept.
    pub fn invalidate(&mut self, stage: &'static str, reason: impl Into<String>) {
        if self.is_valid() {
            self.status = RecordStatus::Invalid {
                stage,
                reason: reason.into(),
            };
        }
    }

    pub fn images(&self) -> Option<&Array3<f32>> {
        self.assembled.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train() -> RawTrain {
        RawTrain {
            train_id: 7,
            images: RawImages::U16(ModuleStack::Dense {
                data: Array4::zeros((3, 4, 2, 2)),
                order: ModuleAxis::PulsesFirst,
            }),
        }
    }

    #[test]
    fn new_record_spans_every_pulse() {
        let record = TrainRecord::new(train(), ControlSnapshot::default());
        assert_eq!(record.pulse_window, 0..3);
        assert!(record.is_valid());
        assert_eq!(record.raw.as_ref().unwrap().module_count(), 4);
    }

    #[test]
    fn first_invalidation_wins() {
        let mut record = TrainRecord::new(train(), ControlSnapshot::default());
        record.invalidate("prefilter", "bad");
        record.invalidate("assembly", "worse");
        assert_eq!(
            record.status,
            RecordStatus::Invalid {
                stage: "prefilter",
                reason: "bad".into()
            }
        );
    }
}
