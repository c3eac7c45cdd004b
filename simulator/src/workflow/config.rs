use crate::generator::train::GeneratorConfig;
use anyhow::Context;
use fxcore::config::{BrokerBackend, PipelineConfig};
use fxcore::math::Rect;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Control-plane updates pushed once before the first train.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlScript {
    pub mask_regions: Vec<Rect>,
    /// Constant reference image subtracted from the train mean.
    pub reference_level: Option<f32>,
    pub gain_file: Option<PathBuf>,
    pub offset_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub trains: u64,
    pub pipeline: PipelineConfig,
    pub generator: GeneratorConfig,
    pub control: ControlScript,
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        config
            .pipeline
            .validate()
            .with_context(|| format!("validating workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    /// Self-contained run: producer and worker share an in-process broker.
    pub fn from_args(trains: u64, seed: u64, malformed_every: Option<u64>) -> Self {
        let mut pipeline = PipelineConfig::default();
        pipeline.broker.backend = BrokerBackend::InProcess;
        Self {
            trains,
            pipeline,
            generator: GeneratorConfig {
                seed,
                malformed_every,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxcore::config::{LaserMode, RoiFom};
    use fxcore::geometry::DetectorFamily;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_from_args_sets_generator() {
        let cfg = WorkflowConfig::from_args(5, 7, Some(3));
        assert_eq!(cfg.trains, 5);
        assert_eq!(cfg.generator.seed, 7);
        assert_eq!(cfg.generator.malformed_every, Some(3));
        assert_eq!(cfg.pipeline.broker.backend, BrokerBackend::InProcess);
        assert_eq!(cfg.pipeline.detector, PipelineConfig::default().detector);
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"trains: 3
pipeline:
  broker:
    host: control-host
    port: 6380
  detector:
    family: Lpd1M
  pulses:
    start: 1
    end: 2
  rois:
    - name: centre
      rect: { x: 500, y: 500, w: 20, h: 20 }
      fom: mean
  azimuthal:
    enabled: true
  aggregation:
    laser_mode: even_on
    on_pulses: [0]
    off_pulses: [1]
generator:
  family: Lpd1M
  pulses: 3
control:
  mask_regions:
    - { x: 0, y: 0, w: 10, h: 10 }
  reference_level: 50.0
",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.trains, 3);
        assert_eq!(cfg.pipeline.detector.family, DetectorFamily::Lpd1M);
        assert_eq!(cfg.pipeline.broker.backend, BrokerBackend::Redis);
        assert_eq!(cfg.pipeline.broker.address(), "control-host:6380");
        assert_eq!(cfg.pipeline.pulses.end, Some(2));
        assert_eq!(cfg.pipeline.rois[0].fom, RoiFom::Mean);
        assert_eq!(cfg.pipeline.aggregation.laser_mode, LaserMode::EvenOn);
        assert_eq!(cfg.pipeline.worker.pull_timeout_ms, 100);
        assert_eq!(cfg.generator.pulses, 3);
        assert_eq!(cfg.control.mask_regions, vec![Rect::new(0, 0, 10, 10)]);
    }

    #[test]
    fn invalid_pipeline_is_rejected_on_load() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"pipeline:\n  pulses:\n    start: 4\n    end: 1\n")
            .unwrap();
        let path = temp.into_temp_path();
        let err = WorkflowConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("pulses"));
    }
}
