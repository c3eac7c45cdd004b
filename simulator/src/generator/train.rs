use fxcore::geometry::{DetectorFamily, ModuleAxis, ModuleTopology, StackedModuleView};
use fxcore::pipeline::{ModuleStack, RawImages, RawTrain};
use ndarray::{Array3, Array4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Configuration for generating synthetic detector trains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub family: DetectorFamily,
    pub pulses: usize,
    /// Mean pixel value of the first pulse.
    pub level: f32,
    /// Per-pulse increase of the mean level.
    pub pulse_step: f32,
    pub noise: f32,
    pub seed: u64,
    pub first_train_id: u64,
    /// Every n-th train is delivered with one module short.
    pub malformed_every: Option<u64>,
    /// Every n-th train arrives as u16 per-module stacks with one module missing.
    pub sparse_every: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            family: DetectorFamily::Dssc1M,
            pulses: 4,
            level: 100.0,
            pulse_step: 10.0,
            noise: 2.0,
            seed: 0,
            first_train_id: 10_000,
            malformed_every: None,
            sparse_every: None,
        }
    }
}

fn every(period: Option<u64>, index: u64) -> bool {
    matches!(period, Some(n) if n > 0 && (index + 1) % n == 0)
}

/// Seeded source of synthetic trains with consecutive ids.
pub struct TrainGenerator {
    config: GeneratorConfig,
    topology: ModuleTopology,
    rng: StdRng,
    produced: u64,
}

impl TrainGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            topology: config.family.topology(),
            rng: StdRng::seed_from_u64(config.seed),
            produced: 0,
            config,
        }
    }

    fn pixel(&mut self, pulse: usize) -> f32 {
        let mean = self.config.level + self.config.pulse_step * pulse as f32;
        let jitter = if self.config.noise > 0.0 {
            self.rng.gen_range(-self.config.noise..self.config.noise)
        } else {
            0.0
        };
        (mean + jitter).max(0.0)
    }

    fn dense(&mut self, train_id: u64, n_modules: usize) -> RawTrain {
        let (rows, cols) = self.topology.module_shape;
        let mut data = Array4::zeros((self.config.pulses, n_modules, rows, cols));
        for ((pulse, _, _, _), value) in data.indexed_iter_mut() {
            *value = self.pixel(pulse);
        }
        RawTrain {
            train_id,
            images: RawImages::F32(ModuleStack::Dense {
                data,
                order: ModuleAxis::PulsesFirst,
            }),
        }
    }

    fn sparse(&mut self, train_id: u64) -> anyhow::Result<RawTrain> {
        let (rows, cols) = self.topology.module_shape;
        let n_modules = self.topology.n_modules;
        let missing = (train_id as usize) % n_modules;
        let mut modules = Vec::with_capacity(n_modules - 1);
        for module in (0..n_modules).filter(|&m| m != missing) {
            let mut stack = Array3::<u16>::zeros((self.config.pulses, rows, cols));
            for ((pulse, _, _), value) in stack.indexed_iter_mut() {
                *value = self.pixel(pulse).round().min(f32::from(u16::MAX - 1)) as u16;
            }
            modules.push((module, stack));
        }
        let view = StackedModuleView::new(
            modules,
            n_modules,
            [self.config.pulses, rows, cols],
            u16::MAX,
            ModuleAxis::ModulesFirst,
        )?;
        Ok(RawTrain {
            train_id,
            images: RawImages::U16(ModuleStack::Stacked(view)),
        })
    }

    pub fn next_train(&mut self) -> anyhow::Result<RawTrain> {
        let index = self.produced;
        let train_id = self.config.first_train_id + index;
        self.produced += 1;

        let train = if every(self.config.malformed_every, index) {
            self.dense(train_id, self.topology.n_modules - 1)
        } else if every(self.config.sparse_every, index) {
            self.sparse(train_id)?
        } else {
            self.dense(train_id, self.topology.n_modules)
        };
        log::debug!(target: "simulator::generator", "generated train {}", train_id);
        Ok(train)
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> GeneratorConfig {
        GeneratorConfig {
            pulses: 2,
            noise: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn trains_have_consecutive_ids_and_pulse_levels() {
        let mut generator = TrainGenerator::new(small());
        let first = generator.next_train().unwrap();
        let second = generator.next_train().unwrap();
        assert_eq!(first.train_id, 10_000);
        assert_eq!(second.train_id, 10_001);
        assert_eq!(first.images.module_count(), 16);
        assert_eq!(first.images.pulse_count(), 2);
        match &first.images {
            RawImages::F32(ModuleStack::Dense { data, .. }) => {
                assert_eq!(data[[0, 3, 5, 5]], 100.0);
                assert_eq!(data[[1, 3, 5, 5]], 110.0);
            }
            other => panic!("unexpected layout {other:?}"),
        }
    }

    #[test]
    fn malformed_and_sparse_trains_follow_their_period() {
        let mut generator = TrainGenerator::new(GeneratorConfig {
            malformed_every: Some(3),
            sparse_every: Some(2),
            ..small()
        });
        let trains: Vec<_> = (0..4).map(|_| generator.next_train().unwrap()).collect();
        assert_eq!(trains[2].images.module_count(), 15);
        assert!(matches!(trains[1].images, RawImages::U16(ModuleStack::Stacked(_))));
        assert!(matches!(trains[3].images, RawImages::U16(ModuleStack::Stacked(_))));
        assert_eq!(trains[3].images.module_count(), 16);
        assert_eq!(generator.produced(), 4);
    }

    #[test]
    fn same_seed_same_data() {
        let config = GeneratorConfig {
            pulses: 1,
            ..Default::default()
        };
        let a = TrainGenerator::new(config.clone()).next_train().unwrap();
        let b = TrainGenerator::new(config).next_train().unwrap();
        match (&a.images, &b.images) {
            (
                RawImages::F32(ModuleStack::Dense { data: x, .. }),
                RawImages::F32(ModuleStack::Dense { data: y, .. }),
            ) => assert_eq!(x, y),
            _ => panic!("expected dense trains"),
        }
    }
}
