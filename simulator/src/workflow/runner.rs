use crate::generator::train::TrainGenerator;
use crate::workflow::config::{ControlScript, WorkflowConfig};
use anyhow::Context;
use crossbeam_channel::{bounded, Receiver};
use fxcore::config::{BrokerBackend, BrokerConfig};
use fxcore::control::{
    control_plane, control_producer, Connector, ControlProducer, InMemoryBroker, RedisConnector,
};
use fxcore::pipeline::{
    outbound_queue, spawn_worker, PipelineWorker, RecordStatus, StopSignal, TrainRecord,
};
use fxcore::telemetry::{LogManager, MetricsRecorder, MetricsSnapshot};
use ndarray::Array2;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Nominal train repetition rate of the facility.
const TRAIN_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
pub struct TrainSummary {
    pub train_id: u64,
    pub valid: bool,
    pub invalid_stage: Option<String>,
    pub kept_pulses: usize,
    pub fom: Option<f64>,
    pub moving_fom: Option<f64>,
    pub roi_means: Vec<(String, f32)>,
    pub pump_probe_fom: Option<f64>,
}

impl From<&TrainRecord> for TrainSummary {
    fn from(record: &TrainRecord) -> Self {
        let invalid_stage = match &record.status {
            RecordStatus::Valid => None,
            RecordStatus::Invalid { stage, reason } => Some(format!("{stage}: {reason}")),
        };
        Self {
            train_id: record.train_id,
            valid: record.is_valid(),
            invalid_stage,
            kept_pulses: record.pulses.kept_count(),
            fom: record.train.fom,
            moving_fom: record.train.moving_fom,
            roi_means: record.train.roi_means.clone(),
            pump_probe_fom: record.train.pump_probe.as_ref().map(|pp| pp.fom),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub metrics: MetricsSnapshot,
    pub trains: Vec<TrainSummary>,
}

/// Which side of the control plane this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Role {
    /// Publish the control script, then run the worker on generated trains.
    #[default]
    All,
    /// Run the worker only; control updates come from another process.
    Worker,
    /// Publish the control script to the broker and exit.
    Control,
}

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
    role: Role,
}

/// One connector for the producer and one for the worker. An in-process
/// broker only works when both ends hold the same instance.
fn connectors(broker: &BrokerConfig) -> (Arc<dyn Connector>, Arc<dyn Connector>) {
    match broker.backend {
        BrokerBackend::Redis => (RedisConnector::shared(), RedisConnector::shared()),
        BrokerBackend::InProcess => {
            let hub = InMemoryBroker::with_password(broker.password.clone());
            (hub.connector(), hub.connector())
        }
    }
}

fn apply_script(
    producer: &ControlProducer,
    script: &ControlScript,
    canvas_shape: (usize, usize),
) -> anyhow::Result<()> {
    for region in &script.mask_regions {
        producer
            .mask
            .add(*region)
            .with_context(|| format!("publishing mask region {region}"))?;
    }
    if let Some(level) = script.reference_level {
        producer
            .reference
            .set(&Array2::from_elem(canvas_shape, level))
            .context("publishing reference image")?;
    }
    if let Some(path) = &script.gain_file {
        producer
            .calibration
            .set_gain(path)
            .context("publishing gain constants")?;
    }
    if let Some(path) = &script.offset_file {
        producer
            .calibration
            .set_offset(path)
            .context("publishing offset constants")?;
    }
    Ok(())
}

fn collect(results: Receiver<TrainRecord>) -> Vec<TrainSummary> {
    results.iter().map(|record| TrainSummary::from(&record)).collect()
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            role: Role::All,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Push the control script to the configured broker for workers running
    /// in other processes.
    pub fn publish_control(&self) -> anyhow::Result<()> {
        let pipeline = &self.config.pipeline;
        if pipeline.broker.backend == BrokerBackend::InProcess {
            anyhow::bail!("publishing to another process needs the redis broker backend");
        }
        let canvas_shape = pipeline
            .detector
            .build_assembler()
            .context("building detector geometry")?
            .canvas_shape();
        let producer = control_producer(&pipeline.broker, RedisConnector::shared());
        apply_script(&producer, &self.config.control, canvas_shape)?;
        log::info!(
            target: "simulator::runner",
            "control script published to {}",
            pipeline.broker.address()
        );
        Ok(())
    }

    /// Feed `config.trains` trains as fast as the worker takes them.
    pub fn execute(&self) -> anyhow::Result<RunSummary> {
        self.run(Some(self.config.trains), &StopSignal::new(), Duration::ZERO)
    }

    /// Feed trains at the facility rate until `stop` is raised.
    pub fn serve(&self, stop: &StopSignal) -> anyhow::Result<RunSummary> {
        self.run(None, stop, TRAIN_PERIOD)
    }

    fn run(
        &self,
        trains: Option<u64>,
        stop: &StopSignal,
        period: Duration,
    ) -> anyhow::Result<RunSummary> {
        let pipeline = &self.config.pipeline;
        let (producer_side, worker_side) = connectors(&pipeline.broker);
        let metrics = Arc::new(MetricsRecorder::new());
        let logger = LogManager::new("simulator::control");

        let mut control = control_plane(&pipeline.broker, worker_side, Arc::clone(&metrics), logger);
        // subscribe before the script goes out; a failure here is retried at
        // every train boundary
        if let Err(err) = control.connect() {
            log::warn!(
                target: "simulator::runner",
                "control plane at {} not reachable yet: {}",
                pipeline.broker.address(),
                err
            );
        }

        let (sender, receiver) = bounded(pipeline.worker.outbound_capacity);
        let (outbound, results) = outbound_queue(pipeline.worker.outbound_capacity);
        let worker = PipelineWorker::new(
            pipeline.clone(),
            receiver,
            outbound,
            Some(control),
            Arc::clone(&metrics),
        )
        .context("building pipeline worker")?;
        let canvas_shape = pipeline
            .detector
            .build_assembler()
            .context("building detector geometry")?
            .canvas_shape();

        if self.role == Role::All {
            let producer = control_producer(&pipeline.broker, producer_side);
            apply_script(&producer, &self.config.control, canvas_shape)?;
        }

        let handle = spawn_worker(worker).context("starting pipeline worker")?;
        let consumer = thread::Builder::new()
            .name("result-consumer".into())
            .spawn(move || collect(results))
            .context("starting result consumer")?;

        let mut generator = TrainGenerator::new(self.config.generator.clone());
        while trains.map_or(true, |n| generator.produced() < n) && !stop.is_raised() {
            let train = generator.next_train()?;
            if sender.send(train).is_err() {
                log::warn!(target: "simulator::runner", "worker stopped accepting trains");
                break;
            }
            if !period.is_zero() {
                thread::sleep(period);
            }
        }
        drop(sender);

        let metrics = handle.join().context("pipeline worker failed")?;
        let trains = consumer
            .join()
            .map_err(|_| anyhow::anyhow!("result consumer panicked"))?;
        log::info!(
            target: "simulator::runner",
            "processed {} trains, {} invalid, {} dropped",
            metrics.processed,
            metrics.invalid,
            metrics.dropped
        );
        Ok(RunSummary { metrics, trains })
    }
}
