use crate::config::PipelineConfig;
use crate::control::{ControlPlane, ControlSnapshot};
use crate::geometry::GeometryAssembler;
use crate::pipeline::queue::{OutboundQueue, PushOutcome, SourceError, TrainSource};
use crate::pipeline::record::TrainRecord;
use crate::pipeline::PipelineError;
use crate::prelude::ProcessingStage;
use crate::processing::{
    AggregationStage, AssemblyStage, AzimuthalStage, CorrectionStage, PostFilterStage,
    PreFilterStage, RoiStage,
};
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::{MetricsRecorder, MetricsSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Running,
    Stopping,
    Stopped,
}

/// Cooperative stop request, observed at the top of each loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fixed, ordered list of stages.
pub struct StageChain {
    stages: Vec<Box<dyn ProcessingStage>>,
    logger: LogManager,
}

impl StageChain {
    pub fn new(stages: Vec<Box<dyn ProcessingStage>>, logger: LogManager) -> Self {
        Self { stages, logger }
    }

    /// pre-filter → assembly → correction → ROI → azimuthal → post-filter → aggregation
    pub fn standard(assembler: GeometryAssembler, logger: LogManager) -> Self {
        let topology = assembler.topology();
        let prefilter = PreFilterStage::new(topology.n_modules, topology.module_shape);
        let azimuthal = AzimuthalStage::new(
            topology.pixel_size,
            assembler.canvas_shape(),
            logger.child("azimuthal"),
        );
        let stages: Vec<Box<dyn ProcessingStage>> = vec![
            Box::new(prefilter),
            Box::new(AssemblyStage::new(assembler)),
            Box::new(CorrectionStage::new()),
            Box::new(RoiStage::new()),
            Box::new(azimuthal),
            Box::new(PostFilterStage::new()),
            Box::new(AggregationStage::new()),
        ];
        Self::new(stages, logger)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn initialize(&mut self, config: &PipelineConfig) -> Result<(), PipelineError> {
        for stage in &mut self.stages {
            stage
                .initialize(config)
                .map_err(|source| PipelineError::StageInit {
                    stage: stage.name(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Run every stage in order. Once a stage fails the record is marked
    /// invalid and the remaining stages leave it alone.
    pub fn run(&mut self, record: &mut TrainRecord) {
        for stage in &mut self.stages {
            if !record.is_valid() {
                break;
            }
            let name = stage.name();
            let result = self.logger.timed(name, || stage.process(record));
            if let Err(err) = result {
                self.logger.warn(&format!(
                    "train {} invalid at {}: {}",
                    record.train_id, name, err
                ));
                record.invalidate(name, err.to_string());
            }
        }
    }

    pub fn cleanup(&mut self) {
        for stage in &mut self.stages {
            stage.cleanup();
        }
    }
}

/// Single-threaded train loop: pull, refresh control state, run the chain,
/// push without blocking.
pub struct PipelineWorker<S> {
    config: PipelineConfig,
    source: S,
    outbound: OutboundQueue,
    chain: StageChain,
    control: Option<ControlPlane>,
    snapshot: ControlSnapshot,
    canvas_shape: (usize, usize),
    metrics: Arc<MetricsRecorder>,
    stop: StopSignal,
    state: WorkerState,
    logger: LogManager,
}

fn worker_logger(config: &PipelineConfig) -> LogManager {
    LogManager::new(format!("fxcore::worker::{}", config.worker.name))
}

impl<S: TrainSource> PipelineWorker<S> {
    /// Validates the configuration and builds the geometry. Both failures are
    /// fatal and reported here.
    pub fn new(
        config: PipelineConfig,
        source: S,
        outbound: OutboundQueue,
        control: Option<ControlPlane>,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let assembler = config.detector.build_assembler()?;
        let logger = worker_logger(&config);
        let chain = StageChain::standard(assembler.clone(), logger.child("chain"));
        Ok(Self::assemble(
            config,
            source,
            outbound,
            control,
            metrics,
            chain,
            assembler.canvas_shape(),
            logger,
        ))
    }

    /// Use a custom stage chain; `canvas_shape` sizes masks created from scratch.
    pub fn with_chain(
        config: PipelineConfig,
        source: S,
        outbound: OutboundQueue,
        control: Option<ControlPlane>,
        metrics: Arc<MetricsRecorder>,
        chain: StageChain,
        canvas_shape: (usize, usize),
    ) -> Self {
        let logger = worker_logger(&config);
        Self::assemble(
            config,
            source,
            outbound,
            control,
            metrics,
            chain,
            canvas_shape,
            logger,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: PipelineConfig,
        source: S,
        outbound: OutboundQueue,
        control: Option<ControlPlane>,
        metrics: Arc<MetricsRecorder>,
        chain: StageChain,
        canvas_shape: (usize, usize),
        logger: LogManager,
    ) -> Self {
        Self {
            config,
            source,
            outbound,
            chain,
            control,
            snapshot: ControlSnapshot::default(),
            canvas_shape,
            metrics,
            stop: StopSignal::new(),
            state: WorkerState::Init,
            logger,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn snapshot(&self) -> &ControlSnapshot {
        &self.snapshot
    }

    /// `Init → Running`: initialize every stage and subscribe to the control plane.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != WorkerState::Init {
            return Ok(());
        }
        self.chain.initialize(&self.config)?;
        if let Some(control) = self.control.as_mut() {
            if let Err(err) = control.connect() {
                self.metrics.record_control_error();
                self.logger
                    .warn(&format!("control plane unavailable, will retry: {err}"));
            }
        }
        self.logger.record(&format!(
            "running stages {:?}",
            self.chain.stage_names()
        ));
        self.state = WorkerState::Running;
        Ok(())
    }

    fn refresh_control(&mut self) {
        if let Some(control) = self.control.as_mut() {
            self.snapshot = control.refresh(&self.snapshot, self.canvas_shape);
        }
    }

    /// Process one train, or wait up to the pull timeout for one.
    pub fn step(&mut self) -> WorkerState {
        match self.state {
            WorkerState::Running if self.stop.is_raised() => {
                self.state = WorkerState::Stopping;
            }
            WorkerState::Running => self.poll(),
            WorkerState::Stopping => self.shutdown(),
            WorkerState::Init | WorkerState::Stopped => {}
        }
        self.state
    }

    fn poll(&mut self) {
        match self.source.next_train(self.config.worker.pull_timeout()) {
            Ok(Some(train)) => {
                self.refresh_control();
                let mut record = TrainRecord::new(train, self.snapshot.clone());
                self.chain.run(&mut record);
                self.metrics
                    .record_processed(record.train_id, record.is_valid());
                self.emit(record);
            }
            Ok(None) => self.refresh_control(),
            Err(SourceError::Disconnected) => {
                self.logger.record("inbound source closed");
                self.state = WorkerState::Stopping;
            }
            Err(err) => self.logger.warn(&err.to_string()),
        }
    }

    fn emit(&mut self, record: TrainRecord) {
        let train_id = record.train_id;
        match self.outbound.push(record) {
            PushOutcome::Sent => {}
            PushOutcome::Dropped => {
                self.metrics.record_dropped();
                self.logger
                    .debug(&format!("outbound queue full, dropped train {train_id}"));
            }
            PushOutcome::Closed => {
                self.logger.record("outbound consumer gone");
                self.state = WorkerState::Stopping;
            }
        }
        if self.config.worker.publish_metrics {
            if let Some(control) = self.control.as_ref() {
                control.publish_metrics(&self.config.worker.name, &self.metrics.snapshot());
            }
        }
    }

    fn shutdown(&mut self) {
        self.chain.cleanup();
        self.state = WorkerState::Stopped;
        self.logger.record("stopped");
    }

    /// Run until stopped or the source closes.
    pub fn run(mut self) -> Result<MetricsSnapshot, PipelineError> {
        self.start()?;
        while self.step() != WorkerState::Stopped {}
        Ok(self.metrics.snapshot())
    }
}

pub struct WorkerHandle {
    stop: StopSignal,
    thread: JoinHandle<Result<MetricsSnapshot, PipelineError>>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.stop.raise();
    }

    pub fn join(self) -> Result<MetricsSnapshot, PipelineError> {
        self.thread.join().map_err(|_| PipelineError::Panicked)?
    }

    pub fn stop_and_join(self) -> Result<MetricsSnapshot, PipelineError> {
        self.stop();
        self.join()
    }
}

/// Run `worker` on its own thread.
pub fn spawn_worker<S>(worker: PipelineWorker<S>) -> Result<WorkerHandle, PipelineError>
where
    S: TrainSource + 'static,
{
    let stop = worker.stop_signal();
    let name = format!("pipeline-{}", worker.config.worker.name);
    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || worker.run())
        .map_err(|err| PipelineError::Spawn(err.to_string()))?;
    Ok(WorkerHandle { stop, thread })
}
