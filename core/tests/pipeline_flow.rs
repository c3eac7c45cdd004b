use fxcore::config::{PipelineConfig, PulseConfig, RoiConfig, RoiFom};
use fxcore::control::{control_plane, control_producer, Broker, Connector, InMemoryBroker};
use fxcore::geometry::{ModuleAxis, StackedModuleView};
use fxcore::math::Rect;
use fxcore::pipeline::{
    outbound_queue, spawn_worker, ModuleStack, PipelineError, PipelineWorker, RawImages, RawTrain,
    RecordStatus,
};
use fxcore::telemetry::{LogManager, MetricsRecorder};
use ndarray::{Array3, Array4};
use std::sync::Arc;

fn dense_train(train_id: u64, n_modules: usize) -> RawTrain {
    RawTrain {
        train_id,
        images: RawImages::F32(ModuleStack::Dense {
            data: Array4::from_elem((3, n_modules, 128, 512), train_id as f32),
            order: ModuleAxis::PulsesFirst,
        }),
    }
}

fn stacked_train(train_id: u64) -> RawTrain {
    let modules = (0..16).map(|m| (m, Array3::from_elem((3, 128, 512), train_id as u16)));
    let view =
        StackedModuleView::new(modules, 16, [3, 128, 512], u16::MAX, ModuleAxis::ModulesFirst)
            .unwrap();
    RawTrain {
        train_id,
        images: RawImages::U16(ModuleStack::Stacked(view)),
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.pulses = PulseConfig {
        start: 1,
        end: Some(2),
    };
    config.rois = vec![RoiConfig {
        name: "centre".into(),
        rect: Rect::new(500, 500, 10, 10),
        fom: RoiFom::Mean,
    }];
    config.azimuthal.enabled = true;
    config.azimuthal.n_points = 64;
    config.worker.name = "flow".into();
    config.worker.pull_timeout_ms = 10;
    config.worker.outbound_capacity = 16;
    config.worker.publish_metrics = true;
    config
}

#[test]
fn trains_flow_through_every_stage() {
    let config = config();
    let broker = InMemoryBroker::new();
    let metrics = Arc::new(MetricsRecorder::new());
    let mut control = control_plane(
        &config.broker,
        broker.connector(),
        Arc::clone(&metrics),
        LogManager::new("flow-control"),
    );
    control.connect().unwrap();
    control_producer(&config.broker, broker.connector())
        .mask
        .add(Rect::new(0, 0, 10, 10))
        .unwrap();

    let (sender, receiver) = crossbeam_channel::unbounded();
    let (outbound, results) = outbound_queue(config.worker.outbound_capacity);
    let worker = PipelineWorker::new(
        config.clone(),
        receiver,
        outbound,
        Some(control),
        Arc::clone(&metrics),
    )
    .unwrap();
    let handle = spawn_worker(worker).unwrap();

    sender.send(dense_train(1, 16)).unwrap();
    sender.send(stacked_train(2)).unwrap();
    sender.send(dense_train(3, 15)).unwrap();
    sender.send(dense_train(4, 16)).unwrap();
    drop(sender);
    let snapshot = handle.join().unwrap();

    let records: Vec<_> = results.try_iter().collect();
    assert_eq!(
        records.iter().map(|r| r.train_id).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );

    for record in records.iter().filter(|r| r.train_id != 3) {
        assert!(record.is_valid(), "train {} invalid", record.train_id);
        let level = record.train_id as f32;
        assert_eq!(record.pulse_window, 1..3);
        assert_eq!(record.assembled.as_ref().unwrap().shape(), &[2, 1024, 1024]);

        let mean = record.train.mean_image.as_ref().unwrap();
        assert_eq!(mean[[500, 500]], level);
        assert!(mean[[5, 5]].is_nan());
        assert_eq!(record.train.roi_means, vec![("centre".to_string(), level)]);
        assert!(record.train.fom.is_some());
        assert_eq!(record.pulses.azimuthal.as_ref().unwrap().fom.len(), 2);
    }

    match &records[2].status {
        RecordStatus::Invalid { stage, reason } => {
            assert_eq!(*stage, "prefilter");
            assert!(reason.contains("15"));
        }
        RecordStatus::Valid => panic!("malformed train passed"),
    }
    assert!(records[2].assembled.is_none());

    assert_eq!(snapshot.processed, 4);
    assert_eq!(snapshot.invalid, 1);
    assert_eq!(snapshot.dropped, 0);
    assert_eq!(snapshot.last_train_id, Some(4));

    let client = broker.connector().connect(&config.broker).unwrap();
    let stored = client.get("metrics:flow").unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&stored).unwrap();
    assert_eq!(value["processed"], 4);
}

#[test]
fn worker_runs_without_control_plane() {
    let mut config = config();
    config.azimuthal.enabled = false;
    let (sender, receiver) = crossbeam_channel::unbounded();
    let (outbound, results) = outbound_queue(4);
    let metrics = Arc::new(MetricsRecorder::new());
    let worker = PipelineWorker::new(config, receiver, outbound, None, metrics).unwrap();

    sender.send(dense_train(7, 16)).unwrap();
    drop(sender);
    let snapshot = worker.run().unwrap();

    let record = results.try_recv().unwrap();
    assert!(record.is_valid());
    assert!(record.pulses.azimuthal.is_none());
    assert_eq!(record.train.mean_image.as_ref().unwrap()[[5, 5]], 7.0);
    assert_eq!(snapshot.processed, 1);
}

#[test]
fn invalid_configuration_is_fatal() {
    let (_sender, receiver) = crossbeam_channel::unbounded::<RawTrain>();
    let metrics = Arc::new(MetricsRecorder::new());

    let mut config = config();
    config.aggregation.moving_average_window = 0;
    let (outbound, _results) = outbound_queue(1);
    let err = PipelineWorker::new(config, receiver.clone(), outbound, None, Arc::clone(&metrics))
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::Config(_)));

    let mut config = PipelineConfig::default();
    config.detector.quad_positions = Some(vec![
        vec![1.0, 1.0],
        vec![1.0, -1.0],
        vec![-1.0, -1.0],
        vec![-1.0, 200.0],
    ]);
    let (outbound, _results) = outbound_queue(1);
    let err = PipelineWorker::new(config, receiver, outbound, None, metrics)
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::Geometry(_)));
}
