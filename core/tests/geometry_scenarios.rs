use fxcore::config::DetectorConfig;
use fxcore::geometry::{
    DetectorFamily, GeometryAssembler, GeometryCalibration, GeometryError, ModuleAxis,
    ModuleData, ModuleTopology, StackedModuleView,
};
use ndarray::{Array3, Array4};

const DSSC_POSITIONS: [[f64; 2]; 4] = [
    [-124.1, 3.112],
    [-133.068, -110.604],
    [0.988, -125.236],
    [4.528, -4.912],
];

fn dssc(positions: [[f64; 2]; 4]) -> GeometryAssembler {
    let calibration = GeometryCalibration::new(positions).unwrap();
    GeometryAssembler::new(ModuleTopology::dssc_1m(), &calibration).unwrap()
}

fn ones(pulses: usize) -> Array4<f32> {
    Array4::ones((16, pulses, 128, 512))
}

#[test]
fn dssc_reference_positions_fill_full_canvas() {
    let assembler = dssc(DSSC_POSITIONS);
    let data = ones(2);
    let mut canvas = assembler.allocate_canvas::<f32>(2);
    assembler
        .assemble(&ModuleData::dense(data.view(), ModuleAxis::ModulesFirst), &mut canvas)
        .unwrap();

    assert_eq!(canvas.shape(), &[2, 1024, 1024]);
    let footprint = assembler.footprint();
    for pulse in 0..2 {
        for ((row, col), covered) in footprint.indexed_iter() {
            let value = canvas[[pulse, row, col]];
            if *covered {
                assert_eq!(value, 1.0);
            } else {
                assert!(value.is_nan());
            }
        }
    }
}

#[test]
fn shifted_quadrant_leaves_nan_gap() {
    let mut positions = DSSC_POSITIONS;
    positions[2][1] += 0.204;
    let assembler = dssc(positions);
    assert_eq!(assembler.canvas_shape(), (1024, 1024));

    let data = ones(1);
    let mut canvas = assembler.allocate_canvas::<f32>(1);
    assembler
        .assemble(&ModuleData::dense(data.view(), ModuleAxis::ModulesFirst), &mut canvas)
        .unwrap();

    assert!(canvas[[0, 1023, 700]].is_nan());
    assert_eq!(canvas[[0, 1022, 700]], 1.0);
    assert_eq!(canvas[[0, 1023, 100]], 1.0);
}

#[test]
fn missing_modules_read_as_nan() {
    let assembler = dssc(DSSC_POSITIONS);
    let present = (0..16)
        .filter(|&m| m != 5)
        .map(|m| (m, Array3::<u16>::from_elem((1, 128, 512), 7)));
    let view = StackedModuleView::new(present, 16, [1, 128, 512], u16::MAX, ModuleAxis::ModulesFirst)
        .unwrap();

    let mut canvas = assembler.allocate_canvas::<f32>(1);
    assembler.assemble(&ModuleData::from(&view), &mut canvas).unwrap();

    // module 5 is the second module of the upright second quadrant
    assert!(canvas[[0, 700, 100]].is_nan());
    assert_eq!(canvas[[0, 600, 100]], 7.0);
    assert!(!view.is_materialized());
}

#[test]
fn stacked_and_dense_inputs_assemble_identically() {
    let assembler = dssc(DSSC_POSITIONS);
    let dense = Array4::from_shape_fn((2, 16, 128, 512), |(p, m, r, c)| {
        (p * 7 + m * 13 + r * 3 + c) as f32
    });
    let view = StackedModuleView::new(
        (0..16).map(|m| (m, dense.index_axis(ndarray::Axis(1), m).to_owned())),
        16,
        [2, 128, 512],
        f32::NAN,
        ModuleAxis::PulsesFirst,
    )
    .unwrap();

    let mut from_dense = assembler.allocate_canvas::<f32>(2);
    assembler
        .assemble(&ModuleData::dense(dense.view(), ModuleAxis::PulsesFirst), &mut from_dense)
        .unwrap();
    let mut from_view = assembler.allocate_canvas::<f32>(2);
    assembler.assemble(&ModuleData::from(&view), &mut from_view).unwrap();

    assert_eq!(from_dense, from_view);
}

#[test]
fn implausible_positions_are_rejected() {
    let calibration =
        GeometryCalibration::new([[1.0, 1.0], [1.0, -1.0], [-1.0, -1.0], [-1.0, 200.0]]).unwrap();
    let err = GeometryAssembler::new(ModuleTopology::dssc_1m(), &calibration).unwrap_err();
    match err {
        GeometryError::OutOfBounds { expected, .. } => assert_eq!(expected, vec![(1024, 1024)]),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn wide_footprint_matches_only_the_wide_shape() {
    let topology =
        ModuleTopology::dssc_1m().with_expected_shapes(vec![(1024, 1024), (1024, 1536)]);
    let mut positions = DSSC_POSITIONS;
    // push the right half 512 pixels further out
    positions[2][0] += 512.0 * 0.236;
    positions[3][0] += 512.0 * 0.236;
    let calibration = GeometryCalibration::new(positions).unwrap();

    let assembler = GeometryAssembler::new(topology.clone(), &calibration).unwrap();
    assert_eq!(assembler.canvas_shape(), (1024, 1536));
    let wide = GeometryAssembler::with_canvas_shape(topology.clone(), &calibration, (1024, 1536));
    assert!(wide.is_ok());

    let err =
        GeometryAssembler::with_canvas_shape(topology, &calibration, (1024, 1024)).unwrap_err();
    assert_eq!(
        err,
        GeometryError::OutOfBounds {
            footprint: (1024, 1536),
            expected: vec![(1024, 1024)],
        }
    );

    let data = ones(1);
    let mut canvas = assembler.allocate_canvas::<f32>(1);
    assembler
        .assemble(&ModuleData::dense(data.view(), ModuleAxis::ModulesFirst), &mut canvas)
        .unwrap();
    assert_eq!(canvas[[0, 10, 10]], 1.0);
    assert!(canvas[[0, 10, 700]].is_nan());
    assert_eq!(canvas[[0, 10, 1200]], 1.0);
}

#[test]
fn lpd_reference_layout_builds() {
    let topology = ModuleTopology::lpd_1m();
    let calibration = GeometryCalibration::reference(&topology);
    let assembler = GeometryAssembler::new(topology, &calibration).unwrap();
    assert_eq!(assembler.canvas_shape(), (1024, 1024));
}

#[test]
fn ignoring_tile_edges_keeps_the_canvas_shape() {
    for family in [DetectorFamily::Dssc1M, DetectorFamily::Lpd1M] {
        let config = DetectorConfig {
            family,
            ignore_tile_edges: true,
            ..Default::default()
        };
        let assembler = config.build_assembler().unwrap();
        assert_eq!(assembler.canvas_shape(), (1024, 1024), "{family:?}");

        let footprint = assembler.footprint();
        assert!(!footprint[[0, 0]]);
        assert!(footprint[[1, 1]]);
        assert!(!footprint[[1023, 1023]]);
        assert!(footprint[[1022, 1022]]);
    }
}
