//! End-to-end checks: trace → quantize → optimize → TFLite.

use proptest::prelude::*;

use qlite::convert::{ModelPlan, QuantizedElementType};
use qlite::ir::Graph;
use qlite::nn::{functional as F, FnModule, GraphModule, Hardtanh, Linear, ReLU, Sequential};
use qlite::parse::tflite::schema::{BuiltinOperator, TensorType};
use qlite::quant::Backend;
use qlite::{read_model, ConverterOptions, Error, HostTensor, QuantConfig, TfliteConverter};

fn linear_clip() -> Sequential {
    #[rustfmt::skip]
    let w = HostTensor::new(vec![3, 3], vec![
        1.0, 0.0, 0.0,
        0.0, 0.0, 1.0,
        0.0, 1.0, 0.0,
    ]).unwrap();
    let b = HostTensor::new(vec![3], vec![0.0, 4.0, 0.0]).unwrap();
    Sequential::new()
        .add("fc", Linear::new(w, Some(b)))
        .add("clip", Hardtanh { min_val: 0.0, max_val: 6.0 })
}

fn sample() -> HostTensor {
    HostTensor::new(vec![1, 3], vec![1.0, -2.0, 3.0]).unwrap()
}

fn read(path: &std::path::Path) -> ModelPlan {
    read_model(&std::fs::read(path).unwrap()).unwrap()
}

#[test]
fn test_quantized_linear_clip_tracks_float() {
    let dir = tempfile::tempdir().unwrap();
    let float = qlite::trace::run(&linear_clip(), &[sample()]).unwrap();
    assert_eq!(float[0].to_f32_vec(), vec![1.0, 6.0, 0.0]);

    let q = qlite::quantize(linear_clip(), &[sample()], dir.path(), QuantConfig::default()).unwrap();
    let int = q.convert().unwrap();
    let quantized = qlite::trace::run(&int, &[sample()]).unwrap();

    // One 8-bit step over the widest observed range ([-2, 7] before clipping).
    let step = 9.0 / 255.0;
    assert!(float[0].max_abs_diff(&quantized[0]) <= step + 1e-6);
}

#[test]
fn test_quantized_model_converts_to_int8_tflite() {
    let dir = tempfile::tempdir().unwrap();
    let config = QuantConfig::for_backend(Backend::Fbgemm);
    let q = qlite::quantize(linear_clip(), &[sample()], dir.path(), config).unwrap();
    let int = q.convert().unwrap();
    let expected = qlite::trace::run(&int, &[sample()]).unwrap();

    let path = dir.path().join("model.tflite");
    let mut converter = TfliteConverter::new(&int, vec![sample()], &path, ConverterOptions::default());
    converter.convert().unwrap();
    assert!(converter.get_outputs()[0].max_abs_diff(&expected[0]) < 1e-5);
    assert_eq!(converter.input_transpose(), &[false]);

    let plan = read(&path);
    let builtins = plan.builtins();
    assert_eq!(builtins.first(), Some(&BuiltinOperator::QUANTIZE));
    assert_eq!(builtins.last(), Some(&BuiltinOperator::DEQUANTIZE));
    assert!(builtins.contains(&BuiltinOperator::FULLY_CONNECTED));

    let sg = &plan.subgraphs[0];
    let fc = sg
        .operators
        .iter()
        .find(|op| plan.opcode_of(op).map(|c| c.builtin) == Some(BuiltinOperator::FULLY_CONNECTED))
        .unwrap();
    assert_eq!(plan.opcode_of(fc).unwrap().version, 12);
    let weight = &sg.tensors[fc.inputs[1] as usize];
    assert_eq!(weight.dtype, TensorType::INT8);
    assert_eq!(weight.quant.as_ref().unwrap().scale.len(), 3);
    let bias = &sg.tensors[fc.inputs[2] as usize];
    assert_eq!(bias.dtype, TensorType::INT32);
    assert_eq!(sg.tensors[sg.inputs[0] as usize].dtype, TensorType::FLOAT32);
}

#[test]
fn test_uint8_target_rewrites_every_int8_tensor() {
    let dir = tempfile::tempdir().unwrap();
    let q = qlite::quantize(linear_clip(), &[sample()], dir.path(), QuantConfig::default()).unwrap();
    let int = q.convert().unwrap();

    let path = dir.path().join("model_u8.tflite");
    let options = ConverterOptions::default().target(QuantizedElementType::UInt8);
    TfliteConverter::new(&int, vec![sample()], &path, options).convert().unwrap();

    let plan = read(&path);
    let sg = &plan.subgraphs[0];
    assert!(sg.tensors.iter().all(|t| t.dtype != TensorType::INT8));
    assert!(sg.tensors.iter().any(|t| t.dtype == TensorType::UINT8));
    assert!(plan.opcodes.iter().all(|c| c.version == 1));
}

#[test]
fn test_wrong_rank_sample_is_a_shape_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let relu = Sequential::new().add("act", ReLU);
    let traced = qlite::trace(&relu, &[HostTensor::zeros(vec![1, 3, 224, 224])]).unwrap();
    let module = GraphModule::new(traced.graph.clone()).unwrap();

    let path = dir.path().join("m.tflite");
    let mut converter = TfliteConverter::new(&module, vec![sample()], &path, ConverterOptions::default());
    match converter.convert().unwrap_err() {
        Error::ShapeMismatch { index, expected, actual } => {
            assert_eq!(index, 0);
            assert_eq!(expected, vec![1, 3, 224, 224]);
            assert_eq!(actual, vec![1, 3]);
        }
        other => panic!("unexpected error {other}"),
    }

    let err = qlite::convert_graph(traced.graph, &[sample()], &path, &ConverterOptions::default()).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
    assert!(!path.exists());
}

#[test]
fn test_unknown_operator_fails_with_scope() {
    let dir = tempfile::tempdir().unwrap();
    let odd = FnModule::new("Odd", |s, xs| Ok(vec![s.call("erfinv", &[&xs[0]], Default::default())?]));
    let model = Sequential::new().add("body", Sequential::new().add("odd", odd));

    let path = dir.path().join("m.tflite");
    let err = TfliteConverter::new(&model, vec![sample()], &path, ConverterOptions::default())
        .convert()
        .unwrap_err();
    match err {
        Error::UnsupportedOperator { op, scope } => {
            assert_eq!(op, "erfinv");
            assert_eq!(scope, "body.odd");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(!path.exists());
}

#[test]
fn test_constant_subexpression_is_folded_away() {
    let dir = tempfile::tempdir().unwrap();
    let scale = FnModule::new("Scale", |s, xs| {
        let two = s.param("two", &HostTensor::full(vec![1], 2.0));
        let three = s.param("three", &HostTensor::full(vec![1], 3.0));
        let five = F::add(s, &two, &three)?;
        Ok(vec![F::mul(s, &xs[0], &five)?])
    });

    let path = dir.path().join("m.tflite");
    let mut converter = TfliteConverter::new(&scale, vec![sample()], &path, ConverterOptions::default());
    converter.convert().unwrap();
    assert_eq!(converter.get_outputs()[0].to_f32_vec(), vec![5.0, -10.0, 15.0]);

    let plan = read(&path);
    assert_eq!(plan.builtins(), vec![BuiltinOperator::MUL]);
    let sg = &plan.subgraphs[0];
    let mul = &sg.operators[0];
    let folded = &sg.tensors[mul.inputs[1] as usize];
    assert_eq!(plan.buffers[folded.buffer as usize], 5.0f32.to_le_bytes().to_vec());
}

#[test]
fn test_dumped_graph_reloads_for_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("traced.json");
    let path = dir.path().join("m.tflite");
    let options = ConverterOptions::default()
        .dump_intermediate_model(&dump)
        .reclaim_memory_after_dump(true);
    let model = linear_clip();
    let mut converter = TfliteConverter::new(&model, vec![sample()], &path, options);
    converter.convert().unwrap();
    assert_eq!(converter.get_outputs()[0].to_f32_vec(), vec![1.0, 6.0, 0.0]);

    let reloaded = Graph::from_json(&std::fs::read_to_string(&dump).unwrap()).unwrap();
    assert_eq!(reloaded.nodes.len(), 2);
    assert_eq!(read(&path).builtins(), vec![BuiltinOperator::FULLY_CONNECTED]);
}

#[test]
fn test_conv_model_declares_nhwc_input() {
    let dir = tempfile::tempdir().unwrap();
    let weight = HostTensor::new(vec![2, 1, 1, 1], vec![1.0, -1.0]).unwrap();
    let model = Sequential::new()
        .add("conv", qlite::nn::Conv2d::new(weight, None))
        .add("act", ReLU);
    let x = HostTensor::new(vec![1, 1, 2, 2], vec![1.0, -2.0, 3.0, -4.0]).unwrap();
    let expected = qlite::trace::run(&model, &[x.clone()]).unwrap();

    let path = dir.path().join("conv.tflite");
    let mut converter = TfliteConverter::new(&model, vec![x], &path, ConverterOptions::default());
    converter.convert().unwrap();
    assert_eq!(converter.input_transpose(), &[true]);

    // Outputs come back channel-first.
    let out = &converter.get_outputs()[0];
    assert_eq!(out.shape, vec![1, 2, 2, 2]);
    assert!(out.max_abs_diff(&expected[0]) < 1e-6);

    let plan = read(&path);
    let sg = &plan.subgraphs[0];
    assert_eq!(sg.tensors[sg.inputs[0] as usize].shape, vec![1, 2, 2, 1]);
    assert_eq!(plan.builtins().first(), Some(&BuiltinOperator::CONV_2D));
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Relu,
    Sigmoid,
    AddConst(i8),
    MulConst(i8),
    AddSelf,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Relu),
        Just(Step::Sigmoid),
        any::<i8>().prop_map(Step::AddConst),
        any::<i8>().prop_map(Step::MulConst),
        Just(Step::AddSelf),
    ]
}

fn chain(steps: Vec<Step>) -> impl qlite::nn::Module {
    FnModule::new("Chain", move |s, xs| {
        let mut cur = xs[0].clone();
        for (i, step) in steps.iter().enumerate() {
            cur = match *step {
                Step::Relu => F::relu(s, &cur)?,
                Step::Sigmoid => F::sigmoid(s, &cur)?,
                Step::AddConst(c) => {
                    let k = s.param(&format!("c{i}"), &HostTensor::full(vec![1], c as f32 / 16.0));
                    F::add(s, &cur, &k)?
                }
                Step::MulConst(c) => {
                    let k = s.param(&format!("c{i}"), &HostTensor::full(vec![1], c as f32 / 16.0));
                    F::mul(s, &cur, &k)?
                }
                Step::AddSelf => F::add(s, &cur, &cur)?,
            };
        }
        Ok(vec![cur])
    })
}

fn assert_topological(g: &Graph) -> Result<(), TestCaseError> {
    prop_assert!(g.validate().is_ok());
    let producers = g.producers();
    for (i, node) in g.nodes.iter().enumerate() {
        for &input in &node.inputs {
            if let Some(p) = producers[input] {
                prop_assert!(p < i, "node {} reads tensor {} produced later by {}", i, input, p);
            }
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_traced_chains_stay_acyclic_through_optimization(steps in prop::collection::vec(step(), 1..12)) {
        let x = HostTensor::new(vec![1, 4], vec![-1.5, -0.25, 0.5, 2.0]).unwrap();
        let traced = qlite::trace(&chain(steps.clone()), &[x.clone()]).unwrap();
        prop_assert_eq!(traced.graph.nodes.len(), steps.len());
        assert_topological(&traced.graph)?;

        let mut optimized = traced.graph.clone();
        qlite::optimize::optimize(&mut optimized, true).unwrap();
        assert_topological(&optimized)?;

        let before = &traced.outputs[0];
        let after = qlite::ir::interp::run(&optimized, &[x]).unwrap();
        let tol = 1e-4 * before.to_f32_vec().iter().fold(1.0f32, |m, v| m.max(v.abs()));
        prop_assert!(before.max_abs_diff(&after[0]) <= tol);
    }
}
