/// Integration tests for the dispatch pipeline: plain dataflow graphs,
/// fused clusters, validation, and failure isolation.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axon_core::config::EngineConfig;
use axon_core::device::SimDevice;
use axon_core::engine::ExecutionEngine;
use axon_core::error::AxonError;
use axon_core::executor::ExecutorRegistry;
use axon_core::graph::{attr, AttrValue, Graph};
use axon_core::shape::{DataType, TensorDesc, TensorValue, DIM_UNKNOWN};

fn arithmetic_registry() -> Arc<ExecutorRegistry> {
    let registry = ExecutorRegistry::new();
    registry.register_kernel(
        "Neg",
        Arc::new(|inputs: &[TensorValue]| {
            let v = inputs[0]
                .scalar_i64()
                .ok_or_else(|| AxonError::internal("non-scalar input"))?;
            Ok(vec![TensorValue::from_i64(-v)])
        }),
    );
    registry.register_kernel(
        "AddOne",
        Arc::new(|inputs: &[TensorValue]| {
            let v = inputs[0]
                .scalar_i64()
                .ok_or_else(|| AxonError::internal("non-scalar input"))?;
            Ok(vec![TensorValue::from_i64(v + 1)])
        }),
    );
    registry.register_kernel(
        "Add",
        Arc::new(|inputs: &[TensorValue]| {
            let a = inputs[0].scalar_i64().unwrap_or(0);
            let b = inputs[1].scalar_i64().unwrap_or(0);
            Ok(vec![TensorValue::from_i64(a + b)])
        }),
    );
    Arc::new(registry)
}

#[test]
fn linear_graph_runs_end_to_end() {
    let mut g = Graph::new("linear");
    let x = g.add_node("x", "Data", 0, 1);
    let neg = g.add_node("neg", "Neg", 1, 1);
    let out = g.add_node("out", "NetOutput", 1, 1);
    g.add_data_edge(x, 0, neg, 0);
    g.add_data_edge(neg, 0, out, 0);

    let engine = ExecutionEngine::new(
        &g,
        arithmetic_registry(),
        Arc::new(SimDevice::new()),
        EngineConfig::standard(),
    )
    .unwrap();

    let outputs = engine.run(vec![TensorValue::from_i32(5)]).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].scalar_i64(), Some(-5));
}

#[test]
fn diamond_branches_execute_concurrently_and_join() {
    let mut g = Graph::new("diamond");
    let x = g.add_node("x", "Data", 0, 1);
    let left = g.add_node("left", "Neg", 1, 1);
    let right = g.add_node("right", "AddOne", 1, 1);
    let join = g.add_node("join", "Add", 2, 1);
    let out = g.add_node("out", "NetOutput", 1, 1);
    g.add_data_edge(x, 0, left, 0);
    g.add_data_edge(x, 0, right, 0);
    g.add_data_edge(left, 0, join, 0);
    g.add_data_edge(right, 0, join, 1);
    g.add_data_edge(join, 0, out, 0);

    let engine = ExecutionEngine::new(
        &g,
        arithmetic_registry(),
        Arc::new(SimDevice::new()),
        EngineConfig::standard(),
    )
    .unwrap();

    // -10 + 11
    let outputs = engine.run(vec![TensorValue::from_i32(10)]).unwrap();
    assert_eq!(outputs[0].scalar_i64(), Some(1));
}

#[test]
fn failing_node_does_not_stall_independent_branches() {
    let registry = arithmetic_registry();
    registry.register_kernel(
        "Boom",
        Arc::new(|_: &[TensorValue]| Err(AxonError::internal("kernel fault"))),
    );
    let tap_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&tap_hits);
    registry.register_kernel(
        "Tap",
        Arc::new(move |inputs: &[TensorValue]| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(vec![inputs[0].clone()])
        }),
    );

    let mut g = Graph::new("isolated");
    let x = g.add_node("x", "Data", 0, 1);
    let bad = g.add_node("bad", "Boom", 1, 1);
    let good = g.add_node("good", "Tap", 1, 1);
    let out = g.add_node("out", "NetOutput", 1, 1);
    g.add_data_edge(x, 0, bad, 0);
    g.add_data_edge(x, 0, good, 0);
    g.add_data_edge(good, 0, out, 0);

    let engine = ExecutionEngine::new(
        &g,
        registry,
        Arc::new(SimDevice::new()),
        EngineConfig::standard(),
    )
    .unwrap();

    // The failure surfaces, but only after the healthy branch drained.
    let err = engine.run(vec![TensorValue::from_i32(1)]).unwrap_err();
    assert!(matches!(err, AxonError::Dispatch { .. }));
    assert_eq!(tap_hits.load(Ordering::SeqCst), 1);
}

#[test]
fn fused_cluster_runs_as_one_unit() {
    let registry = arithmetic_registry();

    let mut inner = Graph::new("inner");
    let d0 = inner.add_node("in0", "Data", 0, 1);
    inner.set_attr(d0, attr::PARENT_INDEX, AttrValue::Int(0));
    let a = inner.add_node("a", "AddOne", 1, 1);
    inner.add_data_edge(d0, 0, a, 0);
    let b = inner.add_node("b", "Neg", 1, 1);
    inner.add_data_edge(a, 0, b, 0);
    let ret = inner.add_node("ret", "NetOutput", 1, 1);
    inner.set_attr(ret, attr::PARENT_INDEX, AttrValue::Int(0));
    inner.add_data_edge(b, 0, ret, 0);

    let mut g = Graph::new("outer");
    let x = g.add_node("x", "Data", 0, 1);
    let cluster = g.add_node("cluster", "FusedCluster", 1, 1);
    g.set_attr(cluster, attr::FUSED_GRAPH, AttrValue::Graph(Box::new(inner)));
    let out = g.add_node("out", "NetOutput", 1, 1);
    g.add_data_edge(x, 0, cluster, 0);
    g.add_data_edge(cluster, 0, out, 0);

    let engine = ExecutionEngine::new(
        &g,
        registry,
        Arc::new(SimDevice::new()),
        EngineConfig::standard(),
    )
    .unwrap();

    // -(7 + 1)
    let outputs = engine.run(vec![TensorValue::from_i32(7)]).unwrap();
    assert_eq!(outputs[0].scalar_i64(), Some(-8));
}

#[test]
fn compute_class_shapes_resolve_at_completion() {
    let registry = arithmetic_registry();
    registry.register_kernel(
        "Widen",
        Arc::new(|inputs: &[TensorValue]| {
            let v = inputs[0].scalar_i64().unwrap_or(0) as i32;
            let mut bytes = Vec::new();
            for _ in 0..4 {
                bytes.extend_from_slice(&v.to_ne_bytes());
            }
            Ok(vec![TensorValue::new(
                axon_core::shape::TensorDesc::new(vec![4], axon_core::shape::DataType::Int32),
                bytes,
            )])
        }),
    );

    let mut g = Graph::new("widen");
    let x = g.add_node("x", "Data", 0, 1);
    let w = g.add_node("w", "Widen", 1, 1);
    g.set_attr(w, attr::SHAPE_CLASS, AttrValue::Str("compute".into()));
    g.set_output_desc(
        w,
        0,
        axon_core::shape::TensorDesc::new(vec![DIM_UNKNOWN], axon_core::shape::DataType::Int32),
    );
    let out = g.add_node("out", "NetOutput", 1, 1);
    g.add_data_edge(x, 0, w, 0);
    g.add_data_edge(w, 0, out, 0);

    let engine = ExecutionEngine::new(
        &g,
        registry,
        Arc::new(SimDevice::new()),
        EngineConfig::standard(),
    )
    .unwrap();

    let outputs = engine.run(vec![TensorValue::from_i32(9)]).unwrap();
    assert_eq!(outputs[0].desc.dims, vec![4]);
    assert_eq!(outputs[0].byte_len(), 16);
}

/// A compute-class output reaches consumers only through the completion
/// path: the consumer must observe the finished tensor and its resolved
/// shape, never an intermediate state.
#[test]
fn compute_class_successors_wait_for_completion() {
    let registry = arithmetic_registry();
    let producer_done = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));

    let done = Arc::clone(&producer_done);
    registry.register_kernel(
        "Slow",
        Arc::new(move |inputs: &[TensorValue]| {
            std::thread::sleep(Duration::from_millis(25));
            let v = inputs[0].scalar_i64().unwrap_or(0) as i32;
            let mut bytes = Vec::new();
            for _ in 0..4 {
                bytes.extend_from_slice(&v.to_ne_bytes());
            }
            done.store(true, Ordering::SeqCst);
            Ok(vec![TensorValue::new(
                TensorDesc::new(vec![4], DataType::Int32),
                bytes,
            )])
        }),
    );
    let done = Arc::clone(&producer_done);
    let bad = Arc::clone(&violations);
    registry.register_kernel(
        "Check",
        Arc::new(move |inputs: &[TensorValue]| {
            if !done.load(Ordering::SeqCst) || inputs[0].desc.dims != vec![4] {
                bad.fetch_add(1, Ordering::SeqCst);
            }
            Ok(vec![inputs[0].clone()])
        }),
    );

    let mut g = Graph::new("ordered");
    let x = g.add_node("x", "Data", 0, 1);
    let slow = g.add_node("slow", "Slow", 1, 1);
    g.set_attr(slow, attr::SHAPE_CLASS, AttrValue::Str("compute".into()));
    g.set_output_desc(slow, 0, TensorDesc::new(vec![DIM_UNKNOWN], DataType::Int32));
    let check = g.add_node("check", "Check", 1, 1);
    let out = g.add_node("out", "NetOutput", 1, 1);
    g.add_data_edge(x, 0, slow, 0);
    g.add_data_edge(slow, 0, check, 0);
    g.add_data_edge(check, 0, out, 0);

    let engine = ExecutionEngine::new(
        &g,
        registry,
        Arc::new(SimDevice::new()),
        EngineConfig::standard(),
    )
    .unwrap();

    let outputs = engine.run(vec![TensorValue::from_i32(9)]).unwrap();
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(outputs[0].desc.dims, vec![4]);
}

#[test]
fn input_count_mismatch_is_rejected_up_front() {
    let mut g = Graph::new("g");
    let _x = g.add_node("x", "Data", 0, 1);

    let engine = ExecutionEngine::new(
        &g,
        arithmetic_registry(),
        Arc::new(SimDevice::new()),
        EngineConfig::standard(),
    )
    .unwrap();

    let err = engine.run(vec![]).unwrap_err();
    assert!(matches!(err, AxonError::Validation { .. }));
}

#[test]
fn unbound_constant_is_rejected_up_front() {
    let mut g = Graph::new("g");
    let c = g.add_node("c", "Const", 0, 1);
    let neg = g.add_node("neg", "Neg", 1, 1);
    g.add_data_edge(c, 0, neg, 0);

    let engine = ExecutionEngine::new(
        &g,
        arithmetic_registry(),
        Arc::new(SimDevice::new()),
        EngineConfig::standard(),
    )
    .unwrap();

    let err = engine.run(vec![]).unwrap_err();
    assert!(matches!(err, AxonError::Validation { .. }));
}

#[test]
fn single_worker_config_produces_the_same_result() {
    let mut g = Graph::new("linear");
    let x = g.add_node("x", "Data", 0, 1);
    let a = g.add_node("a", "AddOne", 1, 1);
    let b = g.add_node("b", "AddOne", 1, 1);
    let out = g.add_node("out", "NetOutput", 1, 1);
    g.add_data_edge(x, 0, a, 0);
    g.add_data_edge(a, 0, b, 0);
    g.add_data_edge(b, 0, out, 0);

    let engine = ExecutionEngine::new(
        &g,
        arithmetic_registry(),
        Arc::new(SimDevice::new()),
        EngineConfig::single_threaded(),
    )
    .unwrap();

    let outputs = engine.run(vec![TensorValue::from_i32(0)]).unwrap();
    assert_eq!(outputs[0].scalar_i64(), Some(2));
}
