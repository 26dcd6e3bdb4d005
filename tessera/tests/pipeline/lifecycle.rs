use std::sync::Arc;
use std::time::Duration;

use tessera::{
    DataType, DenseTensor, Engine, EngineConfig, EngineError, ManualReadyEvent, ReadyEvent, Tensor,
};

use super::helpers::{Completion, WAIT, enqueue_inplace};

#[test]
fn test_shutdown_abandons_in_flight_partitions() {
    // 10 floats with a 4-byte bound: 10 partitions per rank, all parked
    // behind a readiness token that never fires.
    let config = EngineConfig {
        partition_bytes: 4,
        ..Default::default()
    };
    let cluster = Engine::bootstrap_local_with(2, config).unwrap();
    let stuck = ManualReadyEvent::new();

    let mut completions = Vec::new();
    for engine in &cluster {
        let ctx = engine.init_tensor("grad", 40, DataType::F32, None).unwrap();
        assert_eq!(ctx.key_list.len(), 10);
        let tensor = DenseTensor::from_f32(&[1.0; 10]);
        let done = Completion::new();
        engine
            .enqueue_tensor(
                &ctx,
                Some(tensor.clone() as Arc<dyn Tensor>),
                Some(tensor as Arc<dyn Tensor>),
                Some(Arc::clone(&stuck) as Arc<dyn ReadyEvent>),
                engine.local_rank() as i32,
                0,
                0,
                done.callback(),
                engine.default_queue_list(),
            )
            .unwrap();
        completions.push(done);
    }

    std::thread::sleep(Duration::from_millis(50));

    // Shutdown must return with stage threads joined even though every
    // partition is still mid-pipeline; their callbacks never fire.
    for engine in &cluster {
        engine.shutdown();
    }
    for done in &completions {
        assert!(!done.has_fired());
    }
}

#[test]
fn test_enqueue_after_shutdown_is_rejected() {
    let engine = Engine::bootstrap_local(1).unwrap().remove(0);
    let ctx = engine.init_tensor("grad", 16, DataType::F32, None).unwrap();
    engine.shutdown();

    let tensor = DenseTensor::from_f32(&[1.0; 4]);
    let result = engine.enqueue_tensor(
        &ctx,
        Some(tensor.clone() as Arc<dyn Tensor>),
        Some(tensor as Arc<dyn Tensor>),
        None,
        0,
        0,
        0,
        Box::new(|_| {}),
        vec![],
    );
    assert!(matches!(result, Err(EngineError::Shutdown)));
}

#[test]
fn test_shutdown_is_idempotent() {
    let engine = Engine::bootstrap_local(1).unwrap().remove(0);
    engine.shutdown();
    engine.shutdown();
}

#[test]
fn test_overlapping_tensor_names_get_distinct_keys() {
    let config = EngineConfig {
        partition_bytes: 8,
        ..Default::default()
    };
    let engine = Engine::bootstrap_local_with(1, config).unwrap().remove(0);

    // "grad" partitions are named grad_0/grad_1 internally; a user tensor
    // literally named "grad_0" must not collide with them.
    let grad = engine.init_tensor("grad", 16, DataType::F32, None).unwrap();
    let grad_0 = engine.init_tensor("grad_0", 8, DataType::F32, None).unwrap();

    assert_eq!(grad.key_list.len(), 2);
    assert_eq!(grad_0.key_list.len(), 1);
    for k in &grad_0.key_list {
        assert!(!grad.key_list.contains(k));
    }

    let a = DenseTensor::from_f32(&[1.0; 4]);
    let b = DenseTensor::from_f32(&[9.0; 2]);
    let da = enqueue_inplace(&engine, &grad, &a);
    let db = enqueue_inplace(&engine, &grad_0, &b);
    da.wait(WAIT).unwrap();
    db.wait(WAIT).unwrap();

    assert_eq!(a.to_f32(), vec![1.0; 4]);
    assert_eq!(b.to_f32(), vec![9.0; 2]);
    engine.shutdown();
}

#[test]
fn test_ready_event_defers_dispatch_until_fired() {
    let cluster = Engine::bootstrap_local(2).unwrap();
    let gate = ManualReadyEvent::new();

    let tensors: Vec<_> = (0..2).map(|_| DenseTensor::from_f32(&[2.0; 4])).collect();
    let mut completions = Vec::new();
    for (engine, tensor) in cluster.iter().zip(&tensors) {
        let ctx = engine.init_tensor("gated", 16, DataType::F32, None).unwrap();
        let done = Completion::new();
        engine
            .enqueue_tensor(
                &ctx,
                Some(Arc::clone(tensor) as Arc<dyn Tensor>),
                Some(Arc::clone(tensor) as Arc<dyn Tensor>),
                Some(Arc::clone(&gate) as Arc<dyn ReadyEvent>),
                engine.local_rank() as i32,
                0,
                0,
                done.callback(),
                engine.default_queue_list(),
            )
            .unwrap();
        completions.push(done);
    }

    std::thread::sleep(Duration::from_millis(50));
    for done in &completions {
        assert!(!done.has_fired());
    }

    gate.fire();
    for done in &completions {
        done.wait(WAIT).unwrap();
    }
    for tensor in &tensors {
        assert_eq!(tensor.to_f32(), vec![4.0; 4]);
    }
    for engine in &cluster {
        engine.shutdown();
    }
}
