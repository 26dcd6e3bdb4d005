use std::sync::Arc;

use tessera::{DataType, DenseTensor, Engine, EngineConfig};

use super::helpers::{WAIT, enqueue_inplace};

#[test]
fn test_one_worker_push_pull_is_identity() {
    let workers = Engine::bootstrap_distributed(1).unwrap();
    let engine = &workers[0];
    let ctx = engine.init_tensor("grad", 16, DataType::F32, None).unwrap();

    let tensor = DenseTensor::from_f32(&[1.0, 2.0, 3.0, 4.0]);
    enqueue_inplace(engine, &ctx, &tensor).wait(WAIT).unwrap();

    assert_eq!(tensor.to_f32(), vec![1.0, 2.0, 3.0, 4.0]);
    engine.shutdown();
}

#[test]
fn test_two_workers_aggregate_through_server() {
    let workers = Engine::bootstrap_distributed(2).unwrap();

    // Initialization barriers synchronize the workers, so each runs on its
    // own thread.
    let handles: Vec<_> = workers
        .iter()
        .enumerate()
        .map(|(w, engine)| {
            let engine = Arc::clone(engine);
            std::thread::spawn(move || {
                let ctx = engine.init_tensor("grad", 16, DataType::F32, None).unwrap();
                let fill = (w + 1) as f32;
                let tensor = DenseTensor::from_f32(&[fill; 4]);
                enqueue_inplace(&engine, &ctx, &tensor).wait(WAIT).unwrap();
                tensor.to_f32()
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), vec![3.0; 4]);
    }
    for engine in &workers {
        engine.shutdown();
    }
}

#[test]
fn test_multi_partition_distributed_round() {
    let config = EngineConfig {
        partition_bytes: 8,
        ..Default::default()
    };
    let workers = Engine::bootstrap_distributed_with(2, config).unwrap();

    let handles: Vec<_> = workers
        .iter()
        .map(|engine| {
            let engine = Arc::clone(engine);
            std::thread::spawn(move || {
                let ctx = engine.init_tensor("big", 32, DataType::F32, None).unwrap();
                assert_eq!(ctx.key_list.len(), 4);
                let tensor = DenseTensor::from_f32(&[1.0; 8]);
                enqueue_inplace(&engine, &ctx, &tensor).wait(WAIT).unwrap();
                tensor.to_f32()
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), vec![2.0; 8]);
    }
    for engine in &workers {
        engine.shutdown();
    }
}

#[test]
fn test_push_credit_backpressure_still_completes() {
    // Credit for exactly one 8-byte partition in flight at a time.
    let config = EngineConfig {
        partition_bytes: 8,
        push_credit_bytes: Some(8),
        ..Default::default()
    };
    let workers = Engine::bootstrap_distributed_with(1, config).unwrap();
    let engine = &workers[0];
    let ctx = engine.init_tensor("tight", 32, DataType::F32, None).unwrap();

    let tensor = DenseTensor::from_f32(&[5.0; 8]);
    enqueue_inplace(engine, &ctx, &tensor).wait(WAIT).unwrap();
    assert_eq!(tensor.to_f32(), vec![5.0; 8]);
    engine.shutdown();
}
