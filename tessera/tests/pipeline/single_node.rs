use std::sync::Arc;

use tessera::{DataType, DenseTensor, Engine, EngineConfig};

use super::helpers::{Completion, WAIT, enqueue_inplace};

#[test]
fn test_single_rank_round_trip_is_identity() {
    let engine = Engine::bootstrap_local(1).unwrap().remove(0);
    let ctx = engine.init_tensor("grad", 16, DataType::F32, None).unwrap();

    let tensor = DenseTensor::from_f32(&[1.0, 2.0, 3.0, 4.0]);
    enqueue_inplace(&engine, &ctx, &tensor).wait(WAIT).unwrap();

    // A single device is already reduced; nothing may change.
    assert_eq!(tensor.to_f32(), vec![1.0, 2.0, 3.0, 4.0]);
    engine.shutdown();
}

#[test]
fn test_two_ranks_allreduce() {
    let cluster = Engine::bootstrap_local(2).unwrap();
    let tensors: Vec<_> = (0..2)
        .map(|_| DenseTensor::from_f32(&[1.0, 2.0, 3.0, 4.0]))
        .collect();

    let completions: Vec<_> = cluster
        .iter()
        .zip(&tensors)
        .map(|(engine, tensor)| {
            let ctx = engine.init_tensor("grad", 16, DataType::F32, None).unwrap();
            enqueue_inplace(engine, &ctx, tensor)
        })
        .collect();
    for done in &completions {
        done.wait(WAIT).unwrap();
    }

    for tensor in &tensors {
        assert_eq!(tensor.to_f32(), vec![2.0, 4.0, 6.0, 8.0]);
    }
    for engine in &cluster {
        engine.shutdown();
    }
}

#[test]
fn test_three_ranks_sum_reaches_every_device() {
    let cluster = Engine::bootstrap_local(3).unwrap();
    let tensors: Vec<_> = (0..3)
        .map(|r| DenseTensor::from_f32(&[(r + 1) as f32; 4]))
        .collect();

    let completions: Vec<_> = cluster
        .iter()
        .zip(&tensors)
        .map(|(engine, tensor)| {
            let ctx = engine.init_tensor("w", 16, DataType::F32, None).unwrap();
            enqueue_inplace(engine, &ctx, tensor)
        })
        .collect();
    for done in &completions {
        done.wait(WAIT).unwrap();
    }

    for tensor in &tensors {
        assert_eq!(tensor.to_f32(), vec![6.0; 4]);
    }
    for engine in &cluster {
        engine.shutdown();
    }
}

#[test]
fn test_many_partitions_share_one_callback() {
    // 16 floats with an 8-byte bound: 8 partitions, one callback each rank.
    let config = EngineConfig {
        partition_bytes: 8,
        ..Default::default()
    };
    let cluster = Engine::bootstrap_local_with(2, config).unwrap();
    let values: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let tensors: Vec<_> = (0..2).map(|_| DenseTensor::from_f32(&values)).collect();

    let completions: Vec<_> = cluster
        .iter()
        .zip(&tensors)
        .map(|(engine, tensor)| {
            let ctx = engine.init_tensor("big", 64, DataType::F32, None).unwrap();
            assert_eq!(ctx.key_list.len(), 8);
            enqueue_inplace(engine, &ctx, tensor)
        })
        .collect();
    for done in &completions {
        done.wait(WAIT).unwrap();
    }

    let expected: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
    for tensor in &tensors {
        assert_eq!(tensor.to_f32(), expected);
    }
    for engine in &cluster {
        engine.shutdown();
    }
}

#[test]
fn test_back_to_back_tensors_do_not_interfere() {
    let cluster = Engine::bootstrap_local(2).unwrap();

    // Same contexts on both ranks, fresh buffers per enqueue; the second
    // round may overlap the first in the pipeline.
    let mut all: Vec<(Arc<Completion>, Arc<DenseTensor>, Vec<f32>)> = Vec::new();
    for engine in &cluster {
        let a = engine.init_tensor("layer_a", 16, DataType::F32, None).unwrap();
        let b = engine.init_tensor("layer_b", 16, DataType::F32, None).unwrap();

        let ta = DenseTensor::from_f32(&[1.0; 4]);
        let tb = DenseTensor::from_f32(&[10.0; 4]);
        all.push((enqueue_inplace(engine, &a, &ta), ta, vec![2.0; 4]));
        all.push((enqueue_inplace(engine, &b, &tb), tb, vec![20.0; 4]));
    }
    for (done, tensor, expected) in &all {
        done.wait(WAIT).unwrap();
        assert_eq!(&tensor.to_f32(), expected);
    }
    for engine in &cluster {
        engine.shutdown();
    }
}
