//! Reduce-then-broadcast across 2 local ranks.
//!
//! Each rank enqueues its own gradient tensor. After completion, every rank
//! holds the element-wise sum of all inputs.
//!
//! ```bash
//! cargo run --example allreduce
//! ```

use std::sync::{Arc, Condvar, Mutex};

use tessera::{DataType, DenseTensor, Engine, Tensor};

fn main() -> tessera::Result<()> {
    let local_size = 2u32;
    let cluster = Engine::bootstrap_local(local_size)?;

    let count = 8usize;
    let done = Arc::new((Mutex::new(0u32), Condvar::new()));

    // Each rank fills its tensor with its own rank value.
    // rank 0: [0.0, 0.0, ...], rank 1: [1.0, 1.0, ...]
    let mut tensors = Vec::new();
    for engine in &cluster {
        let ctx = engine.init_tensor("grad", count * 4, DataType::F32, None)?;
        let tensor = DenseTensor::from_f32(&vec![engine.rank() as f32; count]);
        tensors.push(Arc::clone(&tensor));

        let done = Arc::clone(&done);
        engine.enqueue_tensor(
            &ctx,
            Some(Arc::clone(&tensor) as Arc<dyn Tensor>),
            Some(tensor as Arc<dyn Tensor>),
            None,
            engine.local_rank() as i32,
            0,
            0,
            Box::new(move |status| {
                status.expect("reduce failed");
                let (count, cv) = &*done;
                *count.lock().unwrap() += 1;
                cv.notify_all();
            }),
            engine.default_queue_list(),
        )?;
    }

    let (finished, cv) = &*done;
    let mut finished = finished.lock().unwrap();
    while *finished < local_size {
        finished = cv.wait(finished).unwrap();
    }
    drop(finished);

    for (rank, tensor) in tensors.iter().enumerate() {
        println!("rank {rank}: {:?}", tensor.to_f32());
    }
    // Output (all ranks identical):
    // rank 0: [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]
    // rank 1: [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]

    for engine in &cluster {
        engine.shutdown();
    }
    Ok(())
}
