//! The pipeline stage loops.
//!
//! Every stage is an OS thread running `while !shutdown { run_once() }`.
//! `run_once` pulls one unit of work or idles for a microsecond. A stage
//! advances a partition by calling [`finish_or_proceed`], which pops the
//! partition's current stage and either hands it to the next stage's queue
//! or, when the stage list is exhausted, bumps the shared completion counter
//! and fires the user callback on the last partition.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::trace;

use crate::error::{EngineError, Result};
use crate::registry::{GroupEntry, Registry};
use crate::signal::{SignalKind, SignalMsg};
use crate::task::TensorTask;
use crate::types::{CPU_DEVICE_ID, QueueKind, ReduceOp, RequestType, command};

const IDLE: Duration = Duration::from_micros(1);

fn idle() {
    std::thread::sleep(IDLE);
}

/// Advance a partition past its current stage.
pub(crate) fn finish_or_proceed(reg: &Arc<Registry>, task: &Arc<TensorTask>) -> Result<()> {
    let this_op = task.pop_stage()?;
    if let Some(next) = task.current_stage() {
        trace!(
            rank = reg.config.rank,
            stage = %this_op,
            next = %next,
            name = %task.name,
            key = task.key,
            "stage done, passing on"
        );
        reg.queue(next).add_task(Arc::clone(task));
    } else {
        let v = task.counter.fetch_add(1, Ordering::AcqRel);
        if v == task.total_parts - 1 {
            trace!(rank = reg.config.rank, name = %task.name, "tensor complete");
            task.callback.fire(Ok(()));
        }
    }
    Ok(())
}

/// Issue the collective call for one partition's window on the collective
/// stream. Reduce operates on the input buffer, broadcast on the output.
fn issue_collective(reg: &Arc<Registry>, op: QueueKind, task: &TensorTask) -> Result<()> {
    let buffer = match op {
        QueueKind::Reduce => task.tensor.as_deref(),
        _ => task.output.as_deref(),
    }
    .ok_or_else(|| EngineError::Collective(format!("{}: missing buffer", task.name)))?;

    let ptr = buffer.data() + task.offset as u64;
    let count = task.element_count();
    let dtype = buffer.dtype();
    let root = reg.config.root_rank;
    let stream = reg.streams.collective;

    trace!(
        rank = reg.config.rank,
        op = %op,
        key = task.key,
        elements = count,
        device = task.device,
        "issuing collective"
    );
    unsafe {
        match op {
            QueueKind::Reduce => reg.collective.reduce(
                ptr,
                ptr,
                count,
                dtype,
                ReduceOp::Sum,
                root,
                stream,
            ),
            _ => reg
                .collective
                .broadcast(ptr, ptr, count, dtype, root, stream),
        }
    }
}

/// Follower stage: announce a partition to the root, after first parking it
/// on the collective stage's queue so the root's keyed dispatch always finds
/// it.
pub(crate) fn run_coordinate_once(reg: &Arc<Registry>, this_op: QueueKind) -> Result<()> {
    let q = reg.queue(this_op);
    let Some(task) = q.get_task() else {
        idle();
        return Ok(());
    };
    debug_assert!(!reg.config.is_root(), "coordinate stages are follower-only");

    let key = task.key;
    let len = task.len;

    // Park on the next queue before signaling: the root's DO_* must never
    // outrun the keyed enqueue.
    finish_or_proceed(reg, &task)?;

    let kind = match this_op {
        QueueKind::CoordinateReduce => SignalKind::ReduceReady,
        _ => SignalKind::BcastReady,
    };
    reg.bus.send(
        reg.config.root_rank,
        SignalMsg {
            src: reg.config.local_rank,
            kind,
            key,
        },
    )?;
    trace!(
        rank = reg.config.rank,
        key,
        root = reg.config.root_rank,
        ?kind,
        "announced to root"
    );
    q.report_finish(len);
    Ok(())
}

/// Root collective stage: batch up to `nccl_group_size` reduce then
/// broadcast partitions into one group, signaling followers op-by-op.
pub(crate) fn run_root_collective_once(reg: &Arc<Registry>) -> Result<()> {
    debug_assert!(reg.config.is_root(), "collective driver is root-only");
    let local_size = reg.config.local_size;
    let rank = reg.config.local_rank;

    if local_size > 1 {
        reg.drain_signals()?;
    }

    let mut tasks: Vec<Arc<TensorTask>> = Vec::new();
    let mut queues: Vec<QueueKind> = Vec::new();

    reg.collective.group_start()?;
    for this_op in [QueueKind::Reduce, QueueKind::Broadcast] {
        for _ in 0..reg.config.nccl_group_size {
            let task = if local_size > 1 {
                reg.pop_ready_task(this_op)
            } else {
                reg.queue(this_op).get_task()
            };
            let Some(task) = task else { break };

            if task.device != CPU_DEVICE_ID && local_size > 1 {
                let kind = match this_op {
                    QueueKind::Reduce => SignalKind::DoReduce,
                    _ => SignalKind::DoBroadcast,
                };
                reg.bus.broadcast(
                    rank,
                    SignalMsg {
                        src: rank,
                        kind,
                        key: task.key,
                    },
                )?;
                issue_collective(reg, this_op, &task)?;
            }
            tasks.push(task);
            queues.push(this_op);
        }
    }

    if tasks.is_empty() {
        reg.collective.group_end()?;
        idle();
        return Ok(());
    }

    if local_size > 1 {
        reg.bus.broadcast(
            rank,
            SignalMsg {
                src: rank,
                kind: SignalKind::DoGroup,
                key: 0,
            },
        )?;
    }
    trace!(rank = reg.config.rank, batch = tasks.len(), "closing collective group");
    reg.collective.group_end()?;

    let event = reg.runtime.create_event()?;
    reg.runtime.record_event(event, reg.streams.collective)?;
    reg.enqueue_group(GroupEntry {
        tasks,
        queues,
        event,
    });
    Ok(())
}

/// Follower collective stage: slaved to the root's signals. Issues exactly
/// the ops the root names, closes the group on `DoGroup`.
pub(crate) fn run_follower_collective_once(reg: &Arc<Registry>) -> Result<()> {
    debug_assert!(!reg.config.is_root(), "follower collective is follower-only");
    let root = reg.config.root_rank;

    let mut tasks: Vec<Arc<TensorTask>> = Vec::new();
    reg.collective.group_start()?;
    loop {
        let msg = reg.bus.recv(reg.config.local_rank)?;
        if msg.src != root {
            return Err(EngineError::SignalNotFromRoot {
                src: msg.src,
                root,
            });
        }
        if msg.kind == SignalKind::DoGroup {
            break;
        }
        let this_op = match msg.kind {
            SignalKind::DoReduce => QueueKind::Reduce,
            SignalKind::DoBroadcast => QueueKind::Broadcast,
            other => {
                return Err(EngineError::Signal(format!(
                    "follower received unexpected {other:?}"
                )));
            }
        };

        // The coordinate stage parked the partition before announcing it, so
        // absence here is a pipeline bug, not a race.
        let task = reg
            .queue(this_op)
            .get_task_by_key(msg.key)
            .ok_or(EngineError::KeyNotFound {
                key: msg.key,
                queue: this_op,
            })?;
        debug_assert_eq!(task.current_stage(), Some(this_op));

        if task.device != CPU_DEVICE_ID {
            issue_collective(reg, this_op, &task)?;
        }
        tasks.push(task);
    }
    reg.collective.group_end()?;

    let event = reg.runtime.create_event()?;
    reg.runtime.record_event(event, reg.streams.collective)?;
    reg.enqueue_group(GroupEntry {
        tasks,
        queues: Vec::new(),
        event,
    });
    Ok(())
}

/// Sync stage: wait out a finished group's event, then advance every
/// partition in it.
pub(crate) fn run_sync_collective_once(reg: &Arc<Registry>) -> Result<()> {
    let Some(entry) = reg.dequeue_group() else {
        idle();
        return Ok(());
    };
    reg.runtime.event_synchronize(entry.event)?;
    for (i, task) in entry.tasks.iter().enumerate() {
        finish_or_proceed(reg, task)?;
        if let Some(kind) = entry.queues.get(i) {
            reg.queue(*kind).report_finish(task.len);
        }
    }
    reg.runtime.destroy_event(entry.event)?;
    trace!(rank = reg.config.rank, batch = entry.tasks.len(), "group synced");
    Ok(())
}

pub(crate) fn run_copy_d2h_once(reg: &Arc<Registry>) -> Result<()> {
    let q = reg.queue(QueueKind::CopyD2H);
    let Some(task) = q.get_task() else {
        idle();
        return Ok(());
    };
    debug_assert!(reg.config.is_root(), "device staging is root-only");

    if task.device != CPU_DEVICE_ID {
        let tensor = task
            .tensor
            .as_deref()
            .ok_or_else(|| EngineError::runtime(format!("{}: missing input buffer", task.name)))?;
        if task.cpubuff == 0 {
            return Err(EngineError::runtime(format!(
                "{}: host staging buffer not initialized",
                task.name
            )));
        }
        unsafe {
            reg.runtime.copy_d2h(
                task.cpubuff + task.offset as u64,
                tensor.data() + task.offset as u64,
                task.len,
                reg.streams.d2h,
            )?;
        }
        reg.runtime.stream_synchronize(reg.streams.d2h)?;
    }

    finish_or_proceed(reg, &task)?;
    q.report_finish(task.len);
    Ok(())
}

pub(crate) fn run_push_once(reg: &Arc<Registry>) -> Result<()> {
    let q = reg.queue(QueueKind::Push);
    let Some(task) = q.get_task() else {
        idle();
        return Ok(());
    };
    debug_assert!(reg.config.is_root(), "push is root-only");

    let tensor = task
        .tensor
        .as_deref()
        .ok_or_else(|| EngineError::Ps(format!("{}: missing input buffer", task.name)))?;
    // Device tensors push their staged host window; host tensors push the
    // tensor itself.
    let data = if task.device != CPU_DEVICE_ID {
        task.cpubuff + task.offset as u64
    } else {
        tensor.data() + task.offset as u64
    };
    let dtype = tensor.dtype();

    let window = unsafe { std::slice::from_raw_parts_mut(data as *mut u8, task.len) };
    reg.transform.on_push(task.key, window, dtype)?;

    let pskv = reg.encode_key(task.key, task.len);
    let cmd = command(RequestType::DefaultPushPull, dtype);

    let reg2 = Arc::clone(reg);
    let task2 = Arc::clone(&task);
    unsafe {
        reg.ps()?.zpush(
            &pskv,
            data,
            task.len,
            cmd,
            Some(Box::new(move || {
                if let Err(e) = finish_or_proceed(&reg2, &task2) {
                    fatal(&e);
                }
                reg2.queue(QueueKind::Push).report_finish(task2.len);
            })),
        )?;
    }
    Ok(())
}

pub(crate) fn run_pull_once(reg: &Arc<Registry>) -> Result<()> {
    let q = reg.queue(QueueKind::Pull);
    let Some(task) = q.get_task() else {
        idle();
        return Ok(());
    };
    debug_assert!(reg.config.is_root(), "pull is root-only");

    let output = task
        .output
        .as_deref()
        .ok_or_else(|| EngineError::Ps(format!("{}: missing output buffer", task.name)))?;
    let data = if task.device != CPU_DEVICE_ID {
        task.cpubuff + task.offset as u64
    } else {
        output.data() + task.offset as u64
    };
    let dtype = output.dtype();

    let pskv = reg.encode_key(task.key, task.len);
    let cmd = command(RequestType::DefaultPushPull, dtype);

    let reg2 = Arc::clone(reg);
    let task2 = Arc::clone(&task);
    unsafe {
        reg.ps()?.zpull(
            &pskv,
            data,
            task.len,
            cmd,
            Some(Box::new(move || {
                let window =
                    unsafe { std::slice::from_raw_parts_mut(data as *mut u8, task2.len) };
                if let Err(e) = reg2
                    .transform
                    .on_pull(task2.key, window, dtype)
                    .and_then(|()| finish_or_proceed(&reg2, &task2))
                {
                    fatal(&e);
                }
                reg2.queue(QueueKind::Pull).report_finish(task2.len);
            })),
        )?;
    }
    Ok(())
}

pub(crate) fn run_copy_h2d_once(reg: &Arc<Registry>) -> Result<()> {
    let q = reg.queue(QueueKind::CopyH2D);
    let Some(task) = q.get_task() else {
        idle();
        return Ok(());
    };
    debug_assert!(reg.config.is_root(), "device staging is root-only");

    if task.device != CPU_DEVICE_ID {
        let output = task
            .output
            .as_deref()
            .ok_or_else(|| EngineError::runtime(format!("{}: missing output buffer", task.name)))?;
        if task.cpubuff == 0 {
            return Err(EngineError::runtime(format!(
                "{}: host staging buffer not initialized",
                task.name
            )));
        }
        unsafe {
            reg.runtime.copy_h2d(
                output.data() + task.offset as u64,
                task.cpubuff + task.offset as u64,
                task.len,
                reg.streams.h2d,
            )?;
        }
        reg.runtime.stream_synchronize(reg.streams.h2d)?;
    }

    finish_or_proceed(reg, &task)?;
    q.report_finish(task.len);
    Ok(())
}

/// Infrastructure failures are unrecoverable: a partial reduction would
/// silently corrupt model state across the whole job.
pub(crate) fn fatal(e: &EngineError) -> ! {
    tracing::error!(error = %e, "fatal pipeline failure, aborting");
    std::process::abort();
}
