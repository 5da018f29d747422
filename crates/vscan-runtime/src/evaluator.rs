//! Evaluator worker: batched preprocessing plus forward passes for one GPU.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{Array3, Array4};
use tracing::info;

use vscan_core::types::GpuId;
use vscan_infer::engine::{load_network, Engine, ModelSpec};
use vscan_infer::ops::{
    nv12_to_bgr, resize_bilinear_f32, resize_bilinear_u8, subtract_mean, to_f32, write_chw,
};
use vscan_observe::metrics::{DurationAgg, ScopedTimer, TaskStats};

use crate::pipeline::{fatal, PipelineShared};
use crate::queue::WorkQueue;
use crate::EvalWork;

/// Debug seam: observes each converted frame before normalization. Left
/// unset on the hot path.
pub type FrameTap = Arc<dyn Fn(usize, u32, &Array3<u8>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EvaluatorReport {
    pub gpu: GpuId,
    pub items: usize,
    pub forward_calls: usize,
    pub frames: u64,
    /// Batch dimension of every forward pass, in call order.
    pub batch_sizes: Vec<u32>,
    /// Work items this evaluator completed, in completion order.
    pub work_item_indices: Vec<usize>,
    pub total_task_ms: f64,
    pub mean_task_ms: f64,
    pub stddev_task_ms: f64,
    pub idle_ms: f64,
    pub forward_avg_ns: u64,
}

pub(crate) struct EvaluatorParams {
    pub gpu: GpuId,
    pub model: ModelSpec,
    pub tap: Option<FrameTap>,
}

/// Per-stream scratch images, sized once at startup.
struct Lane {
    bgr: Array3<u8>,
    resized: Array3<u8>,
    floated: Array3<f32>,
    normed: Array3<f32>,
}

impl Lane {
    fn new(width: usize, height: usize, dim: usize) -> Self {
        Self {
            bgr: Array3::zeros((height, width, 3)),
            resized: Array3::zeros((dim, dim, 3)),
            floated: Array3::zeros((dim, dim, 3)),
            normed: Array3::zeros((dim, dim, 3)),
        }
    }
}

pub(crate) fn run_evaluator(
    params: EvaluatorParams,
    shared: Arc<PipelineShared>,
    eval_work: WorkQueue<EvalWork>,
) -> EvaluatorReport {
    let gpu = params.gpu;
    let batch = shared.config.batch_size as usize;
    let meta = shared.metadata[0];
    let width = meta.width as usize;
    let height = meta.height as usize;

    let net = match load_network(&params.model, gpu, batch) {
        Ok(n) => n,
        Err(e) => fatal("evaluator", e),
    };
    let mut engine = net.engine;
    let dim = net.input_size;

    // Mean image is resized to the network input once, then reused.
    let mut mean = Array3::zeros((dim, dim, 3));
    resize_bilinear_f32(&net.mean_image, &mut mean);

    let mut lanes: Vec<Lane> = (0..shared.config.num_streams)
        .map(|_| Lane::new(width, height, dim))
        .collect();
    let mut input = Array4::zeros((batch, 3, dim, dim));

    let mut task_stats = TaskStats::default();
    let forward_agg = DurationAgg::default();
    let mut idle = Duration::ZERO;
    let mut items = 0usize;
    let mut forward_calls = 0usize;
    let mut frames = 0u64;
    let mut batch_sizes = Vec::new();
    let mut work_item_indices = Vec::new();

    loop {
        let idle_start = Instant::now();
        let Some(entry) = eval_work.pop() else {
            fatal("evaluator", "eval_work closed before sentinel arrived");
        };
        let EvalWork::Item {
            work_item_index,
            buffer,
        } = entry
        else {
            break;
        };
        idle += idle_start.elapsed();

        let task_start = Instant::now();
        debug_assert_eq!(buffer.gpu(), gpu, "buffer routed to the wrong evaluator");
        let Some(&work_item) = shared.work_items.get(work_item_index) else {
            fatal(
                "evaluator",
                format!("work item index {work_item_index} out of range"),
            );
        };
        let total = work_item.len() as usize;

        if engine.batch() != batch {
            if let Err(e) = engine.reshape_batch(batch) {
                fatal("evaluator", e);
            }
        }

        let run_batch = |engine: &mut Engine,
                             input: &mut Array4<f32>,
                             lanes: &mut [Lane],
                             frame_offset: usize,
                             batch_size: usize| {
            for i in 0..batch_size {
                let lane = &mut lanes[i % lanes.len()];
                let bytes = buffer.frame(frame_offset + i);
                let (y_plane, uv_plane) = bytes.split_at(width * height);

                nv12_to_bgr(y_plane, uv_plane, meta.width, meta.height, &mut lane.bgr);
                if let Some(tap) = &params.tap {
                    let frame_no = work_item.start_frame + (frame_offset + i) as u32;
                    tap(work_item_index, frame_no, &lane.bgr);
                }
                resize_bilinear_u8(&lane.bgr, &mut lane.resized);
                to_f32(&lane.resized, &mut lane.floated);
                subtract_mean(&lane.floated, &mean, &mut lane.normed);
                write_chw(&lane.normed, input, i);
            }
            // All lanes drained; the forward pass may read every input slot.
            let _timer = ScopedTimer::new(&forward_agg);
            if let Err(e) = engine.forward(input) {
                fatal("evaluator", e);
            }
        };

        let mut frame_offset = 0usize;
        while frame_offset + batch < total {
            run_batch(&mut engine, &mut input, &mut lanes, frame_offset, batch);
            forward_calls += 1;
            frames += batch as u64;
            batch_sizes.push(batch as u32);
            frame_offset += batch;
        }

        // Epilogue batch for the remaining tail (possibly a full batch).
        if frame_offset < total {
            let tail = total - frame_offset;
            if engine.batch() != tail {
                if let Err(e) = engine.reshape_batch(tail) {
                    fatal("evaluator", e);
                }
            }
            let mut tail_input = Array4::zeros((tail, 3, dim, dim));
            run_batch(&mut engine, &mut tail_input, &mut lanes, frame_offset, tail);
            forward_calls += 1;
            frames += tail as u64;
            batch_sizes.push(tail as u32);
        }

        task_stats.record(task_start.elapsed());
        items += 1;
        work_item_indices.push(work_item_index);

        if shared.pool.release(buffer).is_err() {
            fatal("evaluator", "buffer pool closed before sentinel arrived");
        }
    }

    let report = EvaluatorReport {
        gpu,
        items,
        forward_calls,
        frames,
        batch_sizes,
        work_item_indices,
        total_task_ms: task_stats.total_ms(),
        mean_task_ms: task_stats.mean_ms(),
        stddev_task_ms: task_stats.stddev_ms(),
        idle_ms: idle.as_secs_f64() * 1e3,
        forward_avg_ns: forward_agg.snapshot().avg_ns(),
    };

    info!(
        event = "evaluate_worker_finished",
        gpu = %gpu,
        tasks = report.items as u64,
        forward_calls = report.forward_calls as u64,
        frames = report.frames,
        total_ms = report.total_task_ms,
        mean_ms = report.mean_task_ms,
        stddev_ms = report.stddev_task_ms,
        idle_ms = report.idle_ms,
        idle_pct = report.idle_ms / (report.idle_ms + report.total_task_ms) * 100.0,
        forward_avg_us = report.forward_avg_ns / 1_000,
        "evaluate worker finished"
    );

    report
}
