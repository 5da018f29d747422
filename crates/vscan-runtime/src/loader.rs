//! Loader worker: decode one work item end-to-end into one pooled buffer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use vscan_media::decode::Decoder;
use vscan_media::frame::pack_nv12_into;
use vscan_store::codec::decode_keyframe_index;
use vscan_store::paths::{iframe_path, processed_video_path};

use vscan_observe::metrics::TaskStats;

use crate::pipeline::{fatal, PipelineShared};
use crate::{EvalWork, LoadWork};

/// End-of-run summary returned through the loader's join handle.
#[derive(Debug, Clone)]
pub struct LoaderReport {
    pub worker: usize,
    pub items: usize,
    pub total_task_ms: f64,
    pub mean_task_ms: f64,
    pub stddev_task_ms: f64,
    pub idle_ms: f64,
    pub io_ms: f64,
    pub decode_ms: f64,
    pub pack_ms: f64,
}

pub(crate) fn run_loader(worker: usize, shared: Arc<PipelineShared>) -> LoaderReport {
    let mut task_stats = TaskStats::default();
    let mut idle = Duration::ZERO;
    let mut io = Duration::ZERO;
    let mut decode = Duration::ZERO;
    let mut pack = Duration::ZERO;
    let mut items = 0usize;

    loop {
        let idle_start = Instant::now();
        let Some(entry) = shared.load_work.pop() else {
            fatal("loader", "load_work closed before sentinel arrived");
        };
        let LoadWork::Item(item_index) = entry else {
            break;
        };
        let mut idle_this = idle_start.elapsed();

        let task_start = Instant::now();
        let Some(&work_item) = shared.work_items.get(item_index) else {
            fatal("loader", format!("work item index {item_index} out of range"));
        };
        let Some(video_path) = shared.video_paths.get(work_item.video_index) else {
            fatal("loader", format!("video index {} out of range", work_item.video_index));
        };
        let meta = shared.metadata[work_item.video_index];

        // Keyframe index, then the processed stream itself.
        let io_start = Instant::now();
        let index_bytes = match shared
            .storage
            .open_random_read(&iframe_path(video_path))
            .and_then(|mut f| f.read_to_end())
        {
            Ok(bytes) => bytes,
            Err(e) => fatal("loader", e),
        };
        let keyframes = match decode_keyframe_index(&index_bytes) {
            Ok(index) => index,
            Err(e) => fatal("loader", e),
        };
        let file = match shared
            .storage
            .open_random_read(&processed_video_path(video_path))
        {
            Ok(f) => f,
            Err(e) => fatal("loader", e),
        };
        io += io_start.elapsed();
        let task_before_acquire = task_start.elapsed();

        // Blocking acquisition; whichever free buffer surfaces decides the
        // GPU this item lands on.
        let acquire_start = Instant::now();
        let Some(mut buffer) = shared.pool.acquire() else {
            fatal("loader", "buffer pool closed before sentinel arrived");
        };
        idle_this += acquire_start.elapsed();

        let resume = Instant::now();
        let gpu = buffer.gpu();
        let mut decoder = match Decoder::open(Some(gpu), file, &meta, keyframes) {
            Ok(d) => d,
            Err(e) => fatal("loader", e),
        };
        if let Err(e) = decoder.seek(work_item.start_frame) {
            fatal("loader", e);
        }

        let mut pack_this = Duration::ZERO;
        for slot in 0..work_item.len() as usize {
            let frame = match decoder.decode() {
                Ok(f) => f,
                Err(e) => fatal("loader", e),
            };
            let pack_start = Instant::now();
            pack_nv12_into(&frame, buffer.frame_mut(slot));
            pack_this += pack_start.elapsed();
        }

        io += decoder.io_time();
        decode += decoder.decode_time();
        pack += pack_this;
        idle += idle_this;
        task_stats.record(task_before_acquire + resume.elapsed());
        items += 1;

        if shared.eval_work[gpu.0]
            .push(EvalWork::Item {
                work_item_index: item_index,
                buffer,
            })
            .is_err()
        {
            fatal("loader", format!("eval_work[{gpu}] closed before sentinel arrived"));
        }
    }

    let report = LoaderReport {
        worker,
        items,
        total_task_ms: task_stats.total_ms(),
        mean_task_ms: task_stats.mean_ms(),
        stddev_task_ms: task_stats.stddev_ms(),
        idle_ms: idle.as_secs_f64() * 1e3,
        io_ms: io.as_secs_f64() * 1e3,
        decode_ms: decode.as_secs_f64() * 1e3,
        pack_ms: pack.as_secs_f64() * 1e3,
    };

    let busy = report.total_task_ms.max(f64::EPSILON);
    info!(
        event = "load_worker_finished",
        worker = worker as u64,
        tasks = items as u64,
        total_ms = report.total_task_ms,
        mean_ms = report.mean_task_ms,
        stddev_ms = report.stddev_task_ms,
        idle_ms = report.idle_ms,
        idle_pct = report.idle_ms / (report.idle_ms + report.total_task_ms) * 100.0,
        io_pct = report.io_ms / busy * 100.0,
        decode_pct = report.decode_ms / busy * 100.0,
        pack_pct = report.pack_ms / busy * 100.0,
        "load worker finished"
    );

    report
}
