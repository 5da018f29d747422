//! Node pipeline lifecycle: build shared state, start workers, drain via
//! sentinels, join, verify the pool recovered every buffer.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{error, info};

use vscan_core::types::{
    check_uniform_dimensions, plan_work_items, ConfigError, GpuId, MetadataError, PipelineConfig,
    VideoMetadata, WorkItem,
};
use vscan_infer::engine::ModelSpec;
use vscan_store::codec::{decode_metadata, CodecError};
use vscan_store::paths::metadata_path;
use vscan_store::{Storage, StorageError};

use crate::buffer::BufferPool;
use crate::evaluator::{run_evaluator, EvaluatorParams, EvaluatorReport, FrameTap};
use crate::loader::{run_loader, LoaderReport};
use crate::queue::{QueueClosed, WorkQueue};
use crate::{EvalWork, LoadWork};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("have {paths} video paths but {metadata} metadata records")]
    VideoCountMismatch { paths: usize, metadata: usize },
    #[error("{0} thread panicked")]
    WorkerPanic(&'static str),
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error("buffer pool recovered {recovered} of {total} buffers after drain")]
    BufferLeak { recovered: usize, total: usize },
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

/// A worker hit a failure the pipeline has no recovery semantics for.
/// Leaving peers blocked on a buffer that will never arrive would deadlock
/// the node, so the process exits instead.
pub(crate) fn fatal(who: &str, err: impl std::fmt::Display) -> ! {
    error!(worker = who, error = %err, "fatal pipeline failure");
    std::process::exit(1);
}

/// Read-only state shared by every worker on the node, plus the queues.
pub struct PipelineShared {
    pub config: PipelineConfig,
    pub video_paths: Vec<PathBuf>,
    pub metadata: Vec<VideoMetadata>,
    pub work_items: Vec<WorkItem>,
    pub storage: Storage,
    pub load_work: WorkQueue<LoadWork>,
    pub eval_work: Vec<WorkQueue<EvalWork>>,
    pub pool: BufferPool,
}

/// Allocator-side view of the node: backlog probe plus the feed side of
/// `load_work`.
#[derive(Clone)]
pub struct NodeFeeder {
    load_work: WorkQueue<LoadWork>,
    eval_work: Vec<WorkQueue<EvalWork>>,
}

impl NodeFeeder {
    /// Entries sitting in the local queues (racy lower bound, matching the
    /// allocator's throttling contract).
    pub fn backlog(&self) -> usize {
        self.load_work.len() + self.eval_work.iter().map(WorkQueue::len).sum::<usize>()
    }

    pub fn push_item(&self, work_item_index: usize) -> Result<(), QueueClosed> {
        self.load_work.push(LoadWork::Item(work_item_index))
    }
}

/// Per-run summaries collected at join time.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub loaders: Vec<LoaderReport>,
    pub evaluators: Vec<EvaluatorReport>,
    /// Most buffers simultaneously in flight; never exceeds the pool size.
    pub buffers_high_water: u64,
}

impl PipelineReport {
    pub fn total_items(&self) -> usize {
        self.evaluators.iter().map(|e| e.items).sum()
    }

    pub fn total_frames(&self) -> u64 {
        self.evaluators.iter().map(|e| e.frames).sum()
    }
}

/// One node's running pipeline: loader and evaluator threads wired through
/// the buffer pool.
pub struct NodePipeline {
    shared: Arc<PipelineShared>,
    loaders: Vec<JoinHandle<LoaderReport>>,
    evaluators: Vec<JoinHandle<EvaluatorReport>>,
}

impl NodePipeline {
    /// Allocate buffers, create queues, and start every worker thread.
    ///
    /// Buffer geometry comes from `metadata[0]`; mixed frame dimensions are
    /// rejected up front.
    pub fn start(
        config: PipelineConfig,
        storage: Storage,
        video_paths: Vec<PathBuf>,
        metadata: Vec<VideoMetadata>,
        model: ModelSpec,
        tap: Option<FrameTap>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        if video_paths.len() != metadata.len() {
            return Err(RuntimeError::VideoCountMismatch {
                paths: video_paths.len(),
                metadata: metadata.len(),
            });
        }
        for meta in &metadata {
            meta.validate()?;
        }
        check_uniform_dimensions(&metadata)?;

        let work_items = plan_work_items(&metadata, config.frames_per_work_item());
        let frame_bytes = metadata.first().map(|m| m.frame_bytes()).unwrap_or(1);
        let pool = BufferPool::new(
            config.gpus_per_node,
            config.load_buffers_per_gpu(),
            frame_bytes,
            config.frames_per_work_item() as usize,
        );

        let load_work = WorkQueue::new();
        let eval_work: Vec<WorkQueue<EvalWork>> =
            (0..config.gpus_per_node).map(|_| WorkQueue::new()).collect();

        let shared = Arc::new(PipelineShared {
            config,
            video_paths,
            metadata,
            work_items,
            storage,
            load_work,
            eval_work,
            pool,
        });

        info!(
            event = "pipeline_started",
            work_items = shared.work_items.len() as u64,
            gpus = config.gpus_per_node as u64,
            load_workers = config.load_workers_per_node as u64,
            buffers = shared.pool.total() as u64,
            "node pipeline started"
        );

        let mut loaders = Vec::with_capacity(config.load_workers_per_node);
        for worker in 0..config.load_workers_per_node {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vscan-load-{worker}"))
                .spawn(move || run_loader(worker, shared))
                .map_err(|e| RuntimeError::Spawn("loader", e))?;
            loaders.push(handle);
        }

        let mut evaluators = Vec::with_capacity(config.gpus_per_node);
        for gpu in 0..config.gpus_per_node {
            let shared = shared.clone();
            let queue = shared.eval_work[gpu].clone();
            let params = EvaluatorParams {
                gpu: GpuId(gpu),
                model: model.clone(),
                tap: tap.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("vscan-eval-{gpu}"))
                .spawn(move || run_evaluator(params, shared, queue))
                .map_err(|e| RuntimeError::Spawn("evaluator", e))?;
            evaluators.push(handle);
        }

        Ok(Self {
            shared,
            loaders,
            evaluators,
        })
    }

    pub fn feeder(&self) -> NodeFeeder {
        NodeFeeder {
            load_work: self.shared.load_work.clone(),
            eval_work: self.shared.eval_work.clone(),
        }
    }

    pub fn work_items(&self) -> &[WorkItem] {
        &self.shared.work_items
    }

    /// Drain the pipeline: one sentinel per loader, join loaders, one
    /// sentinel per evaluator, join evaluators.
    ///
    /// The ordering guarantees no evaluator sees its sentinel before the
    /// last real entry produced by any loader has been enqueued.
    pub fn drain_and_join(self) -> Result<PipelineReport, RuntimeError> {
        let config = self.shared.config;

        for _ in 0..config.load_workers_per_node {
            self.shared.load_work.push(LoadWork::Stop)?;
        }
        let mut loader_reports = Vec::with_capacity(self.loaders.len());
        for handle in self.loaders {
            loader_reports.push(handle.join().map_err(|_| RuntimeError::WorkerPanic("loader"))?);
        }

        for queue in &self.shared.eval_work {
            queue.push(EvalWork::Stop)?;
        }
        let mut evaluator_reports = Vec::with_capacity(self.evaluators.len());
        for handle in self.evaluators {
            evaluator_reports
                .push(handle.join().map_err(|_| RuntimeError::WorkerPanic("evaluator"))?);
        }

        let recovered = self.shared.pool.drain().len();
        if recovered != self.shared.pool.total() {
            return Err(RuntimeError::BufferLeak {
                recovered,
                total: self.shared.pool.total(),
            });
        }

        let pool_metrics = self.shared.pool.metrics();
        info!(
            event = "pipeline_drained",
            buffers_recovered = recovered as u64,
            buffers_acquired_total = pool_metrics.acquired_total.get(),
            buffers_in_flight_high_water = pool_metrics.in_flight_high_water.get(),
            "node pipeline drained"
        );

        Ok(PipelineReport {
            loaders: loader_reports,
            evaluators: evaluator_reports,
            buffers_high_water: pool_metrics.in_flight_high_water.get(),
        })
    }
}

/// Startup helper: read every video's binary metadata record.
pub fn load_all_metadata(
    storage: &Storage,
    video_paths: &[PathBuf],
) -> Result<Vec<VideoMetadata>, RuntimeError> {
    let mut out = Vec::with_capacity(video_paths.len());
    for path in video_paths {
        let bytes = storage
            .open_random_read(&metadata_path(path))?
            .read_to_end()?;
        out.push(decode_metadata(&bytes)?);
    }
    Ok(out)
}
