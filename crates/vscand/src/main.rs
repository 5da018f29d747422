#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{info, info_span, Instrument};

use vscan_core::types::{NodeId, PipelineConfig};
use vscan_infer::engine::ModelSpec;
use vscan_media::preprocess::{artifacts_present, preprocess_video, PreprocessConfig};
use vscan_runtime::allocator::{allocator_service, run_master, run_worker, AllocatorState};
use vscan_runtime::pipeline::{load_all_metadata, NodePipeline};
use vscan_store::Storage;

#[derive(Debug, Parser)]
#[command(
    name = "vscand",
    about = "Run a convolutional network over every frame of a video collection, \
             distributed across the GPUs of a multi-node cluster."
)]
struct Args {
    /// File which contains paths to video files to process, one per line.
    #[arg(long = "video_paths_file", env = "VSCAN_VIDEO_PATHS_FILE")]
    video_paths_file: PathBuf,

    /// Number of GPUs per node.
    #[arg(long = "gpus_per_node", env = "VSCAN_GPUS_PER_NODE", default_value_t = 1)]
    gpus_per_node: usize,

    /// Neural net input batch size.
    #[arg(long = "batch_size", env = "VSCAN_BATCH_SIZE", default_value_t = 64)]
    batch_size: u32,

    /// Number of batches in each work item.
    #[arg(
        long = "batches_per_work_item",
        env = "VSCAN_BATCHES_PER_WORK_ITEM",
        default_value_t = 4
    )]
    batches_per_work_item: u32,

    /// Number of tasks a node will try to maintain in the work queue per GPU.
    #[arg(
        long = "tasks_in_queue_per_gpu",
        env = "VSCAN_TASKS_IN_QUEUE_PER_GPU",
        default_value_t = 4
    )]
    tasks_in_queue_per_gpu: usize,

    /// Number of worker threads processing load jobs per node.
    #[arg(
        long = "load_workers_per_node",
        env = "VSCAN_LOAD_WORKERS_PER_NODE",
        default_value_t = 2
    )]
    load_workers_per_node: usize,

    /// Stream lanes per evaluator for overlapping per-frame preprocessing.
    #[arg(long = "num_streams", env = "VSCAN_NUM_STREAMS", default_value_t = 32)]
    num_streams: usize,

    /// Cluster rank of this process; rank 0 is the master.
    #[arg(long = "rank", env = "VSCAN_RANK", default_value_t = 0)]
    rank: u32,

    /// Total number of nodes in the cluster.
    #[arg(long = "world_size", env = "VSCAN_WORLD_SIZE", default_value_t = 1)]
    world_size: usize,

    /// Master allocator address workers connect to.
    #[arg(
        long = "master_addr",
        env = "VSCAN_MASTER_ADDR",
        default_value = "http://127.0.0.1:50917"
    )]
    master_addr: String,

    /// Bind address for the master's allocator service.
    #[arg(
        long = "listen_addr",
        env = "VSCAN_LISTEN_ADDR",
        default_value = "0.0.0.0:50917"
    )]
    listen_addr: SocketAddr,

    /// Stable identifier for this node; defaults to node-<rank>.
    #[arg(long = "node_id", env = "VSCAN_NODE_ID")]
    node_id: Option<String>,

    /// Network to load: `reference`, or a model file with the onnx feature.
    #[arg(long = "model", env = "VSCAN_MODEL", default_value = "reference")]
    model: String,

    /// Keyframe cadence used when preprocessing missing artifacts.
    #[arg(long = "preprocess_gop", env = "VSCAN_PREPROCESS_GOP", default_value_t = 16)]
    preprocess_gop: u32,
}

fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Usage goes to stdout and exits 1; real argument errors go to
            // stderr with a distinct code.
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 1,
                _ => 2,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    }
}

fn read_video_paths(list_path: &PathBuf) -> Result<Vec<PathBuf>> {
    let raw = std::fs::read_to_string(list_path)
        .with_context(|| format!("reading video paths file {}", list_path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    vscan_observe::logging::init_tracing();

    let args = parse_args();
    let node_id = NodeId(
        args.node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", args.rank)),
    );

    let span = info_span!("vscand", rank = args.rank, node_id = %node_id);
    run(args, node_id).instrument(span).await
}

async fn run(args: Args, node_id: NodeId) -> Result<()> {
    let video_paths = read_video_paths(&args.video_paths_file)?;
    let storage = Storage::disk();

    // Preprocessing gate: the pipeline only runs once every artifact exists.
    let mut missing = Vec::new();
    for path in &video_paths {
        if !artifacts_present(&storage, path)? {
            missing.push(path.clone());
        }
    }
    if !missing.is_empty() {
        if args.rank == 0 {
            for path in &missing {
                info!(path = %path.display(), "video not processed yet, processing now");
                preprocess_video(
                    path,
                    &PreprocessConfig {
                        gop: args.preprocess_gop,
                    },
                )?;
            }
            info!(
                videos = missing.len() as u64,
                "preprocessing complete; run again to start the pipeline"
            );
        } else {
            info!("artifacts missing; master runs preprocessing in its own pass");
        }
        return Ok(());
    }

    let metadata = load_all_metadata(&storage, &video_paths)?;
    let config = PipelineConfig {
        gpus_per_node: args.gpus_per_node,
        batch_size: args.batch_size,
        batches_per_work_item: args.batches_per_work_item,
        tasks_in_queue_per_gpu: args.tasks_in_queue_per_gpu,
        load_workers_per_node: args.load_workers_per_node,
        num_streams: args.num_streams,
    };
    let model = ModelSpec::parse(&args.model)?;

    let pipeline = NodePipeline::start(config, storage, video_paths, metadata, model, None)?;
    let total_work_items = pipeline.work_items().len();
    let feeder = pipeline.feeder();
    let threshold = config.queue_threshold();

    if args.rank == 0 {
        info!(total = total_work_items as u64, "total work items");
        let state = AllocatorState::new(total_work_items, args.world_size);

        let server = if args.world_size > 1 {
            let service = allocator_service(state.clone());
            let listen_addr = args.listen_addr;
            Some(tokio::spawn(async move {
                tonic::transport::Server::builder()
                    .add_service(service)
                    .serve(listen_addr)
                    .await
            }))
        } else {
            None
        };

        run_master(state, feeder, threshold).await?;
        if let Some(server) = server {
            server.abort();
        }
    } else {
        run_worker(
            &args.master_addr,
            &node_id,
            total_work_items,
            feeder,
            threshold,
        )
        .await?;
    }

    let report = tokio::task::spawn_blocking(move || pipeline.drain_and_join()).await??;
    info!(
        event = "run_complete",
        items = report.total_items() as u64,
        frames = report.total_frames(),
        "run complete"
    );
    Ok(())
}
