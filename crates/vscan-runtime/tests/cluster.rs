use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use vscan_core::types::{NodeId, PipelineConfig};
use vscan_infer::engine::ModelSpec;
use vscan_media::preprocess::{preprocess_video, PreprocessConfig};
use vscan_media::y4m::write_y4m;
use vscan_runtime::allocator::{
    allocator_service, run_master, run_worker, AllocatorState,
};
use vscan_runtime::evaluator::FrameTap;
use vscan_runtime::pipeline::{load_all_metadata, NodePipeline, PipelineReport};
use vscan_store::Storage;

fn temp_dir(test_name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "vscan-cluster-{test_name}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn i420_frame(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let y = (width * height) as usize;
    (0..y + y / 2).map(|i| seed.wrapping_add(i as u8)).collect()
}

fn make_videos(dir: &Path, count: usize, frames: u32) -> Vec<PathBuf> {
    let (width, height) = (8, 8);
    (0..count)
        .map(|v| {
            let data: Vec<Vec<u8>> = (0..frames)
                .map(|i| i420_frame(width, height, (v as u8) * 17 + i as u8))
                .collect();
            let path = dir.join(format!("clip-{v}.y4m"));
            std::fs::write(&path, write_y4m(width, height, &data)).unwrap();
            preprocess_video(&path, &PreprocessConfig { gop: 4 }).unwrap();
            path
        })
        .collect()
}

fn cluster_config() -> PipelineConfig {
    PipelineConfig {
        gpus_per_node: 1,
        batch_size: 2,
        batches_per_work_item: 2,
        tasks_in_queue_per_gpu: 2,
        load_workers_per_node: 1,
        num_streams: 2,
    }
}

fn start_node(
    cfg: PipelineConfig,
    videos: &[PathBuf],
    tap: Option<FrameTap>,
) -> NodePipeline {
    let storage = Storage::disk();
    let metadata = load_all_metadata(&storage, videos).unwrap();
    NodePipeline::start(
        cfg,
        storage,
        videos.to_vec(),
        metadata,
        ModelSpec::Reference,
        tap,
    )
    .unwrap()
}

fn processed_indices(report: &PipelineReport) -> BTreeSet<usize> {
    report
        .evaluators
        .iter()
        .flat_map(|e| e.work_item_indices.iter().copied())
        .collect()
}

/// Two nodes over loopback gRPC: every work item is processed exactly once
/// cluster-wide, and the fast worker node takes real work off the slow
/// master.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_process_every_item_exactly_once() {
    let dir = temp_dir("two-nodes");
    // Three videos, four items each: twelve work items.
    let videos = make_videos(&dir, 3, 16);
    let cfg = cluster_config();

    // Slow the master's evaluator so its backlog stays full and the worker
    // keeps winning requests.
    let slow_tap: FrameTap = Arc::new(|_, _, _| std::thread::sleep(Duration::from_millis(3)));
    let master_node = start_node(cfg, &videos, Some(slow_tap));
    let worker_node = start_node(cfg, &videos, None);

    let total = master_node.work_items().len();
    assert_eq!(total, 12);
    assert_eq!(worker_node.work_items().len(), total);

    let state = AllocatorState::new(total, 2);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpListenerStream::new(listener);
    let server = {
        let service = allocator_service(state.clone());
        tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming(incoming)
                .await
        })
    };

    let master_feeder = master_node.feeder();
    let worker_feeder = worker_node.feeder();
    let master_task = run_master(state, master_feeder, cfg.queue_threshold());
    let worker_addr = format!("http://{addr}");
    let worker_node_id = NodeId("worker-1".to_string());
    let worker_task = run_worker(
        &worker_addr,
        &worker_node_id,
        total,
        worker_feeder,
        cfg.queue_threshold(),
    );

    let (master_res, worker_res) = tokio::time::timeout(Duration::from_secs(60), async {
        tokio::join!(master_task, worker_task)
    })
    .await
    .expect("allocator should drain within the timeout");
    master_res.unwrap();
    worker_res.unwrap();
    server.abort();

    let master_report = tokio::task::spawn_blocking(move || master_node.drain_and_join())
        .await
        .unwrap()
        .unwrap();
    let worker_report = tokio::task::spawn_blocking(move || worker_node.drain_and_join())
        .await
        .unwrap()
        .unwrap();

    let master_items = processed_indices(&master_report);
    let worker_items = processed_indices(&worker_report);

    assert!(
        master_items.is_disjoint(&worker_items),
        "an item ran on both nodes: master={master_items:?} worker={worker_items:?}"
    );
    let mut union = master_items.clone();
    union.extend(worker_items.iter().copied());
    assert_eq!(union, (0..total).collect::<BTreeSet<_>>());

    assert!(
        !worker_items.is_empty(),
        "worker node never received any work"
    );
    assert!(
        master_items.len() < total,
        "master hoarded every item despite a live worker"
    );

    let _ = std::fs::remove_dir_all(dir);
}

/// A node whose replicated work-item list disagrees with the master's must
/// be rejected at registration.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_work_item_count_is_rejected() {
    let dir = temp_dir("mismatch");
    let videos = make_videos(&dir, 1, 16);
    let cfg = cluster_config();

    let worker_node = start_node(cfg, &videos, None);

    let state = AllocatorState::new(4, 2);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpListenerStream::new(listener);
    let server = {
        let service = allocator_service(state);
        tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming(incoming)
                .await
        })
    };

    // Claim a different item count than the master computed.
    let err = run_worker(
        &format!("http://{addr}"),
        &NodeId("worker-1".to_string()),
        5,
        worker_node.feeder(),
        cfg.queue_threshold(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("rejected"), "got: {err}");

    server.abort();
    // The worker never received items; drain must still recover all buffers.
    let report = tokio::task::spawn_blocking(move || worker_node.drain_and_join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.total_items(), 0);

    let _ = std::fs::remove_dir_all(dir);
}
