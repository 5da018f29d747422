use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use vscan_core::types::PipelineConfig;
use vscan_infer::engine::ModelSpec;
use vscan_media::preprocess::{preprocess_video, PreprocessConfig};
use vscan_media::y4m::write_y4m;
use vscan_runtime::allocator::{run_master, AllocatorState};
use vscan_runtime::pipeline::{load_all_metadata, NodePipeline, PipelineReport};
use vscan_store::Storage;

fn temp_dir(test_name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "vscan-runtime-{test_name}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn i420_frame(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let y = (width * height) as usize;
    (0..y + y / 2)
        .map(|i| seed.wrapping_mul(13).wrapping_add(i as u8))
        .collect()
}

fn make_video(dir: &Path, name: &str, frames: u32) -> PathBuf {
    let (width, height) = (8, 8);
    let data: Vec<Vec<u8>> = (0..frames)
        .map(|i| i420_frame(width, height, i as u8))
        .collect();
    let path = dir.join(format!("{name}.y4m"));
    std::fs::write(&path, write_y4m(width, height, &data)).unwrap();
    preprocess_video(&path, &PreprocessConfig { gop: 4 }).unwrap();
    path
}

fn config(gpus: usize, loaders: usize) -> PipelineConfig {
    PipelineConfig {
        gpus_per_node: gpus,
        batch_size: 2,
        batches_per_work_item: 2,
        tasks_in_queue_per_gpu: 4,
        load_workers_per_node: loaders,
        num_streams: 4,
    }
}

async fn run_single_node(cfg: PipelineConfig, videos: Vec<PathBuf>) -> PipelineReport {
    let storage = Storage::disk();
    let metadata = load_all_metadata(&storage, &videos).unwrap();
    let pipeline = NodePipeline::start(
        cfg,
        storage,
        videos,
        metadata,
        ModelSpec::Reference,
        None,
    )
    .unwrap();

    let state = AllocatorState::new(pipeline.work_items().len(), 1);
    run_master(state, pipeline.feeder(), cfg.queue_threshold())
        .await
        .unwrap();

    tokio::task::spawn_blocking(move || pipeline.drain_and_join())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_item_runs_one_forward_per_batch() {
    let dir = temp_dir("full-item");
    // One video of exactly one work item (batch 2 x 2 batches).
    let video = make_video(&dir, "full", 4);

    let report = run_single_node(config(1, 1), vec![video]).await;

    assert_eq!(report.total_items(), 1);
    assert_eq!(report.total_frames(), 4);
    let eval = &report.evaluators[0];
    // Every forward sees a full batch, epilogue included.
    assert_eq!(eval.batch_sizes, vec![2, 2]);
    assert_eq!(eval.forward_calls, 2);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_tail_item_runs_single_epilogue_forward() {
    let dir = temp_dir("short-tail");
    // 5 frames -> one full item (4) plus a 1-frame tail item.
    let video = make_video(&dir, "tail", 5);

    let report = run_single_node(config(1, 1), vec![video]).await;

    assert_eq!(report.total_items(), 2);
    assert_eq!(report.total_frames(), 5);
    let eval = &report.evaluators[0];
    // Tail item: zero main batches, one epilogue forward of the remainder.
    assert_eq!(eval.batch_sizes, vec![2, 2, 1]);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_decoded_frame_reaches_forward() {
    let dir = temp_dir("round-trip");
    // Deliberately not a multiple of batch or item size.
    let video = make_video(&dir, "odd", 11);

    let report = run_single_node(config(1, 2), vec![video]).await;

    assert_eq!(report.total_frames(), 11);
    let frames_via_batches: u32 = report
        .evaluators
        .iter()
        .flat_map(|e| e.batch_sizes.iter())
        .sum();
    assert_eq!(frames_via_batches, 11);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_gpus_split_items_evenly() {
    let dir = temp_dir("two-gpus");
    // Two videos of two items each -> four items over two GPUs.
    let videos = vec![make_video(&dir, "a", 8), make_video(&dir, "b", 8)];

    let report = run_single_node(config(2, 1), videos).await;

    assert_eq!(report.evaluators.len(), 2);
    assert_eq!(report.total_items(), 4);
    for eval in &report.evaluators {
        assert_eq!(
            eval.items, 2,
            "gpu {} processed {} items",
            eval.gpu, eval.items
        );
    }

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn work_items_are_processed_exactly_once() {
    let dir = temp_dir("uniqueness");
    let videos = vec![make_video(&dir, "a", 16), make_video(&dir, "b", 9)];

    let report = run_single_node(config(2, 2), videos).await;

    let mut seen = Vec::new();
    for eval in &report.evaluators {
        seen.extend(eval.work_item_indices.iter().copied());
    }
    let unique: BTreeSet<usize> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "a work item was processed twice");
    // 16 frames -> 4 items, 9 frames -> 3 items.
    assert_eq!(unique, (0..7).collect::<BTreeSet<_>>());

    let _ = std::fs::remove_dir_all(dir);
}
