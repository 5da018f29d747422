use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `VSCAN_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for vscan processes:
/// - Always include `node_id` when available.
/// - Include `rank` on any allocator-related event.
/// - Include `gpu` on any evaluator or buffer-pool event.
/// - Include `work_item` on any per-item event.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("VSCAN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
