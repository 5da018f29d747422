//! Per-GPU frame-range buffers and the free queue that recycles them.
//!
//! The free queue doubles as the node's backpressure mechanism: when
//! evaluators fall behind, every buffer is in flight and loaders block in
//! [`BufferPool::acquire`]. Popping an entry *names* the buffer the loader
//! must use, and with it the GPU — GPU assignment is a property of which
//! buffer comes up next, not of any scheduling decision.

use std::sync::Arc;

use vscan_core::types::GpuId;
use vscan_observe::metrics::{Counter, Gauge};

use crate::queue::{QueueClosed, WorkQueue};

/// One preallocated frame-range region.
///
/// Identity (`gpu`, `index`) is fixed for the buffer's whole lifetime. The
/// bytes move with the struct through the handoff queues, so exactly one
/// thread can touch them at any moment.
#[derive(Debug)]
pub struct FrameBuffer {
    gpu: GpuId,
    index: usize,
    frame_bytes: usize,
    bytes: Box<[u8]>,
}

impl FrameBuffer {
    fn new(gpu: GpuId, index: usize, frame_bytes: usize, frames: usize) -> Self {
        Self {
            gpu,
            index,
            frame_bytes,
            bytes: vec![0u8; frame_bytes * frames].into_boxed_slice(),
        }
    }

    pub fn gpu(&self) -> GpuId {
        self.gpu
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Frame slot `slot` within the range, canonical layout.
    pub fn frame(&self, slot: usize) -> &[u8] {
        let start = slot * self.frame_bytes;
        &self.bytes[start..start + self.frame_bytes]
    }

    pub fn frame_mut(&mut self, slot: usize) -> &mut [u8] {
        let start = slot * self.frame_bytes;
        &mut self.bytes[start..start + self.frame_bytes]
    }
}

/// Occupancy accounting for one pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub acquired_total: Counter,
    pub released_total: Counter,
    pub in_flight: Gauge,
    pub in_flight_high_water: Gauge,
}

/// The `empty_load_buffers` queue plus the allocation bookkeeping around it.
#[derive(Debug, Clone)]
pub struct BufferPool {
    free: WorkQueue<FrameBuffer>,
    total: usize,
    metrics: Arc<PoolMetrics>,
}

impl BufferPool {
    /// Allocate `buffers_per_gpu` buffers on each of `gpus` devices and seed
    /// the free queue with all of them, interleaved across GPUs so early
    /// acquisitions spread over devices.
    pub fn new(gpus: usize, buffers_per_gpu: usize, frame_bytes: usize, frames: usize) -> Self {
        let free = WorkQueue::new();
        let total = gpus * buffers_per_gpu;
        for index in 0..buffers_per_gpu {
            for gpu in 0..gpus {
                // Seeding cannot fail: we hold both channel ends.
                let _ = free.push(FrameBuffer::new(GpuId(gpu), index, frame_bytes, frames));
            }
        }
        Self {
            free,
            total,
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Blocking acquisition; transfers exclusive ownership to the caller.
    /// `None` means the pipeline tore down underneath us.
    pub fn acquire(&self) -> Option<FrameBuffer> {
        let buffer = self.free.pop()?;
        self.metrics.acquired_total.inc();
        let in_flight = self.metrics.in_flight.add(1);
        self.metrics.in_flight_high_water.max(in_flight);
        Some(buffer)
    }

    /// Return a buffer to the pool, waking one blocked loader if any.
    pub fn release(&self, buffer: FrameBuffer) -> Result<(), QueueClosed> {
        self.metrics.released_total.inc();
        self.metrics.in_flight.sub(1);
        self.free.push(buffer)
    }

    pub fn metrics(&self) -> Arc<PoolMetrics> {
        self.metrics.clone()
    }

    /// Buffers currently free (racy lower bound).
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Teardown check: pull every buffer back out without blocking.
    /// A full pipeline drain must recover exactly `total()` buffers.
    pub fn drain(&self) -> Vec<FrameBuffer> {
        let mut out = Vec::with_capacity(self.total);
        while let Some(buf) = self.free.try_pop() {
            out.push(buf);
        }
        out
    }
}
