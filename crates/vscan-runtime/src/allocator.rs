//! Cluster work allocator: rank 0 owns the global work-item counter and
//! hands out indices on demand, one per request/reply exchange.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use vscan_core::types::NodeId;
use vscan_proto::convert::{validate_register_request, validate_work_request, WorkAssignment};
use vscan_proto::v0::allocator_client::AllocatorClient;
use vscan_proto::v0::allocator_server::{Allocator, AllocatorServer};
use vscan_proto::v0::{RegisterNodeRequest, RegisterNodeResponse, WorkReply, WorkRequest};

use crate::pipeline::NodeFeeder;

/// How often the master reports remaining work.
const PROGRESS_EVERY: usize = 10;
/// Cooperative yield between allocator iterations.
const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Backoff while a worker waits for the master to come up.
const CONNECT_RETRY: Duration = Duration::from_millis(200);
const CONNECT_ATTEMPTS: usize = 150;

/// Master-side allocation state, shared between the local feed loop and the
/// gRPC service task.
pub struct AllocatorState {
    total: usize,
    world_size: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    next: usize,
    done_nodes: HashSet<String>,
}

impl AllocatorState {
    pub fn new(total_work_items: usize, world_size: usize) -> Arc<Self> {
        Arc::new(Self {
            total: total_work_items,
            world_size: world_size.max(1),
            inner: Mutex::new(Inner {
                next: 0,
                done_nodes: HashSet::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned allocator mutex means a peer already took the process
        // down; keep the state usable for the remaining teardown.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Take the next index if any remain. Allocation order is globally
    /// monotonic across local and remote consumers.
    pub fn allocate(&self) -> Option<usize> {
        let mut inner = self.lock();
        if inner.next >= self.total {
            return None;
        }
        let index = inner.next;
        inner.next += 1;
        if index % PROGRESS_EVERY == 0 {
            info!(
                event = "work_items_left",
                left = (self.total - index) as u64,
                "work items left"
            );
        }
        Some(index)
    }

    pub fn exhausted(&self) -> bool {
        self.lock().next >= self.total
    }

    fn mark_remote_done(&self, node_id: &str) {
        self.lock().done_nodes.insert(node_id.to_string());
    }

    /// True once every non-master rank has received its end-of-work reply.
    pub fn all_remote_done(&self) -> bool {
        self.lock().done_nodes.len() + 1 >= self.world_size
    }
}

pub struct AllocatorSvc {
    state: Arc<AllocatorState>,
}

/// Wrap the state as a tonic service for `Server::builder().add_service`.
pub fn allocator_service(state: Arc<AllocatorState>) -> AllocatorServer<AllocatorSvc> {
    AllocatorServer::new(AllocatorSvc { state })
}

#[tonic::async_trait]
impl Allocator for AllocatorSvc {
    async fn register_node(
        &self,
        request: Request<RegisterNodeRequest>,
    ) -> Result<Response<RegisterNodeResponse>, Status> {
        let req = request.into_inner();
        validate_register_request(&req).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let accepted = req.total_work_items as usize == self.state.total;
        if !accepted {
            warn!(
                node_id = %req.node_id,
                theirs = req.total_work_items,
                ours = self.state.total as u64,
                "rejecting node: replicated work-item lists disagree"
            );
        }
        Ok(Response::new(RegisterNodeResponse {
            accepted,
            world_size: self.state.world_size as u32,
        }))
    }

    async fn request_work(
        &self,
        request: Request<WorkRequest>,
    ) -> Result<Response<WorkReply>, Status> {
        let req = request.into_inner();
        validate_work_request(&req).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let assignment = match self.state.allocate() {
            Some(index) => WorkAssignment::Item(index),
            None => {
                self.state.mark_remote_done(&req.node_id);
                info!(node_id = %req.node_id, "worker node drained");
                WorkAssignment::Done
            }
        };
        Ok(Response::new(assignment.to_wire()))
    }
}

/// Master feed loop: keep the local backlog topped up, then wait for every
/// remote rank to drain. Remote requests are served concurrently by the
/// gRPC task against the same state.
pub async fn run_master(
    state: Arc<AllocatorState>,
    feeder: NodeFeeder,
    threshold: usize,
) -> anyhow::Result<()> {
    loop {
        if feeder.backlog() < threshold {
            if let Some(index) = state.allocate() {
                feeder.push_item(index)?;
                continue;
            }
        }
        if state.exhausted() {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    while !state.all_remote_done() {
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    info!(event = "allocator_finished", total = state.total() as u64, "allocator finished");
    Ok(())
}

async fn connect_with_retry(master_addr: &str) -> anyhow::Result<AllocatorClient<Channel>> {
    let mut last_err = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match Channel::from_shared(master_addr.to_string())?.connect().await {
            Ok(channel) => return Ok(AllocatorClient::new(channel)),
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(CONNECT_RETRY).await;
            }
        }
    }
    Err(anyhow::anyhow!(
        "could not reach master at {master_addr}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Worker request loop for non-master ranks: register, then pull one index
/// whenever the local backlog runs low, until the end-of-work sentinel.
pub async fn run_worker(
    master_addr: &str,
    node_id: &NodeId,
    total_work_items: usize,
    feeder: NodeFeeder,
    threshold: usize,
) -> anyhow::Result<()> {
    let mut client = connect_with_retry(master_addr).await?;

    let resp = client
        .register_node(RegisterNodeRequest {
            node_id: node_id.0.clone(),
            total_work_items: total_work_items as u64,
        })
        .await?
        .into_inner();
    anyhow::ensure!(
        resp.accepted,
        "master rejected registration: replicated work-item lists disagree"
    );
    info!(
        event = "registered",
        node_id = %node_id,
        world_size = resp.world_size,
        "registered with master"
    );

    loop {
        if feeder.backlog() >= threshold {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }
        let reply = client
            .request_work(WorkRequest {
                node_id: node_id.0.clone(),
            })
            .await?
            .into_inner();
        match WorkAssignment::try_from_wire(&reply)? {
            WorkAssignment::Item(index) => feeder.push_item(index)?,
            WorkAssignment::Done => break,
        }
    }

    info!(event = "worker_drained", node_id = %node_id, "no more work from master");
    Ok(())
}
