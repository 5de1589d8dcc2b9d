//! Recorded execution graphs

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::event::DeviceEvent;
use super::queue::DeviceOp;
use super::stream::QueueId;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub(crate) enum NodeKind {
    Launch(Arc<dyn DeviceOp>),
    Record(DeviceEvent),
    Wait(DeviceEvent),
}

#[derive(Clone)]
pub(crate) struct GraphNode {
    pub(crate) queue: usize,
    pub(crate) kind: NodeKind,
}

/// Immutable recording of every command enqueued during one capture
///
/// Launching the graph replays the commands on the same queue layout. Event
/// records inside the graph get fresh generations on every launch, so waits
/// recorded after them keep pointing at the replayed record.
pub struct ExecutionGraph {
    id: u64,
    nodes: Vec<GraphNode>,
    queue_count: usize,
    valid: bool,
}

impl ExecutionGraph {
    pub(crate) fn new(nodes: Vec<GraphNode>, queue_count: usize) -> Self {
        ExecutionGraph {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            nodes,
            queue_count,
            valid: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Number of queues the capturing stream had
    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of kernel/copy ops (excludes event records and waits)
    pub fn launch_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Launch(_)))
            .count()
    }

    /// Names of the recorded ops in capture order
    pub fn op_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Launch(op) => Some(op.name().to_string()),
                _ => None,
            })
            .collect()
    }

    /// Names of the ops recorded on one queue
    pub fn op_names_on(&self, queue: QueueId) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.queue == queue.index())
            .filter_map(|n| match &n.kind {
                NodeKind::Launch(op) => Some(op.name().to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the graph stale; launching it afterwards is an error
    pub fn invalidate(&mut self) {
        if self.valid {
            tracing::debug!("ExecutionGraph {} invalidated", self.id);
        }
        self.valid = false;
    }
}

impl fmt::Debug for ExecutionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGraph")
            .field("id", &self.id)
            .field("nodes", &self.nodes.len())
            .field("launches", &self.launch_count())
            .field("queue_count", &self.queue_count)
            .field("valid", &self.valid)
            .finish()
    }
}
