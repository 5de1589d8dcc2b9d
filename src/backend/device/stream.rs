//! Device stream: a primary queue, auxiliary queues and scoped capture

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use super::error::{DeviceError, DeviceResult};
use super::event::DeviceEvent;
use super::graph::{ExecutionGraph, GraphNode, NodeKind};
use super::queue::{Command, DeviceOp, FnOp, Queue, StickyError};
use super::Device;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Queue selector within a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    Primary,
    Aux(usize),
}

impl QueueId {
    pub(crate) fn index(self) -> usize {
        match self {
            QueueId::Primary => 0,
            QueueId::Aux(n) => n + 1,
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueId::Primary => write!(f, "primary"),
            QueueId::Aux(n) => write!(f, "aux{}", n),
        }
    }
}

/// Ordered command queues on one device
///
/// Enqueueing never blocks. Work on one queue runs in enqueue order; work on
/// different queues is unordered unless an event wait is inserted.
/// [`DeviceStream::synchronize`] is the only blocking call and returns the
/// first failure of any op run since the stream was created.
pub struct DeviceStream {
    id: u64,
    device: Device,
    queues: Vec<Queue>,
    error: StickyError,
    capture: Mutex<Option<Vec<GraphNode>>>,
}

impl DeviceStream {
    /// Create a stream with only the primary queue
    pub fn new(device: &Device) -> DeviceResult<Self> {
        Self::with_aux_queues(device, 0)
    }

    /// Create a stream with `aux` additional queues
    pub fn with_aux_queues(device: &Device, aux: usize) -> DeviceResult<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let error: StickyError = Arc::new(Mutex::new(None));
        let queues = (0..=aux)
            .map(|index| Queue::spawn(id, index, Arc::clone(&error)))
            .collect::<DeviceResult<Vec<_>>>()?;

        tracing::debug!(
            "DeviceStream {} created on device {} with {} auxiliary queue(s)",
            id,
            device.ordinal(),
            aux
        );

        Ok(DeviceStream {
            id,
            device: device.clone(),
            queues,
            error,
            capture: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn aux_queue_count(&self) -> usize {
        self.queues.len() - 1
    }

    pub fn has_queue(&self, queue: QueueId) -> bool {
        queue.index() < self.queues.len()
    }

    /// Append an op to the primary queue
    pub fn enqueue(&self, op: Arc<dyn DeviceOp>) -> DeviceResult<()> {
        self.enqueue_on(QueueId::Primary, op)
    }

    /// Append an op to the given queue
    pub fn enqueue_on(&self, queue: QueueId, op: Arc<dyn DeviceOp>) -> DeviceResult<()> {
        let target = self.queue(queue)?;
        tracing::trace!("stream {} {}: enqueue '{}'", self.id, queue, op.name());
        self.record_node(queue, NodeKind::Launch(Arc::clone(&op)))?;
        target.submit(Command::Launch(op))
    }

    /// Enqueue a closure as a named op
    pub fn launch<F>(&self, queue: QueueId, name: impl Into<String>, f: F) -> DeviceResult<()>
    where
        F: Fn() -> DeviceResult<()> + Send + Sync + 'static,
    {
        self.enqueue_on(queue, Arc::new(FnOp::new(name, f)))
    }

    /// Mark the current end of `queue`; the event completes when the queue gets there
    pub fn record_event(&self, event: &DeviceEvent, queue: QueueId) -> DeviceResult<()> {
        let target = self.queue(queue)?;
        let generation = event.next_generation();
        self.record_node(queue, NodeKind::Record(event.clone()))?;
        target.submit(Command::Record {
            event: event.clone(),
            generation,
        })
    }

    /// Make `queue` wait for the latest record of `event`
    ///
    /// A wait on an event that was never recorded is a no-op.
    pub fn wait_event(&self, event: &DeviceEvent, queue: QueueId) -> DeviceResult<()> {
        let target = self.queue(queue)?;
        let generation = event.recorded_generation();
        if generation == 0 {
            return Ok(());
        }
        self.record_node(queue, NodeKind::Wait(event.clone()))?;
        target.submit(Command::Wait {
            event: event.clone(),
            generation,
        })
    }

    /// Block until every queue has drained
    pub fn synchronize(&self) -> DeviceResult<()> {
        if self.capture.lock()?.is_some() {
            return Err(DeviceError::CaptureError(
                "synchronize is not allowed while capturing".to_string(),
            ));
        }

        let (ack_tx, ack_rx) = mpsc::channel();
        for queue in &self.queues {
            queue.submit(Command::Fence(ack_tx.clone()))?;
        }
        drop(ack_tx);
        for _ in 0..self.queues.len() {
            ack_rx.recv().map_err(|_| {
                DeviceError::QueueError("queue worker exited before fence".to_string())
            })?;
        }

        match self.error.lock()?.as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// First failure observed by an op, without blocking
    pub fn last_error(&self) -> DeviceResult<Option<DeviceError>> {
        Ok(self.error.lock()?.clone())
    }

    pub fn is_capturing(&self) -> DeviceResult<bool> {
        Ok(self.capture.lock()?.is_some())
    }

    /// Run `f` while recording every command it enqueues
    ///
    /// The commands execute as usual; the recording is returned as an
    /// [`ExecutionGraph`] that [`DeviceStream::launch_graph`] can replay.
    /// Captures do not nest.
    pub fn capture<R, E, F>(&self, f: F) -> Result<(R, ExecutionGraph), E>
    where
        F: FnOnce(&Self) -> Result<R, E>,
        E: From<DeviceError>,
    {
        {
            let mut slot = self.capture.lock().map_err(DeviceError::from)?;
            if slot.is_some() {
                return Err(DeviceError::CaptureError(
                    "stream is already capturing".to_string(),
                )
                .into());
            }
            *slot = Some(Vec::new());
        }
        tracing::debug!("stream {}: capture started", self.id);

        let result = f(self);
        let nodes = self
            .capture
            .lock()
            .map_err(DeviceError::from)?
            .take()
            .unwrap_or_default();

        let value = result?;
        let graph = ExecutionGraph::new(nodes, self.queues.len());
        tracing::debug!(
            "stream {}: captured graph {} ({} ops)",
            self.id,
            graph.id(),
            graph.launch_count()
        );
        Ok((value, graph))
    }

    /// Submit a captured graph as one unit per queue
    pub fn launch_graph(&self, graph: &ExecutionGraph) -> DeviceResult<()> {
        if !graph.is_valid() {
            return Err(DeviceError::CaptureError(format!(
                "graph {} has been invalidated",
                graph.id()
            )));
        }
        if graph.queue_count() > self.queues.len() {
            return Err(DeviceError::CaptureError(format!(
                "graph {} needs {} queues, stream has {}",
                graph.id(),
                graph.queue_count(),
                self.queues.len()
            )));
        }
        if self.capture.lock()?.is_some() {
            return Err(DeviceError::CaptureError(
                "cannot launch a graph while capturing".to_string(),
            ));
        }

        // Generations are assigned in capture order before anything is sent,
        // so a wait sees the replayed record that preceded it.
        let mut fresh: HashMap<u64, u64> = HashMap::new();
        let mut per_queue: Vec<Vec<Command>> = (0..graph.queue_count()).map(|_| Vec::new()).collect();
        for node in graph.nodes() {
            let command = match &node.kind {
                NodeKind::Launch(op) => Command::Launch(Arc::clone(op)),
                NodeKind::Record(event) => {
                    let generation = event.next_generation();
                    fresh.insert(event.id(), generation);
                    Command::Record {
                        event: event.clone(),
                        generation,
                    }
                }
                NodeKind::Wait(event) => {
                    let generation = fresh
                        .get(&event.id())
                        .copied()
                        .unwrap_or_else(|| event.recorded_generation());
                    Command::Wait {
                        event: event.clone(),
                        generation,
                    }
                }
            };
            per_queue[node.queue].push(command);
        }

        tracing::trace!("stream {}: launching graph {}", self.id, graph.id());
        for (index, commands) in per_queue.into_iter().enumerate() {
            if !commands.is_empty() {
                self.queues[index].submit(Command::Batch(commands))?;
            }
        }
        Ok(())
    }

    fn queue(&self, queue: QueueId) -> DeviceResult<&Queue> {
        self.queues.get(queue.index()).ok_or_else(|| {
            DeviceError::QueueError(format!(
                "stream {} has no {} queue ({} auxiliary)",
                self.id,
                queue,
                self.aux_queue_count()
            ))
        })
    }

    fn record_node(&self, queue: QueueId, kind: NodeKind) -> DeviceResult<()> {
        if let Some(nodes) = self.capture.lock()?.as_mut() {
            nodes.push(GraphNode {
                queue: queue.index(),
                kind,
            });
        }
        Ok(())
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        for queue in &mut self.queues {
            queue.shutdown();
        }
        tracing::trace!("DeviceStream {} destroyed", self.id);
    }
}

impl fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStream")
            .field("id", &self.id)
            .field("device", &self.device.ordinal())
            .field("aux_queues", &self.aux_queue_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn stream(aux: usize) -> DeviceStream {
        let device = Device::open(0).unwrap();
        DeviceStream::with_aux_queues(&device, aux).unwrap()
    }

    #[test]
    fn test_same_queue_runs_in_order() {
        let stream = stream(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream
                .launch(QueueId::Primary, "push", move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_event_orders_queues() {
        let stream = stream(1);
        let event = DeviceEvent::new();
        let value = Arc::new(AtomicUsize::new(0));

        let writer = Arc::clone(&value);
        stream
            .launch(QueueId::Primary, "slow_write", move || {
                thread::sleep(Duration::from_millis(20));
                writer.store(42, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        stream.record_event(&event, QueueId::Primary).unwrap();
        stream.wait_event(&event, QueueId::Aux(0)).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let (reader, sink) = (Arc::clone(&value), Arc::clone(&seen));
        stream
            .launch(QueueId::Aux(0), "read", move || {
                sink.store(reader.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        stream.synchronize().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_wait_on_unrecorded_event_is_noop() {
        let stream = stream(1);
        let event = DeviceEvent::new();
        stream.wait_event(&event, QueueId::Aux(0)).unwrap();
        stream.synchronize().unwrap();
    }

    #[test]
    fn test_missing_queue_is_rejected() {
        let stream = stream(0);
        let result = stream.launch(QueueId::Aux(0), "noop", || Ok(()));
        assert!(matches!(result, Err(DeviceError::QueueError(_))));
    }

    #[test]
    fn test_errors_are_sticky() {
        let stream = stream(0);
        stream
            .launch(QueueId::Primary, "bad", || {
                Err(DeviceError::execution("bad", "boom"))
            })
            .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        stream
            .launch(QueueId::Primary, "after", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(stream.synchronize().is_err());
        assert!(stream.synchronize().is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_op_becomes_error() {
        let stream = stream(0);
        stream
            .launch(QueueId::Primary, "panics", || panic!("kernel fault"))
            .unwrap();
        match stream.synchronize() {
            Err(DeviceError::ExecutionFailed { kernel, reason }) => {
                assert_eq!(kernel, "panics");
                assert!(reason.contains("kernel fault"));
            }
            other => panic!("expected execution failure, got {:?}", other),
        }
    }

    #[test]
    fn test_capture_and_replay() {
        let stream = stream(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let event = DeviceEvent::new();

        let ((), graph) = stream
            .capture(|s| -> DeviceResult<()> {
                let c = Arc::clone(&counter);
                s.launch(QueueId::Primary, "inc", move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })?;
                s.record_event(&event, QueueId::Primary)?;
                s.wait_event(&event, QueueId::Aux(0))?;
                let c = Arc::clone(&counter);
                s.launch(QueueId::Aux(0), "double", move || {
                    let v = c.load(Ordering::SeqCst);
                    c.store(v * 2, Ordering::SeqCst);
                    Ok(())
                })
            })
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(graph.launch_count(), 2);
        assert_eq!(graph.op_names(), vec!["inc", "double"]);

        stream.launch_graph(&graph).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_nested_capture_rejected() {
        let stream = stream(0);
        let result = stream.capture(|s| s.capture(|_| Ok::<(), DeviceError>(())).map(|_| ()));
        assert!(matches!(result, Err(DeviceError::CaptureError(_))));
        assert!(!stream.is_capturing().unwrap());
    }

    #[test]
    fn test_synchronize_during_capture_rejected() {
        let stream = stream(0);
        let result = stream.capture(|s| s.synchronize());
        assert!(matches!(result, Err(DeviceError::CaptureError(_))));
    }

    #[test]
    fn test_invalidated_graph_rejected() {
        let stream = stream(0);
        let ((), mut graph) = stream
            .capture(|s| s.launch(QueueId::Primary, "noop", || Ok(())))
            .unwrap();
        graph.invalidate();
        assert!(matches!(
            stream.launch_graph(&graph),
            Err(DeviceError::CaptureError(_))
        ));
    }

    #[test]
    fn test_graph_needing_more_queues_rejected() {
        let wide = stream(1);
        let ((), graph) = wide
            .capture(|s| s.launch(QueueId::Aux(0), "noop", || Ok(())))
            .unwrap();
        let narrow = stream(0);
        assert!(narrow.launch_graph(&graph).is_err());
    }
}
