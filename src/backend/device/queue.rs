//! Ordered command queues backed by worker threads

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::error::{DeviceError, DeviceResult};
use super::event::DeviceEvent;

/// A unit of device work
///
/// Ops must be re-runnable: a captured graph launches the same op object on
/// every replay.
pub trait DeviceOp: Send + Sync {
    fn name(&self) -> &str;
    fn launch(&self) -> DeviceResult<()>;
}

/// Closure-backed op used by [`super::DeviceStream::launch`]
pub(crate) struct FnOp<F> {
    name: String,
    f: F,
}

impl<F> FnOp<F>
where
    F: Fn() -> DeviceResult<()> + Send + Sync,
{
    pub(crate) fn new(name: impl Into<String>, f: F) -> Self {
        FnOp {
            name: name.into(),
            f,
        }
    }
}

impl<F> DeviceOp for FnOp<F>
where
    F: Fn() -> DeviceResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self) -> DeviceResult<()> {
        (self.f)()
    }
}

pub(crate) enum Command {
    Launch(Arc<dyn DeviceOp>),
    Record { event: DeviceEvent, generation: u64 },
    Wait { event: DeviceEvent, generation: u64 },
    /// Graph replay: a pre-resolved run of commands delivered as one message
    Batch(Vec<Command>),
    Fence(Sender<()>),
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Launch(op) => write!(f, "Launch({})", op.name()),
            Command::Record { event, generation } => {
                write!(f, "Record(event={}, gen={})", event.id(), generation)
            }
            Command::Wait { event, generation } => {
                write!(f, "Wait(event={}, gen={})", event.id(), generation)
            }
            Command::Batch(cmds) => write!(f, "Batch({})", cmds.len()),
            Command::Fence(_) => write!(f, "Fence"),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// First failure observed by any queue of a stream
pub(crate) type StickyError = Arc<Mutex<Option<DeviceError>>>;

pub(crate) struct Queue {
    index: usize,
    sender: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl Queue {
    pub(crate) fn spawn(stream_id: u64, index: usize, error: StickyError) -> DeviceResult<Self> {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(format!("mlpforge-queue-{}-{}", stream_id, index))
            .spawn(move || run_worker(receiver, error))
            .map_err(|e| {
                DeviceError::InitializationFailed(format!("failed to spawn queue worker: {}", e))
            })?;

        Ok(Queue {
            index,
            sender,
            worker: Some(worker),
        })
    }

    pub(crate) fn submit(&self, command: Command) -> DeviceResult<()> {
        self.sender.send(command).map_err(|_| {
            DeviceError::QueueError(format!("queue {} worker has stopped", self.index))
        })
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Queue {} worker panicked during shutdown", self.index);
            }
        }
    }
}

fn run_worker(receiver: Receiver<Command>, error: StickyError) {
    while let Ok(command) = receiver.recv() {
        if !execute(command, &error) {
            break;
        }
    }
}

/// Returns false on shutdown
fn execute(command: Command, error: &StickyError) -> bool {
    match command {
        Command::Launch(op) => {
            if has_failed(error) {
                tracing::trace!("Skipping '{}' after an earlier device failure", op.name());
                return true;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| op.launch()))
                .unwrap_or_else(|payload| {
                    Err(DeviceError::execution(op.name(), panic_message(payload)))
                });
            if let Err(e) = result {
                tracing::debug!("Op '{}' failed: {}", op.name(), e);
                set_error(error, e);
            }
        }
        // Records and waits still run after a failure so no queue blocks forever.
        Command::Record { event, generation } => {
            if let Err(e) = event.complete(generation) {
                set_error(error, e);
            }
        }
        Command::Wait { event, generation } => {
            if let Err(e) = event.wait_for(generation) {
                set_error(error, e);
            }
        }
        Command::Batch(commands) => {
            for command in commands {
                if !execute(command, error) {
                    return false;
                }
            }
        }
        Command::Fence(ack) => {
            let _ = ack.send(());
        }
        Command::Shutdown => return false,
    }
    true
}

fn has_failed(error: &StickyError) -> bool {
    match error.lock() {
        Ok(guard) => guard.is_some(),
        Err(_) => true,
    }
}

fn set_error(error: &StickyError, err: DeviceError) {
    if let Ok(mut guard) = error.lock() {
        if guard.is_none() {
            *guard = Some(err);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
