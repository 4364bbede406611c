//! The execution stream: a first-class, ordered, asynchronous operation
//! queue. Every engine method only *enqueues* work here; a backend task
//! drains the queue and executes ops strictly in enqueue order, which is
//! what makes a fixed sequence of dependent kernel launches safe without
//! per-step synchronization.

use std::{
    any::TypeId,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::kernel::KernelOp;

pub mod cpu;

pub use cpu::CpuBuilder;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("execution stream is closed")]
    Closed,
    #[error("matrix {0} is not resident on the device")]
    Matrix(usize),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId;

/// Events a stream's backend task serves, strictly in receive order.
pub enum StreamEvent {
    /// Execute one kernel op after everything enqueued before it.
    Launch(Box<dyn KernelOp>),
    /// Read a matrix's contents back to the host.
    Back {
        id: usize,
        sender: flume::Sender<Result<Box<[f32]>, StreamError>>,
    },
    /// Rendezvous once every event enqueued before it has been served.
    Sync { sender: flume::Sender<()> },
    /// Release a matrix's device storage.
    Release(usize),
}

/// Storage and dispatch surface a backend offers to its kernel executors.
pub trait Backend {
    type Buffer;

    /// Execute a single op, dispatching through the registered vtable.
    fn execute(&mut self, op: &dyn KernelOp);

    /// Allocate zero-filled storage for `count` elements under `id`.
    fn alloc(&mut self, id: usize, count: usize) -> Self::Buffer;

    fn fetch(&self, id: usize) -> Option<Self::Buffer>;

    fn free(&mut self, id: usize);
}

/// Executors a backend is able to run, keyed by the op's concrete type.
pub type OpVTable<B> = HashMap<TypeId, fn(&mut B, &dyn KernelOp)>;

/// Handle to one ordered asynchronous execution queue.
///
/// Cloning the handle shares the queue; all clones enqueue onto the same
/// backend task. The backend drains whatever is still pending when the last
/// handle drops, then exits.
#[derive(Debug, Clone)]
pub struct Stream {
    /// The unique identifier of the stream.
    id: uid::Id<StreamId>,
    /// Sends events to serve to the backend.
    sender: flume::Sender<StreamEvent>,
    /// Raised by finite checks executed on the backend.
    fault: Arc<AtomicBool>,
}

impl Stream {
    pub(crate) fn new(sender: flume::Sender<StreamEvent>, fault: Arc<AtomicBool>) -> Self {
        let id = uid::Id::new();
        Self { id, sender, fault }
    }

    #[inline]
    pub fn id(&self) -> uid::Id<StreamId> {
        self.id
    }

    /// Enqueue a kernel op. Non-blocking; execution is asynchronous.
    #[inline]
    pub fn launch(&self, op: impl KernelOp) {
        _ = self.sender.send(StreamEvent::Launch(Box::new(op)));
    }

    #[inline]
    pub(crate) fn send(&self, event: StreamEvent) {
        _ = self.sender.send(event);
    }

    /// Wait until every op enqueued so far has executed.
    pub async fn sync(&self) -> Result<(), StreamError> {
        let (sender, receiver) = flume::bounded(0);
        self.send(StreamEvent::Sync { sender });
        receiver.recv_async().await.map_err(|_| StreamError::Closed)
    }

    /// Whether a finite check has tripped on this stream.
    #[inline]
    pub fn faulted(&self) -> bool {
        self.fault.load(Ordering::Relaxed)
    }
}
