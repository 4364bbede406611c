use std::{
    any::TypeId,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use rustc_hash::FxHashMap as HashMap;

use super::{Backend as _, OpVTable, Stream, StreamError, StreamEvent};
use crate::kernel::{
    AllocOp, BackendOp, CheckFiniteOp, ConcatOp, CopyOp, FillOp, FillRandomOp, GradientStepOp,
    KernelOp, LoadOp, MatMulAccumulateOp, MatMulOp, MatMulTransposeOp, MatrixIr, MulAddOp, MulOp,
    SigmoidOp, SplitOp, TanhBackwardOp, TanhOp,
};

pub type CpuBuffer = Arc<RwLock<Box<[f32]>>>;

#[derive(Debug, Clone)]
pub struct Backend {
    /// Operators that the stream is able to execute.
    ops: Arc<OpVTable<Self>>,
    /// Pool of device-resident buffers.
    buffers: HashMap<usize, CpuBuffer>,
    /// Source for random fills.
    rng: fastrand::Rng,
    /// Raised by finite checks; shared with the stream handle.
    fault: Arc<AtomicBool>,
}

impl Backend {
    /// Fetch the resident buffer behind an operand descriptor.
    pub fn buffer(&self, ir: &MatrixIr) -> CpuBuffer {
        self.fetch(ir.id).expect("matrix not resident on the device")
    }

    #[inline]
    pub fn rng(&mut self) -> &mut fastrand::Rng {
        &mut self.rng
    }

    /// Flag a numeric fault; observable through [`Stream::faulted`].
    #[inline]
    pub fn raise_fault(&self) {
        self.fault.store(true, Ordering::Relaxed);
    }
}

impl super::Backend for Backend {
    type Buffer = CpuBuffer;

    #[inline]
    fn execute(&mut self, op: &dyn KernelOp) {
        let id = op.as_any().type_id();
        match self.ops.get(&id).copied() {
            Some(f) => f(self, op),
            None => log::error!("unable to execute op of type {}", op.name()),
        }
    }

    #[inline]
    fn alloc(&mut self, id: usize, count: usize) -> Self::Buffer {
        let buffer: CpuBuffer = Arc::new(RwLock::new(vec![0.0; count].into_boxed_slice()));
        self.buffers.insert(id, buffer.clone());
        buffer
    }

    #[inline]
    fn fetch(&self, id: usize) -> Option<Self::Buffer> {
        self.buffers.get(&id).cloned()
    }

    #[inline]
    fn free(&mut self, id: usize) {
        self.buffers.remove(&id);
    }
}

#[derive(Debug, Default, Clone)]
pub struct CpuBuilder {
    pub ops: OpVTable<Backend>,
    pub seed: Option<u64>,
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default().add_op::<AllocOp>()
    }

    /// Registers every op of the kernel contract.
    pub fn add_default_ops(self) -> Self {
        self.add_op::<LoadOp>()
            .add_op::<FillOp>()
            .add_op::<FillRandomOp>()
            .add_op::<CopyOp>()
            .add_op::<CheckFiniteOp>()
            .add_op::<ConcatOp>()
            .add_op::<SplitOp>()
            .add_op::<MatMulOp>()
            .add_op::<MatMulTransposeOp>()
            .add_op::<MatMulAccumulateOp>()
            .add_op::<SigmoidOp>()
            .add_op::<TanhOp>()
            .add_op::<TanhBackwardOp>()
            .add_op::<MulOp>()
            .add_op::<MulAddOp>()
            .add_op::<GradientStepOp>()
    }

    pub fn add_op<Op: BackendOp<Backend>>(mut self) -> Self {
        let id = TypeId::of::<Op>();
        let f = |backend: &mut Backend, op: &dyn KernelOp| match op.downcast_ref::<Op>() {
            Some(op) => op.execute(backend),
            None => unreachable!(),
        };
        self.ops.insert(id, f);
        self
    }

    /// Seeds the backend's random source for reproducible weight fills.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub async fn build(self) -> Stream {
        let ops = Arc::new(self.ops);
        let buffers = HashMap::default();
        let rng = match self.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let fault = Arc::new(AtomicBool::new(false));

        let (sender, receiver) = flume::unbounded();
        let backend = Backend {
            ops,
            buffers,
            rng,
            fault: fault.clone(),
        };
        tokio::spawn(serve(backend, receiver));

        Stream::new(sender, fault)
    }
}

async fn serve(mut backend: Backend, receiver: flume::Receiver<StreamEvent>) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            StreamEvent::Launch(op) => backend.execute(op.as_ref()),
            StreamEvent::Back { id, sender } => {
                let data = backend
                    .fetch(id)
                    .map(|buffer| buffer.read().expect("failed to lock").clone())
                    .ok_or(StreamError::Matrix(id));
                _ = sender.send_async(data).await;
            }
            StreamEvent::Sync { sender } => _ = sender.send_async(()).await,
            StreamEvent::Release(id) => backend.free(id),
        }
    }
}
