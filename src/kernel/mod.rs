//! The kernel contract of the engine: every numeric primitive the layer
//! schedules is described here as an op type carrying [`MatrixIr`] operand
//! descriptors. Ops are data; a backend (see [`cpu`]) registers an executor
//! per op type and the stream dispatches to it in enqueue order.

use std::{any::Any, borrow::Cow, sync::Arc};

use derive_more::{Deref, DerefMut, Display};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod cpu;

/// How an op touches one of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Access {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

/// Descriptor of one matrix operand: identity, extents, and access mode.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MatrixIr {
    pub id: usize,
    pub rows: usize,
    pub cols: usize,
    pub access: Access,
}

impl MatrixIr {
    /// Element count.
    #[inline]
    pub fn count(&self) -> usize {
        self.rows * self.cols
    }
}

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A numeric operation schedulable on an execution stream.
pub trait KernelOp: AsAny + std::fmt::Debug + Send + Sync + 'static {
    /// Operand descriptors, inputs before outputs.
    fn io(&self) -> Vec<MatrixIr>;

    fn name(&self) -> Cow<'static, str> {
        std::any::type_name_of_val(self).into()
    }
}

impl dyn KernelOp {
    #[inline]
    pub fn downcast_ref<Op: KernelOp>(&self) -> Option<&Op> {
        self.as_any().downcast_ref()
    }
}

/// Executes a [`KernelOp`] on a concrete backend.
pub trait BackendOp<B>: KernelOp {
    fn execute(&self, backend: &mut B);
}

/// Allocates a buffer on the device, zero-filled or with uploaded contents.
#[derive(Debug, Clone)]
pub struct AllocOp {
    pub buffer: MatrixIr,
    pub contents: Option<Arc<[f32]>>,
}

impl KernelOp for AllocOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.buffer.clone()]
    }
}

/// Uploads host contents into an existing allocation.
#[derive(Debug, Clone)]
pub struct LoadOp {
    pub buffer: MatrixIr,
    pub contents: Arc<[f32]>,
}

impl KernelOp for LoadOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.buffer.clone()]
    }
}

/// Splats a constant over a buffer.
#[derive(Debug, Clone)]
pub struct FillOp {
    pub buffer: MatrixIr,
    pub value: f32,
}

impl KernelOp for FillOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.buffer.clone()]
    }
}

/// Fills a buffer with a uniform random distribution over `[-scale, scale)`.
#[derive(Debug, Clone)]
pub struct FillRandomOp {
    pub buffer: MatrixIr,
    pub scale: f32,
}

impl KernelOp for FillRandomOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.buffer.clone()]
    }
}

/// Device-to-device copy between same-sized buffers.
#[derive(Debug, Clone)]
pub struct CopyOp {
    pub input: MatrixIr,
    pub output: MatrixIr,
}

impl KernelOp for CopyOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.input.clone(), self.output.clone()]
    }
}

/// Raises the stream's fault flag if the buffer holds any non-finite value.
#[derive(Debug, Clone)]
pub struct CheckFiniteOp {
    pub buffer: MatrixIr,
}

impl KernelOp for CheckFiniteOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.buffer.clone()]
    }
}

/// Horizontal concatenation: `output = [a | b]`, row by row.
#[derive(Debug, Clone)]
pub struct ConcatOp {
    pub a: MatrixIr,
    pub b: MatrixIr,
    pub output: MatrixIr,
}

impl KernelOp for ConcatOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.a.clone(), self.b.clone(), self.output.clone()]
    }
}

/// Horizontal split, the inverse of [`ConcatOp`]: `[a | b] = input`.
#[derive(Debug, Clone)]
pub struct SplitOp {
    pub input: MatrixIr,
    pub a: MatrixIr,
    pub b: MatrixIr,
}

impl KernelOp for SplitOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.input.clone(), self.a.clone(), self.b.clone()]
    }
}

/// `output[b][m] = Σ_k weight[m][k] · input[b][k]` — the gate projection
/// form: every batch row of `input` against every row of `weight`.
#[derive(Debug, Clone)]
pub struct MatMulOp {
    pub weight: MatrixIr,
    pub input: MatrixIr,
    pub output: MatrixIr,
}

impl KernelOp for MatMulOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.weight.clone(), self.input.clone(), self.output.clone()]
    }
}

/// `output[m][k] = Σ_b signal[b][m] · input[b][k]` — the weight-space
/// gradient form, contracting over the batch dimension.
#[derive(Debug, Clone)]
pub struct MatMulTransposeOp {
    pub signal: MatrixIr,
    pub input: MatrixIr,
    pub output: MatrixIr,
}

impl KernelOp for MatMulTransposeOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.signal.clone(), self.input.clone(), self.output.clone()]
    }
}

/// `accum[b][k] += Σ_m signal[b][m] · weight[m][k]` — the input-space
/// gradient form, accumulating into `accum`.
#[derive(Debug, Clone)]
pub struct MatMulAccumulateOp {
    pub signal: MatrixIr,
    pub weight: MatrixIr,
    pub accum: MatrixIr,
}

impl KernelOp for MatMulAccumulateOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.signal.clone(), self.weight.clone(), self.accum.clone()]
    }
}

/// In-place transformation of a single buffer.
#[derive(Debug, Clone)]
pub struct UnaryOp {
    pub buffer: MatrixIr,
}

#[derive(Debug, Clone, Deref, DerefMut)]
pub struct SigmoidOp(pub UnaryOp);

impl KernelOp for SigmoidOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.buffer.clone()]
    }
}

#[derive(Debug, Clone, Deref, DerefMut)]
pub struct TanhOp(pub UnaryOp);

impl KernelOp for TanhOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.buffer.clone()]
    }
}

/// `output = gradient ⊙ (1 − activated²)` — the tanh derivative applied to
/// an upstream gradient, taking the already-activated value.
#[derive(Debug, Clone)]
pub struct TanhBackwardOp {
    pub gradient: MatrixIr,
    pub activated: MatrixIr,
    pub output: MatrixIr,
}

impl KernelOp for TanhBackwardOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![
            self.gradient.clone(),
            self.activated.clone(),
            self.output.clone(),
        ]
    }
}

/// Element-wise combination of two buffers into a third.
#[derive(Debug, Clone)]
pub struct BinaryOp {
    pub inputs: [MatrixIr; 2],
    pub output: MatrixIr,
}

impl BinaryOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![
            self.inputs[0].clone(),
            self.inputs[1].clone(),
            self.output.clone(),
        ]
    }
}

/// `output = a ⊙ b`.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct MulOp(pub BinaryOp);

impl KernelOp for MulOp {
    fn io(&self) -> Vec<MatrixIr> {
        self.0.io()
    }
}

/// `output += a ⊙ b`.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct MulAddOp(pub BinaryOp);

impl KernelOp for MulAddOp {
    fn io(&self) -> Vec<MatrixIr> {
        self.0.io()
    }
}

/// One plain gradient-descent step: `weight -= rate · gradient`, elementwise.
#[derive(Debug, Clone)]
pub struct GradientStepOp {
    pub weight: MatrixIr,
    pub gradient: MatrixIr,
    pub rate: f32,
}

impl KernelOp for GradientStepOp {
    fn io(&self) -> Vec<MatrixIr> {
        vec![self.gradient.clone(), self.weight.clone()]
    }
}
