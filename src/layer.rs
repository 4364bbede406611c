//! The layer engine: weights, recurrent state, the per-step workspace, and
//! the `forward`/`backward`/`update_weights`/`reset_state` surface. Every
//! method only enqueues kernels on the layer's stream and returns; results
//! become observable once the stream drains (see [`Matrix::back`] and
//! [`LstmLayer::sync`]).

use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    kernel::{
        Access, BinaryOp, CheckFiniteOp, ConcatOp, FillOp, FillRandomOp, GradientStepOp,
        MatMulAccumulateOp, MatMulOp, MatMulTransposeOp, MulAddOp, MulOp, SigmoidOp, SplitOp,
        TanhBackwardOp, TanhOp, UnaryOp,
    },
    matrix::{Matrix, MatrixError},
    stream::{CpuBuilder, Stream, StreamError},
};

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("configuration error: {0} must be positive")]
    Config(&'static str),
    #[error("shape mismatch: expected {0:?}, found {1:?}")]
    Shape((usize, usize), (usize, usize)),
    #[error("matrix is resident on a foreign stream")]
    ForeignStream,
    #[error("backward requires the activations of a preceding forward")]
    MissingForward,
    #[error("update_weights requires the gradients of a preceding backward")]
    MissingGradients,
    #[error("non-finite values detected on the stream")]
    NumericInstability,
    #[error("matrix error: {0}")]
    Matrix(#[from] MatrixError),
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Fixed-at-construction dimensional and hyperparameter record.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LstmConfig {
    /// Feature width of one input timestep.
    pub input_width: usize,
    /// Width of the cell and hidden state.
    pub hidden_width: usize,
    /// Informational at this level; stacking happens outside the engine.
    pub layer_count: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Enqueue finite checks after `forward`/`backward`; see [`LstmLayer::sync`].
    pub detect_instability: bool,
}

impl LstmConfig {
    /// Width of the combined input: one timestep's features plus the
    /// previous hidden state.
    #[inline]
    pub fn combined_width(&self) -> usize {
        self.input_width + self.hidden_width
    }

    fn check(&self) -> Result<(), LayerError> {
        for (name, value) in [
            ("input_width", self.input_width),
            ("hidden_width", self.hidden_width),
            ("layer_count", self.layer_count),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(LayerError::Config(name));
            }
        }
        match self.learning_rate > 0.0 {
            true => Ok(()),
            false => Err(LayerError::Config("learning_rate")),
        }
    }
}

/// One of the four learned sub-transformations of the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Gate {
    Forget,
    Input,
    Cell,
    Output,
}

impl Gate {
    pub const ALL: [Gate; 4] = [Gate::Forget, Gate::Input, Gate::Cell, Gate::Output];
}

/// Four per-gate matrices of one shape, indexed by [`Gate`].
#[derive(Debug)]
pub struct GateSet([Matrix; 4]);

impl GateSet {
    fn zeros(stream: &Stream, rows: usize, cols: usize) -> Self {
        Self(std::array::from_fn(|_| Matrix::zeros(stream, rows, cols)))
    }

    #[inline]
    pub fn gate(&self, gate: Gate) -> &Matrix {
        &self.0[gate as usize]
    }
}

/// Double-buffered recurrent state: two same-shaped slots and a current
/// index. `flip` realizes the recurrence hand-off at O(1) cost; after a
/// flip the scratch slot still holds the previous step's values, which is
/// exactly the snapshot `backward` reads as the old cell state.
#[derive(Debug)]
pub struct StateBuffer {
    slots: [Matrix; 2],
    current: usize,
}

impl StateBuffer {
    fn zeros(stream: &Stream, rows: usize, cols: usize) -> Self {
        let slots = [
            Matrix::zeros(stream, rows, cols),
            Matrix::zeros(stream, rows, cols),
        ];
        Self { slots, current: 0 }
    }

    /// The logically valid state.
    #[inline]
    pub fn current(&self) -> &Matrix {
        &self.slots[self.current]
    }

    /// The slot the next step writes into.
    #[inline]
    pub fn scratch(&self) -> &Matrix {
        &self.slots[self.current ^ 1]
    }

    #[inline]
    fn flip(&mut self) {
        self.current ^= 1;
    }
}

/// Intermediate and gradient buffers of one forward/backward cycle,
/// overwritten every call.
#[derive(Debug)]
struct Workspace {
    /// `[input | hidden]`, the common operand of all four gate projections.
    combined: Matrix,
    /// Post-activation gate outputs; `backward` consumes them as the
    /// snapshot of the most recent `forward`.
    gates: GateSet,
    /// Tanh of the freshly written cell state. Kept apart from the raw cell
    /// state so the next step's recurrence reads unactivated values.
    cell_tanh: Matrix,
    d_hidden: Matrix,
    /// Gate-local error signals; the `Cell` slot is also the cell-state
    /// gradient the candidate projection backpropagates.
    d_gates: GateSet,
    d_combined: Matrix,
    /// Hidden slice of the combined gradient, kept for a BPTT driver.
    d_hidden_prev: Matrix,
}

/// A single gated recurrent (LSTM) layer driven entirely by asynchronous
/// kernel launches on one execution stream.
///
/// All buffers are exclusively owned by the layer; two layer instances never
/// share a stream, so driving them from different tasks is safe by
/// construction.
#[derive(Debug)]
pub struct LstmLayer {
    config: LstmConfig,
    stream: Stream,
    weights: GateSet,
    gradients: GateSet,
    cell: StateBuffer,
    hidden: StateBuffer,
    workspace: Workspace,
    seen_forward: bool,
    seen_backward: bool,
}

impl LstmLayer {
    /// Build a layer on a fresh CPU-backed stream and schedule its
    /// asynchronous initialization: state zero-fills and the Xavier-scaled
    /// random weight fills. Initialization is complete once the stream
    /// drains.
    pub async fn new(config: LstmConfig) -> Result<Self, LayerError> {
        config.check()?;
        let stream = CpuBuilder::new().add_default_ops().build().await;
        Self::with_stream(config, stream)
    }

    /// Like [`new`](Self::new), but on a caller-built stream (e.g. a seeded
    /// one). The stream must have the full kernel contract registered.
    pub fn with_stream(config: LstmConfig, stream: Stream) -> Result<Self, LayerError> {
        config.check()?;

        let [batch, hidden_width, combined_width] = [
            config.batch_size,
            config.hidden_width,
            config.combined_width(),
        ];

        let weights = GateSet::zeros(&stream, hidden_width, combined_width);
        let gradients = GateSet::zeros(&stream, hidden_width, combined_width);
        let cell = StateBuffer::zeros(&stream, batch, hidden_width);
        let hidden = StateBuffer::zeros(&stream, batch, hidden_width);
        let workspace = Workspace {
            combined: Matrix::zeros(&stream, batch, combined_width),
            gates: GateSet::zeros(&stream, batch, hidden_width),
            cell_tanh: Matrix::zeros(&stream, batch, hidden_width),
            d_hidden: Matrix::zeros(&stream, batch, hidden_width),
            d_gates: GateSet::zeros(&stream, batch, hidden_width),
            d_combined: Matrix::zeros(&stream, batch, combined_width),
            d_hidden_prev: Matrix::zeros(&stream, batch, hidden_width),
        };

        // xavier scale over the combined fan-in
        let scale = (2.0 / combined_width as f32).sqrt();
        for gate in Gate::ALL {
            stream.launch(FillRandomOp {
                buffer: weights.gate(gate).ir(Access::WriteOnly),
                scale,
            });
        }

        Ok(Self {
            config,
            stream,
            weights,
            gradients,
            cell,
            hidden,
            workspace,
            seen_forward: false,
            seen_backward: false,
        })
    }

    fn check_io(&self, matrix: &Matrix, shape: (usize, usize)) -> Result<(), LayerError> {
        if matrix.stream().id() != self.stream.id() {
            return Err(LayerError::ForeignStream);
        }
        match matrix.shape() == shape {
            true => Ok(()),
            false => Err(LayerError::Shape(shape, matrix.shape())),
        }
    }

    /// Advance the recurrence by one timestep.
    ///
    /// `input` is `batch × input_width`; `output` is `batch × hidden_width`,
    /// caller-allocated on this layer's stream, and holds the new hidden
    /// state once the stream drains. The call itself never blocks.
    pub fn forward(&mut self, input: &Matrix, output: &Matrix) -> Result<(), LayerError> {
        let config = &self.config;
        self.check_io(input, (config.batch_size, config.input_width))?;
        self.check_io(output, (config.batch_size, config.hidden_width))?;

        let stream = &self.stream;
        let combined = &self.workspace.combined;

        // combined = [input | hidden]
        stream.launch(ConcatOp {
            a: input.ir(Access::ReadOnly),
            b: self.hidden.current().ir(Access::ReadOnly),
            output: combined.ir(Access::WriteOnly),
        });

        // the four gate projections and their nonlinearities
        for gate in Gate::ALL {
            let buffer = self.workspace.gates.gate(gate);
            stream.launch(MatMulOp {
                weight: self.weights.gate(gate).ir(Access::ReadOnly),
                input: combined.ir(Access::ReadOnly),
                output: buffer.ir(Access::WriteOnly),
            });
            let buffer = buffer.ir(Access::ReadWrite);
            match gate {
                Gate::Cell => stream.launch(TanhOp(UnaryOp { buffer })),
                _ => stream.launch(SigmoidOp(UnaryOp { buffer })),
            }
        }

        // new cell = forget ⊙ cell + input ⊙ candidate
        stream.launch(MulOp(BinaryOp {
            inputs: [
                self.workspace.gates.gate(Gate::Forget).ir(Access::ReadOnly),
                self.cell.current().ir(Access::ReadOnly),
            ],
            output: self.cell.scratch().ir(Access::WriteOnly),
        }));
        stream.launch(MulAddOp(BinaryOp {
            inputs: [
                self.workspace.gates.gate(Gate::Input).ir(Access::ReadOnly),
                self.workspace.gates.gate(Gate::Cell).ir(Access::ReadOnly),
            ],
            output: self.cell.scratch().ir(Access::ReadWrite),
        }));

        // activate a snapshot, keeping the raw cell state for the recurrence
        self.cell.scratch().copy_into(&self.workspace.cell_tanh);
        stream.launch(TanhOp(UnaryOp {
            buffer: self.workspace.cell_tanh.ir(Access::ReadWrite),
        }));

        // new hidden = output gate ⊙ tanh(new cell)
        stream.launch(MulOp(BinaryOp {
            inputs: [
                self.workspace.gates.gate(Gate::Output).ir(Access::ReadOnly),
                self.workspace.cell_tanh.ir(Access::ReadOnly),
            ],
            output: self.hidden.scratch().ir(Access::WriteOnly),
        }));
        self.hidden.scratch().copy_into(output);

        // O(1) hand-off: the freshly written slots become current
        self.cell.flip();
        self.hidden.flip();

        if config.detect_instability {
            stream.launch(CheckFiniteOp {
                buffer: self.hidden.current().ir(Access::ReadOnly),
            });
        }

        self.seen_forward = true;
        Ok(())
    }

    /// Backpropagate through the most recent `forward` step.
    ///
    /// `gradient` is the loss gradient with respect to that step's output
    /// (`batch × hidden_width`); `input_gradient` is caller-allocated
    /// (`batch × input_width`) and receives the slice to hand to the
    /// preceding layer. Weight-space gradients land in the layer's gradient
    /// buffers; the live weights are never touched here — apply them with
    /// [`update_weights`](Self::update_weights).
    pub fn backward(&mut self, gradient: &Matrix, input_gradient: &Matrix) -> Result<(), LayerError> {
        if !self.seen_forward {
            return Err(LayerError::MissingForward);
        }
        let config = &self.config;
        self.check_io(gradient, (config.batch_size, config.hidden_width))?;
        self.check_io(input_gradient, (config.batch_size, config.input_width))?;

        let stream = &self.stream;
        let ws = &self.workspace;

        // d_hidden = gradient ⊙ output gate
        stream.launch(MulOp(BinaryOp {
            inputs: [
                gradient.ir(Access::ReadOnly),
                ws.gates.gate(Gate::Output).ir(Access::ReadOnly),
            ],
            output: ws.d_hidden.ir(Access::WriteOnly),
        }));

        // d_cell = d_hidden through the cell nonlinearity
        stream.launch(TanhBackwardOp {
            gradient: ws.d_hidden.ir(Access::ReadOnly),
            activated: ws.cell_tanh.ir(Access::ReadOnly),
            output: ws.d_gates.gate(Gate::Cell).ir(Access::WriteOnly),
        });

        // remaining gate-local error signals
        stream.launch(MulOp(BinaryOp {
            inputs: [
                ws.d_gates.gate(Gate::Cell).ir(Access::ReadOnly),
                ws.gates.gate(Gate::Cell).ir(Access::ReadOnly),
            ],
            output: ws.d_gates.gate(Gate::Input).ir(Access::WriteOnly),
        }));
        stream.launch(MulOp(BinaryOp {
            inputs: [
                ws.d_gates.gate(Gate::Cell).ir(Access::ReadOnly),
                self.cell.scratch().ir(Access::ReadOnly),
            ],
            output: ws.d_gates.gate(Gate::Forget).ir(Access::WriteOnly),
        }));
        stream.launch(MulOp(BinaryOp {
            inputs: [
                ws.d_hidden.ir(Access::ReadOnly),
                ws.cell_tanh.ir(Access::ReadOnly),
            ],
            output: ws.d_gates.gate(Gate::Output).ir(Access::WriteOnly),
        }));

        // weight-space gradients, plus the gradient flowing back into the
        // combined input
        stream.launch(FillOp {
            buffer: ws.d_combined.ir(Access::WriteOnly),
            value: 0.0,
        });
        for gate in Gate::ALL {
            let signal = ws.d_gates.gate(gate);
            stream.launch(MatMulTransposeOp {
                signal: signal.ir(Access::ReadOnly),
                input: ws.combined.ir(Access::ReadOnly),
                output: self.gradients.gate(gate).ir(Access::WriteOnly),
            });
            stream.launch(MatMulAccumulateOp {
                signal: signal.ir(Access::ReadOnly),
                weight: self.weights.gate(gate).ir(Access::ReadOnly),
                accum: ws.d_combined.ir(Access::ReadWrite),
            });
        }

        // input slice to the caller, hidden slice kept for a BPTT driver
        stream.launch(SplitOp {
            input: ws.d_combined.ir(Access::ReadOnly),
            a: input_gradient.ir(Access::WriteOnly),
            b: ws.d_hidden_prev.ir(Access::WriteOnly),
        });

        if config.detect_instability {
            stream.launch(CheckFiniteOp {
                buffer: input_gradient.ir(Access::ReadOnly),
            });
        }

        self.seen_backward = true;
        Ok(())
    }

    /// Apply one plain SGD step to every gate weight matrix:
    /// `weight -= learning_rate × gradient`.
    pub fn update_weights(&mut self) -> Result<(), LayerError> {
        if !self.seen_backward {
            return Err(LayerError::MissingGradients);
        }
        for gate in Gate::ALL {
            self.stream.launch(GradientStepOp {
                weight: self.weights.gate(gate).ir(Access::ReadWrite),
                gradient: self.gradients.gate(gate).ir(Access::ReadOnly),
                rate: self.config.learning_rate,
            });
        }
        Ok(())
    }

    /// Zero the recurrent state to start an independent sequence. Weights
    /// are untouched. The forward snapshot is invalidated: a `backward`
    /// between a reset and the next `forward` would mix fresh state with
    /// stale activations, so it is refused.
    pub fn reset_state(&mut self) {
        for slot in [
            self.cell.current(),
            self.cell.scratch(),
            self.hidden.current(),
            self.hidden.scratch(),
        ] {
            self.stream.launch(FillOp {
                buffer: slot.ir(Access::WriteOnly),
                value: 0.0,
            });
        }
        self.seen_forward = false;
    }

    /// Drain the stream, then report whether the instability watchdog
    /// tripped on anything executed so far.
    pub async fn sync(&self) -> Result<(), LayerError> {
        self.stream.sync().await?;
        match self.stream.faulted() {
            true => Err(LayerError::NumericInstability),
            false => Ok(()),
        }
    }

    /// Upload fixed contents into one gate's weight matrix, replacing the
    /// random initialization.
    pub fn load_weights<C>(&self, gate: Gate, contents: C) -> Result<(), LayerError>
    where
        C: Into<Arc<[f32]>>,
    {
        Ok(self.weights.gate(gate).load(contents)?)
    }

    #[inline]
    pub fn config(&self) -> &LstmConfig {
        &self.config
    }

    /// The layer's execution stream; caller-side matrices must be created
    /// on it.
    #[inline]
    pub fn stream(&self) -> Stream {
        self.stream.clone()
    }

    #[inline]
    pub fn cell(&self) -> &Matrix {
        self.cell.current()
    }

    #[inline]
    pub fn hidden(&self) -> &Matrix {
        self.hidden.current()
    }

    #[inline]
    pub fn weights(&self, gate: Gate) -> &Matrix {
        self.weights.gate(gate)
    }

    #[inline]
    pub fn gradients(&self, gate: Gate) -> &Matrix {
        self.gradients.gate(gate)
    }

    /// Hidden-state slice of the last `backward`'s combined gradient. This
    /// engine propagates through one step only; a multi-step BPTT driver
    /// accumulates this into the previous timestep's output gradient.
    #[inline]
    pub fn hidden_gradient(&self) -> &Matrix {
        &self.workspace.d_hidden_prev
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Gate, LayerError, LstmConfig, LstmLayer};
    use crate::{matrix::Matrix, stream::CpuBuilder};

    macro_rules! assert_approx_eq {
        ($i:expr, $a:expr, $b:expr, $eps:expr) => {
            assert!(
                ($a - $b).abs() < $eps,
                "assertion failed at {}: `(left ~= right)`\n  left: `{}`\n right: `{}`",
                $i,
                $a,
                $b
            );
        };
    }

    fn config(input_width: usize, hidden_width: usize, batch_size: usize) -> LstmConfig {
        LstmConfig {
            input_width,
            hidden_width,
            layer_count: 1,
            batch_size,
            learning_rate: 0.001,
            detect_instability: false,
        }
    }

    fn sigmoid(x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    /// Host-side mirror of the layer, evaluating the closed-form recurrence
    /// and its one-step gradients.
    struct Reference {
        config: LstmConfig,
        /// Row-major `hidden × combined` weights in [`Gate::ALL`] order.
        weights: [Vec<f32>; 4],
    }

    /// Everything one forward step leaves behind.
    struct Snapshot {
        combined: Vec<f32>,
        gates: [Vec<f32>; 4],
        cell_prev: Vec<f32>,
        cell: Vec<f32>,
        cell_tanh: Vec<f32>,
        hidden: Vec<f32>,
    }

    impl Reference {
        fn step(&self, x: &[f32], h: &[f32], c: &[f32]) -> Snapshot {
            let (iw, hw) = (self.config.input_width, self.config.hidden_width);
            let (batch, cw) = (self.config.batch_size, iw + hw);

            let mut combined = vec![0.0; batch * cw];
            for b in 0..batch {
                combined[b * cw..b * cw + iw].copy_from_slice(&x[b * iw..(b + 1) * iw]);
                combined[b * cw + iw..(b + 1) * cw].copy_from_slice(&h[b * hw..(b + 1) * hw]);
            }

            let mut gates = std::array::from_fn::<_, 4, _>(|_| vec![0.0; batch * hw]);
            for (g, weights) in gates.iter_mut().zip_eq(self.weights.iter()) {
                for (b, j) in itertools::iproduct!(0..batch, 0..hw) {
                    g[b * hw + j] = (0..cw)
                        .map(|k| weights[j * cw + k] * combined[b * cw + k])
                        .sum();
                }
            }
            for (index, g) in gates.iter_mut().enumerate() {
                match index == Gate::Cell as usize {
                    true => g.iter_mut().for_each(|x| *x = x.tanh()),
                    false => g.iter_mut().for_each(|x| *x = sigmoid(*x)),
                }
            }

            let [f, i, g, o] = &gates;
            let cell = f
                .iter()
                .zip_eq(c)
                .zip_eq(i.iter().zip_eq(g))
                .map(|((f, c), (i, g))| f * c + i * g)
                .collect_vec();
            let cell_tanh = cell.iter().map(|c| c.tanh()).collect_vec();
            let hidden = o
                .iter()
                .zip_eq(cell_tanh.iter())
                .map(|(o, t)| o * t)
                .collect_vec();

            Snapshot {
                combined,
                gates,
                cell_prev: c.to_vec(),
                cell,
                cell_tanh,
                hidden,
            }
        }

        /// One-step gradients from a snapshot: per-gate weight gradients and
        /// the combined-input gradient.
        fn backward(&self, snapshot: &Snapshot, gradient: &[f32]) -> ([Vec<f32>; 4], Vec<f32>) {
            let (iw, hw) = (self.config.input_width, self.config.hidden_width);
            let (batch, cw) = (self.config.batch_size, iw + hw);

            let [_, _, g, o] = &snapshot.gates;
            let d_hidden = gradient
                .iter()
                .zip_eq(o)
                .map(|(grad, o)| grad * o)
                .collect_vec();
            let d_cell = d_hidden
                .iter()
                .zip_eq(snapshot.cell_tanh.iter())
                .map(|(d, t)| d * (1.0 - t * t))
                .collect_vec();

            let signals: [Vec<f32>; 4] = [
                // forget: d_cell ⊙ previous cell
                d_cell
                    .iter()
                    .zip_eq(snapshot.cell_prev.iter())
                    .map(|(d, c)| d * c)
                    .collect_vec(),
                // input: d_cell ⊙ candidate
                d_cell.iter().zip_eq(g).map(|(d, g)| d * g).collect_vec(),
                // cell: d_cell itself
                d_cell.clone(),
                // output: d_hidden ⊙ tanh(cell)
                d_hidden
                    .iter()
                    .zip_eq(snapshot.cell_tanh.iter())
                    .map(|(d, t)| d * t)
                    .collect_vec(),
            ];

            let mut d_weights = std::array::from_fn::<_, 4, _>(|_| vec![0.0; hw * cw]);
            let mut d_combined = vec![0.0; batch * cw];
            for (index, signal) in signals.iter().enumerate() {
                let d_w = &mut d_weights[index];
                for (j, k) in itertools::iproduct!(0..hw, 0..cw) {
                    d_w[j * cw + k] = (0..batch)
                        .map(|b| signal[b * hw + j] * snapshot.combined[b * cw + k])
                        .sum();
                }
                let weights = &self.weights[index];
                for (b, k) in itertools::iproduct!(0..batch, 0..cw) {
                    d_combined[b * cw + k] += (0..hw)
                        .map(|j| signal[b * hw + j] * weights[j * cw + k])
                        .sum::<f32>();
                }
            }
            (d_weights, d_combined)
        }
    }

    /// Build a layer with deterministic weights and its host-side mirror.
    async fn fixture(config: LstmConfig, seed: u64) -> Result<(LstmLayer, Reference), LayerError> {
        fastrand::seed(seed);
        let layer = LstmLayer::new(config.clone()).await?;

        let count = config.hidden_width * config.combined_width();
        let weights = std::array::from_fn::<_, 4, _>(|_| {
            (0..count).map(|_| fastrand::f32() * 0.2 - 0.1).collect_vec()
        });
        for (gate, data) in Gate::ALL.into_iter().zip_eq(weights.iter()) {
            layer.load_weights(gate, data.clone())?;
        }

        Ok((layer, Reference { config, weights }))
    }

    #[tokio::test]
    async fn test_zero_state_after_construction() -> Result<(), Box<dyn Error>> {
        let layer = LstmLayer::new(config(3, 4, 2)).await?;

        assert!(layer.cell().back().await?.iter().all(|&x| x == 0.0));
        assert!(layer.hidden().back().await?.iter().all(|&x| x == 0.0));

        Ok(())
    }

    #[tokio::test]
    async fn test_config_validation() -> Result<(), Box<dyn Error>> {
        let result = LstmLayer::new(config(0, 4, 2)).await;
        assert!(matches!(result, Err(LayerError::Config("input_width"))));

        let mut bad = config(3, 4, 2);
        bad.learning_rate = -1.0;
        assert!(matches!(
            LstmLayer::new(bad).await,
            Err(LayerError::Config("learning_rate"))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_reset_state() -> Result<(), Box<dyn Error>> {
        let (mut layer, _) = fixture(config(3, 4, 2), 42).await?;
        let stream = layer.stream();

        let input = Matrix::create(&stream, 2, 3, vec![0.5; 6])?;
        let output = Matrix::zeros(&stream, 2, 4);
        layer.forward(&input, &output)?;
        layer.forward(&input, &output)?;
        assert!(layer.hidden().back().await?.iter().any(|&x| x != 0.0));

        layer.reset_state();
        assert!(layer.cell().back().await?.iter().all(|&x| x == 0.0));
        assert!(layer.hidden().back().await?.iter().all(|&x| x == 0.0));

        // the forward snapshot is gone with the state
        let gradient = Matrix::create(&stream, 2, 4, vec![0.1; 8])?;
        let input_gradient = Matrix::zeros(&stream, 2, 3);
        assert!(matches!(
            layer.backward(&gradient, &input_gradient),
            Err(LayerError::MissingForward)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_output_shape() -> Result<(), Box<dyn Error>> {
        let (mut layer, _) = fixture(config(3, 4, 2), 42).await?;
        let stream = layer.stream();

        let input = Matrix::create(&stream, 2, 3, vec![0.25; 6])?;
        let output = Matrix::zeros(&stream, 2, 4);
        for _ in 0..5 {
            layer.forward(&input, &output)?;
            assert_eq!(output.shape(), (2, 4));
            assert_eq!(output.back().await?.len(), 8);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_recurrence_reference() -> Result<(), Box<dyn Error>> {
        let (mut layer, reference) = fixture(config(3, 4, 2), 42).await?;
        let stream = layer.stream();

        let mut h = vec![0.0; 8];
        let mut c = vec![0.0; 8];
        let output = Matrix::zeros(&stream, 2, 4);

        for step in 0..3 {
            let x = (0..6).map(|_| fastrand::f32() * 2.0 - 1.0).collect_vec();
            let input = Matrix::create(&stream, 2, 3, x.clone())?;
            layer.forward(&input, &output)?;

            let snapshot = reference.step(&x, &h, &c);
            h = snapshot.hidden;
            c = snapshot.cell;

            let computed = output.back().await?;
            for (index, (&computed, &expected)) in computed.iter().zip_eq(h.iter()).enumerate() {
                assert_approx_eq!(step * 8 + index, computed, expected, 1e-5);
            }
            let cell = layer.cell().back().await?;
            for (index, (&computed, &expected)) in cell.iter().zip_eq(c.iter()).enumerate() {
                assert_approx_eq!(step * 8 + index, computed, expected, 1e-5);
            }
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_fixed_scenario() -> Result<(), Box<dyn Error>> {
        // the canonical host configuration, with weights forced to a known
        // constant so the output is hand-computable
        let config = config(6, 64, 1);
        let mut layer = LstmLayer::new(config.clone()).await?;
        let stream = layer.stream();

        let count = 64 * config.combined_width();
        for gate in Gate::ALL {
            layer.load_weights(gate, vec![0.01; count])?;
        }

        let input = Matrix::create(&stream, 1, 6, vec![1.0; 6])?;
        let output = Matrix::zeros(&stream, 1, 64);
        layer.forward(&input, &output)?;

        // every gate sees the same pre-activation 0.01 × 6 = 0.06
        let z = 0.06f32;
        let cell = sigmoid(z) * z.tanh();
        let expected = sigmoid(z) * cell.tanh();

        let computed = output.back().await?;
        assert_eq!(computed.len(), 64);
        for (index, &computed) in computed.iter().enumerate() {
            assert_approx_eq!(index, computed, expected, 1e-5);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_double_buffer_swap() -> Result<(), Box<dyn Error>> {
        let (mut layer, reference) = fixture(config(3, 4, 1), 7).await?;
        let stream = layer.stream();

        let x1 = vec![0.3, -0.2, 0.8];
        let x2 = vec![-0.6, 0.4, 0.1];
        let input1 = Matrix::create(&stream, 1, 3, x1.clone())?;
        let input2 = Matrix::create(&stream, 1, 3, x2.clone())?;
        let output = Matrix::zeros(&stream, 1, 4);

        layer.forward(&input1, &output)?;
        let first = output.back().await?;

        // the state read by the second step must be the first step's output
        let hidden = layer.hidden().back().await?;
        assert_eq!(first, hidden);

        layer.forward(&input2, &output)?;
        let second = output.back().await?;

        let s1 = reference.step(&x1, &[0.0; 4], &[0.0; 4]);
        let s2 = reference.step(&x2, &s1.hidden, &s1.cell);
        for (index, (&computed, &expected)) in second.iter().zip_eq(s2.hidden.iter()).enumerate() {
            assert_approx_eq!(index, computed, expected, 1e-5);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_hidden_bounds() -> Result<(), Box<dyn Error>> {
        // random initialization: the hidden state is a sigmoid-gated tanh,
        // so it stays within [-1, 1] for arbitrary finite inputs
        fastrand::seed(42);
        let mut layer = LstmLayer::new(config(5, 8, 3)).await?;
        let stream = layer.stream();

        let output = Matrix::zeros(&stream, 3, 8);
        for _ in 0..5 {
            let x = (0..15).map(|_| fastrand::f32() * 100.0 - 50.0).collect_vec();
            let input = Matrix::create(&stream, 3, 5, x)?;
            layer.forward(&input, &output)?;

            let hidden = output.back().await?;
            assert!(hidden.iter().all(|x| (-1.0..=1.0).contains(x)));
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_backward_reference() -> Result<(), Box<dyn Error>> {
        let (mut layer, reference) = fixture(config(3, 4, 2), 42).await?;
        let stream = layer.stream();

        // two steps so the previous cell state is nonzero
        let x1 = (0..6).map(|_| fastrand::f32() - 0.5).collect_vec();
        let x2 = (0..6).map(|_| fastrand::f32() - 0.5).collect_vec();
        let output = Matrix::zeros(&stream, 2, 4);

        let input = Matrix::create(&stream, 2, 3, x1.clone())?;
        layer.forward(&input, &output)?;
        let input = Matrix::create(&stream, 2, 3, x2.clone())?;
        layer.forward(&input, &output)?;

        let grad = (0..8).map(|_| fastrand::f32() - 0.5).collect_vec();
        let gradient = Matrix::create(&stream, 2, 4, grad.clone())?;
        let input_gradient = Matrix::zeros(&stream, 2, 3);
        layer.backward(&gradient, &input_gradient)?;

        let s1 = reference.step(&x1, &[0.0; 8], &[0.0; 8]);
        let s2 = reference.step(&x2, &s1.hidden, &s1.cell);
        let (d_weights, d_combined) = reference.backward(&s2, &grad);

        for (gate, expected) in Gate::ALL.into_iter().zip_eq(d_weights.iter()) {
            let computed = layer.gradients(gate).back().await?;
            for (index, (&computed, &expected)) in
                computed.iter().zip_eq(expected.iter()).enumerate()
            {
                assert_approx_eq!(index, computed, expected, 1e-5);
            }
        }

        // the combined gradient splits into the caller's input slice and
        // the retained hidden slice
        let computed = input_gradient.back().await?;
        let retained = layer.hidden_gradient().back().await?;
        for b in 0..2 {
            for k in 0..3 {
                assert_approx_eq!(k, computed[b * 3 + k], d_combined[b * 7 + k], 1e-5);
            }
            for j in 0..4 {
                assert_approx_eq!(j, retained[b * 4 + j], d_combined[b * 7 + 3 + j], 1e-5);
            }
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_backward_leaves_weights_untouched() -> Result<(), Box<dyn Error>> {
        let (mut layer, _) = fixture(config(3, 4, 2), 42).await?;
        let stream = layer.stream();

        let input = Matrix::create(&stream, 2, 3, vec![0.5; 6])?;
        let output = Matrix::zeros(&stream, 2, 4);
        layer.forward(&input, &output)?;

        let before = layer.weights(Gate::Forget).back().await?;

        let gradient = Matrix::create(&stream, 2, 4, vec![0.1; 8])?;
        let input_gradient = Matrix::zeros(&stream, 2, 3);
        layer.backward(&gradient, &input_gradient)?;

        let after = layer.weights(Gate::Forget).back().await?;
        assert_eq!(before, after);

        Ok(())
    }

    #[tokio::test]
    async fn test_update_weights_step() -> Result<(), Box<dyn Error>> {
        let (mut layer, _) = fixture(config(3, 4, 2), 42).await?;
        let stream = layer.stream();

        let input = Matrix::create(&stream, 2, 3, vec![0.5; 6])?;
        let output = Matrix::zeros(&stream, 2, 4);
        layer.forward(&input, &output)?;

        let gradient = Matrix::create(&stream, 2, 4, vec![0.1; 8])?;
        let input_gradient = Matrix::zeros(&stream, 2, 3);
        layer.backward(&gradient, &input_gradient)?;

        let rate = layer.config().learning_rate;
        let mut before = Vec::new();
        let mut grads = Vec::new();
        for gate in Gate::ALL {
            before.push(layer.weights(gate).back().await?);
            grads.push(layer.gradients(gate).back().await?);
        }

        layer.update_weights()?;

        for ((gate, before), grad) in Gate::ALL.into_iter().zip_eq(before).zip_eq(grads) {
            let after = layer.weights(gate).back().await?;
            for (index, ((&after, &before), &grad)) in after
                .iter()
                .zip_eq(before.iter())
                .zip_eq(grad.iter())
                .enumerate()
            {
                assert_approx_eq!(index, after, before - rate * grad, 1e-7);
            }
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_call_order_contracts() -> Result<(), Box<dyn Error>> {
        let mut layer = LstmLayer::new(config(3, 4, 2)).await?;
        let stream = layer.stream();

        let gradient = Matrix::create(&stream, 2, 4, vec![0.1; 8])?;
        let input_gradient = Matrix::zeros(&stream, 2, 3);
        assert!(matches!(
            layer.backward(&gradient, &input_gradient),
            Err(LayerError::MissingForward)
        ));
        assert!(matches!(
            layer.update_weights(),
            Err(LayerError::MissingGradients)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_shape_mismatch() -> Result<(), Box<dyn Error>> {
        let mut layer = LstmLayer::new(config(3, 4, 2)).await?;
        let stream = layer.stream();

        let input = Matrix::zeros(&stream, 2, 5);
        let output = Matrix::zeros(&stream, 2, 4);
        assert!(matches!(
            layer.forward(&input, &output),
            Err(LayerError::Shape(..))
        ));

        let foreign = CpuBuilder::new().add_default_ops().build().await;
        let input = Matrix::zeros(&foreign, 2, 3);
        assert!(matches!(
            layer.forward(&input, &output),
            Err(LayerError::ForeignStream)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_instability_detection() -> Result<(), Box<dyn Error>> {
        let mut config = config(3, 4, 1);
        config.detect_instability = true;
        let mut layer = LstmLayer::new(config).await?;
        let stream = layer.stream();

        let input = Matrix::create(&stream, 1, 3, vec![0.5; 3])?;
        let output = Matrix::zeros(&stream, 1, 4);
        layer.forward(&input, &output)?;
        layer.sync().await?;

        let poisoned = Matrix::create(&stream, 1, 3, vec![0.5, f32::NAN, 0.5])?;
        layer.forward(&poisoned, &output)?;
        assert!(matches!(
            layer.sync().await,
            Err(LayerError::NumericInstability)
        ));

        Ok(())
    }
}
