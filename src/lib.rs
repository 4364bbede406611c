//! `skein` is a single gated recurrent (LSTM) layer whose forward pass,
//! backward pass, and parameter update all execute as asynchronous numeric
//! kernels ordered by one execution stream.
//!
//! ## Key Components
//! 1. **Execution Stream** ([`stream`]):
//!    - A first-class ordered asynchronous queue; ops enqueued on it execute
//!      in enqueue order, making dependent kernel chains safe without
//!      per-step synchronization.
//!    - A reference CPU backend built through [`stream::CpuBuilder`], with
//!      an op vtable as the seam for other backends.
//!
//! 2. **Kernel Contract** ([`kernel`]):
//!    - One op type per numeric primitive the layer schedules:
//!      concatenation, dense multiplies and their gradient forms,
//!      activations and their derivatives, element-wise combines, fills.
//!
//! 3. **Device Buffers** ([`matrix`]):
//!    - Exclusively owned matrices of device-resident `f32` storage,
//!      allocated once, released on drop, read back asynchronously.
//!
//! 4. **Layer Engine** ([`layer`]):
//!    - Gate computations, the double-buffered cell/hidden recurrence,
//!      one-step backpropagation into separated gradient storage, and the
//!      plain SGD weight update.
//!
//! ## Example
//! ```
//! use skein::{LstmConfig, LstmLayer, Matrix};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LstmConfig {
//!     input_width: 6,
//!     hidden_width: 64,
//!     layer_count: 2,
//!     batch_size: 1,
//!     learning_rate: 0.001,
//!     detect_instability: false,
//! };
//! let mut layer = LstmLayer::new(config).await?;
//!
//! let stream = layer.stream();
//! let input = Matrix::create(&stream, 1, 6, vec![0.5; 6])?;
//! let output = Matrix::zeros(&stream, 1, 64);
//!
//! layer.forward(&input, &output)?;
//! let hidden = output.back().await?;
//! assert_eq!(hidden.len(), 64);
//! # Ok(())
//! # }
//! ```

pub mod kernel;
pub mod layer;
pub mod matrix;
pub mod stream;

pub use layer::{Gate, LayerError, LstmConfig, LstmLayer};
pub use matrix::Matrix;
pub use stream::Stream;
