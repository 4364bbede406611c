//! Reference CPU executors for the kernel contract. Each file implements
//! [`BackendOp`](super::BackendOp) for one family of ops against the CPU
//! stream backend.

mod activation;
mod elementwise;
mod matmul;
mod memory;
mod shape;
