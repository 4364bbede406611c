use crate::{
    kernel::{BackendOp, ConcatOp, SplitOp},
    stream::cpu::Backend,
};

impl BackendOp<Backend> for ConcatOp {
    fn execute(&self, backend: &mut Backend) {
        let [rows, a_cols, b_cols] = [self.a.rows, self.a.cols, self.b.cols];
        let cols = a_cols + b_cols;

        let a = backend.buffer(&self.a);
        let b = backend.buffer(&self.b);
        let output = backend.buffer(&self.output);

        let a = a.read().expect("failed to lock");
        let b = b.read().expect("failed to lock");
        let mut output = output.write().expect("failed to lock");

        for i in 0..rows {
            let out = &mut output[i * cols..(i + 1) * cols];
            out[..a_cols].copy_from_slice(&a[i * a_cols..(i + 1) * a_cols]);
            out[a_cols..].copy_from_slice(&b[i * b_cols..(i + 1) * b_cols]);
        }
    }
}

impl BackendOp<Backend> for SplitOp {
    fn execute(&self, backend: &mut Backend) {
        let [rows, a_cols, b_cols] = [self.a.rows, self.a.cols, self.b.cols];
        let cols = a_cols + b_cols;

        let input = backend.buffer(&self.input);
        let a = backend.buffer(&self.a);
        let b = backend.buffer(&self.b);

        let input = input.read().expect("failed to lock");
        let mut a = a.write().expect("failed to lock");
        let mut b = b.write().expect("failed to lock");

        for i in 0..rows {
            let row = &input[i * cols..(i + 1) * cols];
            a[i * a_cols..(i + 1) * a_cols].copy_from_slice(&row[..a_cols]);
            b[i * b_cols..(i + 1) * b_cols].copy_from_slice(&row[a_cols..]);
        }
    }
}
