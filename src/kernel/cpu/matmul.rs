use crate::{
    kernel::{BackendOp, MatMulAccumulateOp, MatMulOp, MatMulTransposeOp},
    stream::cpu::Backend,
};

impl BackendOp<Backend> for MatMulOp {
    fn execute(&self, backend: &mut Backend) {
        let [m, k] = [self.weight.rows, self.weight.cols];
        let batch = self.input.rows;
        debug_assert_eq!(k, self.input.cols);
        debug_assert_eq!([batch, m], [self.output.rows, self.output.cols]);

        let w = backend.buffer(&self.weight);
        let x = backend.buffer(&self.input);
        let output = backend.buffer(&self.output);

        let w = w.read().expect("failed to lock");
        let x = x.read().expect("failed to lock");
        let mut output = output.write().expect("failed to lock");

        #[cfg(not(feature = "rayon"))]
        for (i, j) in itertools::iproduct!(0..batch, 0..m) {
            let row = &x[i * k..(i + 1) * k];
            output[i * m + j] = w[j * k..(j + 1) * k]
                .iter()
                .zip(row)
                .map(|(w, x)| w * x)
                .sum();
        }
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;

            output
                .par_chunks_exact_mut(m)
                .enumerate()
                .for_each(|(i, out)| {
                    let row = &x[i * k..(i + 1) * k];
                    for (j, out) in out.iter_mut().enumerate() {
                        *out = w[j * k..(j + 1) * k]
                            .iter()
                            .zip(row)
                            .map(|(w, x)| w * x)
                            .sum();
                    }
                });
        }
    }
}

impl BackendOp<Backend> for MatMulTransposeOp {
    fn execute(&self, backend: &mut Backend) {
        let [batch, m] = [self.signal.rows, self.signal.cols];
        let k = self.input.cols;
        debug_assert_eq!(batch, self.input.rows);
        debug_assert_eq!([m, k], [self.output.rows, self.output.cols]);

        let s = backend.buffer(&self.signal);
        let x = backend.buffer(&self.input);
        let output = backend.buffer(&self.output);

        let s = s.read().expect("failed to lock");
        let x = x.read().expect("failed to lock");
        let mut output = output.write().expect("failed to lock");

        #[cfg(not(feature = "rayon"))]
        for (j, l) in itertools::iproduct!(0..m, 0..k) {
            output[j * k + l] = (0..batch).map(|i| s[i * m + j] * x[i * k + l]).sum();
        }
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;

            output
                .par_chunks_exact_mut(k)
                .enumerate()
                .for_each(|(j, out)| {
                    for (l, out) in out.iter_mut().enumerate() {
                        *out = (0..batch).map(|i| s[i * m + j] * x[i * k + l]).sum();
                    }
                });
        }
    }
}

impl BackendOp<Backend> for MatMulAccumulateOp {
    fn execute(&self, backend: &mut Backend) {
        let [batch, m] = [self.signal.rows, self.signal.cols];
        let k = self.weight.cols;
        debug_assert_eq!(m, self.weight.rows);
        debug_assert_eq!([batch, k], [self.accum.rows, self.accum.cols]);

        let s = backend.buffer(&self.signal);
        let w = backend.buffer(&self.weight);
        let accum = backend.buffer(&self.accum);

        let s = s.read().expect("failed to lock");
        let w = w.read().expect("failed to lock");
        let mut accum = accum.write().expect("failed to lock");

        #[cfg(not(feature = "rayon"))]
        for (i, l) in itertools::iproduct!(0..batch, 0..k) {
            accum[i * k + l] += (0..m).map(|j| s[i * m + j] * w[j * k + l]).sum::<f32>();
        }
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;

            accum
                .par_chunks_exact_mut(k)
                .enumerate()
                .for_each(|(i, out)| {
                    for (l, out) in out.iter_mut().enumerate() {
                        *out += (0..m).map(|j| s[i * m + j] * w[j * k + l]).sum::<f32>();
                    }
                });
        }
    }
}
