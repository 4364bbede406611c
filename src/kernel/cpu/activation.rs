use itertools::Itertools;

use crate::{
    kernel::{BackendOp, SigmoidOp, TanhBackwardOp, TanhOp},
    stream::cpu::Backend,
};

impl BackendOp<Backend> for SigmoidOp {
    fn execute(&self, backend: &mut Backend) {
        let buffer = backend.buffer(&self.buffer);
        buffer
            .write()
            .expect("failed to lock")
            .iter_mut()
            .for_each(|x| *x = 1.0 / (1.0 + (-*x).exp()));
    }
}

impl BackendOp<Backend> for TanhOp {
    fn execute(&self, backend: &mut Backend) {
        let buffer = backend.buffer(&self.buffer);
        buffer
            .write()
            .expect("failed to lock")
            .iter_mut()
            .for_each(|x| *x = x.tanh());
    }
}

impl BackendOp<Backend> for TanhBackwardOp {
    fn execute(&self, backend: &mut Backend) {
        let gradient = backend.buffer(&self.gradient);
        let activated = backend.buffer(&self.activated);
        let output = backend.buffer(&self.output);

        let gradient = gradient.read().expect("failed to lock");
        let activated = activated.read().expect("failed to lock");
        let mut output = output.write().expect("failed to lock");

        gradient
            .iter()
            .zip_eq(activated.iter())
            .zip_eq(output.iter_mut())
            .for_each(|((g, a), out)| *out = g * (1.0 - a * a));
    }
}
