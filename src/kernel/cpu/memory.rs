use crate::{
    kernel::{AllocOp, BackendOp, CheckFiniteOp, CopyOp, FillOp, FillRandomOp, LoadOp},
    stream::{Backend as _, cpu::Backend},
};

impl BackendOp<Backend> for AllocOp {
    fn execute(&self, backend: &mut Backend) {
        let buffer = backend.alloc(self.buffer.id, self.buffer.count());
        if let Some(contents) = &self.contents {
            buffer
                .write()
                .expect("failed to lock")
                .copy_from_slice(contents);
        }
    }
}

impl BackendOp<Backend> for LoadOp {
    fn execute(&self, backend: &mut Backend) {
        let buffer = backend.buffer(&self.buffer);
        buffer
            .write()
            .expect("failed to lock")
            .copy_from_slice(&self.contents);
    }
}

impl BackendOp<Backend> for FillOp {
    fn execute(&self, backend: &mut Backend) {
        let buffer = backend.buffer(&self.buffer);
        buffer.write().expect("failed to lock").fill(self.value);
    }
}

impl BackendOp<Backend> for FillRandomOp {
    fn execute(&self, backend: &mut Backend) {
        let buffer = backend.buffer(&self.buffer);
        let scale = self.scale;
        let rng = backend.rng();
        buffer
            .write()
            .expect("failed to lock")
            .iter_mut()
            .for_each(|x| *x = scale * (2.0 * rng.f32() - 1.0));
    }
}

impl BackendOp<Backend> for CopyOp {
    fn execute(&self, backend: &mut Backend) {
        let input = backend.buffer(&self.input);
        let output = backend.buffer(&self.output);

        let input = input.read().expect("failed to lock");
        output
            .write()
            .expect("failed to lock")
            .copy_from_slice(&input);
    }
}

impl BackendOp<Backend> for CheckFiniteOp {
    fn execute(&self, backend: &mut Backend) {
        let buffer = backend.buffer(&self.buffer);
        let x = buffer.read().expect("failed to lock");
        if x.iter().any(|x| !x.is_finite()) {
            log::error!("non-finite values in matrix {}", self.buffer.id);
            backend.raise_fault();
        }
    }
}
