use itertools::Itertools;

use crate::{
    kernel::{BackendOp, GradientStepOp, MulAddOp, MulOp},
    stream::cpu::Backend,
};

impl BackendOp<Backend> for MulOp {
    fn execute(&self, backend: &mut Backend) {
        let a = backend.buffer(&self.inputs[0]);
        let b = backend.buffer(&self.inputs[1]);
        let output = backend.buffer(&self.output);

        let a = a.read().expect("failed to lock");
        let b = b.read().expect("failed to lock");
        let mut output = output.write().expect("failed to lock");

        a.iter()
            .zip_eq(b.iter())
            .zip_eq(output.iter_mut())
            .for_each(|((a, b), out)| *out = a * b);
    }
}

impl BackendOp<Backend> for MulAddOp {
    fn execute(&self, backend: &mut Backend) {
        let a = backend.buffer(&self.inputs[0]);
        let b = backend.buffer(&self.inputs[1]);
        let output = backend.buffer(&self.output);

        let a = a.read().expect("failed to lock");
        let b = b.read().expect("failed to lock");
        let mut output = output.write().expect("failed to lock");

        a.iter()
            .zip_eq(b.iter())
            .zip_eq(output.iter_mut())
            .for_each(|((a, b), out)| *out += a * b);
    }
}

impl BackendOp<Backend> for GradientStepOp {
    fn execute(&self, backend: &mut Backend) {
        let weight = backend.buffer(&self.weight);
        let gradient = backend.buffer(&self.gradient);
        let rate = self.rate;

        let gradient = gradient.read().expect("failed to lock");
        weight
            .write()
            .expect("failed to lock")
            .iter_mut()
            .zip_eq(gradient.iter())
            .for_each(|(w, g)| *w -= rate * g);
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use crate::{
        kernel::{Access, BinaryOp, GradientStepOp, MulAddOp, MulOp},
        matrix::Matrix,
        stream::CpuBuilder,
    };

    #[tokio::test]
    async fn test_mul_mul_add() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);

        let stream = CpuBuilder::new().add_default_ops().build().await;

        let x = (0..12).map(|_| fastrand::f32()).collect_vec();
        let y = (0..12).map(|_| fastrand::f32()).collect_vec();

        let a = Matrix::create(&stream, 4, 3, x.clone())?;
        let b = Matrix::create(&stream, 4, 3, y.clone())?;
        let c = Matrix::zeros(&stream, 4, 3);

        stream.launch(MulOp(BinaryOp {
            inputs: [a.ir(Access::ReadOnly), b.ir(Access::ReadOnly)],
            output: c.ir(Access::WriteOnly),
        }));
        stream.launch(MulAddOp(BinaryOp {
            inputs: [a.ir(Access::ReadOnly), b.ir(Access::ReadOnly)],
            output: c.ir(Access::ReadWrite),
        }));

        let r#ref = x.iter().zip_eq(y.iter()).map(|(x, y)| 2.0 * x * y);
        let output = c.back().await?;
        for (computed, expected) in output.iter().zip_eq(r#ref) {
            assert!((computed - expected).abs() < 1e-6);
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_gradient_step() -> Result<(), Box<dyn Error>> {
        let stream = CpuBuilder::new().add_default_ops().build().await;

        let weight = Matrix::create(&stream, 2, 2, vec![1.0, 2.0, 3.0, 4.0])?;
        let gradient = Matrix::create(&stream, 2, 2, vec![0.5, -0.5, 1.0, 0.0])?;

        stream.launch(GradientStepOp {
            weight: weight.ir(Access::ReadWrite),
            gradient: gradient.ir(Access::ReadOnly),
            rate: 0.1,
        });

        let output = weight.back().await?;
        assert_eq!(&output[..], &[0.95, 2.05, 2.9, 4.0]);

        Ok(())
    }
}
