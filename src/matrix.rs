use std::sync::Arc;

use thiserror::Error;

use crate::{
    kernel::{Access, AllocOp, CopyOp, LoadOp, MatrixIr},
    stream::{Stream, StreamError, StreamEvent},
};

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("matrix creation error: shape ({0}, {1})'s size not match data len {2}")]
    Create(usize, usize, usize),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixId;

/// An owned rectangular block of device-resident storage.
///
/// The allocation happens exactly once at construction and is released
/// exactly once when the handle drops. Handles are deliberately not
/// [`Clone`]: every buffer has a single owner, and ops refer to it through
/// [`MatrixIr`] descriptors instead of aliasing the handle.
#[derive(Debug)]
pub struct Matrix {
    stream: Stream,
    rows: usize,
    cols: usize,
    id: uid::Id<MatrixId>,
}

impl Matrix {
    /// Allocate a zero-filled `rows × cols` matrix on the stream.
    pub fn zeros(stream: &Stream, rows: usize, cols: usize) -> Self {
        let stream = stream.clone();
        let id = uid::Id::new();
        let matrix = Self {
            stream,
            rows,
            cols,
            id,
        };
        matrix.stream.launch(AllocOp {
            buffer: matrix.ir(Access::WriteOnly),
            contents: None,
        });
        matrix
    }

    /// Allocate a matrix and upload `contents` from the host.
    pub fn create<C>(stream: &Stream, rows: usize, cols: usize, contents: C) -> Result<Self, MatrixError>
    where
        C: Into<Arc<[f32]>>,
    {
        let contents: Arc<[f32]> = contents.into();
        if contents.len() != rows * cols {
            return Err(MatrixError::Create(rows, cols, contents.len()));
        }

        let stream = stream.clone();
        let id = uid::Id::new();
        let matrix = Self {
            stream,
            rows,
            cols,
            id,
        };
        matrix.stream.launch(AllocOp {
            buffer: matrix.ir(Access::WriteOnly),
            contents: Some(contents),
        });
        Ok(matrix)
    }

    /// Overwrite the device contents with `contents` from the host.
    pub fn load<C>(&self, contents: C) -> Result<(), MatrixError>
    where
        C: Into<Arc<[f32]>>,
    {
        let contents: Arc<[f32]> = contents.into();
        if contents.len() != self.count() {
            return Err(MatrixError::Create(self.rows, self.cols, contents.len()));
        }
        self.stream.launch(LoadOp {
            buffer: self.ir(Access::WriteOnly),
            contents,
        });
        Ok(())
    }

    /// Schedule a device-to-device copy of this matrix into `output`.
    pub fn copy_into(&self, output: &Matrix) {
        self.stream.launch(CopyOp {
            input: self.ir(Access::ReadOnly),
            output: output.ir(Access::WriteOnly),
        });
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element count.
    #[inline]
    pub fn count(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn id(&self) -> uid::Id<MatrixId> {
        self.id
    }

    #[inline]
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    #[inline]
    pub fn ir(&self, access: Access) -> MatrixIr {
        MatrixIr {
            id: self.id.get(),
            rows: self.rows,
            cols: self.cols,
            access,
        }
    }

    /// Read back the contents of the matrix from the device.
    ///
    /// Completes only after every op enqueued before this call has executed,
    /// so this doubles as the caller's synchronization point.
    pub async fn back(&self) -> Result<Box<[f32]>, StreamError> {
        let (sender, receiver) = flume::bounded(0);
        self.stream.send(StreamEvent::Back {
            id: self.id.get(),
            sender,
        });
        receiver.recv_async().await.map_err(|_| StreamError::Closed)?
    }
}

impl Drop for Matrix {
    fn drop(&mut self) {
        self.stream.send(StreamEvent::Release(self.id.get()));
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::Matrix;
    use crate::stream::CpuBuilder;

    #[tokio::test]
    async fn test_create_back() -> Result<(), Box<dyn Error>> {
        let stream = CpuBuilder::new().add_default_ops().build().await;

        let data = (0..6).map(|x| x as f32).collect::<Vec<_>>();
        let a = Matrix::create(&stream, 2, 3, data.clone())?;
        assert_eq!(a.shape(), (2, 3));
        assert_eq!(&a.back().await?[..], &data[..]);

        let b = Matrix::zeros(&stream, 3, 2);
        assert!(b.back().await?.iter().all(|&x| x == 0.0));

        Ok(())
    }

    #[tokio::test]
    async fn test_create_len_mismatch() -> Result<(), Box<dyn Error>> {
        let stream = CpuBuilder::new().add_default_ops().build().await;

        let result = Matrix::create(&stream, 2, 3, vec![0.0; 5]);
        assert!(result.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_load() -> Result<(), Box<dyn Error>> {
        let stream = CpuBuilder::new().add_default_ops().build().await;

        let a = Matrix::zeros(&stream, 2, 2);
        a.load(vec![1.0, 2.0, 3.0, 4.0])?;
        assert_eq!(&a.back().await?[..], &[1.0, 2.0, 3.0, 4.0]);
        assert!(a.load(vec![0.0; 3]).is_err());

        Ok(())
    }
}
