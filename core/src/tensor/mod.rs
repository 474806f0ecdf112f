//! Host tensor values.
//!
//! # What lives here?
//!
//! The placement layer never touches gradient *data*: it only decides which graph nodes to create
//! and where. The values in this module exist for the two places where data is real:
//!
//! 1. **Initializers**: the initial value of a variable.
//! 2. **The reference runtime**: [`crate::runtime::Session`] evaluates graphs on the host so
//!    that aggregation results can be checked numerically.
//!
//! A `Tensor` is a flat, row-major vector plus a dynamic shape. Unlike a model-building tensor
//! the rank is not part of the type: gradients of every rank flow through the same aggregation
//! paths, and repacking flattens and restores them constantly.
//!
//! ```rust
//! use varmgr_rs::tensor::Tensor;
//!
//! let t = Tensor::new(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! assert_eq!(t.shape(), &[2, 3]);
//! assert_eq!(t.numel(), 6);
//!
//! let flat = t.reshape([6]).unwrap();
//! let parts = flat.split(&[4, 2]).unwrap();
//! assert_eq!(parts[1].data(), &[5.0, 6.0]);
//! ```

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;
use varmgr_rs_kernels::KernelError;

pub mod device;

pub use device::{DeviceSpec, DeviceType};

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<KernelError> for TensorError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            KernelError::EmptyInput => TensorError::Unsupported("empty input list".into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// # Requirements
/// - `Copy + Clone`: Essential for efficient storage in contiguous memory (e.g., `Vec<T>`).
/// - `Num + ...`: Provides necessary numeric operations for reductions.
/// - `Send + Sync`: Required for parallel execution via `rayon`.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// Number of elements of a shape. The empty shape is a scalar with one element.
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// A dense host tensor with a dynamic shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor<T: TensorElem = f32> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: TensorElem> Tensor<T> {
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        let size = num_elements(&shape);
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::full(shape, T::zero())
    }

    /// Creates a new Tensor filled with `value`.
    pub fn full(shape: impl Into<Vec<usize>>, value: T) -> Self {
        let shape = shape.into();
        let data = vec![value; num_elements(&shape)];
        Self { shape, data }
    }

    /// A rank-0 tensor.
    pub fn scalar(value: T) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Reshapes the tensor to a new shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the total number of elements in `new_shape`
    /// does not match the current size of the tensor.
    pub fn reshape(self, new_shape: impl Into<Vec<usize>>) -> Result<Self> {
        let new_shape = new_shape.into();
        let new_size = num_elements(&new_shape);
        if new_size != self.data.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.data.len()],
                got: vec![new_size],
            });
        }
        Ok(Self {
            shape: new_shape,
            data: self.data,
        })
    }

    /// Concatenates tensors into one rank-1 tensor, in order.
    pub fn concat(parts: &[&Tensor<T>]) -> Self {
        let total = parts.iter().map(|p| p.numel()).sum();
        let mut data = Vec::with_capacity(total);
        for p in parts {
            data.extend_from_slice(&p.data);
        }
        Self {
            shape: vec![total],
            data,
        }
    }

    /// Splits a tensor into contiguous rank-1 pieces of the given sizes.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the sizes do not add up to the element count.
    pub fn split(&self, sizes: &[usize]) -> Result<Vec<Self>> {
        let total: usize = sizes.iter().sum();
        if total != self.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.numel()],
                got: vec![total],
            });
        }
        let mut offset = 0;
        let mut out = Vec::with_capacity(sizes.len());
        for &size in sizes {
            out.push(Self {
                shape: vec![size],
                data: self.data[offset..offset + size].to_vec(),
            });
            offset += size;
        }
        Ok(out)
    }

    /// Element-wise sum of tensors with identical shapes.
    pub fn add_n(inputs: &[&Tensor<T>]) -> Result<Self> {
        let first = inputs
            .first()
            .ok_or_else(|| TensorError::Unsupported("add_n of zero tensors".into()))?;
        if let Some(bad) = inputs.iter().find(|t| t.shape != first.shape) {
            return Err(TensorError::ShapeMismatch {
                expected: first.shape.clone(),
                got: bad.shape.clone(),
            });
        }
        let slices: Vec<&[T]> = inputs.iter().map(|t| t.data.as_slice()).collect();
        let data = varmgr_rs_kernels::cpu_add_n(&slices)?;
        Ok(Self {
            shape: first.shape.clone(),
            data,
        })
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        Self {
            shape: self.shape.clone(),
            data: varmgr_rs_kernels::cpu_scale(&self.data, factor),
        }
    }

    /// `self += alpha * other`.
    pub fn axpy(&mut self, alpha: T, other: &Tensor<T>) -> Result<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        varmgr_rs_kernels::cpu_axpy(&mut self.data, alpha, &other.data)?;
        Ok(())
    }

    /// Returns `true` if no element is NaN or infinite.
    pub fn all_finite(&self) -> bool {
        varmgr_rs_kernels::cpu_all_finite(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_shape_mismatch() {
        let result = Tensor::new(vec![1.0f32, 2.0, 3.0], [2, 2]);
        assert!(matches!(result, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_scalar_has_one_element() {
        let t = Tensor::scalar(3.0f32);
        assert!(t.shape().is_empty());
        assert_eq!(t.numel(), 1);
    }

    #[test]
    fn test_reshape_roundtrip() {
        let t = Tensor::new((0..12).map(|x| x as f32).collect(), [3, 4]).unwrap();
        let flat = t.clone().reshape([12]).unwrap();
        let back = flat.reshape([3, 4]).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_reshape_wrong_size() {
        let t = Tensor::<f32>::zeros([2, 2]);
        assert!(t.reshape([5]).is_err());
    }

    #[test]
    fn test_concat_then_split() {
        let a = Tensor::new(vec![1.0f32, 2.0], [2]).unwrap();
        let b = Tensor::new(vec![3.0f32, 4.0, 5.0], [3]).unwrap();
        let c = Tensor::concat(&[&a, &b]);
        assert_eq!(c.shape(), &[5]);

        let parts = c.split(&[2, 3]).unwrap();
        assert_eq!(parts[0], a);
        assert_eq!(parts[1], b);
    }

    #[test]
    fn test_split_bad_sizes() {
        let t = Tensor::<f32>::zeros([4]);
        assert!(t.split(&[1, 2]).is_err());
    }

    #[test]
    fn test_split_allows_empty_pieces() {
        let t = Tensor::new(vec![1.0f32, 2.0], [2]).unwrap();
        let parts = t.split(&[0, 0, 2]).unwrap();
        assert_eq!(parts[0].numel(), 0);
        assert_eq!(parts[2].data(), &[1.0, 2.0]);
    }

    #[test]
    fn test_add_n_and_scale() {
        let a = Tensor::full([2, 2], 1.0f32);
        let b = Tensor::full([2, 2], 3.0f32);
        let sum = Tensor::add_n(&[&a, &b]).unwrap();
        assert_eq!(sum.data(), &[4.0; 4]);
        assert_eq!(sum.scale(0.5).data(), &[2.0; 4]);
    }

    #[test]
    fn test_add_n_shape_mismatch() {
        let a = Tensor::<f32>::zeros([4]);
        let b = Tensor::<f32>::zeros([2, 2]);
        assert!(Tensor::add_n(&[&a, &b]).is_err());
    }

    #[test]
    fn test_axpy() {
        let mut p = Tensor::new(vec![1.0f32, 2.0], [2]).unwrap();
        let g = Tensor::new(vec![0.5f32, -0.5], [2]).unwrap();
        p.axpy(-0.1, &g).unwrap();
        assert!((p.data()[0] - 0.95).abs() < 1e-6);
        assert!((p.data()[1] - 2.05).abs() < 1e-6);
    }

    #[test]
    fn test_all_finite() {
        assert!(Tensor::full([3], 1.0f32).all_finite());
        let t = Tensor::new(vec![1.0f32, f32::NAN], [2]).unwrap();
        assert!(!t.all_finite());
    }
}
