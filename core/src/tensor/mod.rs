//! Dense, row-major tensors.
//!
//! A [`Tensor`] is a flat `Vec<T>` plus a compile-time rank and a runtime shape. Everything the
//! training pipeline moves around is one of these:
//!
//! - item data: `Tensor<f32, 3>` (`[H, W, C]`), stacked into `Tensor<f32, 4>` per batch,
//! - label and confidence matrices: `Tensor<f32, 3>` (`[B, B, G]`),
//! - parameters and gradients: `Tensor<f32, 1>` (flattened, see [`crate::model::ParamMap`]).
//!
//! ```rust
//! use aquila::tensor::Tensor;
//!
//! let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! assert_eq!(t.shape(), &[2, 3]);
//! assert_eq!(t.get([1, 2]), Some(&6.0));
//! ```
//!
//! The rank is a const generic and the shape is runtime data, so batch size and group count can
//! vary between runs without re-instantiating anything, while a `[B, G]` score matrix can never be
//! confused with a `[B, B, G]` label matrix.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

/// Error type for Tensor operations.
#[derive(Error, Debug, Clone, PartialEq)]
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
    /// The requested operation is not supported (e.g., for a specific rank).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// `Send + Sync` is required because tensors cross the producer/replica thread boundary.
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

/// An N-dimensional array stored contiguously in row-major order.
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a flat vector and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of
    /// `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![T::zero(); size],
        }
    }

    /// Stacks equally-shaped tensors along a new leading dimension.
    ///
    /// `OUT` must be `RANK + 1`; the check happens at runtime because const generic arithmetic is
    /// not available on stable.
    pub fn stack<const OUT: usize>(parts: &[Tensor<T, RANK>]) -> Result<Tensor<T, OUT>> {
        if OUT != RANK + 1 {
            return Err(TensorError::Unsupported(format!(
                "stacking rank {RANK} tensors produces rank {}, not {OUT}",
                RANK + 1
            )));
        }
        let Some(first) = parts.first() else {
            return Err(TensorError::Unsupported("cannot stack zero tensors".into()));
        };

        let mut data = Vec::with_capacity(first.size() * parts.len());
        for part in parts {
            if part.shape != first.shape {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.to_vec(),
                    got: part.shape.to_vec(),
                });
            }
            data.extend_from_slice(&part.data);
        }

        let mut shape = [0; OUT];
        shape[0] = parts.len();
        shape[1..].copy_from_slice(&first.shape);
        Tensor::new(data, shape)
    }

    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns the underlying data as a mutable slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Returns the total number of elements in the tensor.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Converts a multi-dimensional index into a flat offset.
    pub fn offset(&self, index: [usize; RANK]) -> Result<usize> {
        let mut offset = 0;
        for (dim, (&i, &len)) in index.iter().zip(self.shape.iter()).enumerate() {
            if i >= len {
                return Err(TensorError::IndexOutOfBounds {
                    index: index.to_vec(),
                    shape: self.shape.to_vec(),
                });
            }
            offset += i * self.strides[dim];
        }
        Ok(offset)
    }

    /// Returns the element at `index`, or `None` when it is out of bounds.
    pub fn get(&self, index: [usize; RANK]) -> Option<&T> {
        self.offset(index).ok().map(|o| &self.data[o])
    }

    /// Returns the contiguous run of elements that share the leading `RANK - 1` coordinates given
    /// by `prefix`, i.e. the innermost dimension.
    ///
    /// For a `[B, B, G]` label matrix, `lane(&[i, j])` is the G-vector for cell `(i, j)`.
    pub fn lane(&self, prefix: &[usize]) -> Result<&[T]> {
        let start = self.lane_start(prefix)?;
        let width = self.shape[RANK - 1];
        Ok(&self.data[start..start + width])
    }

    fn lane_start(&self, prefix: &[usize]) -> Result<usize> {
        if RANK == 0 || prefix.len() + 1 != RANK {
            return Err(TensorError::Unsupported(format!(
                "lane prefix of length {} on a rank {RANK} tensor",
                prefix.len()
            )));
        }
        let mut start = 0;
        for (dim, &i) in prefix.iter().enumerate() {
            if i >= self.shape[dim] {
                return Err(TensorError::IndexOutOfBounds {
                    index: prefix.to_vec(),
                    shape: self.shape.to_vec(),
                });
            }
            start += i * self.strides[dim];
        }
        Ok(start)
    }
}

/// Computes row-major strides for a given shape.
const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T: TensorElem> From<Vec<T>> for Tensor<T, 1> {
    fn from(data: Vec<T>) -> Self {
        let len = data.len();
        Self {
            shape: [len],
            strides: [1],
            data,
        }
    }
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}
