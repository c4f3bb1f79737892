//! Item loaders: turn an item name into its fixed-size `[H, W, C]` tensor.
//!
//! Image decoding lives outside this crate. [`RawItemLoader`] reads items that were already
//! decoded to little-endian `f32` files; [`SyntheticItemLoader`] fabricates deterministic data
//! for smoke runs and tests.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::DataError;
use crate::tensor::Tensor;

/// Source of per-item tensors. Shared by every producer thread of a pipeline.
pub trait ItemLoader: Send + Sync {
    /// The `[H, W, C]` shape every loaded item has.
    fn item_shape(&self) -> [usize; 3];

    /// Loads one item. Failures are reported as [`DataError::ItemLoad`].
    fn load(&self, name: &str) -> Result<Tensor<f32, 3>, DataError>;
}

/// Memory-maps `<root>/<name>` and decodes it as raw little-endian `f32` values.
#[derive(Debug, Clone)]
pub struct RawItemLoader {
    root: PathBuf,
    shape: [usize; 3],
}

impl RawItemLoader {
    pub fn new(root: impl Into<PathBuf>, shape: [usize; 3]) -> Self {
        Self {
            root: root.into(),
            shape,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ItemLoader for RawItemLoader {
    fn item_shape(&self) -> [usize; 3] {
        self.shape
    }

    fn load(&self, name: &str) -> Result<Tensor<f32, 3>, DataError> {
        let path = self.root.join(name);
        let file = File::open(&path).map_err(|e| DataError::item_load(name, e.to_string()))?;
        // SAFETY: the mapping is read-only and dropped before this function returns; item
        // files are not rewritten while training runs.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| DataError::item_load(name, e.to_string()))?;

        let expected = self.shape.iter().product::<usize>() * std::mem::size_of::<f32>();
        if mmap.len() != expected {
            return Err(DataError::item_load(
                name,
                format!("expected {expected} bytes for shape {:?}, found {}", self.shape, mmap.len()),
            ));
        }

        let data = mmap
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Tensor::new(data, self.shape).map_err(|e| DataError::item_load(name, e.to_string()))
    }
}

/// Deterministic pseudo-items derived from a hash of the item name.
///
/// Names listed in `failing` always fail to load, which is how tests exercise the drop policy.
#[derive(Debug, Clone, Default)]
pub struct SyntheticItemLoader {
    shape: [usize; 3],
    failing: HashSet<String>,
}

impl SyntheticItemLoader {
    pub fn new(shape: [usize; 3]) -> Self {
        Self {
            shape,
            failing: HashSet::new(),
        }
    }

    pub fn with_failing<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing.extend(names.into_iter().map(Into::into));
        self
    }
}

impl ItemLoader for SyntheticItemLoader {
    fn item_shape(&self) -> [usize; 3] {
        self.shape
    }

    fn load(&self, name: &str) -> Result<Tensor<f32, 3>, DataError> {
        if self.failing.contains(name) {
            return Err(DataError::item_load(name, "synthetic failure"));
        }

        // FNV-1a seed, then an xorshift stream mapped into [0, 1).
        let mut state = name
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
        let size: usize = self.shape.iter().product();
        let data = (0..size)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 40) as f32 / (1u64 << 24) as f32
            })
            .collect();
        Tensor::new(data, self.shape).map_err(|e| DataError::item_load(name, e.to_string()))
    }
}
