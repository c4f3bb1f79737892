//! Dense pairwise supervision for a sampled batch.

use super::{Batch, PairIndex};
use crate::tensor::Tensor;

/// Builds the `[B, B, G]` label and confidence matrices for `batch`.
///
/// Cell `(i, j)` holds the labels of the ordered pair `(batch[i], batch[j])`. The diagonal and
/// every pair without a record stay zero in both matrices: zero confidence means the cell carries
/// no supervision and must not contribute to the loss.
pub fn build_label_matrices(batch: &Batch, index: &PairIndex) -> (Tensor<f32, 3>, Tensor<f32, 3>) {
    let b = batch.len();
    let g = index.groups();
    let mut labels = Tensor::<f32, 3>::zeros([b, b, g]);
    let mut conf = Tensor::<f32, 3>::zeros([b, b, g]);

    let items = batch.items();
    for (i, &x) in items.iter().enumerate() {
        for (j, &y) in items.iter().enumerate() {
            if i == j {
                continue;
            }
            let Some(pair) = index.lookup_ids(x, y) else {
                continue;
            };
            let cell = (i * b + j) * g;
            labels.data_mut()[cell..cell + g].copy_from_slice(&pair.label);
            conf.data_mut()[cell..cell + g].copy_from_slice(&pair.conf);
        }
    }

    (labels, conf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> PairIndex {
        let corpus = "a,b,1,0,0,2\nb,c,3,1,1,0\n";
        PairIndex::from_reader(corpus.as_bytes(), 2).unwrap()
    }

    fn batch(index: &PairIndex, names: &[&str]) -> Batch {
        names
            .iter()
            .map(|n| index.item_id(n).unwrap())
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn test_places_labels_at_ordered_cells() {
        let index = index();
        let batch = batch(&index, &["c", "a", "b"]);
        let (labels, conf) = build_label_matrices(&batch, &index);
        assert_eq!(labels.shape(), &[3, 3, 2]);

        // (a, b) is cell (1, 2); (b, a) is cell (2, 1).
        assert_eq!(labels.lane(&[1, 2]).unwrap(), &[1.0, 0.0]);
        assert_eq!(labels.lane(&[2, 1]).unwrap(), &[0.0, 2.0]);
        assert_eq!(conf.lane(&[1, 2]).unwrap(), &[1.0, 2.0]);

        // (b, c) is cell (2, 0).
        assert_eq!(labels.lane(&[2, 0]).unwrap(), &[3.0, 1.0]);
        assert_eq!(labels.lane(&[0, 2]).unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn test_missing_pairs_and_diagonal_are_zero() {
        let index = index();
        let batch = batch(&index, &["a", "c", "b"]);
        let (labels, conf) = build_label_matrices(&batch, &index);

        for cell in [[0, 0], [1, 1], [0, 1], [1, 0]] {
            assert_eq!(labels.lane(&cell).unwrap(), &[0.0, 0.0]);
            assert_eq!(conf.lane(&cell).unwrap(), &[0.0, 0.0]);
        }
    }
}
