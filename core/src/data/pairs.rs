//! In-memory index of labeled item pairs.
//!
//! The corpus is line oriented: `itemA,itemB,<2G integers>`. The first `G` integers are the
//! label vector for the ordered pair `(A, B)`, the next `G` are for `(B, A)`. Each group's
//! confidence is the number of judgments recorded for the pair in that group
//! (`|label_ab| + |label_ba|`), the same in both directions; a group nobody judged has zero
//! confidence and carries no supervision.
//!
//! The index is immutable once built and is shared between sampler threads behind an `Arc`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{info, warn};

use super::ItemId;
use crate::error::DataError;

/// Label and confidence vectors for one ordered pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairLabels {
    pub label: Vec<f32>,
    pub conf: Vec<f32>,
}

/// Item adjacency plus directional pair labels.
#[derive(Debug)]
pub struct PairIndex {
    groups: usize,
    names: Vec<String>,
    ids: HashMap<String, ItemId>,
    partners: Vec<Vec<ItemId>>,
    pairs: HashMap<(ItemId, ItemId), PairLabels>,
}

impl PairIndex {
    /// Starts building an index with `groups` label dimensions.
    pub fn builder(groups: usize) -> PairIndexBuilder {
        PairIndexBuilder {
            groups,
            names: Vec::new(),
            ids: HashMap::new(),
            pairs: HashMap::new(),
        }
    }

    /// Loads a corpus file.
    pub fn from_path<P: AsRef<Path>>(path: P, groups: usize) -> Result<Self, DataError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| DataError::io(path, &e))?;
        let index = Self::from_reader(BufReader::new(file), groups)?;
        info!(
            path = %path.display(),
            items = index.len(),
            pairs = index.pair_count(),
            "loaded pair corpus"
        );
        Ok(index)
    }

    /// Parses a corpus from any buffered reader.
    pub fn from_reader<R: BufRead>(reader: R, groups: usize) -> Result<Self, DataError> {
        let mut builder = Self::builder(groups);
        for (n, line) in reader.lines().enumerate() {
            let line_no = n + 1;
            let line = line.map_err(|e| DataError::format(line_no, e.to_string()))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            builder.parse_record(line_no, line)?;
        }
        Ok(builder.build())
    }

    /// Builds an index from `(a, b, label_ab, label_ba)` records.
    pub fn from_records<'a, I>(records: I, groups: usize) -> Result<Self, DataError>
    where
        I: IntoIterator<Item = (&'a str, &'a str, &'a [f32], &'a [f32])>,
    {
        let mut builder = Self::builder(groups);
        for (line_no, (a, b, label_ab, label_ba)) in records.into_iter().enumerate() {
            builder.insert_pair(line_no + 1, a, b, label_ab, label_ba)?;
        }
        Ok(builder.build())
    }

    /// Number of label groups (G).
    pub fn groups(&self) -> usize {
        self.groups
    }

    /// Number of distinct items.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of unordered pairs with a record.
    pub fn pair_count(&self) -> usize {
        self.pairs.len() / 2
    }

    pub fn item_id(&self, name: &str) -> Option<ItemId> {
        self.ids.get(name).copied()
    }

    pub fn item_name(&self, id: ItemId) -> Option<&str> {
        self.names.get(id.index()).map(String::as_str)
    }

    /// Iterates over all item ids in first-seen order.
    pub fn item_ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        (0..self.names.len()).map(ItemId::from_index)
    }

    /// Partners of `id`, ordered by item id.
    pub fn partners(&self, id: ItemId) -> &[ItemId] {
        self.partners
            .get(id.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of recorded partners of `id`.
    pub fn degree(&self, id: ItemId) -> usize {
        self.partners(id).len()
    }

    /// Directional lookup: `lookup_ids(a, b)` and `lookup_ids(b, a)` may carry different labels.
    pub fn lookup_ids(&self, a: ItemId, b: ItemId) -> Option<&PairLabels> {
        self.pairs.get(&(a, b))
    }

    /// Directional lookup by item name.
    pub fn lookup(&self, a: &str, b: &str) -> Option<&PairLabels> {
        let a = self.item_id(a)?;
        let b = self.item_id(b)?;
        self.lookup_ids(a, b)
    }
}

/// Incremental constructor for [`PairIndex`].
#[derive(Debug)]
pub struct PairIndexBuilder {
    groups: usize,
    names: Vec<String>,
    ids: HashMap<String, ItemId>,
    pairs: HashMap<(ItemId, ItemId), PairLabels>,
}

impl PairIndexBuilder {
    /// Registers an item. Items without any pair are valid and sampleable.
    pub fn add_item(&mut self, name: &str) -> ItemId {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = ItemId::from_index(self.names.len());
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Records the pair `(a, b)` with the label vectors for both directions.
    ///
    /// A repeated pair replaces the earlier record.
    pub fn add_pair(
        &mut self,
        a: &str,
        b: &str,
        label_ab: &[f32],
        label_ba: &[f32],
    ) -> Result<(), DataError> {
        self.insert_pair(0, a, b, label_ab, label_ba)
    }

    fn parse_record(&mut self, line_no: usize, line: &str) -> Result<(), DataError> {
        let mut fields = line.split(',').map(str::trim);
        let a = fields.next().unwrap_or_default();
        let Some(b) = fields.next() else {
            return Err(DataError::format(line_no, "expected `itemA,itemB,<labels>`"));
        };

        let values = fields
            .map(|f| {
                f.parse::<i64>()
                    .map(|v| v as f32)
                    .map_err(|_| DataError::format(line_no, format!("`{f}` is not an integer")))
            })
            .collect::<Result<Vec<f32>, _>>()?;

        if values.len() != 2 * self.groups {
            return Err(DataError::Schema {
                line: line_no,
                expected: 2 * self.groups,
                found: values.len(),
            });
        }

        let (label_ab, label_ba) = values.split_at(self.groups);
        self.insert_pair(line_no, a, b, label_ab, label_ba)
    }

    fn insert_pair(
        &mut self,
        line_no: usize,
        a: &str,
        b: &str,
        label_ab: &[f32],
        label_ba: &[f32],
    ) -> Result<(), DataError> {
        if a.is_empty() || b.is_empty() {
            return Err(DataError::format(line_no, "empty item name"));
        }
        if a == b {
            return Err(DataError::format(line_no, format!("`{a}` is paired with itself")));
        }
        if label_ab.len() != self.groups || label_ba.len() != self.groups || self.groups == 0 {
            return Err(DataError::Schema {
                line: line_no,
                expected: 2 * self.groups,
                found: label_ab.len() + label_ba.len(),
            });
        }

        let conf: Vec<f32> = label_ab
            .iter()
            .zip(label_ba)
            .map(|(x, y)| x.abs() + y.abs())
            .collect();

        let a = self.add_item(a);
        let b = self.add_item(b);
        let previous = self.pairs.insert(
            (a, b),
            PairLabels {
                label: label_ab.to_vec(),
                conf: conf.clone(),
            },
        );
        self.pairs.insert(
            (b, a),
            PairLabels {
                label: label_ba.to_vec(),
                conf,
            },
        );
        if previous.is_some() {
            warn!(line = line_no, a = a.0, b = b.0, "duplicate pair record replaces earlier one");
        }
        Ok(())
    }

    /// Finalizes the index.
    pub fn build(self) -> PairIndex {
        let mut partners = vec![Vec::new(); self.names.len()];
        let mut keys: Vec<(ItemId, ItemId)> = self.pairs.keys().copied().collect();
        keys.sort_unstable();
        for (a, b) in keys {
            partners[a.index()].push(b);
        }

        PairIndex {
            groups: self.groups,
            names: self.names,
            ids: self.ids,
            partners,
            pairs: self.pairs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORPUS: &str = "\
# two groups
a.jpg,b.jpg,1,0,0,2
b.jpg,c.jpg,3,1,1,0

a.jpg,c.jpg,0,0,0,0
";

    #[test]
    fn test_parses_directional_labels() {
        let index = PairIndex::from_reader(CORPUS.as_bytes(), 2).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.pair_count(), 3);

        let ab = index.lookup("a.jpg", "b.jpg").unwrap();
        assert_eq!(ab.label, vec![1.0, 0.0]);
        assert_eq!(ab.conf, vec![1.0, 2.0]);

        let ba = index.lookup("b.jpg", "a.jpg").unwrap();
        assert_eq!(ba.label, vec![0.0, 2.0]);
        assert_eq!(ba.conf, ab.conf);

        let ac = index.lookup("a.jpg", "c.jpg").unwrap();
        assert_eq!(ac.conf, vec![0.0, 0.0]);
    }

    #[test]
    fn test_degree_counts_partners() {
        let index = PairIndex::from_reader(CORPUS.as_bytes(), 2).unwrap();
        let a = index.item_id("a.jpg").unwrap();
        let b = index.item_id("b.jpg").unwrap();
        assert_eq!(index.degree(a), 2);
        assert_eq!(index.degree(b), 2);
        assert!(index.partners(a).contains(&b));
    }

    #[test]
    fn test_wrong_label_count_is_schema_error() {
        let err = PairIndex::from_reader("a,b,1,0,1\n".as_bytes(), 2).unwrap_err();
        assert_eq!(
            err,
            DataError::Schema {
                line: 1,
                expected: 4,
                found: 3
            }
        );
    }

    #[test]
    fn test_non_integer_is_format_error() {
        let err = PairIndex::from_reader("a,b,1,x,0,0\n".as_bytes(), 2).unwrap_err();
        assert!(matches!(err, DataError::Format { line: 1, .. }));

        let err = PairIndex::from_reader("lonely\n".as_bytes(), 2).unwrap_err();
        assert!(matches!(err, DataError::Format { line: 1, .. }));
    }

    #[test]
    fn test_self_pair_is_rejected() {
        let err = PairIndex::from_reader("a,a,1,0\n".as_bytes(), 1).unwrap_err();
        assert!(matches!(err, DataError::Format { .. }));
    }

    #[test]
    fn test_duplicate_record_last_wins() {
        let index = PairIndex::from_reader("a,b,1,0\nb,a,5,7\n".as_bytes(), 1).unwrap();
        assert_eq!(index.pair_count(), 1);
        assert_eq!(index.lookup("a", "b").unwrap().label, vec![7.0]);
        assert_eq!(index.lookup("b", "a").unwrap().label, vec![5.0]);
        assert_eq!(index.degree(index.item_id("a").unwrap()), 1);
    }

    #[test]
    fn test_from_records_matches_parsed_corpus() {
        let records: [(&str, &str, &[f32], &[f32]); 2] = [
            ("a.jpg", "b.jpg", &[1.0, 0.0], &[0.0, 2.0]),
            ("b.jpg", "c.jpg", &[3.0, 1.0], &[1.0, 0.0]),
        ];
        let index = PairIndex::from_records(records, 2).unwrap();
        let parsed = PairIndex::from_reader(CORPUS.as_bytes(), 2).unwrap();
        assert_eq!(index.lookup("b.jpg", "c.jpg"), parsed.lookup("b.jpg", "c.jpg"));
        assert_eq!(index.pair_count(), 2);
    }

    #[test]
    fn test_isolated_items_have_zero_degree() {
        let mut builder = PairIndex::builder(1);
        builder.add_pair("a", "b", &[1.0], &[0.0]).unwrap();
        let z = builder.add_item("null.jpg");
        let index = builder.build();
        assert_eq!(index.len(), 3);
        assert_eq!(index.degree(z), 0);
        assert!(index.partners(z).is_empty());
    }
}
