use std::io::Write;
use std::sync::Arc;

use aquila::data::{BatchSampler, PairIndex, SamplerConfig, build_label_matrices};
use aquila::error::DataError;

fn write_corpus(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_from_disk() {
    let file = write_corpus(
        "# left,right,<3 groups left>,<3 groups right>\n\
         p1.jpg,p2.jpg,2,0,1,0,1,1\n\
         p2.jpg,p3.jpg,0,0,0,4,0,0\n\
         p3.jpg,p4.jpg,1,1,1,1,1,1\n",
    );
    let index = PairIndex::from_path(file.path(), 3).unwrap();
    assert_eq!(index.len(), 4);
    assert_eq!(index.pair_count(), 3);
    assert_eq!(index.lookup("p2.jpg", "p1.jpg").unwrap().label, vec![0.0, 1.0, 1.0]);
    assert_eq!(index.lookup("p2.jpg", "p3.jpg").unwrap().conf, vec![4.0, 0.0, 0.0]);
    assert!(index.lookup("p1.jpg", "p3.jpg").is_none());
}

#[test]
fn test_missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = PairIndex::from_path(dir.path().join("absent.csv"), 2).unwrap_err();
    assert!(matches!(err, DataError::Io { .. }));
}

#[test]
fn test_errors_carry_line_numbers() {
    let file = write_corpus("a,b,1,0\n\nb,c,1,0,0\n");
    let err = PairIndex::from_path(file.path(), 1).unwrap_err();
    assert_eq!(
        err,
        DataError::Schema {
            line: 3,
            expected: 2,
            found: 3
        }
    );

    let file = write_corpus("a,b,1,x\n");
    assert!(matches!(
        PairIndex::from_path(file.path(), 1),
        Err(DataError::Format { line: 1, .. })
    ));
}

#[test]
fn test_sampled_batches_have_symmetric_confidence() {
    let mut records = Vec::new();
    let names: Vec<String> = (0..30).map(|i| format!("n{i}")).collect();
    let labels = [([3.0f32, 0.0], [1.0f32, 2.0]), ([0.0, 1.0], [0.0, 0.0])];
    for i in 0..30 {
        let (ab, ba) = &labels[i % 2];
        records.push((names[i].as_str(), names[(i + 1) % 30].as_str(), &ab[..], &ba[..]));
        records.push((names[i].as_str(), names[(i + 4) % 30].as_str(), &ba[..], &ab[..]));
    }
    let index = Arc::new(PairIndex::from_records(records, 2).unwrap());

    let mut sampler = BatchSampler::new(Arc::clone(&index), SamplerConfig::new(6)).unwrap();
    for _ in 0..50 {
        let batch = sampler.next_batch();
        let (labels, conf) = build_label_matrices(&batch, &index);
        for i in 0..6 {
            for j in 0..6 {
                for g in 0..2 {
                    assert_eq!(conf.get([i, j, g]), conf.get([j, i, g]));
                    let c = *conf.get([i, j, g]).unwrap();
                    let l = *labels.get([i, j, g]).unwrap() + *labels.get([j, i, g]).unwrap();
                    assert_eq!(c, l);
                }
            }
        }
    }
}
