use std::collections::HashMap;

use aquila::checkpoint::{
    Checkpoint, CheckpointWriter, checkpoint_path, latest_checkpoint, load_checkpoint, save_checkpoint,
};
use aquila::error::CheckpointError;
use aquila::{ParamMap, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

fn params() -> ParamMap {
    let mut p = ParamMap::new();
    p.insert("ranker/weights".into(), Tensor::from(vec![1.0, 2.0, 3.0]));
    p.insert("ranker/scale".into(), Tensor::from(vec![0.25]));
    p
}

#[test]
fn test_file_layout() {
    let dir = tempfile::tempdir().unwrap();
    let mut averages = params();
    averages.get_mut("ranker/scale").unwrap().data_mut()[0] = 0.2;
    let mut slots = ParamMap::new();
    slots.insert("ranker/weights/rms".into(), Tensor::from(vec![1.0, 1.0, 1.0]));
    let checkpoint = Checkpoint::new(300, params()).with_averages(averages).with_slots(slots);
    let path = save_checkpoint(dir.path(), &checkpoint).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
    let metadata = header.metadata().as_ref().unwrap();
    assert_eq!(metadata.get("global_step").map(String::as_str), Some("300"));

    let tensors = SafeTensors::deserialize(&bytes).unwrap();
    let mut names: Vec<String> = tensors.names().into_iter().map(|s| s.to_string()).collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "ema/ranker/scale",
            "ema/ranker/weights",
            "param/ranker/scale",
            "param/ranker/weights",
            "slot/ranker/weights/rms"
        ]
    );

    let weights = tensors.tensor("param/ranker/weights").unwrap();
    assert_eq!(weights.dtype(), Dtype::F32);
    assert_eq!(weights.shape(), &[3]);
    let scale = tensors.tensor("ema/ranker/scale").unwrap();
    assert_eq!(scale.data(), 0.2f32.to_le_bytes().as_slice());
}

#[test]
fn test_step_falls_back_to_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint_path(dir.path(), 7);

    let bytes: Vec<u8> = [4.0f32, 5.0].iter().flat_map(|v| v.to_le_bytes()).collect();
    let view = TensorView::new(Dtype::F32, vec![2], &bytes).unwrap();
    let mut views = HashMap::new();
    views.insert("param/w".to_string(), view);
    std::fs::write(&path, safetensors::serialize(views, None).unwrap()).unwrap();

    let checkpoint = load_checkpoint(&path).unwrap();
    assert_eq!(checkpoint.step, 7);
    assert_eq!(checkpoint.params["w"].data(), &[4.0, 5.0]);
    assert!(checkpoint.averages.is_empty());
    assert!(checkpoint.slots.is_empty());
}

#[test]
fn test_missing_step_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.safetensors");
    let bytes = 1.0f32.to_le_bytes();
    let view = TensorView::new(Dtype::F32, vec![1], &bytes).unwrap();
    let mut views = HashMap::new();
    views.insert("param/w".to_string(), view);
    std::fs::write(&path, safetensors::serialize(views, None).unwrap()).unwrap();

    assert!(matches!(
        load_checkpoint(&path),
        Err(CheckpointError::MissingStep { .. })
    ));
}

#[test]
fn test_corrupt_file_is_a_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = checkpoint_path(dir.path(), 1);
    std::fs::write(&path, b"definitely not safetensors").unwrap();
    assert!(matches!(load_checkpoint(&path), Err(CheckpointError::Format { .. })));
}

#[test]
fn test_writer_keeps_all_when_unbounded() {
    let dir = tempfile::tempdir().unwrap();
    let writer = CheckpointWriter::new(dir.path().join("nested"), 0).unwrap();
    for step in 1..=5 {
        writer.submit(Checkpoint::new(step, params())).unwrap();
    }
    let written = writer.finish().unwrap();

    assert_eq!(written.len(), 5);
    assert!(written.iter().all(|p| p.exists()));
    assert_eq!(
        latest_checkpoint(&dir.path().join("nested")).unwrap(),
        Some(checkpoint_path(&dir.path().join("nested"), 5))
    );
    // No temporary files are left behind.
    let leftovers = std::fs::read_dir(dir.path().join("nested"))
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            !name.to_string_lossy().ends_with(".safetensors")
        })
        .count();
    assert_eq!(leftovers, 0);
}
