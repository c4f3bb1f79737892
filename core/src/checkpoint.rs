//! Checkpointing and Serialization.
//!
//! Checkpoints are `safetensors` files named `model.ckpt-<step>.safetensors`. Parameters are
//! stored under `param/<id>`, their moving averages under `ema/<id>`, optimizer slots under
//! `slot/<id>/<slot>`, and the global step in the `global_step` metadata entry.
//!
//! Writes normally go through [`CheckpointWriter`], which serializes on a background thread so
//! the training loop does not wait on disk.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{error, info, warn};

use crate::error::CheckpointError;
use crate::model::ParamMap;
use crate::tensor::Tensor;

const PREFIX: &str = "model.ckpt-";
const EXTENSION: &str = ".safetensors";
const PARAM_PREFIX: &str = "param/";
const EMA_PREFIX: &str = "ema/";
const SLOT_PREFIX: &str = "slot/";
const STEP_KEY: &str = "global_step";

/// Contents of a checkpoint file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    pub step: u64,
    pub params: ParamMap,
    pub averages: ParamMap,
    /// Optimizer state, see [`crate::optim::Optimizer::slots`].
    pub slots: ParamMap,
}

impl Checkpoint {
    pub fn new(step: u64, params: ParamMap) -> Self {
        Self {
            step,
            params,
            ..Self::default()
        }
    }

    pub fn with_averages(mut self, averages: ParamMap) -> Self {
        self.averages = averages;
        self
    }

    pub fn with_slots(mut self, slots: ParamMap) -> Self {
        self.slots = slots;
        self
    }
}

/// `<dir>/model.ckpt-<step>.safetensors`
pub fn checkpoint_path(dir: &Path, step: u64) -> PathBuf {
    dir.join(format!("{PREFIX}{step}{EXTENSION}"))
}

/// Writes `checkpoint` into `dir`. The file appears atomically.
pub fn save_checkpoint(dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
    let step = checkpoint.step;
    fs::create_dir_all(dir).map_err(|source| CheckpointError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = checkpoint_path(dir, step);

    let encoded: Vec<(String, Vec<u8>, Vec<usize>)> = checkpoint
        .params
        .iter()
        .map(|(k, t)| (format!("{PARAM_PREFIX}{k}"), t))
        .chain(checkpoint.averages.iter().map(|(k, t)| (format!("{EMA_PREFIX}{k}"), t)))
        .chain(checkpoint.slots.iter().map(|(k, t)| (format!("{SLOT_PREFIX}{k}"), t)))
        .map(|(name, t)| {
            let bytes = t.data().iter().flat_map(|v| v.to_le_bytes()).collect();
            (name, bytes, t.shape().to_vec())
        })
        .collect();

    let views = encoded
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| format_error(&path, e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut metadata = HashMap::new();
    metadata.insert(STEP_KEY.to_string(), step.to_string());
    let bytes = safetensors::serialize(views, Some(metadata)).map_err(|e| format_error(&path, e))?;

    let tmp = path.with_extension("safetensors.tmp");
    fs::write(&tmp, bytes).map_err(|source| CheckpointError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, &path).map_err(|source| CheckpointError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Reads a checkpoint written by [`save_checkpoint`].
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint, CheckpointError> {
    let path = path.as_ref();
    let buffer = fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let (_, header) = SafeTensors::read_metadata(&buffer).map_err(|e| format_error(path, e))?;
    let step = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(STEP_KEY))
        .and_then(|s| s.parse().ok())
        .or_else(|| step_from_path(path))
        .ok_or_else(|| CheckpointError::MissingStep {
            path: path.to_path_buf(),
        })?;

    let tensors = SafeTensors::deserialize(&buffer).map_err(|e| format_error(path, e))?;
    let mut checkpoint = Checkpoint {
        step,
        ..Checkpoint::default()
    };
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(format_error(path, format!("`{name}` is {:?}, expected F32", view.dtype())));
        }
        let data: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let tensor = Tensor::from(data);

        if let Some(key) = name.strip_prefix(PARAM_PREFIX) {
            checkpoint.params.insert(key.to_string(), tensor);
        } else if let Some(key) = name.strip_prefix(EMA_PREFIX) {
            checkpoint.averages.insert(key.to_string(), tensor);
        } else if let Some(key) = name.strip_prefix(SLOT_PREFIX) {
            checkpoint.slots.insert(key.to_string(), tensor);
        } else {
            warn!(path = %path.display(), tensor = %name, "ignoring unknown checkpoint tensor");
        }
    }
    Ok(checkpoint)
}

/// Checkpoints in `dir`, oldest first.
pub fn list_checkpoints(dir: &Path) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut found: Vec<(u64, PathBuf)> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter_map(|path| step_from_path(&path).map(|step| (step, path)))
        .collect();
    found.sort();
    Ok(found)
}

/// The checkpoint with the highest step in `dir`, if any.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    Ok(list_checkpoints(dir)?.pop().map(|(_, path)| path))
}

/// Copies every checkpoint parameter whose id and shape match into `params`. Returns how many
/// parameters were restored.
pub fn restore_matching(params: &mut ParamMap, checkpoint: &Checkpoint) -> usize {
    let mut restored = 0;
    for (key, param) in params.iter_mut() {
        match checkpoint.params.get(key) {
            Some(saved) if saved.shape() == param.shape() => {
                *param = saved.clone();
                restored += 1;
            }
            Some(saved) => {
                warn!(param = %key, saved = ?saved.shape(), current = ?param.shape(), "shape differs, keeping initial value");
            }
            None => {}
        }
    }
    restored
}

fn step_from_path(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(PREFIX)?
        .strip_suffix(EXTENSION)?
        .parse()
        .ok()
}

fn format_error(path: &Path, e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Format {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Snapshots the writer holds before `submit` blocks. Each one is a full copy of the model state.
const PENDING_WRITES: usize = 8;

/// Background checkpoint writer.
///
/// Submissions queue up behind the writer thread; `submit` only blocks once
/// `PENDING_WRITES` (8) writes are already pending. [`CheckpointWriter::finish`] waits for every pending write and reports the
/// first failure. Dropping the writer also waits, but discards errors.
pub struct CheckpointWriter {
    dir: PathBuf,
    tx: Option<Sender<Checkpoint>>,
    handle: Option<JoinHandle<Result<Vec<PathBuf>, CheckpointError>>>,
}

impl CheckpointWriter {
    /// Spawns the writer. Keeps at most `keep` checkpoints in `dir` (`0` keeps all).
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        let (tx, rx) = channel::bounded::<Checkpoint>(PENDING_WRITES);
        let thread_dir = dir.clone();
        let handle = thread::Builder::new()
            .name("checkpoint-writer".into())
            .spawn(move || {
                let mut written = Vec::new();
                let mut first_error = None;
                for job in rx {
                    match save_checkpoint(&thread_dir, &job) {
                        Ok(path) => {
                            info!(step = job.step, path = %path.display(), "checkpoint written");
                            written.push(path);
                            prune(&thread_dir, keep);
                        }
                        Err(e) => {
                            error!(step = job.step, error = %e, "checkpoint write failed");
                            first_error.get_or_insert(e);
                        }
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(written),
                }
            })
            .map_err(|source| CheckpointError::Io {
                path: dir.clone(),
                source,
            })?;

        Ok(Self {
            dir,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queues a snapshot for writing.
    pub fn submit(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let tx = self.tx.as_ref().ok_or(CheckpointError::WriterGone)?;
        tx.send(checkpoint).map_err(|_| CheckpointError::WriterGone)
    }

    /// Waits for all pending writes. Returns every path written, in order.
    pub fn finish(mut self) -> Result<Vec<PathBuf>, CheckpointError> {
        self.join()
    }

    fn join(&mut self) -> Result<Vec<PathBuf>, CheckpointError> {
        drop(self.tx.take());
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| CheckpointError::WriterGone)?,
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        let _ = self.join();
    }
}

fn prune(dir: &Path, keep: usize) {
    if keep == 0 {
        return;
    }
    let Ok(mut existing) = list_checkpoints(dir) else {
        return;
    };
    while existing.len() > keep {
        let (step, path) = existing.remove(0);
        if let Err(e) = fs::remove_file(&path) {
            warn!(step, path = %path.display(), error = %e, "cannot remove old checkpoint");
        }
    }
}
