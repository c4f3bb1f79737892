//! # aquila
//!
//! `aquila` trains pairwise ranking models: given two items, predict which one ranks higher in
//! each of several attribute groups, weighted by how many judgments back each comparison.
//!
//! The crate does not define a network. It supplies everything around one:
//!
//! - [`data`]: the pair corpus, a degree-weighted batch sampler, dense label matrices, and a
//!   bounded producer/consumer queue that streams batches to the replicas.
//! - [`train`]: the multi-replica loop with gradient averaging, learning-rate decay, moving
//!   averages, validation and checkpointing.
//! - [`distributed`]: replica lanes and the gradient barrier.
//! - [`optim`]: RMSProp and momentum optimizers, learning-rate schedules.
//! - [`loss`]: RankNet loss and pairwise accuracy for `[B, G]` scores.
//! - [`checkpoint`]: `safetensors` checkpoints.
//! - [`mod@tensor`]: the dense row-major container everything above passes around.
//!
//! ## Example
//!
//! ```rust
//! use aquila::data::{PairIndex, build_label_matrices};
//!
//! let corpus = "a.jpg,b.jpg,2,0,1,1\nb.jpg,c.jpg,0,3,0,0\n";
//! let index = PairIndex::from_reader(corpus.as_bytes(), 2).unwrap();
//! assert_eq!(index.lookup("a.jpg", "b.jpg").unwrap().conf, vec![3.0, 1.0]);
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod tensor;
pub mod train;

pub use config::TrainingConfig;
pub use error::{TrainError, TrainResult};
pub use model::{GradientMap, Model, ParamMap};
pub use tensor::{Tensor, TensorElem, TensorError};
pub use train::{StopReason, Trainer, TrainingSummary};
