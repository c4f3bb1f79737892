//! # Data-parallel replicas
//!
//! Every replica holds the *same* parameters and processes a *different* batch. One step looks
//! like this:
//!
//! ```text
//!            params (read-only)
//!          /        |         \
//!   replica 0   replica 1 ... replica R-1     each: dequeue -> infer -> loss -> gradients
//!          \        |         /
//!        average_gradients (barrier)
//!                   |
//!        optimizer update (single writer)
//! ```
//!
//! Replicas run on a dedicated `rayon` pool and never write to shared parameters; they return
//! gradient maps that [`average_gradients`] combines in replica order, so the result does not
//! depend on which replica finished first.

pub mod reduce;
pub mod replica;

pub use reduce::average_gradients;
pub use replica::{EvalOutput, Replica, ReplicaOutput, ReplicaPool};
