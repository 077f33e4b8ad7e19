//! Importance-Matrix Collection
//!
//! This crate gathers per-feature activation statistics for the weight
//! tensors of a model while it decodes calibration text, and persists them
//! as an importance matrix for quantization:
//!
//! - **Collection**: Two-phase graph callback folding mean squared activations
//!   into per-tensor records, including expert-routed multiplies
//! - **Persistence**: Count-weighted binary format that merges exactly across runs
//! - **Perplexity**: Parallel log-softmax scan over the produced logits
//! - **Layer Importance**: Cosine-based score between consecutive layers
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                      Calibration Driver                            │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                                                                    │
//! │  ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐ │
//! │  │  ModelRuntime   │    │    Collector    │    │   StatsStore    │ │
//! │  │  decode(batch)  │ -> │   ask/collect   │ -> │ name → Stats    │ │
//! │  └─────────────────┘    └─────────────────┘    └─────────────────┘ │
//! │           │                     │                      │           │
//! │           ↓                     ↓                      ↓           │
//! │  ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐ │
//! │  │  LogitScanner   │    │   Checkpoints   │    │   LIM Report    │ │
//! │  │  ppl ± stddev   │    │  imatrix.dat    │    │ -cos(Lᵢ, Lᵢ₊₁)  │ │
//! │  └─────────────────┘    └─────────────────┘    └─────────────────┘ │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Invariants
//!
//! 1. **Saved values are count-weighted**: each stored value is the mean of
//!    squares scaled by the record's call count, so loading several files
//!    and saving again reproduces the call-weighted average
//!
//! 2. **Shape is fixed at first sight**: a record never changes its cell
//!    count; a conflicting observation aborts the run
//!
//! 3. **Incomplete records are not written**: records with uncovered cells are
//!    dropped, except routed records missing only a few experts, which get a
//!    neutral placeholder in the written copy

mod collector;
mod config;
mod error;
mod format;
mod lim;
mod name;
mod perplexity;
mod run;
mod stats;
mod tensor;

pub use collector::{Admission, Collector, Interest};
pub use config::{ImatrixConfig, DEFAULT_OUT_FILE};
pub use error::{ImatrixError, Result};
pub use format::{
    curate, load_into, read_from, save, write_to, CuratedEntry, LoadSummary, SaveSummary,
    SavedEntry, SavedMatrix, Trailer, PATCHABLE_EXPERT_FRACTION,
};
pub use lim::{analyze, lim_score, GroupResult, LimEntry, LimGroup, LimReport, LimScore};
pub use name::{canonical_name, LayerName};
pub use perplexity::{log_softmax, LogSoftmax, LogitScanner, NllAccumulator, PerplexityEstimate};
pub use run::{run_session, CalibrationRun, ModelRuntime, RunSummary, SessionSummary, Token};
pub use stats::{CellFault, ExpertView, Stats, StatsStore};
pub use tensor::{f32_bytes, i32_bytes, ElementType, GraphNode, OpKind, TensorBuffer, TensorView};

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        Collector, GraphNode, ImatrixConfig, ImatrixError, LimReport, ModelRuntime, Result,
        StatsStore, TensorView,
    };
}
