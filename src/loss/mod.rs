//! Candidate-set loss primitives
//!
//! The numerical core shared by every task head:
//!
//! - `score` - Pairwise scoring functions (translational, dot, cosine)
//! - `layout` - Named query/positive/negative batch partitions
//! - `sampler` - Negative scoring with in-batch false-negative masking
//! - `contrastive` - Listwise softmax and self-adversarial margin losses
//! - `marginal` - Multi-positive marginal cross-entropy for span prediction
//!
//! All primitives are pure functions of their inputs: no caches, no shared
//! mutable state, safe to call independently per device shard. Malformed
//! batches abort the step with a typed [`LossError`]; expected numerical
//! degeneracies (zero-norm vectors, all-masked target rows) are absorbed with
//! finite sentinel values instead, so backpropagation never sees an infinity.

mod contrastive;
mod error;
mod layout;
mod marginal;
mod sampler;
mod score;

pub use contrastive::{
    self_adversarial_weights, CandidateBatch, ContrastiveLossConfig, ContrastiveLossEngine,
    MarginLossOptions,
};
pub use error::LossError;
pub use layout::{flatten_segments, unflatten_index, CandidateBatchLayout, CandidateGroups};
pub use marginal::MarginalSpanLoss;
pub use sampler::{NegativeIdentifiers, NegativeRegime, NegativeSampler, DEFAULT_MASK_VALUE};
pub use score::ScoreFn;
