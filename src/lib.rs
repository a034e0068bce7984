//! # RustKELab (RKL)
//!
//! Candidate-set loss primitives for joint language-model and
//! knowledge-embedding training, built on Candle.
//!
//! ## Overview
//!
//! RKL provides the numerical core shared by a family of task heads sitting
//! on top of a text encoder:
//!
//! - Scoring functions for entity/candidate pairs (translational distance,
//!   dot product, temperature-scaled cosine)
//! - Named query/positive/negative batch layouts
//! - Negative sampling with in-batch false-negative masking
//! - Contrastive losses (listwise softmax and self-adversarial margin
//!   logistic)
//! - Multi-positive marginal cross-entropy for extractive span prediction
//!   over segmented documents
//!
//! The encoder and the (potentially sharded) entity embedding store are
//! consumed as opaque services through the traits in [`encoder`]; RKL never
//! touches their internals.
//!
//! ## Architecture
//!
//! - `device` - CPU/CUDA/Metal device selection
//! - `encoder` - Encoder and embedding-store collaborator traits
//! - `loss` - Score functions, batch layouts, samplers, and loss engines
//! - `heads` - Thin task-head compositions of the loss primitives

pub mod device;
pub mod encoder;
pub mod heads;
pub mod loss;

// Re-export commonly used types
pub use anyhow::{Error, Result};

pub use device::{select_device, DevicePreference};
pub use encoder::{EmbeddingStore, EncoderModel, EncoderOutput};
pub use heads::{EntityRankingHead, KnowledgeEmbeddingHead, ProjectionHead, SpanHead};
pub use loss::{
    CandidateBatchLayout, ContrastiveLossConfig, ContrastiveLossEngine, LossError,
    MarginalSpanLoss, NegativeRegime, NegativeSampler, ScoreFn,
};
