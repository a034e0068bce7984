//! Task-head compositions
//!
//! Each head is a thin composition of a projection and the loss primitives
//! in [`crate::loss`]; no loss logic lives here. Heads own only their learned
//! projections, receive encoder output and embedding-store lookups from the
//! caller, and return a scalar loss (or score/representation outputs on the
//! evaluation paths).

mod knowledge;
mod projection;
mod ranking;
mod span;

pub use knowledge::{
    CorruptedEntities, CorruptionSide, KnowledgeBatch, KnowledgeEmbeddingHead,
    KnowledgeHeadConfig, RelationSource,
};
pub use projection::ProjectionHead;
pub use ranking::{last_token, EntityRankingHead, RankingHeadConfig};
pub use span::SpanHead;
