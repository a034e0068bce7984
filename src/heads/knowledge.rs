//! Knowledge-embedding task head
//!
//! Joint language-model + knowledge-embedding training over (head, relation,
//! tail) triples. Entity vectors come from the embedding store; the relation
//! vector comes either from a learned relation table or from the text
//! encoder's output projected through a relation head and scaled by a small
//! coefficient so the randomly-initialized text branch cannot swamp the
//! translational geometry early in training.
//!
//! The loss is the margin logistic formulation with self-adversarial
//! negative weighting; negatives corrupt either the head or the tail entity.

use std::sync::Arc;

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Module, VarBuilder};
use serde::{Deserialize, Serialize};

use super::projection::ProjectionHead;
use crate::encoder::EmbeddingStore;
use crate::loss::{
    CandidateBatch, ContrastiveLossConfig, ContrastiveLossEngine, MarginLossOptions,
    NegativeRegime, ScoreFn,
};

/// Configuration for [`KnowledgeEmbeddingHead`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KnowledgeHeadConfig {
    /// Number of relation types in the learned relation table
    pub num_relations: usize,
    /// Entity/relation embedding dimension
    pub dim: usize,
    /// Margin constant of the translational score
    pub gamma: f64,
    /// Norm order of the translational distance
    pub norm_order: u8,
    /// Scale applied to text-derived relation vectors
    pub text_coefficient: f64,
    /// Self-adversarial temperature; `None` weights negatives uniformly
    pub adversarial_temperature: Option<f64>,
    /// Stop gradient through positive/negative entity vectors
    pub detach_candidates: bool,
    /// Dropout probability inside the relation projection
    pub dropout: f32,
}

impl Default for KnowledgeHeadConfig {
    fn default() -> Self {
        Self {
            num_relations: 237,
            dim: 256,
            gamma: 5.0,
            norm_order: 1,
            text_coefficient: 0.05,
            adversarial_temperature: Some(1.0),
            detach_candidates: false,
            dropout: 0.1,
        }
    }
}

/// Which side of the triple the negatives corrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionSide {
    Head,
    Tail,
}

/// Negative entity indices plus the side they corrupt
#[derive(Debug, Clone, Copy)]
pub struct CorruptedEntities<'a> {
    pub side: CorruptionSide,
    /// `[bsz, K]` entity indices (`U32`)
    pub indices: &'a Tensor,
}

/// Where the relation vector for a triple batch comes from
#[derive(Debug, Clone, Copy)]
pub enum RelationSource<'a> {
    /// `[bsz]` relation ids resolved through the learned table
    Lookup(&'a Tensor),
    /// Encoder sequence output `[bsz, seq_len, hidden]`, projected and scaled
    Text(&'a Tensor),
}

/// One triple training batch
#[derive(Debug, Clone, Copy)]
pub struct KnowledgeBatch<'a> {
    /// `[bsz]` head entity indices (`U32`)
    pub head: &'a Tensor,
    /// `[bsz]` tail entity indices (`U32`)
    pub tail: &'a Tensor,
    pub relation: RelationSource<'a>,
    pub negatives: CorruptedEntities<'a>,
    /// Optional `[bsz]` per-triple subsampling weights
    pub subsampling_weight: Option<&'a Tensor>,
}

/// TransE-style head over a shared entity store
pub struct KnowledgeEmbeddingHead {
    entities: Arc<dyn EmbeddingStore>,
    relations: candle_nn::Embedding,
    rel_head: ProjectionHead,
    engine: ContrastiveLossEngine,
    text_coefficient: f64,
}

impl KnowledgeEmbeddingHead {
    pub fn new(
        vb: VarBuilder,
        entities: Arc<dyn EmbeddingStore>,
        hidden_size: usize,
        config: KnowledgeHeadConfig,
    ) -> Result<Self> {
        let relations =
            candle_nn::embedding(config.num_relations, config.dim, vb.pp("rel_embeddings"))?;
        let rel_head = ProjectionHead::new(
            vb.pp("rel_head"),
            hidden_size,
            config.dim,
            config.dropout,
        )?;
        let engine = ContrastiveLossEngine::new(ContrastiveLossConfig {
            score_fn: ScoreFn::Translational {
                gamma: config.gamma,
                p: config.norm_order,
            },
            regime: NegativeRegime::Explicit,
            margin: Some(MarginLossOptions {
                adversarial_temperature: config.adversarial_temperature,
            }),
            detach_candidates: config.detach_candidates,
            ..Default::default()
        })?;

        tracing::info!(
            "knowledge head: dim={}, gamma={}, {} relations",
            config.dim,
            config.gamma,
            config.num_relations
        );

        Ok(Self {
            entities,
            relations,
            rel_head,
            engine,
            text_coefficient: config.text_coefficient,
        })
    }

    /// Scalar training loss for one triple batch.
    pub fn forward(&self, batch: &KnowledgeBatch<'_>, train: bool) -> Result<Tensor> {
        let (query, positive, relation, negatives) = self.resolve(batch, train)?;
        let mut candidate_batch = CandidateBatch::new(&query, &positive, &negatives)
            .with_relation(&relation);
        if let Some(weight) = batch.subsampling_weight {
            candidate_batch = candidate_batch.with_subsampling_weight(weight);
        }
        self.engine.forward(&candidate_batch)
    }

    /// `[bsz, K]` candidate scores for evaluation-time ranking; no loss.
    pub fn score_candidates(&self, batch: &KnowledgeBatch<'_>) -> Result<Tensor> {
        let (query, positive, relation, negatives) = self.resolve(batch, false)?;
        let candidate_batch =
            CandidateBatch::new(&query, &positive, &negatives).with_relation(&relation);
        self.engine.negative_scores(&candidate_batch)
    }

    /// Resolve lookups and orient the triple so the engine's
    /// `score(query, candidate, relation)` covers both corruption sides:
    /// corrupting the tail scores `||h + r - t'||`, corrupting the head
    /// scores `||h' + r - t|| = ||t - r - h'||`.
    fn resolve(
        &self,
        batch: &KnowledgeBatch<'_>,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let head = self.entities.lookup(batch.head)?;
        let tail = self.entities.lookup(batch.tail)?;
        let relation = match batch.relation {
            RelationSource::Lookup(ids) => self.relations.forward(ids)?,
            RelationSource::Text(sequence_output) => {
                (self.rel_head.forward(sequence_output, train)? * self.text_coefficient)?
            }
        };
        let negatives = self.entities.lookup(batch.negatives.indices)?;

        Ok(match batch.negatives.side {
            CorruptionSide::Tail => (head, tail, relation, negatives),
            CorruptionSide::Head => (tail, head, relation.neg()?, negatives),
        })
    }
}
