//! Contrastive loss engine
//!
//! Composes a scoring function and a negative sampler into a scalar training
//! loss. Two interchangeable formulations over the same score layout:
//!
//! - **Listwise softmax cross-entropy**: `[positive, negatives...]` logits
//!   with the gold label fixed at index 0, mean-reduced. The default when no
//!   margin options are configured.
//! - **Margin logistic with self-adversarial weighting**: `log_sigmoid`
//!   terms over translational-distance scores, negatives reweighted by a
//!   detached softmax of their own scores so harder negatives contribute
//!   more gradient.
//!
//! The formulation is resolved once at construction; ambiguous configurations
//! are rejected there rather than silently defaulted.

use anyhow::Result;
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use super::error::LossError;
use super::sampler::{NegativeIdentifiers, NegativeRegime, NegativeSampler, DEFAULT_MASK_VALUE};
use super::score::ScoreFn;

/// Options for the margin-based logistic formulation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginLossOptions {
    /// Temperature for the self-adversarial softmax over negative scores.
    /// `None` weights negatives uniformly instead.
    pub adversarial_temperature: Option<f64>,
}

impl Default for MarginLossOptions {
    fn default() -> Self {
        Self {
            adversarial_temperature: Some(1.0),
        }
    }
}

/// Engine configuration, resolved once at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContrastiveLossConfig {
    pub score_fn: ScoreFn,
    pub regime: NegativeRegime,
    /// Selects the margin logistic formulation
    pub margin: Option<MarginLossOptions>,
    /// Explicitly selects the listwise softmax formulation
    pub listwise: bool,
    /// Stop gradient through positive/negative branches
    pub detach_candidates: bool,
    /// Sentinel for masked false-negative scores
    pub mask_value: f64,
}

impl Default for ContrastiveLossConfig {
    fn default() -> Self {
        Self {
            score_fn: ScoreFn::Dot,
            regime: NegativeRegime::Explicit,
            margin: None,
            listwise: false,
            detach_candidates: false,
            mask_value: DEFAULT_MASK_VALUE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Formulation {
    Listwise,
    MarginLogistic { adversarial_temperature: Option<f64> },
}

/// One contrastive training batch
///
/// All tensors are borrowed for the duration of a single forward call.
/// `relation` feeds the translational score function; `identifiers` are
/// required by the in-batch regime; `subsampling_weight` (`[bsz]`,
/// non-negative) reweights per-query contributions, normalized by the weight
/// sum rather than the element count.
#[derive(Debug, Clone, Copy)]
pub struct CandidateBatch<'a> {
    pub query: &'a Tensor,
    pub positive: &'a Tensor,
    pub negatives: &'a Tensor,
    pub relation: Option<&'a Tensor>,
    pub identifiers: Option<NegativeIdentifiers<'a>>,
    pub subsampling_weight: Option<&'a Tensor>,
}

impl<'a> CandidateBatch<'a> {
    pub fn new(query: &'a Tensor, positive: &'a Tensor, negatives: &'a Tensor) -> Self {
        Self {
            query,
            positive,
            negatives,
            relation: None,
            identifiers: None,
            subsampling_weight: None,
        }
    }

    pub fn with_relation(mut self, relation: &'a Tensor) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn with_identifiers(mut self, identifiers: NegativeIdentifiers<'a>) -> Self {
        self.identifiers = Some(identifiers);
        self
    }

    pub fn with_subsampling_weight(mut self, weight: &'a Tensor) -> Self {
        self.subsampling_weight = Some(weight);
        self
    }
}

/// Pure scores-to-scalar-loss engine; no state survives a call
#[derive(Debug)]
pub struct ContrastiveLossEngine {
    score_fn: ScoreFn,
    sampler: NegativeSampler,
    formulation: Formulation,
}

impl ContrastiveLossEngine {
    pub fn new(config: ContrastiveLossConfig) -> Result<Self> {
        config.score_fn.validate()?;

        let formulation = match (&config.margin, config.listwise) {
            (Some(_), true) => {
                return Err(LossError::Configuration(
                    "margin options and listwise formulation requested simultaneously; \
                     select exactly one"
                        .into(),
                )
                .into())
            }
            (Some(options), false) => {
                if !matches!(config.score_fn, ScoreFn::Translational { .. }) {
                    return Err(LossError::Configuration(
                        "margin logistic formulation requires the translational score function"
                            .into(),
                    )
                    .into());
                }
                Formulation::MarginLogistic {
                    adversarial_temperature: options.adversarial_temperature,
                }
            }
            (None, _) => Formulation::Listwise,
        };

        let sampler = NegativeSampler::new(config.regime)
            .with_detach(config.detach_candidates)
            .with_mask_value(config.mask_value);

        tracing::debug!(
            "contrastive engine: {:?} scores, {:?} negatives, {:?}",
            config.score_fn,
            config.regime,
            formulation
        );

        Ok(Self {
            score_fn: config.score_fn,
            sampler,
            formulation,
        })
    }

    pub fn score_fn(&self) -> &ScoreFn {
        &self.score_fn
    }

    pub fn sampler(&self) -> &NegativeSampler {
        &self.sampler
    }

    /// Negative score matrix for a batch, masked and detached per the engine
    /// configuration. Exposed for evaluation-time candidate ranking.
    pub fn negative_scores(&self, batch: &CandidateBatch<'_>) -> Result<Tensor> {
        self.sampler.negative_scores(
            &self.score_fn,
            batch.query,
            batch.negatives,
            batch.relation,
            batch.identifiers,
        )
    }

    /// Compute the scalar loss for one batch.
    pub fn forward(&self, batch: &CandidateBatch<'_>) -> Result<Tensor> {
        let bsz = batch.query.dim(0)?;
        if batch.positive.dim(0)? != bsz {
            return Err(LossError::ShapeMismatch(format!(
                "query batch {bsz} vs positive batch {}",
                batch.positive.dim(0)?
            ))
            .into());
        }
        if let Some(weight) = batch.subsampling_weight {
            if weight.dims() != [bsz] {
                return Err(LossError::ShapeMismatch(format!(
                    "expected [{bsz}] subsampling weights, got {:?}",
                    weight.dims()
                ))
                .into());
            }
        }

        let positive = self.sampler.positive_branch(batch.positive);
        let positive_score = self.score_fn.score(batch.query, &positive, batch.relation)?;
        let negative_scores = self.negative_scores(batch)?;
        if negative_scores.dim(0)? != bsz {
            return Err(LossError::ShapeMismatch(format!(
                "query batch {bsz} vs negative score batch {}",
                negative_scores.dim(0)?
            ))
            .into());
        }

        match self.formulation {
            Formulation::Listwise => {
                listwise_loss(&positive_score, &negative_scores, batch.subsampling_weight)
            }
            Formulation::MarginLogistic {
                adversarial_temperature,
            } => margin_loss(
                &positive_score,
                &negative_scores,
                adversarial_temperature,
                batch.subsampling_weight,
            ),
        }
    }
}

/// Softmax of negative scores with gradient disabled, so the weights rescale
/// but never redirect the negative gradient. Rows sum to 1.
pub fn self_adversarial_weights(negative_scores: &Tensor, temperature: f64) -> Result<Tensor> {
    let scaled = (negative_scores * temperature)?;
    Ok(candle_nn::ops::softmax(&scaled, D::Minus1)?.detach())
}

fn listwise_loss(
    positive_score: &Tensor,
    negative_scores: &Tensor,
    weight: Option<&Tensor>,
) -> Result<Tensor> {
    let positive_col = positive_score.unsqueeze(1)?;
    let logits = Tensor::cat(&[&positive_col, negative_scores], 1)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    // the gold candidate is always column 0
    let per_example = log_probs.narrow(1, 0, 1)?.squeeze(1)?.neg()?;
    reduce_mean(&per_example, weight)
}

fn margin_loss(
    positive_score: &Tensor,
    negative_scores: &Tensor,
    adversarial_temperature: Option<f64>,
    weight: Option<&Tensor>,
) -> Result<Tensor> {
    let positive_term = log_sigmoid(positive_score)?.neg()?;

    let negative_log_sig = log_sigmoid(&negative_scores.neg()?)?;
    let negative_term = match adversarial_temperature {
        Some(temperature) => {
            let weights = self_adversarial_weights(negative_scores, temperature)?;
            (weights * &negative_log_sig)?.sum(D::Minus1)?.neg()?
        }
        None => negative_log_sig.mean(D::Minus1)?.neg()?,
    };

    let positive_loss = reduce_mean(&positive_term, weight)?;
    let negative_loss = reduce_mean(&negative_term, weight)?;
    Ok(((positive_loss + negative_loss)? / 2.0)?)
}

/// Mean over the batch, or `sum(w * term) / sum(w)` when subsampling weights
/// are supplied.
fn reduce_mean(term: &Tensor, weight: Option<&Tensor>) -> Result<Tensor> {
    match weight {
        Some(w) => {
            let weighted = (term * w)?.sum_all()?;
            let normalizer = w.sum_all()?;
            Ok((weighted / normalizer)?)
        }
        None => Ok(term.mean_all()?),
    }
}

/// Numerically stable `log(sigmoid(x))`: `min(x, 0) - log(1 + exp(-|x|))`.
fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    let capped = x.minimum(0.0)?;
    let log1p = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok((capped - log1p)?)
}
