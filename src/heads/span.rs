//! Extractive span head
//!
//! Start/end position prediction over multi-segment documents. Each example
//! is encoded as several overlapping segments; the head predicts one logit
//! pair per token, flattens the segment axis, and trains with the marginal
//! cross-entropy so every annotated occurrence of the answer counts as gold.

use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use crate::loss::{LossError, MarginalSpanLoss};

/// Per-token start/end logits plus marginal span loss
pub struct SpanHead {
    qa_outputs: Linear,
    loss: MarginalSpanLoss,
}

impl SpanHead {
    pub fn new(vb: VarBuilder, hidden_size: usize) -> Result<Self> {
        Ok(Self {
            qa_outputs: candle_nn::linear(hidden_size, 2, vb.pp("qa_outputs"))?,
            loss: MarginalSpanLoss::default(),
        })
    }

    pub fn with_loss(mut self, loss: MarginalSpanLoss) -> Self {
        self.loss = loss;
        self
    }

    /// Start and end logits, each `[examples, segments, seq_len]`, from the
    /// `[examples * segments, seq_len, hidden]` encoder output.
    pub fn logits(
        &self,
        sequence_output: &Tensor,
        examples: usize,
        segments: usize,
    ) -> Result<(Tensor, Tensor)> {
        let rows = sequence_output.dim(0)?;
        if rows != examples * segments {
            return Err(LossError::ShapeMismatch(format!(
                "expected {} encoded segments for {examples} examples x {segments} segments, \
                 got {rows}",
                examples * segments
            ))
            .into());
        }
        let logits = self.qa_outputs.forward(sequence_output)?;
        let start = logits
            .narrow(D::Minus1, 0, 1)?
            .squeeze(D::Minus1)?
            .reshape((examples, segments, ()))?;
        let end = logits
            .narrow(D::Minus1, 1, 1)?
            .squeeze(D::Minus1)?
            .reshape((examples, segments, ()))?;
        Ok((start, end))
    }

    /// Scalar loss, averaging the start and end marginal cross-entropies.
    ///
    /// Targets are `[examples, T_max]` positions (`I64`) in the flattened
    /// `segments * seq_len` coordinate space, padded with the loss's ignore
    /// index.
    pub fn forward(
        &self,
        sequence_output: &Tensor,
        examples: usize,
        segments: usize,
        start_targets: &Tensor,
        end_targets: &Tensor,
    ) -> Result<Tensor> {
        let (start_logits, end_logits) = self.logits(sequence_output, examples, segments)?;
        let start_loss = self.loss.forward_segments(&start_logits, start_targets)?;
        let end_loss = self.loss.forward_segments(&end_logits, end_targets)?;
        Ok(((start_loss + end_loss)? / 2.0)?)
    }
}
