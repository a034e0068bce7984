//! Pooled projection head
//!
//! dense -> tanh -> out_proj over the first-token (`<s>`/`[CLS]`)
//! representation, with dropout around the dense layer. Shared by the
//! knowledge-embedding head (relation/description projections) and any head
//! that needs a fixed-dimension sentence vector.

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Dropout, Linear, Module, VarBuilder};

pub struct ProjectionHead {
    dense: Linear,
    out_proj: Linear,
    dropout: Dropout,
}

impl ProjectionHead {
    pub fn new(
        vb: VarBuilder,
        hidden_size: usize,
        out_dim: usize,
        dropout: f32,
    ) -> Result<Self> {
        let dense = candle_nn::linear(hidden_size, hidden_size, vb.pp("dense"))?;
        let out_proj = candle_nn::linear(hidden_size, out_dim, vb.pp("out_proj"))?;
        Ok(Self {
            dense,
            out_proj,
            dropout: Dropout::new(dropout),
        })
    }

    /// Project the first-token representation of `[batch, seq_len, hidden]`
    /// sequence output.
    pub fn forward(&self, sequence_output: &Tensor, train: bool) -> Result<Tensor> {
        let first_token = sequence_output.narrow(1, 0, 1)?.squeeze(1)?;
        self.forward_pooled(&first_token, train)
    }

    /// Project an already-pooled `[batch, hidden]` representation.
    pub fn forward_pooled(&self, pooled: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.dropout.forward(pooled, train)?;
        let x = self.dense.forward(&x)?.tanh()?;
        let x = self.dropout.forward(&x, train)?;
        Ok(self.out_proj.forward(&x)?)
    }
}
