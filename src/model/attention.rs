//! Location-sensitive attention.
//!
//! ```text
//! keys     = W_m · memory                        (once per run)
//! f        = conv1d(previous weights)            [B, T, filters]
//! energy_j = v_a · tanh(keys_j + W_q·query + W_l·f_j + b_a)
//! weights  = softmax(energy)  |  σ(energy) / Σ σ(energy)   (smoothing)
//! context  = Σ_j weights_j · memory_j
//! ```
//!
//! The "previous weights" fed to the location convolution are either the last
//! step's alignments or their running sum, depending on `cumulative_weights`.

use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Init, Linear, VarBuilder};

use super::layers::{ParamRegistry, linear_no_bias};
use super::mask::{mask_padding, score_mask_value, sequence_mask};
use crate::config::TacotronConfig;

/// Encoder memory prepared once per decoder run.
#[derive(Debug, Clone)]
pub struct AttentionMemory {
    /// `[B, T, attention_dim]`
    pub keys: Tensor,
    /// `[B, T, enc_dim]`, zero beyond each length.
    pub values: Tensor,
    /// `[B, T]` u8, 1 on valid positions. `None` when encoder masking is off.
    pub mask: Option<Tensor>,
}

impl AttentionMemory {
    pub fn batch_size(&self) -> Result<usize> {
        self.values.dim(0)
    }

    pub fn max_time(&self) -> Result<usize> {
        self.values.dim(1)
    }

    pub fn value_dim(&self) -> Result<usize> {
        self.values.dim(2)
    }
}

/// Result of one attention step.
#[derive(Debug, Clone)]
pub struct AttentionStep {
    /// `[B, enc_dim]`
    pub context: Tensor,
    /// `[B, T]`
    pub alignments: Tensor,
    /// `[B, T]` weights the next step's location features are computed from.
    pub next_state: Tensor,
}

#[derive(Debug, Clone)]
pub struct LocationSensitiveAttention {
    query_layer: Linear,
    memory_layer: Linear,
    location_conv: Conv1d,
    location_layer: Linear,
    v_a: Tensor,
    b_a: Tensor,
    smoothing: bool,
    cumulative: bool,
    mask_encoder: bool,
}

impl LocationSensitiveAttention {
    pub fn new(
        query_dim: usize,
        memory_dim: usize,
        cfg: &TacotronConfig,
        vb: VarBuilder,
        reg: &mut ParamRegistry,
    ) -> Result<Self> {
        let attn_dim = cfg.attention_dim;
        let query_layer = linear_no_bias(query_dim, attn_dim, vb.pp("query_layer"), reg)?;
        let memory_layer = linear_no_bias(memory_dim, attn_dim, vb.pp("memory_layer"), reg)?;
        let location_conv = candle_nn::conv1d(
            1,
            cfg.attention_filters,
            cfg.attention_kernel,
            Conv1dConfig {
                padding: cfg.attention_kernel / 2,
                ..Default::default()
            },
            vb.pp("location_features_convolution"),
        )?;
        reg.register_weight(location_conv.weight());
        let location_layer = linear_no_bias(
            cfg.attention_filters,
            attn_dim,
            vb.pp("location_features_layer"),
            reg,
        )?;
        let v_a = vb.get_with_hints(
            attn_dim,
            "attention_variable_projection",
            Init::Randn {
                mean: 0.0,
                stdev: (attn_dim as f64).powf(-0.5),
            },
        )?;
        reg.register_weight(&v_a);
        let b_a = vb.get_with_hints(attn_dim, "attention_bias", Init::Const(0.0))?;
        Ok(Self {
            query_layer,
            memory_layer,
            location_conv,
            location_layer,
            v_a,
            b_a,
            smoothing: cfg.smoothing,
            cumulative: cfg.cumulative_weights,
            mask_encoder: cfg.mask_encoder,
        })
    }

    /// Project the encoder outputs into keys and zero the padded values.
    pub fn prepare_memory(&self, memory: &Tensor, lengths: &[usize]) -> Result<AttentionMemory> {
        let t = memory.dim(1)?;
        let (values, mask) = if self.mask_encoder {
            let mask = sequence_mask(lengths, t, DType::U8, memory.device())?;
            (mask_padding(memory, lengths)?, Some(mask))
        } else {
            (memory.clone(), None)
        };
        let keys = self.memory_layer.forward(&values)?;
        Ok(AttentionMemory { keys, values, mask })
    }

    /// Zero weights `[B, T]` used as the first step's state.
    pub fn initial_alignments(&self, memory: &AttentionMemory) -> Result<Tensor> {
        Tensor::zeros(
            (memory.batch_size()?, memory.max_time()?),
            memory.values.dtype(),
            memory.values.device(),
        )
    }

    /// Zero context `[B, enc_dim]`.
    pub fn initial_context(&self, memory: &AttentionMemory) -> Result<Tensor> {
        Tensor::zeros(
            (memory.batch_size()?, memory.value_dim()?),
            memory.values.dtype(),
            memory.values.device(),
        )
    }

    /// Unnormalized scores `[B, T]` with padded positions set to the dtype minimum.
    fn energy(&self, query: &Tensor, state: &Tensor, memory: &AttentionMemory) -> Result<Tensor> {
        let processed_query = self.query_layer.forward(query)?.unsqueeze(1)?; // [B, 1, A]
        let location = self
            .location_conv
            .forward(&state.unsqueeze(1)?)? // [B, F, T]
            .transpose(1, 2)?
            .contiguous()?;
        let processed_location = self.location_layer.forward(&location)?; // [B, T, A]

        let hidden = memory
            .keys
            .broadcast_add(&processed_query)?
            .add(&processed_location)?
            .broadcast_add(&self.b_a)?
            .tanh()?;
        let energy = hidden.broadcast_mul(&self.v_a)?.sum(D::Minus1)?;

        match &memory.mask {
            Some(mask) => {
                let fill = Tensor::full(score_mask_value(energy.dtype()), energy.shape(), energy.device())?
                    .to_dtype(energy.dtype())?;
                mask.where_cond(&energy, &fill)
            }
            None => Ok(energy),
        }
    }

    fn normalize(&self, energy: &Tensor) -> Result<Tensor> {
        if self.smoothing {
            let s = candle_nn::ops::sigmoid(energy)?;
            s.broadcast_div(&s.sum_keepdim(D::Minus1)?)
        } else {
            candle_nn::ops::softmax(energy, D::Minus1)
        }
    }

    /// One attention step. `query`: `[B, query_dim]`, `state`: `[B, T]`.
    pub fn step(&self, query: &Tensor, state: &Tensor, memory: &AttentionMemory) -> Result<AttentionStep> {
        let energy = self.energy(query, state, memory)?;
        let alignments = self.normalize(&energy)?;
        let context = alignments
            .unsqueeze(1)?
            .matmul(&memory.values)?
            .squeeze(1)?;
        let next_state = if self.cumulative {
            (state + &alignments)?
        } else {
            alignments.clone()
        };
        Ok(AttentionStep {
            context,
            alignments,
            next_state,
        })
    }
}
