//! Training loss: reconstruction, stop token, guided attention and L2 terms.
//!
//! Two regimes, picked by `mask_decoder`:
//!
//! | term        | masked (`mask_decoder = true`)          | unmasked                         |
//! |-------------|-----------------------------------------|----------------------------------|
//! | before/after| Σ w·(t−o)² / #valid                     | mean \|t−o\| over padded extent   |
//! | stop token  | weighted sigmoid CE over valid frames   | mean sigmoid CE                  |
//! | attention   | 0                                       | guided attention                 |
//!
//! The L2 term is always `reg_weight · Σ ½‖w‖²` over the registry.

use candle_core::{D, DType, Tensor};

use crate::config::TacotronConfig;
use crate::error::{Error, Result};
use crate::model::layers::ParamRegistry;
use crate::model::mask::sequence_mask;
use crate::model::tacotron::TacotronOutput;

/// Pad value for guided-attention alignments; outside the `[0, 1]` range of
/// attention weights.
pub const GUIDED_ATTENTION_PAD: f64 = -1.0;

// ---------------------------------------------------------------------------
// Elementwise terms
// ---------------------------------------------------------------------------

/// Sigmoid cross-entropy with logits `x`, labels `z` and positive weight `q`:
/// `(1 − z)·x + (1 + (q − 1)·z)·(log(1 + e^−|x|) + max(−x, 0))`.
pub fn weighted_sigmoid_cross_entropy(labels: &Tensor, logits: &Tensor, pos_weight: f64) -> candle_core::Result<Tensor> {
    let log_weight = labels.affine(pos_weight - 1.0, 1.0)?;
    let softplus_neg = logits
        .abs()?
        .neg()?
        .exp()?
        .affine(1.0, 1.0)?
        .log()?
        .add(&logits.neg()?.relu()?)?;
    let linear = labels.affine(-1.0, 1.0)?.mul(logits)?;
    linear + log_weight.mul(&softplus_neg)?
}

/// `Σ mask·w·(t − o)² / Σ mask`, `mask` broadcast over channels.
///
/// `mask`: `[B, T, 1]`; `weights`: optional `[B, T, D]` per-entry weights.
pub fn masked_mse(
    targets: &Tensor,
    outputs: &Tensor,
    mask: &Tensor,
    weights: Option<&Tensor>,
) -> candle_core::Result<Tensor> {
    let channels = targets.dim(D::Minus1)? as f64;
    let sq = (targets - outputs)?.sqr()?.broadcast_mul(mask)?;
    let sq = match weights {
        Some(w) => sq.mul(w)?,
        None => sq,
    };
    let count = (mask.sum_all()? * channels)?;
    sq.sum_all()?.div(&count)
}

/// Masked mean of weighted sigmoid cross-entropy. `mask`: `[B, T]`.
pub fn masked_sigmoid_cross_entropy(
    labels: &Tensor,
    logits: &Tensor,
    mask: &Tensor,
    pos_weight: f64,
) -> candle_core::Result<Tensor> {
    let losses = weighted_sigmoid_cross_entropy(labels, logits, pos_weight)?.mul(mask)?;
    losses.sum_all()?.div(&mask.sum_all()?)
}

/// Weights that scale pitch entries of unvoiced frames by `unvoiced_weight`.
///
/// A frame is unvoiced when its first pitch channel is at or below
/// `threshold`. Returns `[B, T, D]`.
pub fn unvoiced_pitch_weights(
    targets: &Tensor,
    num_pitch: usize,
    unvoiced_weight: f64,
    threshold: f64,
) -> candle_core::Result<Tensor> {
    let (b, t, d) = targets.dims3()?;
    let unvoiced = targets.narrow(2, 0, 1)?.le(threshold)?; // [B, T, 1] u8
    let scaled = Tensor::full(unvoiced_weight, (b, t, num_pitch), targets.device())?.to_dtype(targets.dtype())?;
    let ones = Tensor::ones((b, t, num_pitch), targets.dtype(), targets.device())?;
    let pitch = unvoiced.broadcast_as((b, t, num_pitch))?.where_cond(&scaled, &ones)?;
    let rest = Tensor::ones((b, t, d - num_pitch), targets.dtype(), targets.device())?;
    Tensor::cat(&[&pitch, &rest], 2)
}

// ---------------------------------------------------------------------------
// Guided attention
// ---------------------------------------------------------------------------

/// Penalty template `W[n, t] = 1 − exp(−(t/T − n/N)² / (2g²))`, row-major `[N, T]`.
pub fn guided_attention_matrix(n: usize, t: usize, g: f64) -> Vec<f32> {
    let mut w = Vec::with_capacity(n * t);
    for i in 0..n {
        for j in 0..t {
            let d = j as f64 / t as f64 - i as f64 / n as f64;
            w.push((1.0 - (-(d * d) / (2.0 * g * g)).exp()) as f32);
        }
    }
    w
}

/// Pad `xs` along `dim` with `value` up to `size`, or crop it to `size`.
fn fit_dim(xs: &Tensor, dim: usize, size: usize, value: f64) -> candle_core::Result<Tensor> {
    let len = xs.dim(dim)?;
    if len >= size {
        return xs.narrow(dim, 0, size);
    }
    let mut pad_shape = xs.dims().to_vec();
    pad_shape[dim] = size - len;
    let pad = Tensor::full(value, pad_shape, xs.device())?.to_dtype(xs.dtype())?;
    Tensor::cat(&[xs, &pad], dim)
}

/// Guided attention loss for `alignments: [B, T_in, steps]` against a
/// `[n, t]` template.
pub fn guided_attention_loss(alignments: &Tensor, template: &[f32], n: usize, t: usize) -> candle_core::Result<Tensor> {
    let a = fit_dim(alignments, 1, n, GUIDED_ATTENTION_PAD)?;
    let a = fit_dim(&a, 2, t, GUIDED_ATTENTION_PAD)?;
    let w = Tensor::from_slice(template, (1, n, t), a.device())?.to_dtype(a.dtype())?;
    let mask = a.ne(GUIDED_ATTENTION_PAD)?.to_dtype(a.dtype())?;
    let penalty = a.broadcast_mul(&w)?.abs()?.mul(&mask)?;
    penalty.sum_all()?.div(&mask.sum_all()?)
}

/// `weight · Σ_w ½ Σ w²`.
pub fn l2_regularization(weights: &[Tensor], weight: f64) -> candle_core::Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for w in weights {
        let term = w.to_dtype(DType::F32)?.sqr()?.sum_all()?;
        total = Some(match total {
            Some(t) => (t + term)?,
            None => term,
        });
    }
    match total {
        Some(t) => t.affine(0.5 * weight, 0.0),
        None => Tensor::new(0f32, &candle_core::Device::Cpu),
    }
}

// ---------------------------------------------------------------------------
// Composer
// ---------------------------------------------------------------------------

/// The five loss components and their sum, each a scalar tensor.
#[derive(Debug, Clone)]
pub struct LossTerms {
    pub before: Tensor,
    pub after: Tensor,
    pub stop_token: Tensor,
    pub attention: Tensor,
    pub regularization: Tensor,
    pub total: Tensor,
}

/// Host copies of [`LossTerms`] for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossValues {
    pub before: f32,
    pub after: f32,
    pub stop_token: f32,
    pub attention: f32,
    pub regularization: f32,
    pub total: f32,
}

impl LossTerms {
    pub fn values(&self) -> Result<LossValues> {
        let scalar = |t: &Tensor| -> Result<f32> { Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?) };
        Ok(LossValues {
            before: scalar(&self.before)?,
            after: scalar(&self.after)?,
            stop_token: scalar(&self.stop_token)?,
            attention: scalar(&self.attention)?,
            regularization: scalar(&self.regularization)?,
            total: scalar(&self.total)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossComposer {
    mask_decoder: bool,
    num_pitch: usize,
    pos_weight: f64,
    unvoiced_pitch_weight: f64,
    unvoiced_pitch_threshold: f64,
    reg_weight: f64,
    max_text_length: usize,
    max_frame_num: usize,
    guided_template: Vec<f32>,
}

impl LossComposer {
    pub fn new(cfg: &TacotronConfig) -> Self {
        let guided_template = if cfg.mask_decoder {
            Vec::new()
        } else {
            guided_attention_matrix(cfg.max_text_length, cfg.max_frame_num, cfg.guided_attention_sigma)
        };
        Self {
            mask_decoder: cfg.mask_decoder,
            num_pitch: cfg.num_pitch,
            pos_weight: cfg.cross_entropy_pos_weight,
            unvoiced_pitch_weight: cfg.unvoiced_pitch_weight,
            unvoiced_pitch_threshold: cfg.unvoiced_pitch_threshold,
            reg_weight: cfg.reg_weight,
            max_text_length: cfg.max_text_length,
            max_frame_num: cfg.max_frame_num,
            guided_template,
        }
    }

    pub fn compute(&self, output: &TacotronOutput, registry: &ParamRegistry) -> Result<LossTerms> {
        let targets = output
            .targets
            .as_ref()
            .ok_or_else(|| Error::config("loss requested on a run without targets"))?;
        let stop_targets = targets
            .stop_tokens
            .as_ref()
            .ok_or_else(|| Error::config("loss requested on a run without stop-token targets"))?;
        if targets.frames.dims() != output.decoder_outputs.dims() {
            return Err(Error::config(format!(
                "targets {:?} and decoder outputs {:?} differ in shape",
                targets.frames.dims(),
                output.decoder_outputs.dims()
            )));
        }

        let frames = &targets.frames;
        let (before, after, stop_token, attention) = if self.mask_decoder {
            let lengths = targets
                .lengths
                .as_ref()
                .ok_or_else(|| Error::config("masked loss requires target lengths"))?;
            let (_, t, _) = frames.dims3()?;
            let mask = sequence_mask(lengths, t, frames.dtype(), frames.device())?;
            let frame_mask = mask.unsqueeze(2)?;
            let weights = if self.unvoiced_pitch_weight != 1.0 {
                Some(unvoiced_pitch_weights(
                    frames,
                    self.num_pitch,
                    self.unvoiced_pitch_weight,
                    self.unvoiced_pitch_threshold,
                )?)
            } else {
                None
            };
            let before = masked_mse(frames, &output.decoder_outputs, &frame_mask, weights.as_ref())?;
            let after = masked_mse(frames, &output.final_outputs, &frame_mask, weights.as_ref())?;
            let stop = masked_sigmoid_cross_entropy(stop_targets, &output.stop_token_outputs, &mask, self.pos_weight)?;
            let attention = before.zeros_like()?;
            (before, after, stop, attention)
        } else {
            let before = (frames - &output.decoder_outputs)?.abs()?.mean_all()?;
            let after = (frames - &output.final_outputs)?.abs()?.mean_all()?;
            let stop = weighted_sigmoid_cross_entropy(stop_targets, &output.stop_token_outputs, 1.0)?.mean_all()?;
            let attention = guided_attention_loss(
                &output.alignments,
                &self.guided_template,
                self.max_text_length,
                self.max_frame_num,
            )?;
            (before, after, stop, attention)
        };

        let regularization = l2_regularization(registry.regularizable(), self.reg_weight)?
            .to_dtype(before.dtype())?
            .to_device(before.device())?;
        let total = before
            .add(&after)?
            .add(&stop_token)?
            .add(&attention)?
            .add(&regularization)?;

        Ok(LossTerms {
            before,
            after,
            stop_token,
            attention,
            regularization,
            total,
        })
    }
}
