//! Text encoder: convolution stack followed by a bidirectional zoneout LSTM.
//!
//! ```text
//! embedded inputs [B, T, E]
//!   → N × (Conv1d(k) → BatchNorm → ReLU → Dropout)      [B, T, C]
//!   → BiLSTM(H) with zoneout, length-aware              [B, T, 2H]
//! ```
//!
//! The forward direction freezes its state and emits zeros past each
//! example's length. The backward direction reads every sequence reversed
//! within its own length, so padding never leaks into the valid steps.

use candle_core::{IndexOp, Result, Tensor};
use candle_nn::VarBuilder;

use super::layers::{ConvActivation, ConvBlock, LstmState, ParamRegistry, ZoneoutLstmCell};
use super::mask::{reverse_sequences, reverse_within_length_indices, sequence_mask};
use crate::config::TacotronConfig;

/// Stack of convolution blocks over the embedded symbols.
#[derive(Debug, Clone)]
pub struct EncoderConvolutions {
    blocks: Vec<ConvBlock>,
}

impl EncoderConvolutions {
    pub fn new(cfg: &TacotronConfig, vb: VarBuilder, reg: &mut ParamRegistry) -> Result<Self> {
        let mut blocks = Vec::with_capacity(cfg.enc_conv_num_layers);
        let mut in_channels = cfg.embedding_dim;
        for i in 0..cfg.enc_conv_num_layers {
            blocks.push(ConvBlock::new(
                in_channels,
                cfg.enc_conv_channels,
                cfg.enc_conv_kernel_size,
                ConvActivation::Relu,
                cfg.dropout_rate,
                cfg.batch_norm_momentum,
                cfg.batch_norm_epsilon,
                vb.pp(format!("conv_layer_{i}")),
                reg,
            )?);
            in_channels = cfg.enc_conv_channels;
        }
        Ok(Self { blocks })
    }

    /// `xs`: `[B, T, E]` → `[B, T, C]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = xs.transpose(1, 2)?.contiguous()?;
        for block in &self.blocks {
            h = block.forward_t(&h, train)?;
        }
        h.transpose(1, 2)?.contiguous()
    }
}

/// Bidirectional LSTM over the convolution features.
#[derive(Debug, Clone)]
pub struct EncoderRnn {
    forward_cell: ZoneoutLstmCell,
    backward_cell: ZoneoutLstmCell,
}

impl EncoderRnn {
    pub fn new(
        input_size: usize,
        units: usize,
        zoneout: f64,
        vb: VarBuilder,
        reg: &mut ParamRegistry,
    ) -> Result<Self> {
        Ok(Self {
            forward_cell: ZoneoutLstmCell::new(input_size, units, zoneout, vb.pp("fw"), reg)?,
            backward_cell: ZoneoutLstmCell::new(input_size, units, zoneout, vb.pp("bw"), reg)?,
        })
    }

    /// `xs`: `[B, T, C]`, `lengths`: true length per example → `[B, T, 2H]`.
    pub fn forward_t(&self, xs: &Tensor, lengths: &[usize], train: bool) -> Result<Tensor> {
        let (_b, t, _c) = xs.dims3()?;
        let mask = sequence_mask(lengths, t, xs.dtype(), xs.device())?;

        let fw = run_direction(&self.forward_cell, xs, &mask, train)?;

        let rev_idx = reverse_within_length_indices(lengths, t, xs.device())?;
        let reversed = reverse_sequences(xs, &rev_idx)?;
        let bw = run_direction(&self.backward_cell, &reversed, &mask, train)?;
        let bw = reverse_sequences(&bw, &rev_idx)?;

        Tensor::cat(&[&fw, &bw], 2)
    }
}

/// Unroll one LSTM direction. Steps where `mask` is 0 keep the previous
/// state and produce a zero output.
fn run_direction(cell: &ZoneoutLstmCell, xs: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
    let (b, t, _c) = xs.dims3()?;
    let mut state = cell.zero_state(b, xs.dtype(), xs.device())?;
    let mut outputs = Vec::with_capacity(t);
    for step in 0..t {
        let x_t = xs.i((.., step, ..))?.contiguous()?;
        let m = mask.i((.., step))?.unsqueeze(1)?; // [B, 1]
        let next = cell.step(&x_t, &state, train)?;
        outputs.push(next.h.broadcast_mul(&m)?);
        state = LstmState {
            h: blend(&next.h, &state.h, &m)?,
            c: blend(&next.c, &state.c, &m)?,
        };
    }
    Tensor::stack(&outputs, 1)
}

/// `old + m * (new - old)` with `m` broadcast over the feature axis.
fn blend(new: &Tensor, old: &Tensor, m: &Tensor) -> Result<Tensor> {
    old + (new - old)?.broadcast_mul(m)?
}

/// Full encoder: convolutions then the bidirectional LSTM.
#[derive(Debug, Clone)]
pub struct Encoder {
    convolutions: EncoderConvolutions,
    rnn: EncoderRnn,
}

/// Encoder result with the intermediate convolution shape kept for logging.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[B, T, 2H]`
    pub outputs: Tensor,
    pub conv_output_dims: Vec<usize>,
}

impl Encoder {
    pub fn new(cfg: &TacotronConfig, vb: VarBuilder, reg: &mut ParamRegistry) -> Result<Self> {
        let convolutions = EncoderConvolutions::new(cfg, vb.pp("encoder_convolutions"), reg)?;
        let rnn = EncoderRnn::new(
            cfg.enc_conv_channels,
            cfg.encoder_lstm_units,
            cfg.zoneout_rate,
            vb.pp("encoder_lstm"),
            reg,
        )?;
        Ok(Self { convolutions, rnn })
    }

    /// `embedded`: `[B, T, E]`, `lengths`: `[B]` true input lengths.
    pub fn forward_t(&self, embedded: &Tensor, lengths: &[usize], train: bool) -> Result<EncoderOutput> {
        let conv = self.convolutions.forward_t(embedded, train)?;
        let conv_output_dims = conv.dims().to_vec();
        let outputs = self.rnn.forward_t(&conv, lengths, train)?;
        Ok(EncoderOutput {
            outputs,
            conv_output_dims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_cfg() -> TacotronConfig {
        TacotronConfig {
            embedding_dim: 8,
            enc_conv_num_layers: 2,
            enc_conv_kernel_size: 3,
            enc_conv_channels: 6,
            encoder_lstm_units: 4,
            ..TacotronConfig::default()
        }
    }

    #[test]
    fn test_encoder_shape() {
        let dev = Device::Cpu;
        let cfg = small_cfg();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut reg = ParamRegistry::new();
        let encoder = Encoder::new(&cfg, vb.pp("encoder"), &mut reg).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (2, 7, 8), &dev).unwrap();
        let out = encoder.forward_t(&xs, &[7, 4], false).unwrap();
        assert_eq!(out.conv_output_dims, vec![2, 7, 6]);
        assert_eq!(out.outputs.dims(), &[2, 7, 8]);
    }

    #[test]
    fn test_padding_does_not_affect_valid_steps() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut reg = ParamRegistry::new();
        let rnn = EncoderRnn::new(6, 4, 0.0, vb.pp("rnn"), &mut reg).unwrap();

        let valid = Tensor::randn(0f32, 1.0, (1, 3, 6), &dev).unwrap();
        let pad_a = Tensor::zeros((1, 2, 6), DType::F32, &dev).unwrap();
        let pad_b = Tensor::randn(0f32, 5.0, (1, 2, 6), &dev).unwrap();
        let xa = Tensor::cat(&[&valid, &pad_a], 1).unwrap();
        let xb = Tensor::cat(&[&valid, &pad_b], 1).unwrap();

        let ya = rnn.forward_t(&xa, &[3], false).unwrap();
        let yb = rnn.forward_t(&xb, &[3], false).unwrap();
        let diff: f32 = (ya.narrow(1, 0, 3).unwrap() - yb.narrow(1, 0, 3).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6, "padding changed valid outputs by {diff}");

        // Outputs beyond the length are zero.
        let tail: f32 = ya.narrow(1, 3, 2).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(tail, 0.0);
    }
}
