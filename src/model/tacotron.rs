//! Top-level model combining all components.
//!
//! `Tacotron` orchestrates:
//! - Symbol embedding and the encoder (conv stack + BiLSTM)
//! - Autoregressive decoding driven by a mode-selected helper
//! - Postnet residual refinement and per-feature output slices

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};
use rand::Rng;

use super::decoder::{DecoderCell, dynamic_decode};
use super::encoder::Encoder;
use super::helpers::{DecoderHelper, SynthesisHelper, TrainingHelper, teacher_forcing_ratio};
use super::layers::ParamRegistry;
use super::postnet::Postnet;
use crate::config::{TacotronConfig, TeacherForcingMode};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Run mode / inputs
// ---------------------------------------------------------------------------

/// What a forward pass is for. Selects the helper, whether layers run in
/// training mode, and whether `max_iters` caps decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Training,
    Evaluating,
    /// Teacher-forced with ratio 1.0 to produce ground-truth-aligned frames.
    GroundTruthAligned,
    Synthesis,
}

impl RunMode {
    /// Map the boolean flag set used by training drivers onto a mode.
    pub fn from_flags(is_training: bool, is_evaluating: bool, gta: bool) -> Result<Self> {
        match (is_training, is_evaluating, gta) {
            (true, true, _) => Err(Error::config(
                "model can not be in training and evaluation modes at the same time",
            )),
            (true, false, _) => Ok(Self::Training),
            (false, true, _) => Ok(Self::Evaluating),
            (false, false, true) => Ok(Self::GroundTruthAligned),
            (false, false, false) => Ok(Self::Synthesis),
        }
    }

    pub fn is_training(self) -> bool {
        self == Self::Training
    }

    /// Decoding is teacher-forced from targets.
    pub fn uses_targets(self) -> bool {
        self != Self::Synthesis
    }

    /// `max_iters` is only enforced outside training and evaluation.
    pub fn applies_max_iters(self) -> bool {
        !matches!(self, Self::Training | Self::Evaluating)
    }
}

/// One batch as handed over by the data layer.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// `[B, T_in]` u32 symbol IDs.
    pub inputs: Tensor,
    pub input_lengths: Vec<usize>,
    /// `[B, T_out, num_pitch]`, or `[B, T_out]` when `num_pitch == 1`.
    pub pitch_targets: Option<Tensor>,
    /// `[B, T_out, num_spectral]`
    pub spectral_targets: Option<Tensor>,
    /// `[B, T_out, num_aperiodicity]`
    pub aperiodicity_targets: Option<Tensor>,
    /// `[B, T_out]`, 1.0 from the last real frame on.
    pub stop_token_targets: Option<Tensor>,
    pub targets_lengths: Option<Vec<usize>>,
    pub global_step: Option<usize>,
}

impl ModelInputs {
    pub fn new(inputs: Tensor, input_lengths: Vec<usize>) -> Self {
        Self {
            inputs,
            input_lengths,
            pitch_targets: None,
            spectral_targets: None,
            aperiodicity_targets: None,
            stop_token_targets: None,
            targets_lengths: None,
            global_step: None,
        }
    }

    pub fn with_targets(
        mut self,
        pitch: Option<Tensor>,
        spectral: Option<Tensor>,
        aperiodicity: Option<Tensor>,
        stop_tokens: Option<Tensor>,
    ) -> Self {
        self.pitch_targets = pitch;
        self.spectral_targets = spectral;
        self.aperiodicity_targets = aperiodicity;
        self.stop_token_targets = stop_tokens;
        self
    }

    pub fn with_targets_lengths(mut self, lengths: Vec<usize>) -> Self {
        self.targets_lengths = Some(lengths);
        self
    }

    pub fn with_global_step(mut self, step: usize) -> Self {
        self.global_step = Some(step);
        self
    }

    fn has_acoustic_targets(&self) -> bool {
        self.pitch_targets.is_some() || self.spectral_targets.is_some() || self.aperiodicity_targets.is_some()
    }
}

/// Targets packed the way the loss consumes them.
#[derive(Debug, Clone)]
pub struct Targets {
    /// `[B, T_out, target_depth]`
    pub frames: Tensor,
    /// `[B, T_out]`
    pub stop_tokens: Option<Tensor>,
    pub lengths: Option<Vec<usize>>,
}

/// Everything a forward pass produces.
#[derive(Debug, Clone)]
pub struct TacotronOutput {
    pub mode: RunMode,
    /// `[B, steps, target_depth * r]` before unpacking.
    pub frame_groups: Tensor,
    /// `[B, steps * r, target_depth]`
    pub decoder_outputs: Tensor,
    /// `[B, steps * r, target_depth]`
    pub final_outputs: Tensor,
    /// `[B, steps * r, num_pitch]`
    pub pitch_outputs: Tensor,
    /// `[B, steps * r, num_spectral]`
    pub spectral_outputs: Tensor,
    /// `[B, steps * r, num_aperiodicity]`
    pub aperiodicity_outputs: Tensor,
    /// `[B, steps * r]` logits.
    pub stop_token_outputs: Tensor,
    /// `[B, T_in, steps]`
    pub alignments: Tensor,
    /// Decoder steps per example before its stop condition fired.
    pub decoder_lengths: Vec<usize>,
    pub iterations: usize,
    pub outputs_per_step: usize,
    /// Set in training mode.
    pub teacher_forcing_ratio: Option<f64>,
    pub input_lengths: Vec<usize>,
    pub targets: Option<Targets>,
}

impl TacotronOutput {
    /// [`Self::decoder_lengths`] in frames.
    pub fn frame_lengths(&self) -> Vec<usize> {
        self.decoder_lengths
            .iter()
            .map(|&steps| steps * self.outputs_per_step)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Tacotron {
    embedding: Embedding,
    encoder: Encoder,
    decoder: DecoderCell,
    postnet: Postnet,
    registry: ParamRegistry,
    dtype: DType,
    cfg: TacotronConfig,
}

impl Tacotron {
    pub fn new(cfg: &TacotronConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let mut registry = ParamRegistry::new();
        let vb = vb.pp("inference");

        let embedding = candle_nn::embedding(cfg.num_symbols, cfg.embedding_dim, vb.pp("inputs_embedding"))?;
        registry.register_weight(embedding.embeddings());
        let encoder = Encoder::new(cfg, vb.pp("encoder"), &mut registry)?;
        let decoder = DecoderCell::new(cfg, vb.pp("decoder"), &mut registry)?;
        let postnet = Postnet::new(cfg, vb.pp("postnet_convolutions"), &mut registry)?;

        tracing::info!(
            "Tacotron built: {} symbols, frame depth {} x r={}, {} regularized weights",
            cfg.num_symbols,
            cfg.target_depth(),
            cfg.outputs_per_step,
            registry.regularizable().len()
        );

        Ok(Self {
            embedding,
            encoder,
            decoder,
            postnet,
            registry,
            dtype: vb.dtype(),
            cfg: cfg.clone(),
        })
    }

    /// Regularizable weights and pending normalization updates.
    pub fn registry(&self) -> &ParamRegistry {
        &self.registry
    }

    /// Run the full graph for one batch.
    pub fn forward(&self, batch: &ModelInputs, mode: RunMode) -> Result<TacotronOutput> {
        let targets = self.validate_inputs(batch, mode)?;
        let cfg = &self.cfg;
        let depth = cfg.target_depth();
        let r = cfg.outputs_per_step;
        let train = mode.is_training();
        if train {
            let dropped = self.registry.update_ops().clear();
            if dropped > 0 {
                tracing::debug!("dropped {dropped} normalization updates from an unstepped training run");
            }
        }
        let device = batch.inputs.device();
        let b = batch.input_lengths.len();

        let embedded = self.embedding.forward(&batch.inputs)?;
        let encoded = self.encoder.forward_t(&embedded, &batch.input_lengths, train)?;
        let memory = self
            .decoder
            .attention()
            .prepare_memory(&encoded.outputs, &batch.input_lengths)?;

        let (mut helper, ratio): (Box<dyn DecoderHelper>, Option<f64>) = match (&targets, mode) {
            (Some(t), RunMode::Training | RunMode::Evaluating | RunMode::GroundTruthAligned) => {
                let ratio = if train {
                    teacher_forcing_ratio(cfg, batch.global_step)
                } else {
                    1.0
                };
                let seed = cfg
                    .seed
                    .map(|s| s.wrapping_add(batch.global_step.unwrap_or(0) as u64))
                    .unwrap_or_else(|| rand::rng().random());
                let helper = TrainingHelper::new(&t.frames, r, ratio, seed)?;
                (Box::new(helper), train.then_some(ratio))
            }
            _ => (
                Box::new(SynthesisHelper::new(b, depth, cfg.stop_threshold, self.dtype, device)),
                None,
            ),
        };

        let max_iters = mode.applies_max_iters().then_some(cfg.max_iters);
        let decoded = dynamic_decode(&self.decoder, helper.as_mut(), &memory, max_iters, train)?;

        let steps = decoded.iterations;
        let decoder_outputs = decoded.frames.reshape((b, steps * r, depth))?;
        let stop_token_outputs = decoded.stop_logits.reshape((b, steps * r))?;

        let residual = self.postnet.residual(&decoder_outputs, train)?;
        let final_outputs = (&decoder_outputs + &residual)?;

        let pitch_outputs = final_outputs.narrow(2, 0, cfg.num_pitch)?;
        let spectral_outputs = final_outputs.narrow(2, cfg.num_pitch, cfg.num_spectral)?;
        let aperiodicity_outputs =
            final_outputs.narrow(2, cfg.num_pitch + cfg.num_spectral, cfg.num_aperiodicity)?;

        tracing::debug!("Tacotron forward ({mode:?}), dimensions:");
        tracing::debug!("  embedding:              {:?}", embedded.dims());
        tracing::debug!("  enc conv out:           {:?}", encoded.conv_output_dims);
        tracing::debug!("  encoder out:            {:?}", encoded.outputs.dims());
        tracing::debug!("  decoder out:            {:?}", decoder_outputs.dims());
        tracing::debug!("  projected residual out: {:?}", residual.dims());
        tracing::debug!("  final out:              {:?}", final_outputs.dims());
        tracing::debug!("  pitch out:              {:?}", pitch_outputs.dims());
        tracing::debug!("  spectral out:           {:?}", spectral_outputs.dims());
        tracing::debug!("  aperiodicity out:       {:?}", aperiodicity_outputs.dims());
        tracing::debug!("  <stop_token> out:       {:?}", stop_token_outputs.dims());

        Ok(TacotronOutput {
            mode,
            frame_groups: decoded.frames,
            decoder_outputs,
            final_outputs,
            pitch_outputs,
            spectral_outputs,
            aperiodicity_outputs,
            stop_token_outputs,
            alignments: decoded.alignments,
            decoder_lengths: decoded.decoder_lengths,
            iterations: steps,
            outputs_per_step: r,
            teacher_forcing_ratio: ratio,
            input_lengths: batch.input_lengths.clone(),
            targets,
        })
    }

    /// Check the batch against the mode and config, and pack the targets.
    fn validate_inputs(&self, batch: &ModelInputs, mode: RunMode) -> Result<Option<Targets>> {
        let cfg = &self.cfg;
        let gta = mode == RunMode::GroundTruthAligned;
        let has_acoustic = batch.has_acoustic_targets();

        if !has_acoustic && batch.stop_token_targets.is_some() {
            return Err(Error::config(
                "no acoustic targets were provided but stop-token targets were given",
            ));
        }
        if has_acoustic && batch.stop_token_targets.is_none() && !gta {
            return Err(Error::config(
                "acoustic targets are provided without corresponding stop-token targets",
            ));
        }
        if gta && cfg.gta_excludes_spectral && batch.spectral_targets.is_some() {
            return Err(Error::config(
                "spectral targets are not supported in ground-truth-aligned mode",
            ));
        }
        if mode.is_training() && cfg.mask_decoder && batch.targets_lengths.is_none() {
            return Err(Error::config(
                "model set to mask paddings but no targets lengths provided for the mask",
            ));
        }
        if mode.is_training()
            && cfg.teacher_forcing_mode == TeacherForcingMode::Scheduled
            && batch.global_step.is_none()
        {
            return Err(Error::config(
                "scheduled teacher forcing requires the global step in training mode",
            ));
        }
        if mode.uses_targets() && !has_acoustic {
            return Err(Error::config(format!("{mode:?} mode requires acoustic targets")));
        }

        let (b, t_in) = batch.inputs.dims2()?;
        if batch.input_lengths.len() != b {
            return Err(Error::config(format!(
                "got {} input lengths for a batch of {b}",
                batch.input_lengths.len()
            )));
        }
        if let Some(&len) = batch.input_lengths.iter().find(|&&l| l == 0 || l > t_in) {
            return Err(Error::config(format!("input length {len} outside 1..={t_in}")));
        }

        if !has_acoustic {
            return Ok(None);
        }

        let pitch = batch
            .pitch_targets
            .as_ref()
            .ok_or_else(|| Error::config("pitch targets are missing"))?;
        let pitch = if pitch.rank() == 2 && cfg.num_pitch == 1 {
            pitch.unsqueeze(2)?
        } else {
            pitch.clone()
        };
        let aperiodicity = batch
            .aperiodicity_targets
            .as_ref()
            .ok_or_else(|| Error::config("aperiodicity targets are missing"))?;
        let (_, t_out, _) = pitch.dims3()?;

        let spectral = match &batch.spectral_targets {
            Some(s) => s.clone(),
            None if gta && cfg.gta_excludes_spectral => {
                Tensor::zeros((b, t_out, cfg.num_spectral), self.dtype, pitch.device())?
            }
            None => return Err(Error::config("spectral targets are missing")),
        };

        for (name, tensor, channels) in [
            ("pitch", &pitch, cfg.num_pitch),
            ("spectral", &spectral, cfg.num_spectral),
            ("aperiodicity", aperiodicity, cfg.num_aperiodicity),
        ] {
            let dims = tensor.dims();
            if dims != [b, t_out, channels] {
                return Err(Error::config(format!(
                    "{name} targets have shape {dims:?}, expected [{b}, {t_out}, {channels}]"
                )));
            }
        }
        if let Some(stop) = &batch.stop_token_targets
            && stop.dims() != [b, t_out]
        {
            return Err(Error::config(format!(
                "stop-token targets have shape {:?}, expected [{b}, {t_out}]",
                stop.dims()
            )));
        }
        if t_out == 0 || t_out % cfg.outputs_per_step != 0 {
            return Err(Error::config(format!(
                "target length {t_out} is not a positive multiple of outputs_per_step ({})",
                cfg.outputs_per_step
            )));
        }
        if let Some(lengths) = &batch.targets_lengths
            && lengths.len() != b
        {
            return Err(Error::config(format!(
                "got {} target lengths for a batch of {b}",
                lengths.len()
            )));
        }

        let frames = Tensor::cat(
            &[
                &pitch.to_dtype(self.dtype)?,
                &spectral.to_dtype(self.dtype)?,
                &aperiodicity.to_dtype(self.dtype)?,
            ],
            2,
        )?
        .contiguous()?;
        let stop_tokens = batch
            .stop_token_targets
            .as_ref()
            .map(|s| s.to_dtype(self.dtype))
            .transpose()?;
        Ok(Some(Targets {
            frames,
            stop_tokens,
            lengths: batch.targets_lengths.clone(),
        }))
    }
}

/// Build a `[B, T]` u32 input tensor from per-example symbol IDs, zero padded.
pub fn pad_inputs(sequences: &[Vec<u32>], device: &Device) -> Result<(Tensor, Vec<usize>)> {
    let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
    let mut data = Vec::with_capacity(sequences.len() * max_len);
    for seq in sequences {
        data.extend_from_slice(seq);
        data.extend(std::iter::repeat_n(0u32, max_len - seq.len()));
    }
    let lengths = sequences.iter().map(Vec::len).collect();
    Ok((Tensor::from_vec(data, (sequences.len(), max_len), device)?, lengths))
}
