//! Autoregressive decoder.
//!
//! ```text
//! input frame ──► Prenet ─┐
//! prev context ───────────┴► concat ─► N × ZoneoutLSTM ─► query
//!                                                          │
//!                       LocationSensitiveAttention ◄───────┘
//!                                │ context
//!             [lstm_out ⊕ context] ─► FrameProjection (depth·r)
//!                                  └► StopProjection  (r logits)
//! ```
//!
//! [`DecoderCell::step`] is a pure function of its inputs and the previous
//! [`DecoderState`]; [`dynamic_decode`] threads the state through time and lets
//! a [`DecoderHelper`] pick each next input and decide termination.

use candle_core::{Device, Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::attention::{AttentionMemory, LocationSensitiveAttention};
use super::helpers::DecoderHelper;
use super::layers::{FrameProjection, LstmState, ParamRegistry, Prenet, StopProjection, ZoneoutLstmCell};
use crate::config::TacotronConfig;

// ---------------------------------------------------------------------------
// Stacked LSTM
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DecoderRnn {
    cells: Vec<ZoneoutLstmCell>,
}

impl DecoderRnn {
    pub fn new(
        input_size: usize,
        num_layers: usize,
        units: usize,
        zoneout: f64,
        vb: VarBuilder,
        reg: &mut ParamRegistry,
    ) -> Result<Self> {
        let mut cells = Vec::with_capacity(num_layers);
        let mut in_dim = input_size;
        for i in 0..num_layers {
            cells.push(ZoneoutLstmCell::new(
                in_dim,
                units,
                zoneout,
                vb.pp(format!("decoder_lstm_{i}")),
                reg,
            )?);
            in_dim = units;
        }
        Ok(Self { cells })
    }

    pub fn zero_state(&self, batch: usize, dtype: candle_core::DType, dev: &Device) -> Result<Vec<LstmState>> {
        self.cells
            .iter()
            .map(|cell| cell.zero_state(batch, dtype, dev))
            .collect()
    }

    /// Run every layer once; returns the top layer's output and the new states.
    pub fn step(&self, xs: &Tensor, states: &[LstmState], train: bool) -> Result<(Tensor, Vec<LstmState>)> {
        let mut h = xs.clone();
        let mut next = Vec::with_capacity(self.cells.len());
        for (cell, state) in self.cells.iter().zip(states) {
            let s = cell.step(&h, state, train)?;
            h = s.h.clone();
            next.push(s);
        }
        Ok((h, next))
    }
}

// ---------------------------------------------------------------------------
// Decoder cell
// ---------------------------------------------------------------------------

/// Everything carried from one decoder step to the next.
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub cell_states: Vec<LstmState>,
    /// `[B, enc_dim]`
    pub context: Tensor,
    /// `[B, T_in]` previous or cumulative alignments, per `cumulative_weights`.
    pub attention_state: Tensor,
    /// One `[B, T_in]` alignment per completed step.
    pub alignment_history: Vec<Tensor>,
    pub time: usize,
}

/// Per-step outputs.
#[derive(Debug, Clone)]
pub struct DecoderStepOutput {
    /// `[B, depth * r]`
    pub frames: Tensor,
    /// `[B, r]`
    pub stop_logits: Tensor,
    /// `[B, T_in]`
    pub alignments: Tensor,
}

#[derive(Debug, Clone)]
pub struct DecoderCell {
    prenet: Prenet,
    rnn: DecoderRnn,
    attention: LocationSensitiveAttention,
    frame_projection: FrameProjection,
    stop_projection: StopProjection,
    swap_with_cpu: bool,
}

impl DecoderCell {
    pub fn new(cfg: &TacotronConfig, vb: VarBuilder, reg: &mut ParamRegistry) -> Result<Self> {
        let depth = cfg.target_depth();
        let r = cfg.outputs_per_step;
        let enc_dim = cfg.encoder_output_dim();

        let prenet = Prenet::new(depth, &cfg.prenet_layers, cfg.dropout_rate, true, vb.pp("decoder_prenet"), reg)?;
        let rnn = DecoderRnn::new(
            prenet.output_size() + enc_dim,
            cfg.decoder_layers,
            cfg.decoder_lstm_units,
            cfg.zoneout_rate,
            vb.pp("decoder_lstm"),
            reg,
        )?;
        let attention =
            LocationSensitiveAttention::new(cfg.decoder_lstm_units, enc_dim, cfg, vb.pp("location_sensitive_attention"), reg)?;
        let projection_in = cfg.decoder_lstm_units + enc_dim;
        let frame_projection = FrameProjection::new(projection_in, depth * r, vb.pp("linear_transform"), reg)?;
        let stop_projection = StopProjection::new(projection_in, r, vb.pp("stop_token_projection"), reg)?;
        Ok(Self {
            prenet,
            rnn,
            attention,
            frame_projection,
            stop_projection,
            swap_with_cpu: cfg.swap_with_cpu,
        })
    }

    pub fn attention(&self) -> &LocationSensitiveAttention {
        &self.attention
    }

    pub fn swap_with_cpu(&self) -> bool {
        self.swap_with_cpu
    }

    /// Zero state for a fresh run over `memory`.
    pub fn initial_state(&self, memory: &AttentionMemory) -> Result<DecoderState> {
        let batch = memory.batch_size()?;
        let dtype = memory.values.dtype();
        let dev = memory.values.device();
        Ok(DecoderState {
            cell_states: self.rnn.zero_state(batch, dtype, dev)?,
            context: self.attention.initial_context(memory)?,
            attention_state: self.attention.initial_alignments(memory)?,
            alignment_history: Vec::new(),
            time: 0,
        })
    }

    /// One decoder step. `inputs`: `[B, depth]`.
    pub fn step(
        &self,
        inputs: &Tensor,
        state: DecoderState,
        memory: &AttentionMemory,
        train: bool,
    ) -> Result<(DecoderStepOutput, DecoderState)> {
        let prenet_out = self.prenet.forward_t(inputs, train)?;
        let lstm_in = Tensor::cat(&[&prenet_out, &state.context], 1)?;
        let (lstm_out, cell_states) = self.rnn.step(&lstm_in, &state.cell_states, train)?;

        let attn = self.attention.step(&lstm_out, &state.attention_state, memory)?;

        let projection_in = Tensor::cat(&[&lstm_out, &attn.context], 1)?;
        let frames = self.frame_projection.forward(&projection_in)?;
        let stop_logits = self.stop_projection.forward(&projection_in)?;

        let mut alignment_history = state.alignment_history;
        alignment_history.push(if self.swap_with_cpu {
            attn.alignments.to_device(&Device::Cpu)?
        } else {
            attn.alignments.clone()
        });

        let next = DecoderState {
            cell_states,
            context: attn.context,
            attention_state: attn.next_state,
            alignment_history,
            time: state.time + 1,
        };
        Ok((
            DecoderStepOutput {
                frames,
                stop_logits,
                alignments: attn.alignments,
            },
            next,
        ))
    }
}

// ---------------------------------------------------------------------------
// Decode loop
// ---------------------------------------------------------------------------

/// Stacked results of a full decoder run.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[B, steps, depth * r]`
    pub frames: Tensor,
    /// `[B, steps, r]`
    pub stop_logits: Tensor,
    /// `[B, T_in, steps]`
    pub alignments: Tensor,
    /// Decoder steps each example ran before finishing (inclusive).
    pub decoder_lengths: Vec<usize>,
    pub iterations: usize,
}

/// Zero the rows of `xs: [B, N]` whose example already finished.
fn mask_finished(xs: &Tensor, finished: &[bool]) -> Result<Tensor> {
    if !finished.iter().any(|&f| f) {
        return Ok(xs.clone());
    }
    let keep: Vec<f32> = finished.iter().map(|&f| if f { 0.0 } else { 1.0 }).collect();
    let keep = Tensor::from_vec(keep, (finished.len(), 1), xs.device())?.to_dtype(xs.dtype())?;
    xs.broadcast_mul(&keep)
}

/// Run `cell` until `helper` reports every example finished or `max_iters`
/// steps have been taken.
///
/// Examples that finish early keep flowing through the batch; their later
/// frames and stop logits are zeroed.
pub fn dynamic_decode(
    cell: &DecoderCell,
    helper: &mut dyn DecoderHelper,
    memory: &AttentionMemory,
    max_iters: Option<usize>,
    train: bool,
) -> Result<DecoderOutput> {
    let batch = helper.batch_size();
    let device = memory.values.device().clone();
    let host = if cell.swap_with_cpu() { Device::Cpu } else { device.clone() };

    let mut inputs = helper.initial_inputs()?;
    let mut state = cell.initial_state(memory)?;
    let mut finished = vec![false; batch];
    let mut decoder_lengths = vec![0usize; batch];
    let mut frames = Vec::new();
    let mut stop_logits = Vec::new();

    loop {
        let time = state.time;
        let (out, next_state) = cell.step(&inputs, state, memory, train)?;
        state = next_state;

        frames.push(mask_finished(&out.frames, &finished)?.to_device(&host)?);
        stop_logits.push(mask_finished(&out.stop_logits, &finished)?.to_device(&host)?);

        let step_finished = helper.is_finished(time, &out.stop_logits)?;
        for b in 0..batch {
            if !finished[b] {
                decoder_lengths[b] = time + 1;
                finished[b] = step_finished.get(b).copied().unwrap_or(false);
            }
        }

        if finished.iter().all(|&f| f) {
            break;
        }
        if let Some(max) = max_iters
            && state.time >= max
        {
            tracing::debug!("decoder hit max_iters={max} with unfinished examples");
            break;
        }
        inputs = helper.next_inputs(time, &out.frames)?;
    }

    let iterations = state.time;
    tracing::debug!(
        "decoder run: iterations={iterations} lengths={:?} swap_with_cpu={}",
        decoder_lengths,
        cell.swap_with_cpu()
    );

    let frames = Tensor::stack(&frames, 1)?.to_device(&device)?;
    let stop_logits = Tensor::stack(&stop_logits, 1)?.to_device(&device)?;
    let alignments = Tensor::stack(&state.alignment_history, 2)?.to_device(&device)?;

    Ok(DecoderOutput {
        frames,
        stop_logits,
        alignments,
        decoder_lengths,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::helpers::{SynthesisHelper, TrainingHelper};
    use candle_core::DType;
    use candle_nn::VarMap;

    fn tiny_cfg() -> TacotronConfig {
        TacotronConfig {
            num_pitch: 1,
            num_spectral: 2,
            num_aperiodicity: 1,
            encoder_lstm_units: 3,
            attention_dim: 4,
            attention_filters: 2,
            attention_kernel: 3,
            prenet_layers: vec![5, 5],
            decoder_layers: 2,
            decoder_lstm_units: 6,
            outputs_per_step: 2,
            ..TacotronConfig::default()
        }
    }

    fn build(cfg: &TacotronConfig, varmap: &VarMap) -> DecoderCell {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let mut reg = ParamRegistry::new();
        DecoderCell::new(cfg, vb.pp("decoder"), &mut reg).unwrap()
    }

    #[test]
    fn test_single_step_is_pure() {
        let dev = Device::Cpu;
        let cfg = TacotronConfig {
            dropout_rate: 0.0,
            ..tiny_cfg()
        };
        let varmap = VarMap::new();
        let cell = build(&cfg, &varmap);
        let memory = Tensor::randn(0f32, 1.0, (2, 5, 6), &dev).unwrap();
        let mem = cell.attention().prepare_memory(&memory, &[5, 3]).unwrap();
        let state = cell.initial_state(&mem).unwrap();
        let inputs = Tensor::zeros((2, 4), DType::F32, &dev).unwrap();

        let (a, next) = cell.step(&inputs, state.clone(), &mem, false).unwrap();
        let (b, _) = cell.step(&inputs, state, &mem, false).unwrap();
        assert_eq!(a.frames.dims(), &[2, 8]);
        assert_eq!(a.stop_logits.dims(), &[2, 2]);
        assert_eq!(next.time, 1);
        assert_eq!(next.alignment_history.len(), 1);
        let diff: f32 = (a.frames - b.frames).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_teacher_forced_run_length() {
        let dev = Device::Cpu;
        let cfg = tiny_cfg();
        let varmap = VarMap::new();
        let cell = build(&cfg, &varmap);
        let memory = Tensor::randn(0f32, 1.0, (2, 5, 6), &dev).unwrap();
        let mem = cell.attention().prepare_memory(&memory, &[5, 3]).unwrap();
        let targets = Tensor::randn(0f32, 1.0, (2, 10, 4), &dev).unwrap();
        let mut helper = TrainingHelper::new(&targets, 2, 1.0, 0).unwrap();

        let out = dynamic_decode(&cell, &mut helper, &mem, None, true).unwrap();
        assert_eq!(out.iterations, 5);
        assert_eq!(out.frames.dims(), &[2, 5, 8]);
        assert_eq!(out.stop_logits.dims(), &[2, 5, 2]);
        assert_eq!(out.alignments.dims(), &[2, 5, 5]);
        assert_eq!(out.decoder_lengths, vec![5, 5]);
    }

    #[test]
    fn test_synthesis_respects_max_iters_and_swap() {
        let dev = Device::Cpu;
        let cfg = TacotronConfig {
            swap_with_cpu: true,
            ..tiny_cfg()
        };
        let varmap = VarMap::new();
        let cell = build(&cfg, &varmap);
        // Push the stop logits far below zero so no example ever finishes.
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.starts_with("decoder.stop_token_projection") {
                let value = if name.ends_with("bias") { -1e4 } else { 0.0 };
                let filled = (var.as_tensor().zeros_like().unwrap() + value).unwrap();
                var.set(&filled).unwrap();
            }
        }
        let memory = Tensor::randn(0f32, 1.0, (2, 5, 6), &dev).unwrap();
        let mem = cell.attention().prepare_memory(&memory, &[5, 3]).unwrap();
        let mut helper = SynthesisHelper::new(2, 4, 0.5, DType::F32, &dev);

        let out = dynamic_decode(&cell, &mut helper, &mem, Some(20), false).unwrap();
        assert_eq!(out.iterations, 20);
        assert_eq!(out.frames.dims(), &[2, 20, 8]);
        assert_eq!(out.decoder_lengths, vec![20, 20]);
    }

    /// Feeds back predictions; example `b` finishes after `stop_after[b]` steps.
    struct StaggeredHelper {
        inner: SynthesisHelper,
        stop_after: Vec<usize>,
    }

    impl DecoderHelper for StaggeredHelper {
        fn batch_size(&self) -> usize {
            self.inner.batch_size()
        }

        fn initial_inputs(&self) -> Result<Tensor> {
            self.inner.initial_inputs()
        }

        fn next_inputs(&mut self, time: usize, outputs: &Tensor) -> Result<Tensor> {
            self.inner.next_inputs(time, outputs)
        }

        fn is_finished(&self, time: usize, _stop_logits: &Tensor) -> Result<Vec<bool>> {
            Ok(self.stop_after.iter().map(|&n| time + 1 >= n).collect())
        }
    }

    #[test]
    fn test_examples_finishing_at_different_steps() {
        let dev = Device::Cpu;
        let cfg = tiny_cfg();
        let varmap = VarMap::new();
        let cell = build(&cfg, &varmap);
        let memory = Tensor::randn(0f32, 1.0, (2, 5, 6), &dev).unwrap();
        let mem = cell.attention().prepare_memory(&memory, &[5, 3]).unwrap();
        let mut helper = StaggeredHelper {
            inner: SynthesisHelper::new(2, 4, 0.5, DType::F32, &dev),
            stop_after: vec![2, 5],
        };

        let out = dynamic_decode(&cell, &mut helper, &mem, Some(20), false).unwrap();
        assert_eq!(out.iterations, 5);
        assert_eq!(out.decoder_lengths, vec![2, 5]);
        assert_eq!(out.frames.dims(), &[2, 5, 8]);

        let abs_sum = |t: Tensor| -> f32 { t.abs().unwrap().sum_all().unwrap().to_scalar().unwrap() };
        let first_tail = out.frames.narrow(0, 0, 1).unwrap().narrow(1, 2, 3).unwrap();
        assert_eq!(abs_sum(first_tail), 0.0);
        let first_stop_tail = out.stop_logits.narrow(0, 0, 1).unwrap().narrow(1, 2, 3).unwrap();
        assert_eq!(abs_sum(first_stop_tail), 0.0);
        // The running example keeps producing frames.
        let second_tail = out.frames.narrow(0, 1, 1).unwrap().narrow(1, 2, 3).unwrap();
        assert!(abs_sum(second_tail) > 0.0);
        let first_head = out.frames.narrow(0, 0, 1).unwrap().narrow(1, 0, 2).unwrap();
        assert!(abs_sum(first_head) > 0.0);
    }

    #[test]
    fn test_finished_examples_are_masked() {
        let dev = Device::Cpu;
        let xs = Tensor::ones((3, 2), DType::F32, &dev).unwrap();
        let masked = mask_finished(&xs, &[false, true, false]).unwrap();
        let rows: Vec<Vec<f32>> = masked.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![1.0, 1.0], vec![0.0, 0.0], vec![1.0, 1.0]]);
    }
}
