//! Building blocks shared by the encoder, decoder and postnet.
//!
//! - [`BatchNorm1d`]: channel batch norm over `[B, C, T]` whose running
//!   statistics are queued in [`UpdateOps`] instead of being written in place
//! - [`ConvBlock`]: Conv1d → BatchNorm → activation → dropout
//! - [`ZoneoutLstmCell`]: LSTM cell with zoneout on both `h` and `c`
//! - [`Prenet`]: dense ReLU stack with dropout that is applied at inference too
//! - [`FrameProjection`] / [`StopProjection`]: decoder output heads
//! - [`ParamRegistry`]: explicit list of L2-regularizable weights (no biases)

use std::sync::{Arc, Mutex};

use candle_core::{D, DType, Module, Result, Tensor, Var};
use candle_nn::{Conv1d, Conv1dConfig, Init, Linear, VarBuilder};

// ---------------------------------------------------------------------------
// Parameter registry / update ops
// ---------------------------------------------------------------------------

/// Normalization-statistics updates recorded by training forward passes.
///
/// The updates are held back until [`UpdateOps::apply`] is called, so the
/// training step decides when running statistics change relative to the
/// parameter update.
#[derive(Debug, Clone, Default)]
pub struct UpdateOps {
    pending: Arc<Mutex<Vec<(Var, Tensor)>>>,
}

impl UpdateOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `var <- value`.
    pub fn push(&self, var: &Var, value: Tensor) {
        self.lock().push((var.clone(), value));
    }

    /// Number of queued updates.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every queued update and empty the queue. Returns how many were applied.
    pub fn apply(&self) -> Result<usize> {
        let pending: Vec<_> = self.lock().drain(..).collect();
        for (var, value) in pending.iter() {
            var.set(value)?;
        }
        Ok(pending.len())
    }

    /// Drop queued updates without applying them. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut pending = self.lock();
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Var, Tensor)>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parameters declared by layers at construction time.
///
/// Each layer registers its weight matrices / kernels here; biases, norm
/// offsets and running statistics are never registered, so the L2 term is a
/// plain sum over [`ParamRegistry::regularizable`].
#[derive(Debug, Clone, Default)]
pub struct ParamRegistry {
    regularizable: Vec<Tensor>,
    update_ops: UpdateOps,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_weight(&mut self, weight: &Tensor) {
        self.regularizable.push(weight.clone());
    }

    pub fn regularizable(&self) -> &[Tensor] {
        &self.regularizable
    }

    pub fn update_ops(&self) -> &UpdateOps {
        &self.update_ops
    }
}

fn linear(in_dim: usize, out_dim: usize, vb: VarBuilder, reg: &mut ParamRegistry) -> Result<Linear> {
    let layer = candle_nn::linear(in_dim, out_dim, vb)?;
    reg.register_weight(layer.weight());
    Ok(layer)
}

pub(crate) fn linear_no_bias(
    in_dim: usize,
    out_dim: usize,
    vb: VarBuilder,
    reg: &mut ParamRegistry,
) -> Result<Linear> {
    let layer = candle_nn::linear_no_bias(in_dim, out_dim, vb)?;
    reg.register_weight(layer.weight());
    Ok(layer)
}

/// Conv1d with `kernel_size / 2` padding so the time length is preserved.
pub(crate) fn same_conv1d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    vb: VarBuilder,
    reg: &mut ParamRegistry,
) -> Result<Conv1d> {
    let cfg = Conv1dConfig {
        padding: kernel_size / 2,
        ..Default::default()
    };
    let conv = candle_nn::conv1d(in_channels, out_channels, kernel_size, cfg, vb)?;
    reg.register_weight(conv.weight());
    Ok(conv)
}

/// Dropout that is a no-op when `active` is false or the rate is zero.
pub(crate) fn maybe_dropout(xs: &Tensor, rate: f64, active: bool) -> Result<Tensor> {
    if active && rate > 0.0 {
        candle_nn::ops::dropout(xs, rate as f32)
    } else {
        Ok(xs.clone())
    }
}

// ---------------------------------------------------------------------------
// Batch norm
// ---------------------------------------------------------------------------

/// Batch normalization over the channel axis of `[B, C, T]`.
///
/// Training mode normalizes with the batch statistics and queues an
/// exponential-moving-average update of the running statistics:
/// `running = momentum * running + (1 - momentum) * batch`.
/// Inference mode normalizes with the running statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm1d {
    gamma: Tensor,
    beta: Tensor,
    running_mean: Var,
    running_var: Var,
    momentum: f64,
    eps: f64,
    update_ops: UpdateOps,
}

impl BatchNorm1d {
    pub fn new(
        num_features: usize,
        momentum: f64,
        eps: f64,
        vb: VarBuilder,
        reg: &ParamRegistry,
    ) -> Result<Self> {
        let gamma = vb.get_with_hints(num_features, "gamma", Init::Const(1.0))?;
        let beta = vb.get_with_hints(num_features, "beta", Init::Const(0.0))?;
        let running_mean = vb.get_with_hints(num_features, "running_mean", Init::Const(0.0))?;
        let running_var = vb.get_with_hints(num_features, "running_var", Init::Const(1.0))?;
        Ok(Self {
            gamma,
            beta,
            running_mean: Var::from_tensor(&running_mean)?,
            running_var: Var::from_tensor(&running_var)?,
            momentum,
            eps,
            update_ops: reg.update_ops().clone(),
        })
    }

    pub fn running_mean(&self) -> &Tensor {
        self.running_mean.as_tensor()
    }

    /// `xs`: `[B, C, T]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let c = xs.dim(1)?;
        let (mean, var) = if train {
            let mean = xs.mean_keepdim(2)?.mean_keepdim(0)?; // [1, C, 1]
            let centered = xs.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim(2)?.mean_keepdim(0)?;

            let m = self.momentum;
            let batch_mean = mean.flatten_all()?.to_dtype(self.running_mean.dtype())?;
            let batch_var = var.flatten_all()?.to_dtype(self.running_var.dtype())?;
            let next_mean = ((self.running_mean.as_tensor() * m)? + (batch_mean * (1.0 - m))?)?;
            let next_var = ((self.running_var.as_tensor() * m)? + (batch_var * (1.0 - m))?)?;
            self.update_ops.push(&self.running_mean, next_mean);
            self.update_ops.push(&self.running_var, next_var);

            (mean, var)
        } else {
            let mean = self
                .running_mean
                .as_tensor()
                .to_dtype(xs.dtype())?
                .reshape((1, c, 1))?;
            let var = self
                .running_var
                .as_tensor()
                .to_dtype(xs.dtype())?
                .reshape((1, c, 1))?;
            (mean, var)
        };

        let normed = xs
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.gamma.reshape((1, c, 1))?)?
            .broadcast_add(&self.beta.reshape((1, c, 1))?)
    }
}

// ---------------------------------------------------------------------------
// Convolution block
// ---------------------------------------------------------------------------

/// Nonlinearity applied after the batch norm of a [`ConvBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvActivation {
    Relu,
    Tanh,
    Identity,
}

/// Conv1d ("same" padding) → BatchNorm → activation → dropout (training only).
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv: Conv1d,
    norm: BatchNorm1d,
    activation: ConvActivation,
    dropout_rate: f64,
}

impl ConvBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        activation: ConvActivation,
        dropout_rate: f64,
        bn_momentum: f64,
        bn_eps: f64,
        vb: VarBuilder,
        reg: &mut ParamRegistry,
    ) -> Result<Self> {
        let conv = same_conv1d(in_channels, out_channels, kernel_size, vb.pp("conv"), reg)?;
        let norm = BatchNorm1d::new(out_channels, bn_momentum, bn_eps, vb.pp("batch_norm"), reg)?;
        Ok(Self {
            conv,
            norm,
            activation,
            dropout_rate,
        })
    }

    /// `xs`: `[B, C_in, T]` → `[B, C_out, T]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.conv.forward(xs)?;
        let h = self.norm.forward_t(&h, train)?;
        let h = match self.activation {
            ConvActivation::Relu => h.relu()?,
            ConvActivation::Tanh => h.tanh()?,
            ConvActivation::Identity => h,
        };
        maybe_dropout(&h, self.dropout_rate, train)
    }
}

// ---------------------------------------------------------------------------
// Zoneout LSTM
// ---------------------------------------------------------------------------

/// Hidden and cell state of one LSTM layer, each `[B, H]`.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

/// LSTM cell with zoneout regularization.
///
/// Gate order is `i, f, g, o`; the forget gate gets a constant `+1.0` bias.
/// During training each unit keeps its previous value with probability
/// `zoneout`; at inference the update is the expectation
/// `(1 - zoneout) * new + zoneout * previous`.
#[derive(Debug, Clone)]
pub struct ZoneoutLstmCell {
    input_proj: Linear,
    hidden_proj: Linear,
    hidden_size: usize,
    zoneout: f64,
}

impl ZoneoutLstmCell {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        zoneout: f64,
        vb: VarBuilder,
        reg: &mut ParamRegistry,
    ) -> Result<Self> {
        let input_proj = linear(input_size, 4 * hidden_size, vb.pp("kernel_ih"), reg)?;
        let hidden_proj = linear_no_bias(hidden_size, 4 * hidden_size, vb.pp("kernel_hh"), reg)?;
        Ok(Self {
            input_proj,
            hidden_proj,
            hidden_size,
            zoneout,
        })
    }

    pub fn zero_state(&self, batch: usize, dtype: DType, dev: &candle_core::Device) -> Result<LstmState> {
        let zeros = Tensor::zeros((batch, self.hidden_size), dtype, dev)?;
        Ok(LstmState {
            h: zeros.clone(),
            c: zeros,
        })
    }

    /// One step. `xs`: `[B, input_size]`.
    pub fn step(&self, xs: &Tensor, state: &LstmState, train: bool) -> Result<LstmState> {
        let gates = (self.input_proj.forward(xs)? + self.hidden_proj.forward(&state.h)?)?;
        let chunks = gates.chunk(4, D::Minus1)?;
        let i = candle_nn::ops::sigmoid(&chunks[0])?;
        let f = candle_nn::ops::sigmoid(&(&chunks[1] + 1.0)?)?;
        let g = chunks[2].tanh()?;
        let o = candle_nn::ops::sigmoid(&chunks[3])?;

        let new_c = ((f * &state.c)? + (i * g)?)?;
        let new_h = (o * new_c.tanh()?)?;

        if self.zoneout <= 0.0 {
            return Ok(LstmState { h: new_h, c: new_c });
        }
        Ok(LstmState {
            h: self.zoneout(&new_h, &state.h, train)?,
            c: self.zoneout(&new_c, &state.c, train)?,
        })
    }

    fn zoneout(&self, new: &Tensor, prev: &Tensor, train: bool) -> Result<Tensor> {
        let z = self.zoneout;
        if train {
            // 1 where the unit takes the new value.
            let keep_new = Tensor::rand(0f32, 1f32, new.shape(), new.device())?
                .ge(z)?
                .to_dtype(new.dtype())?;
            prev + (new - prev)?.mul(&keep_new)?
        } else {
            (new * (1.0 - z))? + (prev * z)?
        }
    }
}

// ---------------------------------------------------------------------------
// Prenet / projections
// ---------------------------------------------------------------------------

/// Dense ReLU layers followed by dropout.
///
/// `always_apply` keeps dropout active outside training; the decoder prenet
/// is built with it set, so synthesis stays stochastic.
#[derive(Debug, Clone)]
pub struct Prenet {
    layers: Vec<Linear>,
    output_size: usize,
    dropout_rate: f64,
    always_apply: bool,
}

impl Prenet {
    pub fn new(
        input_size: usize,
        layer_sizes: &[usize],
        dropout_rate: f64,
        always_apply: bool,
        vb: VarBuilder,
        reg: &mut ParamRegistry,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(layer_sizes.len());
        let mut in_dim = input_size;
        for (i, &size) in layer_sizes.iter().enumerate() {
            layers.push(linear(in_dim, size, vb.pp(format!("dense_{i}")), reg)?);
            in_dim = size;
        }
        Ok(Self {
            layers,
            output_size: in_dim,
            dropout_rate,
            always_apply,
        })
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn always_apply(&self) -> bool {
        self.always_apply
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = xs.clone();
        for layer in &self.layers {
            h = layer.forward(&h)?.relu()?;
            h = maybe_dropout(&h, self.dropout_rate, self.always_apply || train)?;
        }
        Ok(h)
    }
}

/// Linear projection of `[lstm_out ⊕ context]` to `target_depth * r` frame values.
#[derive(Debug, Clone)]
pub struct FrameProjection {
    dense: Linear,
}

impl FrameProjection {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder, reg: &mut ParamRegistry) -> Result<Self> {
        Ok(Self {
            dense: linear(in_dim, out_dim, vb.pp("projection"), reg)?,
        })
    }
}

impl Module for FrameProjection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.dense.forward(xs)
    }
}

/// Linear projection to `r` stop-token logits (no activation).
#[derive(Debug, Clone)]
pub struct StopProjection {
    dense: Linear,
}

impl StopProjection {
    pub fn new(in_dim: usize, r: usize, vb: VarBuilder, reg: &mut ParamRegistry) -> Result<Self> {
        Ok(Self {
            dense: linear(in_dim, r, vb.pp("projection"), reg)?,
        })
    }
}

impl Module for StopProjection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.dense.forward(xs)
    }
}
