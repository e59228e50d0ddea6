//! Postnet: convolutional residual predictor applied to the decoder frames.
//!
//! ```text
//! frames [B, T, depth]
//!   → (N-1) × (Conv1d → BatchNorm → tanh → Dropout)
//!   →        Conv1d → BatchNorm → Dropout
//!   → Linear(channels → depth)             residual [B, T, depth]
//! ```

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::layers::{ConvActivation, ConvBlock, ParamRegistry};
use crate::config::TacotronConfig;

#[derive(Debug, Clone)]
pub struct Postnet {
    blocks: Vec<ConvBlock>,
    projection: Linear,
}

impl Postnet {
    pub fn new(cfg: &TacotronConfig, vb: VarBuilder, reg: &mut ParamRegistry) -> Result<Self> {
        let depth = cfg.target_depth();
        let mut blocks = Vec::with_capacity(cfg.postnet_num_layers);
        let mut in_channels = depth;
        for i in 0..cfg.postnet_num_layers {
            let activation = if i + 1 == cfg.postnet_num_layers {
                ConvActivation::Identity
            } else {
                ConvActivation::Tanh
            };
            blocks.push(ConvBlock::new(
                in_channels,
                cfg.postnet_channels,
                cfg.postnet_kernel_size,
                activation,
                cfg.dropout_rate,
                cfg.batch_norm_momentum,
                cfg.batch_norm_epsilon,
                vb.pp(format!("conv_layer_{i}")),
                reg,
            )?);
            in_channels = cfg.postnet_channels;
        }
        let projection = candle_nn::linear(cfg.postnet_channels, depth, vb.pp("residual_projection"))?;
        reg.register_weight(projection.weight());
        Ok(Self { blocks, projection })
    }

    /// Residual for `frames: [B, T, depth]`.
    pub fn residual(&self, frames: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = frames.transpose(1, 2)?.contiguous()?;
        for block in &self.blocks {
            h = block.forward_t(&h, train)?;
        }
        let h = h.transpose(1, 2)?.contiguous()?;
        self.projection.forward(&h)
    }

    /// `frames + residual(frames)`.
    pub fn forward_t(&self, frames: &Tensor, train: bool) -> Result<Tensor> {
        frames + self.residual(frames, train)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_zero_residual_is_identity() {
        let dev = Device::Cpu;
        let cfg = TacotronConfig {
            postnet_num_layers: 3,
            postnet_channels: 4,
            postnet_kernel_size: 3,
            ..TacotronConfig::default()
        };
        let vb = candle_nn::VarBuilder::zeros(DType::F32, &dev);
        let mut reg = ParamRegistry::new();
        let postnet = Postnet::new(&cfg, vb, &mut reg).unwrap();
        // 3 conv kernels + the residual projection.
        assert_eq!(reg.regularizable().len(), 4);

        let frames = Tensor::randn(0f32, 1.0, (2, 6, cfg.target_depth()), &dev).unwrap();
        let out = postnet.forward_t(&frames, false).unwrap();
        assert_eq!(out.dims(), frames.dims());
        let diff: f32 = (out - &frames).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }
}
