//! Hyperparameters for the Tacotron feature-prediction model.
//!
//! Defaults follow the WORLD-vocoder variant of Tacotron-2: one log-F0
//! channel, 60 mel-generalized cepstrum channels and 5 band aperiodicity
//! channels per frame.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How the teacher-forcing ratio evolves during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeacherForcingMode {
    /// Fixed ratio (`teacher_forcing_ratio`) for the whole run.
    Constant,
    /// Cosine decay from `teacher_forcing_init_ratio` driven by the global step.
    Scheduled,
}

/// Complete set of knobs consumed by the model, loss and optimizer.
///
/// Unknown fields in a JSON file are rejected; missing fields fall back to
/// [`TacotronConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TacotronConfig {
    // --- Symbols / acoustic features ---
    /// Size of the symbol table (embedding rows).
    pub num_symbols: usize,
    pub num_pitch: usize,
    pub num_spectral: usize,
    pub num_aperiodicity: usize,

    // --- Embedding / encoder ---
    pub embedding_dim: usize,
    pub enc_conv_num_layers: usize,
    pub enc_conv_kernel_size: usize,
    pub enc_conv_channels: usize,
    /// Units per direction of the bidirectional encoder LSTM.
    pub encoder_lstm_units: usize,
    pub zoneout_rate: f64,
    /// Dropout for convolutions (training only) and the prenet (always).
    pub dropout_rate: f64,
    pub batch_norm_momentum: f64,
    pub batch_norm_epsilon: f64,

    // --- Attention ---
    pub attention_dim: usize,
    pub attention_filters: usize,
    pub attention_kernel: usize,
    /// Use sigmoid-based smoothing normalization instead of softmax.
    pub smoothing: bool,
    /// Feed the running sum of alignments to the location features.
    pub cumulative_weights: bool,
    /// Mask attention scores beyond each input length.
    pub mask_encoder: bool,

    // --- Decoder ---
    pub prenet_layers: Vec<usize>,
    pub decoder_layers: usize,
    pub decoder_lstm_units: usize,
    /// Reduction factor: frames emitted per decoder step.
    pub outputs_per_step: usize,
    /// Hard cap on decoder iterations outside training/evaluation.
    pub max_iters: usize,
    pub stop_threshold: f64,
    /// Keep per-step decoder outputs in host memory during the loop.
    pub swap_with_cpu: bool,

    // --- Postnet ---
    pub postnet_num_layers: usize,
    pub postnet_kernel_size: usize,
    pub postnet_channels: usize,

    // --- Loss ---
    /// Length-masked losses; disables the guided-attention term.
    pub mask_decoder: bool,
    pub cross_entropy_pos_weight: f64,
    /// Weight for pitch entries of unvoiced frames in the masked MSE.
    pub unvoiced_pitch_weight: f64,
    /// Pitch targets at or below this value count as unvoiced.
    pub unvoiced_pitch_threshold: f64,
    /// Guided-attention template height (encoder steps).
    pub max_text_length: usize,
    /// Guided-attention template width (decoder steps).
    pub max_frame_num: usize,
    pub guided_attention_sigma: f64,
    pub reg_weight: f64,

    // --- Teacher forcing ---
    pub teacher_forcing_mode: TeacherForcingMode,
    pub teacher_forcing_ratio: f64,
    pub teacher_forcing_init_ratio: f64,
    pub teacher_forcing_final_ratio: f64,
    pub teacher_forcing_start_decay: usize,
    pub teacher_forcing_decay_steps: usize,
    /// Final ratio as a fraction of the initial one; derived when absent.
    pub teacher_forcing_decay_alpha: Option<f64>,
    /// Ground-truth-aligned runs take no spectral targets.
    pub gta_excludes_spectral: bool,

    // --- Optimizer ---
    pub decay_learning_rate: bool,
    pub start_decay: usize,
    pub decay_steps: usize,
    pub decay_rate: f64,
    pub initial_learning_rate: f64,
    pub final_learning_rate: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub clip_gradients: bool,
    pub clip_norm: f64,

    /// Seed for the teacher-forcing draws.
    pub seed: Option<u64>,
}

impl Default for TacotronConfig {
    fn default() -> Self {
        Self {
            num_symbols: 150,
            num_pitch: 1,
            num_spectral: 60,
            num_aperiodicity: 5,

            embedding_dim: 512,
            enc_conv_num_layers: 3,
            enc_conv_kernel_size: 5,
            enc_conv_channels: 512,
            encoder_lstm_units: 256,
            zoneout_rate: 0.1,
            dropout_rate: 0.5,
            batch_norm_momentum: 0.99,
            batch_norm_epsilon: 1e-3,

            attention_dim: 128,
            attention_filters: 32,
            attention_kernel: 31,
            smoothing: false,
            cumulative_weights: true,
            mask_encoder: true,

            prenet_layers: vec![256, 256],
            decoder_layers: 2,
            decoder_lstm_units: 1024,
            outputs_per_step: 2,
            max_iters: 2500,
            stop_threshold: 0.5,
            swap_with_cpu: false,

            postnet_num_layers: 5,
            postnet_kernel_size: 5,
            postnet_channels: 512,

            mask_decoder: false,
            cross_entropy_pos_weight: 1.0,
            unvoiced_pitch_weight: 1.0,
            unvoiced_pitch_threshold: 0.0,
            max_text_length: 300,
            max_frame_num: 1000,
            guided_attention_sigma: 0.2,
            reg_weight: 1e-6,

            teacher_forcing_mode: TeacherForcingMode::Constant,
            teacher_forcing_ratio: 1.0,
            teacher_forcing_init_ratio: 1.0,
            teacher_forcing_final_ratio: 0.0,
            teacher_forcing_start_decay: 10_000,
            teacher_forcing_decay_steps: 280_000,
            teacher_forcing_decay_alpha: None,
            gta_excludes_spectral: true,

            decay_learning_rate: true,
            start_decay: 50_000,
            decay_steps: 50_000,
            decay_rate: 0.5,
            initial_learning_rate: 1e-3,
            final_learning_rate: 1e-5,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-6,
            clip_gradients: true,
            clip_norm: 1.0,

            seed: None,
        }
    }
}

impl TacotronConfig {
    /// Load from a JSON file, then validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Channels per acoustic frame.
    pub fn target_depth(&self) -> usize {
        self.num_pitch + self.num_spectral + self.num_aperiodicity
    }

    /// Width of the encoder output (both LSTM directions).
    pub fn encoder_output_dim(&self) -> usize {
        2 * self.encoder_lstm_units
    }

    /// Effective `alpha` of the teacher-forcing cosine decay.
    pub fn teacher_forcing_alpha(&self) -> f64 {
        self.teacher_forcing_decay_alpha.unwrap_or_else(|| {
            if self.teacher_forcing_init_ratio > 0.0 {
                self.teacher_forcing_final_ratio / self.teacher_forcing_init_ratio
            } else {
                0.0
            }
        })
    }

    /// Reject hyperparameter combinations the graph cannot be built from.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_symbols", self.num_symbols),
            ("num_pitch", self.num_pitch),
            ("embedding_dim", self.embedding_dim),
            ("enc_conv_num_layers", self.enc_conv_num_layers),
            ("enc_conv_channels", self.enc_conv_channels),
            ("encoder_lstm_units", self.encoder_lstm_units),
            ("attention_dim", self.attention_dim),
            ("attention_filters", self.attention_filters),
            ("decoder_layers", self.decoder_layers),
            ("decoder_lstm_units", self.decoder_lstm_units),
            ("outputs_per_step", self.outputs_per_step),
            ("max_iters", self.max_iters),
            ("postnet_num_layers", self.postnet_num_layers),
            ("postnet_channels", self.postnet_channels),
            ("max_text_length", self.max_text_length),
            ("max_frame_num", self.max_frame_num),
            ("decay_steps", self.decay_steps),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::config(format!("{name} must be > 0")));
            }
        }

        for (name, kernel) in [
            ("enc_conv_kernel_size", self.enc_conv_kernel_size),
            ("attention_kernel", self.attention_kernel),
            ("postnet_kernel_size", self.postnet_kernel_size),
        ] {
            if kernel % 2 == 0 {
                return Err(Error::config(format!(
                    "{name} must be odd for same-length convolution, got {kernel}"
                )));
            }
        }

        if self.prenet_layers.is_empty() || self.prenet_layers.contains(&0) {
            return Err(Error::config("prenet_layers must be non-empty and > 0"));
        }

        for (name, rate) in [
            ("zoneout_rate", self.zoneout_rate),
            ("dropout_rate", self.dropout_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(Error::config(format!("{name} must be in [0, 1), got {rate}")));
            }
        }

        for (name, ratio) in [
            ("teacher_forcing_ratio", self.teacher_forcing_ratio),
            ("teacher_forcing_init_ratio", self.teacher_forcing_init_ratio),
            ("teacher_forcing_final_ratio", self.teacher_forcing_final_ratio),
            ("stop_threshold", self.stop_threshold),
            ("batch_norm_momentum", self.batch_norm_momentum),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(Error::config(format!("{name} must be in [0, 1], got {ratio}")));
            }
        }

        if let Some(alpha) = self.teacher_forcing_decay_alpha
            && !(0.0..=1.0).contains(&alpha)
        {
            return Err(Error::config(format!(
                "teacher_forcing_decay_alpha must be in [0, 1], got {alpha}"
            )));
        }

        if self.initial_learning_rate <= 0.0 || self.final_learning_rate <= 0.0 {
            return Err(Error::config("learning rates must be > 0"));
        }
        if self.final_learning_rate > self.initial_learning_rate {
            return Err(Error::config(format!(
                "final_learning_rate ({}) exceeds initial_learning_rate ({})",
                self.final_learning_rate, self.initial_learning_rate
            )));
        }
        if !(self.decay_rate > 0.0 && self.decay_rate <= 1.0) {
            return Err(Error::config(format!(
                "decay_rate must be in (0, 1], got {}",
                self.decay_rate
            )));
        }
        if self.clip_norm <= 0.0 {
            return Err(Error::config("clip_norm must be > 0"));
        }
        if self.guided_attention_sigma <= 0.0 {
            return Err(Error::config("guided_attention_sigma must be > 0"));
        }
        if self.unvoiced_pitch_weight < 0.0 {
            return Err(Error::config("unvoiced_pitch_weight must be >= 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = TacotronConfig::default();
        assert_eq!(cfg.target_depth(), 66); // 1 + 60 + 5
        assert_eq!(cfg.encoder_output_dim(), 512);
        assert_eq!(cfg.teacher_forcing_mode, TeacherForcingMode::Constant);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "num_symbols": 42, "outputs_per_step": 3, "teacher_forcing_mode": "scheduled" }"#;
        let cfg: TacotronConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.num_symbols, 42);
        assert_eq!(cfg.outputs_per_step, 3);
        assert_eq!(cfg.teacher_forcing_mode, TeacherForcingMode::Scheduled);
        assert_eq!(cfg.decoder_lstm_units, 1024);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = r#"{ "num_symbolz": 42 }"#;
        assert!(serde_json::from_str::<TacotronConfig>(json).is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        let cfg = TacotronConfig {
            num_symbols: 80,
            mask_decoder: true,
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
        let loaded = TacotronConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_teacher_forcing_alpha() {
        let cfg = TacotronConfig {
            teacher_forcing_init_ratio: 0.8,
            teacher_forcing_final_ratio: 0.2,
            ..Default::default()
        };
        assert!((cfg.teacher_forcing_alpha() - 0.25).abs() < 1e-12);

        let cfg = TacotronConfig {
            teacher_forcing_decay_alpha: Some(0.1),
            ..Default::default()
        };
        assert_eq!(cfg.teacher_forcing_alpha(), 0.1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let even_kernel = TacotronConfig {
            attention_kernel: 30,
            ..Default::default()
        };
        assert!(matches!(even_kernel.validate(), Err(Error::Config(_))));

        let zero_r = TacotronConfig {
            outputs_per_step: 0,
            ..Default::default()
        };
        assert!(zero_r.validate().is_err());

        let inverted_lr = TacotronConfig {
            initial_learning_rate: 1e-5,
            final_learning_rate: 1e-3,
            ..Default::default()
        };
        assert!(inverted_lr.validate().is_err());

        let bad_dropout = TacotronConfig {
            dropout_rate: 1.0,
            ..Default::default()
        };
        assert!(bad_dropout.validate().is_err());

        let no_conv_layers = TacotronConfig {
            enc_conv_num_layers: 0,
            ..Default::default()
        };
        assert!(matches!(no_conv_layers.validate(), Err(Error::Config(_))));

        let no_iters = TacotronConfig {
            max_iters: 0,
            ..Default::default()
        };
        assert!(matches!(no_iters.validate(), Err(Error::Config(_))));
    }
}
