//! Decoder helpers: what the decoder reads next and when it stops.
//!
//! - [`TrainingHelper`]: teacher forcing with a sampling ratio; runs for
//!   exactly `T_out / r` steps
//! - [`SynthesisHelper`]: feeds back its own predictions and stops per example
//!   once every stop probability in a frame group crosses the threshold
//!
//! Uses `ChaCha8Rng` for reproducible teacher-forcing draws.

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::{TacotronConfig, TeacherForcingMode};

/// Contract between [`super::decoder::dynamic_decode`] and the input strategy.
pub trait DecoderHelper {
    fn batch_size(&self) -> usize;

    /// `<GO>` frame `[B, target_depth]`.
    fn initial_inputs(&self) -> Result<Tensor>;

    /// Next decoder input after step `time` produced `outputs: [B, depth * r]`.
    fn next_inputs(&mut self, time: usize, outputs: &Tensor) -> Result<Tensor>;

    /// Per-example finished flags after step `time` produced `stop_logits: [B, r]`.
    fn is_finished(&self, time: usize, stop_logits: &Tensor) -> Result<Vec<bool>>;
}

/// Last frame of a packed `[B, depth * r]` frame group.
fn last_frame(outputs: &Tensor, depth: usize) -> Result<Tensor> {
    let width = outputs.dim(1)?;
    outputs.narrow(1, width - depth, depth)
}

// ---------------------------------------------------------------------------
// Teacher forcing
// ---------------------------------------------------------------------------

/// Teacher-forcing ratio for a run.
///
/// `Constant` returns the configured ratio. `Scheduled` holds
/// `teacher_forcing_init_ratio` until `teacher_forcing_start_decay` and then
/// follows a cosine decay over `teacher_forcing_decay_steps` down to
/// `init * alpha`.
pub fn teacher_forcing_ratio(cfg: &TacotronConfig, global_step: Option<usize>) -> f64 {
    let ratio = match cfg.teacher_forcing_mode {
        TeacherForcingMode::Constant => cfg.teacher_forcing_ratio,
        TeacherForcingMode::Scheduled => {
            let init = cfg.teacher_forcing_init_ratio;
            let step = global_step.unwrap_or(0);
            if step < cfg.teacher_forcing_start_decay {
                init
            } else {
                let decay_steps = cfg.teacher_forcing_decay_steps.max(1) as f64;
                let elapsed = ((step - cfg.teacher_forcing_start_decay) as f64).min(decay_steps);
                let cosine = 0.5 * (1.0 + (std::f64::consts::PI * elapsed / decay_steps).cos());
                let alpha = cfg.teacher_forcing_alpha();
                init * ((1.0 - alpha) * cosine + alpha)
            }
        }
    };
    ratio.clamp(0.0, 1.0)
}

/// Feeds ground-truth frames `targets[:, r-1::r]` with probability `ratio`,
/// otherwise the model's last predicted frame. One draw per step covers the
/// whole batch.
pub struct TrainingHelper {
    /// `[B, T_out / r, depth]`
    targets: Tensor,
    batch_size: usize,
    depth: usize,
    steps: usize,
    ratio: f64,
    rng: ChaCha8Rng,
}

impl TrainingHelper {
    /// `targets`: `[B, T_out, depth]` with `T_out` a multiple of `r`.
    pub fn new(targets: &Tensor, r: usize, ratio: f64, seed: u64) -> Result<Self> {
        let (batch_size, t_out, depth) = targets.dims3()?;
        let steps = t_out / r;
        let idx: Vec<u32> = (0..steps).map(|i| (i * r + r - 1) as u32).collect();
        let idx = Tensor::from_vec(idx, steps, targets.device())?;
        let targets = targets.contiguous()?.index_select(&idx, 1)?;
        Ok(Self {
            targets,
            batch_size,
            depth,
            steps,
            ratio,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Decoder steps this helper runs for.
    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl DecoderHelper for TrainingHelper {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn initial_inputs(&self) -> Result<Tensor> {
        Tensor::zeros(
            (self.batch_size, self.depth),
            self.targets.dtype(),
            self.targets.device(),
        )
    }

    fn next_inputs(&mut self, time: usize, outputs: &Tensor) -> Result<Tensor> {
        // Past the last target group the run is over; keep the shape valid.
        if time >= self.steps {
            return last_frame(outputs, self.depth);
        }
        let draw: f64 = self.rng.random();
        if draw < self.ratio {
            self.targets.i((.., time, ..))?.contiguous()
        } else {
            last_frame(outputs, self.depth)
        }
    }

    fn is_finished(&self, time: usize, _stop_logits: &Tensor) -> Result<Vec<bool>> {
        Ok(vec![time + 1 >= self.steps; self.batch_size])
    }
}

// ---------------------------------------------------------------------------
// Free-running synthesis
// ---------------------------------------------------------------------------

/// Feeds back the last predicted frame; an example finishes once all `r`
/// stop probabilities exceed `threshold`.
pub struct SynthesisHelper {
    batch_size: usize,
    depth: usize,
    threshold: f64,
    dtype: DType,
    device: Device,
}

impl SynthesisHelper {
    pub fn new(batch_size: usize, depth: usize, threshold: f64, dtype: DType, device: &Device) -> Self {
        Self {
            batch_size,
            depth,
            threshold,
            dtype,
            device: device.clone(),
        }
    }
}

impl DecoderHelper for SynthesisHelper {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn initial_inputs(&self) -> Result<Tensor> {
        Tensor::zeros((self.batch_size, self.depth), self.dtype, &self.device)
    }

    fn next_inputs(&mut self, _time: usize, outputs: &Tensor) -> Result<Tensor> {
        last_frame(outputs, self.depth)
    }

    fn is_finished(&self, _time: usize, stop_logits: &Tensor) -> Result<Vec<bool>> {
        let probs: Vec<Vec<f32>> = candle_nn::ops::sigmoid(stop_logits)?
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .to_vec2()?;
        let threshold = self.threshold as f32;
        Ok(probs
            .iter()
            .map(|row| row.iter().all(|&p| p > threshold))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduled_ratio_in_unit_interval() {
        let cfg = TacotronConfig {
            teacher_forcing_mode: TeacherForcingMode::Scheduled,
            teacher_forcing_start_decay: 100,
            teacher_forcing_decay_steps: 1000,
            ..TacotronConfig::default()
        };
        let mut prev = f64::INFINITY;
        for step in (0..5000).step_by(37) {
            let ratio = teacher_forcing_ratio(&cfg, Some(step));
            assert!((0.0..=1.0).contains(&ratio), "step {step}: {ratio}");
            assert!(ratio <= prev + 1e-12);
            prev = ratio;
        }
        assert_eq!(teacher_forcing_ratio(&cfg, Some(0)), 1.0);
        assert_eq!(teacher_forcing_ratio(&cfg, Some(100)), 1.0);
        // Fully decayed: init * alpha = final ratio.
        assert!(teacher_forcing_ratio(&cfg, Some(1100)).abs() < 1e-12);
        assert!(teacher_forcing_ratio(&cfg, Some(50_000)).abs() < 1e-12);
    }

    #[test]
    fn test_scheduled_ratio_with_alpha() {
        let cfg = TacotronConfig {
            teacher_forcing_mode: TeacherForcingMode::Scheduled,
            teacher_forcing_init_ratio: 0.8,
            teacher_forcing_start_decay: 0,
            teacher_forcing_decay_steps: 100,
            teacher_forcing_decay_alpha: Some(0.5),
            ..TacotronConfig::default()
        };
        let mid = teacher_forcing_ratio(&cfg, Some(50));
        assert!((mid - 0.8 * 0.75).abs() < 1e-9, "{mid}");
        let end = teacher_forcing_ratio(&cfg, Some(100));
        assert!((end - 0.4).abs() < 1e-9, "{end}");
    }

    #[test]
    fn test_constant_ratio() {
        let cfg = TacotronConfig {
            teacher_forcing_ratio: 0.3,
            ..TacotronConfig::default()
        };
        assert_eq!(teacher_forcing_ratio(&cfg, None), 0.3);
        assert_eq!(teacher_forcing_ratio(&cfg, Some(1_000_000)), 0.3);
    }

    #[test]
    fn test_training_helper_feeds_every_rth_frame() {
        let dev = Device::Cpu;
        // [1, 6, 1] frames 0..6, r = 2 → groups end at frames 1, 3, 5.
        let targets = Tensor::arange(0f32, 6.0, &dev).unwrap().reshape((1, 6, 1)).unwrap();
        let mut helper = TrainingHelper::new(&targets, 2, 1.0, 0).unwrap();
        assert_eq!(helper.steps(), 3);

        let go: Vec<Vec<f32>> = helper.initial_inputs().unwrap().to_vec2().unwrap();
        assert_eq!(go, vec![vec![0.0]]);

        let outputs = Tensor::new(&[[-1f32, -2.0]], &dev).unwrap();
        let logits = Tensor::zeros((1, 2), DType::F32, &dev).unwrap();
        let mut fed = Vec::new();
        for time in 0..3 {
            let next: Vec<Vec<f32>> = helper.next_inputs(time, &outputs).unwrap().to_vec2().unwrap();
            fed.push(next[0][0]);
            assert_eq!(helper.is_finished(time, &logits).unwrap(), vec![time == 2]);
        }
        assert_eq!(fed, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_training_helper_zero_ratio_feeds_predictions() {
        let dev = Device::Cpu;
        let targets = Tensor::ones((2, 4, 2), DType::F32, &dev).unwrap();
        let mut helper = TrainingHelper::new(&targets, 2, 0.0, 7).unwrap();
        let outputs = Tensor::new(&[[1f32, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]], &dev).unwrap();
        let next: Vec<Vec<f32>> = helper.next_inputs(0, &outputs).unwrap().to_vec2().unwrap();
        assert_eq!(next, vec![vec![3.0, 4.0], vec![7.0, 8.0]]);
    }

    #[test]
    fn test_synthesis_helper_stops_per_example() {
        let dev = Device::Cpu;
        let helper = SynthesisHelper::new(3, 2, 0.5, DType::F32, &dev);
        let logits = Tensor::new(&[[5f32, 5.0], [5.0, -5.0], [-5.0, -5.0]], &dev).unwrap();
        assert_eq!(helper.is_finished(0, &logits).unwrap(), vec![true, false, false]);
    }
}
