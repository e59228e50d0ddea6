//! Learning-rate schedule, gradient clipping and the training step.
//!
//! [`TacotronOptimizer::step`] runs, in order:
//! 1. set the learning rate for `global_step`
//! 2. backpropagate the total loss
//! 3. clip the gradients by their global norm
//! 4. apply the queued batch-norm statistic updates
//! 5. apply the Adam update

use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use crate::config::TacotronConfig;
use crate::error::Result;
use crate::model::layers::{ParamRegistry, UpdateOps};

// ---------------------------------------------------------------------------
// Learning rate
// ---------------------------------------------------------------------------

/// Exponential decay held between a ceiling and a floor:
/// `min(max(init · rate^((step − start_decay) / decay_steps), final), init)`.
///
/// Constant `init` until `start_decay`, then decays towards `final`, which is
/// held from then on.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningRateSchedule {
    decay: bool,
    initial: f64,
    final_rate: f64,
    start_decay: usize,
    decay_steps: usize,
    decay_rate: f64,
}

impl LearningRateSchedule {
    pub fn from_config(cfg: &TacotronConfig) -> Self {
        Self {
            decay: cfg.decay_learning_rate,
            initial: cfg.initial_learning_rate,
            final_rate: cfg.final_learning_rate,
            start_decay: cfg.start_decay,
            decay_steps: cfg.decay_steps.max(1),
            decay_rate: cfg.decay_rate,
        }
    }

    /// Learning rate at `step`.
    #[must_use]
    pub fn rate(&self, step: usize) -> f64 {
        if !self.decay {
            return self.initial;
        }
        let exponent = (step as f64 - self.start_decay as f64) / self.decay_steps as f64;
        let lr = self.initial * self.decay_rate.powf(exponent);
        lr.max(self.final_rate).min(self.initial)
    }
}

// ---------------------------------------------------------------------------
// Gradient clipping
// ---------------------------------------------------------------------------

/// `sqrt(Σ ‖g‖²)` over all gradients.
pub fn global_norm(grads: &[Tensor]) -> Result<f64> {
    let mut sum = 0f64;
    for g in grads {
        let sq: f32 = g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar()?;
        sum += f64::from(sq);
    }
    Ok(sum.sqrt())
}

/// Scale every gradient by `clip_norm / max(norm, clip_norm)`.
///
/// Returns the clipped gradients and the norm before clipping.
pub fn clip_by_global_norm(grads: &[Tensor], clip_norm: f64) -> Result<(Vec<Tensor>, f64)> {
    let norm = global_norm(grads)?;
    if norm <= clip_norm || !norm.is_finite() {
        return Ok((grads.to_vec(), norm));
    }
    let scale = clip_norm / norm;
    let clipped = grads
        .iter()
        .map(|g| g.affine(scale, 0.0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok((clipped, norm))
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

/// What one optimizer step did.
#[derive(Debug, Clone)]
pub struct OptimizationStep {
    pub learning_rate: f64,
    /// Global gradient norm before clipping.
    pub gradient_norm: f64,
    /// Gradients as applied (after clipping), by parameter name.
    pub gradients: Vec<(String, Tensor)>,
    /// Batch-norm statistic updates written before the parameter update.
    pub applied_update_ops: usize,
}

pub struct TacotronOptimizer {
    opt: AdamW,
    vars: Vec<(String, Var)>,
    schedule: LearningRateSchedule,
    clip_norm: Option<f64>,
    update_ops: UpdateOps,
}

impl TacotronOptimizer {
    /// Adam over every trainable variable in `varmap`. Batch-norm running
    /// statistics are left to the update ops.
    pub fn new(varmap: &VarMap, registry: &ParamRegistry, cfg: &TacotronConfig) -> Result<Self> {
        let mut vars: Vec<(String, Var)> = {
            let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
            data.iter()
                .filter(|(name, _)| !name.contains("running_"))
                .map(|(name, var)| (name.clone(), var.clone()))
                .collect()
        };
        vars.sort_by(|a, b| a.0.cmp(&b.0));

        let schedule = LearningRateSchedule::from_config(cfg);
        let params = ParamsAdamW {
            lr: schedule.rate(0),
            beta1: cfg.adam_beta1,
            beta2: cfg.adam_beta2,
            eps: cfg.adam_epsilon,
            weight_decay: 0.0,
        };
        let opt = AdamW::new(vars.iter().map(|(_, v)| v.clone()).collect(), params)?;
        tracing::debug!("optimizer over {} variables", vars.len());

        Ok(Self {
            opt,
            vars,
            schedule,
            clip_norm: cfg.clip_gradients.then_some(cfg.clip_norm),
            update_ops: registry.update_ops().clone(),
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.opt.learning_rate()
    }

    /// One training update from `loss` at `global_step`.
    pub fn step(&mut self, loss: &Tensor, global_step: usize) -> Result<OptimizationStep> {
        let learning_rate = self.schedule.rate(global_step);
        self.opt.set_learning_rate(learning_rate);

        let mut grads = loss.backward()?;
        let mut tracked: Vec<(String, Var)> = Vec::new();
        let mut raw: Vec<Tensor> = Vec::new();
        for (name, var) in &self.vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                raw.push(g.clone());
                tracked.push((name.clone(), var.clone()));
            }
        }

        let (applied, gradient_norm) = match self.clip_norm {
            Some(clip) => clip_by_global_norm(&raw, clip)?,
            None => {
                let norm = global_norm(&raw)?;
                (raw, norm)
            }
        };
        for ((_, var), grad) in tracked.iter().zip(&applied) {
            grads.insert(var.as_tensor(), grad.clone());
        }

        let applied_update_ops = self.update_ops.apply()?;
        self.opt.step(&grads)?;

        tracing::debug!(
            "step={global_step} lr={learning_rate:.3e} grad_norm={gradient_norm:.4} update_ops={applied_update_ops}"
        );

        Ok(OptimizationStep {
            learning_rate,
            gradient_norm,
            gradients: tracked.into_iter().map(|(name, _)| name).zip(applied).collect(),
            applied_update_ops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{Init, VarBuilder};

    fn schedule_cfg() -> TacotronConfig {
        TacotronConfig {
            initial_learning_rate: 1e-3,
            final_learning_rate: 1e-5,
            start_decay: 100,
            decay_steps: 50,
            decay_rate: 0.5,
            ..TacotronConfig::default()
        }
    }

    #[test]
    fn test_learning_rate_schedule() {
        let sched = LearningRateSchedule::from_config(&schedule_cfg());
        assert_eq!(sched.rate(0), 1e-3);
        assert_eq!(sched.rate(100), 1e-3);
        assert!((sched.rate(150) - 5e-4).abs() < 1e-12);

        let mut prev = f64::INFINITY;
        for step in 0..2000 {
            let lr = sched.rate(step);
            assert!(lr <= prev);
            assert!((1e-5..=1e-3).contains(&lr));
            prev = lr;
        }
        assert_eq!(sched.rate(1_000_000), 1e-5);
    }

    #[test]
    fn test_constant_learning_rate() {
        let cfg = TacotronConfig {
            decay_learning_rate: false,
            ..schedule_cfg()
        };
        let sched = LearningRateSchedule::from_config(&cfg);
        assert_eq!(sched.rate(0), sched.rate(1_000_000));
    }

    #[test]
    fn test_clip_by_global_norm() {
        let dev = Device::Cpu;
        let a = Tensor::new(&[3f32, 0.0], &dev).unwrap();
        let b = Tensor::new(&[[4f32]], &dev).unwrap();
        let (clipped, norm) = clip_by_global_norm(&[a.clone(), b.clone()], 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-9);
        assert!((global_norm(&clipped).unwrap() - 1.0).abs() < 1e-6);
        let a_clipped: Vec<f32> = clipped[0].to_vec1().unwrap();
        assert!((a_clipped[0] - 0.6).abs() < 1e-6);

        // Below the threshold nothing changes.
        let (same, norm) = clip_by_global_norm(&[a, b], 10.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-9);
        let b_same: Vec<Vec<f32>> = same[1].to_vec2().unwrap();
        assert_eq!(b_same, vec![vec![4.0]]);
    }

    #[test]
    fn test_step_applies_update_ops_before_parameters() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let registry = ParamRegistry::new();
        let w = vb.get_with_hints((2,), "w", Init::Const(3.0)).unwrap();
        let stat = vb.get_with_hints((2,), "running_mean", Init::Const(0.0)).unwrap();
        let stat = Var::from_tensor(&stat).unwrap();
        registry
            .update_ops()
            .push(&stat, Tensor::new(&[1f32, 2.0], &dev).unwrap());

        let cfg = TacotronConfig {
            decay_learning_rate: false,
            initial_learning_rate: 0.1,
            clip_norm: 1.0,
            ..TacotronConfig::default()
        };
        let mut opt = TacotronOptimizer::new(&varmap, &registry, &cfg).unwrap();
        let loss = w.sqr().unwrap().sum_all().unwrap();
        let step = opt.step(&loss, 0).unwrap();

        assert_eq!(step.applied_update_ops, 1);
        assert!(registry.update_ops().is_empty());
        let stat_now: Vec<f32> = stat.as_tensor().to_vec1().unwrap();
        assert_eq!(stat_now, vec![1.0, 2.0]);

        // d/dw Σw² = 2w = [6, 6], norm 6√2 → clipped to unit norm.
        assert!((step.gradient_norm - 6.0 * 2f64.sqrt()).abs() < 1e-4);
        assert_eq!(step.gradients.len(), 1);
        assert_eq!(step.gradients[0].0, "w");
        assert!((global_norm(&[step.gradients[0].1.clone()]).unwrap() - 1.0).abs() < 1e-5);

        // Adam moves each coordinate by ~lr in the gradient direction.
        let w_now: Vec<f32> = w.to_vec1().unwrap();
        assert!(w_now.iter().all(|&x| (x - 2.9).abs() < 1e-3), "{w_now:?}");
    }
}
