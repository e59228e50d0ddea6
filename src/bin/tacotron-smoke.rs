//! Tacotron smoke driver.
//!
//! Builds the model from a JSON hyperparameter file (or the defaults), runs a
//! few training steps on a random batch and one free-running synthesis pass.
//!
//! # Output
//!
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"train_steps":3,"final_loss":1.93,"learning_rate":0.001,"synthesis_iterations":40}
//! ```

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tacotron_rs::{
    config::TacotronConfig,
    loss::LossComposer,
    model::{ModelInputs, RunMode, Tacotron, pad_inputs},
    optim::TacotronOptimizer,
};

#[derive(Parser, Debug)]
#[command(
    name = "tacotron-smoke",
    about = "Run a few Tacotron training and synthesis steps on random data"
)]
struct Args {
    /// Hyperparameter JSON file. Omit for the built-in defaults.
    #[arg(long, short = 'c')]
    config: Option<String>,

    /// Training steps to run.
    #[arg(long, default_value_t = 3)]
    steps: usize,

    /// Examples per batch.
    #[arg(long, short = 'b', default_value_t = 2)]
    batch_size: usize,

    /// Longest input sequence in the random batch.
    #[arg(long, default_value_t = 12)]
    max_input_len: usize,

    /// Longest target in decoder steps (frames = steps × outputs_per_step).
    #[arg(long, default_value_t = 8)]
    max_target_steps: usize,

    /// Override `max_iters` for the synthesis pass.
    #[arg(long)]
    max_iters: Option<usize>,

    /// Random seed for the batch.
    #[arg(long, short = 's', default_value_t = 0)]
    seed: u64,

    /// Stay on the CPU even when a GPU is available.
    #[arg(long)]
    cpu: bool,

    /// Write the trained variables to this safetensors file.
    #[arg(long)]
    checkpoint: Option<String>,
}

fn random_batch(
    cfg: &TacotronConfig,
    args: &Args,
    rng: &mut ChaCha8Rng,
    device: &Device,
) -> anyhow::Result<ModelInputs> {
    let b = args.batch_size;
    let r = cfg.outputs_per_step;

    let sequences: Vec<Vec<u32>> = (0..b)
        .map(|_| {
            let len = rng.random_range(1..=args.max_input_len);
            (0..len)
                .map(|_| rng.random_range(0..cfg.num_symbols as u32))
                .collect()
        })
        .collect();
    let (inputs, input_lengths) = pad_inputs(&sequences, device)?;

    let t_out = args.max_target_steps * r;
    let targets_lengths: Vec<usize> = (0..b)
        .map(|_| rng.random_range(1..=args.max_target_steps) * r)
        .collect();

    let mut stop = vec![0f32; b * t_out];
    for (i, &len) in targets_lengths.iter().enumerate() {
        for t in len - 1..t_out {
            stop[i * t_out + t] = 1.0;
        }
    }

    let pitch = Tensor::randn(0f32, 1.0, (b, t_out, cfg.num_pitch), device)?;
    let spectral = Tensor::randn(0f32, 1.0, (b, t_out, cfg.num_spectral), device)?;
    let aperiodicity = Tensor::randn(0f32, 1.0, (b, t_out, cfg.num_aperiodicity), device)?;
    let stop = Tensor::from_vec(stop, (b, t_out), device)?;

    Ok(ModelInputs::new(inputs, input_lengths)
        .with_targets(Some(pitch), Some(spectral), Some(aperiodicity), Some(stop))
        .with_targets_lengths(targets_lengths))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.batch_size == 0 || args.max_input_len == 0 || args.max_target_steps == 0 {
        anyhow::bail!("batch size, input length and target steps must be > 0");
    }

    let mut cfg = match &args.config {
        Some(path) => TacotronConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load config {path}: {e}"))?,
        None => TacotronConfig::default(),
    };
    if let Some(max_iters) = args.max_iters {
        cfg.max_iters = max_iters;
    }

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    tracing::info!("Using device: {:?}", device);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Tacotron::new(&cfg, vb)?;
    let composer = LossComposer::new(&cfg);
    let mut optimizer = TacotronOptimizer::new(&varmap, model.registry(), &cfg)?;

    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let batch = random_batch(&cfg, &args, &mut rng, &device)?;

    let mut final_loss = f32::NAN;
    for step in 0..args.steps {
        let batch = batch.clone().with_global_step(step);
        let output = model.forward(&batch, RunMode::Training)?;
        let terms = composer.compute(&output, model.registry())?;
        let update = optimizer.step(&terms.total, step)?;
        let values = terms.values()?;
        tracing::info!(
            "step {step}: loss={:.4} (before={:.4} after={:.4} stop={:.4} attn={:.4} reg={:.2e}) lr={:.2e} grad_norm={:.3}",
            values.total,
            values.before,
            values.after,
            values.stop_token,
            values.attention,
            values.regularization,
            update.learning_rate,
            update.gradient_norm,
        );
        final_loss = values.total;
    }

    if let Some(path) = &args.checkpoint {
        varmap.save(path)?;
        tracing::info!("Saved checkpoint to {path}");
    }

    let synthesis = ModelInputs::new(batch.inputs.clone(), batch.input_lengths.clone());
    let output = model.forward(&synthesis, RunMode::Synthesis)?;
    tracing::info!(
        "synthesis: {} iterations, frame lengths {:?}",
        output.iterations,
        output.frame_lengths()
    );

    let summary = serde_json::json!({
        "train_steps": args.steps,
        "final_loss": final_loss,
        "learning_rate": optimizer.learning_rate(),
        "synthesis_iterations": output.iterations,
    });
    println!("{summary}");

    Ok(())
}
