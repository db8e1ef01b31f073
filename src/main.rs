use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Optimizer, SGD};
use clap::{Parser, Subcommand};
use kfac::{
    build_communicators, logging, Communicator, Kfac, KfacConfig, KfacModel,
    KfacParamScheduler, LayerNorm, Linear, TrainableLayer,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kfac")]
#[command(about = "Kronecker-factored gradient preconditioning for candle models", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Configuration file (JSON or YAML)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Train a small regression network on synthetic data
    Demo {
        /// Configuration file (JSON or YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of epochs
        #[arg(long, default_value_t = 5)]
        epochs: usize,

        /// Steps per epoch
        #[arg(long, default_value_t = 20)]
        steps: usize,

        /// Worker threads; overrides the configured backend
        #[arg(short, long, env = "KFAC_WORKERS")]
        workers: Option<usize>,
    },

    /// Show build information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet, cli.json)?;

    match cli.command {
        Commands::Validate { file } => validate_config(file)?,
        Commands::Demo {
            config,
            epochs,
            steps,
            workers,
        } => run_demo(config, epochs, steps, workers)?,
        Commands::Info => show_system_info(),
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = KfacConfig::from_file(&config_path).context("Failed to load configuration file")?;
    for note in config.advisories() {
        warn!("{}", note);
    }

    info!("Configuration is valid");
    info!("Configuration summary:");
    info!("  - lr={} damping={} factor_decay={}", config.lr, config.damping, config.factor_decay);
    info!(
        "  - fac_update_freq={} kfac_update_freq={}",
        config.fac_update_freq, config.kfac_update_freq
    );
    info!("  - gradient rescale: {:?}", config.gradient_rescale);
    info!(
        "  - diag_blocks={} (warm-up {} epochs)",
        config.diag_blocks, config.diag_warmup
    );
    info!("  - layer kinds: {:?}", config.layer_kinds);
    info!("  - workers: {}", config.comm.world_size());
    if let Some(schedule) = &config.schedule {
        info!("  - schedule: {:?}", schedule);
    }

    Ok(())
}

/// Two dense layers around a normalization layer
struct DemoNet {
    fc1: Linear,
    norm: LayerNorm,
    fc2: Linear,
}

impl DemoNet {
    const INPUTS: usize = 8;
    const HIDDEN: usize = 16;

    fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            fc1: Linear::init("fc1", Self::INPUTS, Self::HIDDEN, true, device)?,
            norm: LayerNorm::init("norm", Self::HIDDEN, true, device)?,
            fc2: Linear::init("fc2", Self::HIDDEN, 1, false, device)?,
        })
    }

    fn parameters(&self) -> Vec<Var> {
        let layers: [&dyn TrainableLayer; 3] = [&self.fc1, &self.norm, &self.fc2];
        layers
            .iter()
            .flat_map(|layer| std::iter::once(layer.weight().clone()).chain(layer.bias().cloned()))
            .collect()
    }
}

impl Module for DemoNet {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(xs)?.relu()?;
        let h = self.norm.forward(&h)?;
        self.fc2.forward(&h)
    }
}

impl KfacModel for DemoNet {
    fn layers_mut(&mut self) -> Vec<&mut dyn TrainableLayer> {
        vec![&mut self.fc1, &mut self.norm, &mut self.fc2]
    }
}

fn demo_config() -> KfacConfig {
    KfacConfig {
        lr: 0.05,
        fac_update_freq: 1,
        kfac_update_freq: 10,
        ..Default::default()
    }
}

fn run_demo(
    config_path: Option<PathBuf>,
    epochs: usize,
    steps: usize,
    workers: Option<usize>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => KfacConfig::from_file(&path).context("Failed to load configuration file")?,
        None => demo_config(),
    };
    if let Some(workers) = workers {
        config.comm = kfac::CommBackend::Threads { workers };
    }
    config.validate().context("Invalid demo configuration")?;

    let comms = build_communicators(&config.comm);
    info!(
        "Training demo network for {} epochs x {} steps on {} worker(s)",
        epochs,
        steps,
        comms.len()
    );

    let handles = comms
        .into_iter()
        .map(|comm| {
            let config = config.clone();
            let rank = comm.rank();
            thread::Builder::new()
                .name(format!("worker-{}", rank))
                .spawn(move || run_worker(comm, config, epochs, steps))
                .context("Failed to spawn worker thread")
        })
        .collect::<Result<Vec<_>>>()?;

    let mut final_losses = Vec::new();
    for handle in handles {
        let loss = handle
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))??;
        final_losses.push(loss);
    }

    info!("Demo complete; final loss per worker: {:?}", final_losses);
    Ok(())
}

fn run_worker(
    comm: Arc<dyn Communicator>,
    config: KfacConfig,
    epochs: usize,
    steps: usize,
) -> Result<f32> {
    let device = Device::Cpu;
    let rank = comm.rank();
    let batch = 32;

    let mut model = DemoNet::new(&device)?;
    let params = model.parameters();
    // Every worker starts from the same weights
    for var in &params {
        let synced = comm.allreduce_average(var.as_tensor())?;
        var.set(&synced)?;
    }

    let mut kfac = Kfac::with_communicator(&mut model, config.clone(), Arc::clone(&comm))
        .context("Failed to build K-FAC preconditioner")?;
    let mut scheduler = KfacParamScheduler::from_config(&kfac);
    let mut sgd = SGD::new(params.clone(), config.lr)?;

    let target_weights = Tensor::arange(0f32, DemoNet::INPUTS as f32, &device)?
        .affine(0.25, -1.0)?
        .reshape((DemoNet::INPUTS, 1))?;

    let mut last_loss = f32::NAN;
    for epoch in 0..epochs {
        let mut epoch_loss = 0.0;
        let mut last_nu = 0.0;

        for _ in 0..steps {
            let x = Tensor::rand(-1f32, 1f32, (batch, DemoNet::INPUTS), &device)?;
            let y = x.matmul(&target_weights)?.sin()?;

            let pred = model.forward(&x)?;
            let loss = candle_nn::loss::mse(&pred, &y)?;
            let mut grads = loss.backward()?;

            if comm.size() > 1 {
                for var in &params {
                    if let Some(grad) = grads.get(var.as_tensor()) {
                        let averaged = comm.allreduce_average(grad)?;
                        grads.insert(var.as_tensor(), averaged);
                    }
                }
            }

            kfac.set_learning_rate(sgd.learning_rate());
            let stats = kfac.step(&mut grads, Some(epoch))?;
            sgd.step(&grads)?;

            epoch_loss += loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            last_nu = stats.nu;
        }

        last_loss = epoch_loss / steps.max(1) as f32;
        if rank == 0 {
            info!(
                "epoch {:>3}: loss={:.5} nu={:.3e} damping={:.3e}",
                epoch,
                last_loss,
                last_nu,
                kfac.hyperparams().damping
            );
        }

        if let Some(scheduler) = scheduler.as_mut() {
            scheduler.step(&mut kfac, None);
        }
    }

    Ok(last_loss)
}

fn show_system_info() {
    println!("KFAC - Kronecker-factored gradient preconditioner");
    println!();
    println!("Version: {}", kfac::VERSION);
    println!(
        "Built with Rust: {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!();
    println!("Supported layers: Linear, Conv2d, LayerNorm");
    println!("Gradient rescaling: adaptive, global-kl, kronecker-norm");
    println!("Communication backends: local, threads");
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  NVIDIA CUDA GPU acceleration: enabled");
    #[cfg(not(feature = "cuda"))]
    println!("  NVIDIA CUDA GPU acceleration: disabled (build with --features cuda)");

    #[cfg(feature = "metal")]
    println!("  Apple Metal GPU acceleration: enabled");
    #[cfg(not(feature = "metal"))]
    println!("  Apple Metal GPU acceleration: disabled (build with --features metal)");

    println!("  CPU: always available");
}
