use std::time::SystemTime;

use aiy_diffusion::{
    config::DiffusionConfig,
    schedulers::{DenoisingMode, Diffuser, NoisePredictor},
    utils::{count_non_finite, get_device, output_filename},
};
use clap::Parser;
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Mode {
    Linear,
    Quadratic,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with the noise schedule and sampler settings.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// The number of steps to run the diffusion for.
    #[arg(long)]
    n_steps: Option<usize>,

    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Stochasticity of the reverse process, 0 is deterministic.
    #[arg(long)]
    eta: Option<f64>,

    #[arg(long, default_value = "9527")]
    seed: i64,

    /// The numbers of samples to generate simultaneously.
    #[arg(long, default_value_t = 1)]
    bsize: i64,

    /// Side of the generated square images, in pixels.
    #[arg(long, default_value_t = 64)]
    size: i64,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "ddim_final.png")]
    final_image: String,

    /// Generate intermediary images at each step.
    #[arg(long, action)]
    intermediary_images: bool,
}

/// The exact noise predictor for data made of a single known image:
/// `eps = (x - sqrt(alpha_bar_t) * x0) / sqrt(1 - alpha_bar_t)`.
struct AnalyticPredictor {
    target: Tensor,
    alpha_bars: Tensor,
}

impl NoisePredictor for AnalyticPredictor {
    fn predict(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor {
        let alpha_bar_t = self.alpha_bars.gather(0, timesteps, false).reshape([-1, 1, 1, 1]);
        (xs - alpha_bar_t.sqrt() * &self.target) / (1f64 - &alpha_bar_t).sqrt()
    }
}

// A diagonal colour gradient in [-1, 1], shape [3, size, size].
fn target_image(size: i64, device: Device) -> Tensor {
    let ramp = Tensor::linspace(-1., 1., size, (Kind::Float, device));
    let rows = ramp.view([size, 1]).expand([size, size], false);
    let cols = ramp.view([1, size]).expand([size, size], false);
    Tensor::stack(&[&rows, &cols, &((&rows + &cols) / 2.)], 0)
}

fn save_batch(images: &Tensor, final_image: &str, timestep_idx: Option<usize>) -> anyhow::Result<()> {
    let images = ((images / 2 + 0.5).clamp(0., 1.) * 255.).to_kind(Kind::Uint8).to_device(Device::Cpu);
    let bsize = images.size()[0];
    for idx in 0..bsize {
        let filename = output_filename(final_image, idx + 1, bsize, timestep_idx);
        tch::vision::image::save(&images.get(idx), filename)?;
    }
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    let device = if args.cpu { Device::Cpu } else { get_device() };
    let mut config = match &args.config {
        Some(path) => DiffusionConfig::from_file(path)?,
        None => DiffusionConfig::default(),
    };
    if let Some(n_steps) = args.n_steps {
        config.sampler.number_of_steps = n_steps;
    }
    if let Some(mode) = args.mode {
        config.sampler.mode = match mode {
            Mode::Linear => DenoisingMode::Linear,
            Mode::Quadratic => DenoisingMode::Quadratic,
        };
    }
    if let Some(eta) = args.eta {
        config.sampler.eta = eta;
    }
    let diffuser = config.build(Device::Cpu)?.to(device);
    tracing::info!(?device, ?config.sampler, "diffuser ready");

    let predictor = AnalyticPredictor {
        target: target_image(args.size, device),
        alpha_bars: diffuser.schedule().alpha_bars().shallow_clone(),
    };

    let start = SystemTime::now();
    tch::manual_seed(args.seed);
    let latents = Tensor::randn([args.bsize, 3, args.size, args.size], (Kind::Float, device));
    let trajectory = diffuser.denoise_batch(&latents, &predictor)?;

    if args.intermediary_images {
        for (timestep_idx, images) in trajectory.iter().enumerate() {
            save_batch(images, &args.final_image, Some(timestep_idx + 1))?;
        }
    }
    let final_images = trajectory.last().ok_or_else(|| anyhow::anyhow!("empty trajectory"))?;
    let non_finite = count_non_finite(final_images)?;
    if non_finite > 0 {
        tracing::warn!(non_finite, "final samples contain non-finite values");
    }
    save_batch(final_images, &args.final_image, None)?;
    tracing::info!("Generated {} image(s) in {:?}", args.bsize, SystemTime::now().duration_since(start)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();
        None
    };
    run(args)
}
