// Generates noised training pairs for a set of images and builds the UNet
// that would be trained on them.
//
// cargo run --release --features clap,tracing-subscriber --example datagen -- \
//     --image data/cat.jpg --image data/dog.jpg --timesteps 0,10,49
//
// For each image and each requested timestep this writes the noised image and
// the residual target, scaled back to [0, 255], next to the output prefix.
use clap::Parser;
use diffusion_datagen::{
    models::{unet_2d::UNet, unet_graph},
    pipelines::{TrainingPairConfig, TrainingPairGenerator},
    utils,
};
use tch::{nn, nn::Module, Device, Tensor};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The source images.
    #[arg(long = "image", value_name = "FILE", required = true)]
    images: Vec<String>,

    /// Images are resized to squares of this side length.
    #[arg(long, default_value_t = 64)]
    img_length: i64,

    /// The number of diffusion timesteps.
    #[arg(long, default_value_t = 50)]
    n_timesteps: usize,

    #[arg(long, default_value_t = 0.0001)]
    noise_start: f64,

    #[arg(long, default_value_t = 0.06)]
    noise_end: f64,

    /// Comma separated timesteps for which images are written.
    #[arg(long, value_delimiter = ',', default_value = "0,25,49")]
    timesteps: Vec<usize>,

    /// Depth of the UNet.
    #[arg(long, default_value_t = 4)]
    n_downblocks: usize,

    #[arg(long, default_value_t = 2)]
    downscale_factor: i64,

    /// Prefix of the generated files.
    #[arg(long, default_value = "noised")]
    output_prefix: String,

    /// Seed for the noise draws.
    #[arg(long)]
    seed: Option<i64>,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    if let Some(seed) = args.seed {
        tch::manual_seed(seed);
    }
    let device = if args.cpu { Device::Cpu } else { Device::cuda_if_available() };

    let config = TrainingPairConfig {
        n_timesteps: args.n_timesteps,
        noise_start: args.noise_start,
        noise_end: args.noise_end,
    };
    let generator = TrainingPairGenerator::from_files(&args.images, args.img_length, config)?;
    generator.scheduler().check_timesteps(&args.timesteps)?;

    for (index, batch) in generator.iter().enumerate() {
        let batch = batch?;
        for &t in args.timesteps.iter() {
            let input = format!("{}-{index}-t{t}.png", args.output_prefix);
            let target = format!("{}-{index}-t{t}-residual.png", args.output_prefix);
            utils::save_image(&batch.inputs[t], &input)?;
            utils::save_image(&batch.targets[t], &target)?;
            println!("wrote {input} and {target}");
        }
    }

    let graph = unet_graph::build(args.img_length, args.n_downblocks, args.downscale_factor)?;
    println!("{}", graph.summary());

    let _no_grad_guard = tch::no_grad_guard();
    let vs = nn::VarStore::new(device);
    let unet = UNet::new(vs.root(), &graph);
    if let Some(batch) = generator.iter().next() {
        let (inputs, _targets) = batch?.stacked()?;
        let predictions = unet.forward(&inputs.to_device(device));
        println!("untrained predictions: {:?}", predictions.size());
    } else {
        let size = [1, 3, args.img_length, args.img_length];
        let xs = Tensor::zeros(size, (tch::Kind::Float, device));
        println!("untrained predictions: {:?}", unet.forward(&xs).size());
    }
    Ok(())
}
