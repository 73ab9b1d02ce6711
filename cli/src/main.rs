mod progress;

use structopt::StructOpt;

use neural_style::{
    image::ImageOutputFormat as ImgFmt, CancelToken, Error, FeatureExtractor, Network,
    OptimizerKind, RunProgress, RunStatus, Session,
};
use progress::ProgressBars;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};

fn parse_img_fmt(input: &str) -> Result<ImgFmt, String> {
    let fmt = match input {
        "png" => ImgFmt::Png,
        "jpg" => ImgFmt::Jpeg(90),
        "bmp" => ImgFmt::Bmp,
        other => {
            return Err(format!(
                "image format `{}` not one of: 'png', 'jpg', 'bmp'",
                other
            ))
        }
    };

    Ok(fmt)
}

fn parse_optimizer(input: &str) -> Result<OptimizerKind, String> {
    match input {
        "adam" => Ok(OptimizerKind::adam()),
        "sgd" => Ok(OptimizerKind::GradientDescent),
        other => Err(format!("optimizer `{}` not one of: 'adam', 'sgd'", other)),
    }
}

fn parse_layers(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Transfer {
    /// The image whose structure is kept, the generated image has its size
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image whose textures and colors are applied to the content
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// Comma separated names of the layers used for the content loss
    #[structopt(long, default_value = "block5_conv2")]
    content_layers: String,
    /// Comma separated names of the layers used for the style loss
    #[structopt(
        long,
        default_value = "block1_conv1,block2_conv1,block3_conv1,block4_conv1,block5_conv1"
    )]
    style_layers: String,
    #[structopt(long, default_value = "1000.0")]
    content_weight: f32,
    #[structopt(long, default_value = "0.01")]
    style_weight: f32,
    /// The number of updates applied to the content image
    #[structopt(long, default_value = "100")]
    iterations: u32,
    #[structopt(long, default_value = "5.0")]
    learning_rate: f32,
    /// Decays the learning rate as `lr / (1 + decay * iteration)`
    #[structopt(long = "lr-decay", default_value = "0.0")]
    learning_rate_decay: f32,
    /// The update rule, one of 'adam' or 'sgd'
    #[structopt(long, default_value = "adam", parse(try_from_str = parse_optimizer))]
    optimizer: OptimizerKind,
    /// Input images are downscaled so that their longest side is at most this
    #[structopt(long, default_value = "512")]
    max_size: u32,
    /// The number of intermediate images to keep over the run
    #[structopt(long)]
    snapshots: Option<u32>,
    /// A directory into which the snapshots are saved, named after their iteration
    #[structopt(long, parse(from_os_str))]
    snapshot_dir: Option<PathBuf>,
    /// Stops the run after this many seconds, keeping the best image found so far
    #[structopt(long)]
    time_limit: Option<u64>,
    /// Don't show a progress bar
    #[structopt(long)]
    no_progress: bool,
    /// The format to save the generated image as.
    ///
    /// NOTE: this will only apply when stdout is specified via `-o -`, otherwise the image
    /// format is determined by the file extension of the path provided to `-o`
    #[structopt(
        long,
        default_value = "png",
        parse(try_from_str = parse_img_fmt)
    )]
    out_fmt: ImgFmt,
    /// The path to save the generated image to, the file extensions of the path determines
    /// the image format used. You may use `-` for stdout.
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: PathBuf,
}

#[derive(StructOpt)]
enum Subcommand {
    /// Applies the style of one image to the content of another
    #[structopt(name = "transfer")]
    Transfer(Transfer),
    /// Lists the layers of the network that can be used for the losses
    #[structopt(name = "layers")]
    Layers,
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Transfers the style of an image onto another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// A network weights file. Without one, a VGG16 shaped network with random
    /// weights is used, which transfers colors but little else.
    #[structopt(long, parse(from_os_str))]
    weights: Option<PathBuf>,
    /// The seed used to initialize the random network when no weights are given
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// The maximum number of worker threads that can be active at any one time
    /// while running the network. Defaults to the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    #[structopt(subcommand)]
    cmd: Subcommand,
}

fn print_error(e: &dyn std::fmt::Display) {
    if atty::is(atty::Stream::Stderr) {
        eprintln!("\x1b[31merror\x1b[0m: {}", e);
    } else {
        eprintln!("error: {}", e);
    }
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match real_main() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(&e);
            std::process::exit(1);
        }
    }
}

fn load_network(
    weights: Option<&Path>,
    seed: u64,
    max_threads: Option<usize>,
) -> Result<Network, Error> {
    let network = match weights {
        Some(path) => {
            let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
            let network = Network::read(&mut file)?;
            info!(path = %path.display(), layers = network.layer_names().len(), "loaded network");
            network
        }
        None => {
            warn!("no weights file given, using a randomly initialized network");
            Network::vgg16(seed)
        }
    };

    Ok(match max_threads {
        Some(mt) => network.with_max_thread_count(mt),
        None => network,
    })
}

fn real_main() -> Result<i32, Error> {
    let Opt {
        weights,
        seed,
        max_threads,
        cmd,
    } = Opt::from_args();

    let transfer = match cmd {
        Subcommand::Transfer(transfer) => transfer,
        Subcommand::Layers => {
            let network = load_network(weights.as_deref(), seed, max_threads)?;
            for name in network.layer_names() {
                match network.conv(name) {
                    Some(conv) => println!(
                        "{:<16} conv {}x{} {} -> {}",
                        name,
                        conv.kernel(),
                        conv.kernel(),
                        conv.in_channels(),
                        conv.out_channels()
                    ),
                    None => println!("{:<16} max pool 2x2", name),
                }
            }
            return Ok(0);
        }
    };

    // Check that the extension for the path supplied by the user is one of the ones we support
    {
        match transfer
            .output_path
            .extension()
            .and_then(|ext| ext.to_str())
        {
            Some("png") | Some("jpg") | Some("bmp") => {}
            None => {}
            Some(other) => return Err(Error::UnsupportedOutputFormat(other.to_owned())),
        }
    }

    let network = load_network(weights.as_deref(), seed, max_threads)?;

    let mut sb = Session::builder()
        .extractor(Arc::new(network))
        .content(&transfer.content)
        .style(&transfer.style)
        .content_layers(parse_layers(&transfer.content_layers))
        .style_layers(parse_layers(&transfer.style_layers))
        .content_weight(transfer.content_weight)
        .style_weight(transfer.style_weight)
        .iterations(transfer.iterations)
        .learning_rate(transfer.learning_rate)
        .learning_rate_decay(transfer.learning_rate_decay)
        .optimizer(transfer.optimizer)
        .max_dimension(transfer.max_size);

    if let Some(count) = transfer.snapshots {
        sb = sb.snapshot_count(count);
    } else if transfer.snapshot_dir.is_some() {
        sb = sb.snapshot_count(10);
    }

    let session = sb.build()?;

    let cancel = CancelToken::new();
    if let Some(secs) = transfer.time_limit {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            cancel.cancel();
        });
    }

    let progress: Option<Box<dyn RunProgress>> = if !transfer.no_progress {
        Some(Box::new(ProgressBars::new()))
    } else {
        None
    };

    let result = session.run(progress, Some(&cancel))?;

    if let Some(ref dir) = transfer.snapshot_dir {
        result.save_snapshots(dir)?;
    }

    let code = match result.status() {
        RunStatus::Completed => 0,
        RunStatus::Cancelled => {
            warn!(
                iterations = result.iterations_run(),
                "time limit reached, saving the best image so far"
            );
            0
        }
        RunStatus::Failed(failure) => {
            print_error(failure);
            2
        }
    };

    if transfer.output_path.to_str() == Some("-") {
        let out = std::io::stdout();
        let mut out = out.lock();
        result.write(&mut out, transfer.out_fmt)?;
    } else {
        // This won't respect the output format specified by the user,
        // only the extension on the path they specify
        result.save(&transfer.output_path)?;
    }

    Ok(code)
}
