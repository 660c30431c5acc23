// accel_media - command-line front end
// Runs image and audio kernels against the host reference backend

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use accel_media::{
    AccelConfig, AcceleratorSession, ArgValue, AudioObject, DispatchConfig, FftMode, FftOrchestrator, HostBackend,
    ImageObject, KernelDispatcher, MediaCollection, Waveform,
};

#[derive(Parser)]
#[command(name = "accel_media", version, about = "Accelerator media compute orchestration")]
struct Args {
    /// JSON config file (session, dispatch and host sections)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory with *.cl kernel sources
    #[arg(long)]
    kernel_dir: Option<PathBuf>,

    /// Device index (defaults to the strongest device)
    #[arg(long)]
    device: Option<usize>,

    /// Emulated device memory in MB
    #[arg(long)]
    memory_mb: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List compute devices
    Devices,

    /// Render a Mandelbrot image
    Mandelbrot {
        #[arg(long, default_value_t = 800)]
        width: u32,
        #[arg(long, default_value_t = 600)]
        height: u32,
        #[arg(long, default_value_t = 1.0)]
        zoom: f64,
        #[arg(long, default_value_t = -0.5)]
        x: f64,
        #[arg(long, default_value_t = 0.0)]
        y: f64,
        #[arg(long, default_value_t = 256)]
        iter: u32,
        #[arg(long, default_value = "00")]
        version: String,
        /// Write the result as PNG
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Time-stretch a generated test tone
    Stretch {
        #[arg(long, default_value_t = 0.75)]
        factor: f64,
        #[arg(long, default_value_t = 2.0)]
        seconds: f64,
        #[arg(long, default_value_t = 44100)]
        samplerate: u32,
        #[arg(long, default_value_t = 120.0)]
        tempo: f64,
        #[arg(long, default_value = "timestretch_double")]
        kernel: String,
        #[arg(long, default_value = "03")]
        version: String,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        overlap: Option<f32>,
    },

    /// Forward and inverse FFT of a test tone, reporting reconstruction error
    Fft {
        #[arg(long, default_value_t = 1.0)]
        seconds: f64,
        #[arg(long, default_value_t = 44100)]
        samplerate: u32,
        #[arg(long, default_value_t = 4096)]
        chunk_size: usize,
    },

    /// Show session status and memory usage
    Usage,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AccelConfig::from_json_file(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => AccelConfig::default(),
    };
    if let Some(dir) = args.kernel_dir {
        config.session.kernel_dir = Some(dir);
    }
    if config.session.kernel_dir.is_none() {
        config.session.kernel_dir = Some(PathBuf::from("kernels"));
    }
    if let Some(mb) = args.memory_mb {
        config.host.memory_capacity = mb * 1024 * 1024;
    }

    let mut session = AcceleratorSession::new(HostBackend::with_config(config.host.clone()));
    let device = args.device;

    match args.command {
        Command::Devices => {
            let devices = session.devices();
            println!("{}", serde_json::to_string_pretty(&devices)?);
            info!("Strongest device: {:?}", session.strongest_device_index());
            return Ok(());
        }
        Command::Mandelbrot {
            width,
            height,
            zoom,
            x,
            y,
            iter,
            version,
            output,
        } => {
            open_session(&mut session, &mut config, device)?;
            let dispatcher = KernelDispatcher::new(config.dispatch);
            let mut images = MediaCollection::new();
            let id = images.add(ImageObject::blank("mandelbrot", width, height));
            let image = images.get_mut(id).context("image vanished")?;

            let variable = [
                ArgValue::Double(zoom),
                ArgValue::Double(x),
                ArgValue::Double(y),
                ArgValue::Int(iter as i32),
            ];
            dispatcher.execute_image_kernel(&mut session, image, "mandelbrot", &version, &variable)?;
            println!("{}", serde_json::to_string_pretty(&image.info())?);

            if let Some(path) = output {
                let pixels = image.pixels().context("render left no host pixels")?;
                pixels.save(&path).with_context(|| format!("Failed to write {}", path.display()))?;
                info!("💾 Saved {}", path.display());
            }
            images.clear(&mut session);
        }
        Command::Stretch {
            factor,
            seconds,
            samplerate,
            tempo,
            kernel,
            version,
            chunk_size,
            overlap,
        } => {
            open_session(&mut session, &mut config, device)?;
            let dispatch = DispatchConfig {
                chunk_size: chunk_size.unwrap_or(config.dispatch.chunk_size),
                overlap: overlap.unwrap_or(config.dispatch.overlap),
                move_back: true,
            };
            dispatch.validate()?;
            let dispatcher = KernelDispatcher::new(dispatch);
            let mut audio = AudioObject::waveform(Waveform::Sine, seconds, samplerate, 1, 16)?.with_tempo(tempo);
            let before = audio.samples().len();

            dispatcher.time_stretch(&mut session, &mut audio, &kernel, &version, factor)?;
            info!("⏱️  {} samples -> {} samples", before, audio.samples().len());
            println!("{}", serde_json::to_string_pretty(&audio.info())?);
        }
        Command::Fft {
            seconds,
            samplerate,
            chunk_size,
        } => {
            open_session(&mut session, &mut config, device)?;
            let dispatch = DispatchConfig {
                chunk_size,
                overlap: 0.0,
                move_back: true,
            };
            let fft = FftOrchestrator::new(dispatch, FftMode::Auto);
            let dispatcher = KernelDispatcher::new(dispatch);
            let mut audio = AudioObject::waveform(Waveform::Sine, seconds, samplerate, 1, 16)?;
            let original = audio.samples().to_vec();

            fft.perform_fft(&mut session, &mut audio)?;
            fft.perform_fft(&mut session, &mut audio)?;
            dispatcher.pull_audio(&mut session, &mut audio)?;

            let restored = audio.samples();
            if restored.is_empty() {
                bail!("no samples after inverse transform");
            }
            let max_error = original
                .iter()
                .zip(restored)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max);
            println!(
                "{}",
                serde_json::json!({
                    "samples": restored.len(),
                    "max_abs_error": max_error,
                    "form": audio.form(),
                })
            );
        }
        Command::Usage => {
            open_session(&mut session, &mut config, device)?;
            println!("{}", serde_json::to_string_pretty(&session.info())?);
            println!("{}", serde_json::to_string_pretty(&session.metrics().snapshot())?);
        }
    }

    session.dispose();
    Ok(())
}

/// Open the requested device, or the strongest one when none is given.
fn open_session(
    session: &mut AcceleratorSession<HostBackend>,
    config: &mut AccelConfig,
    device: Option<usize>,
) -> Result<()> {
    config.session.device_index = device
        .or_else(|| session.strongest_device_index())
        .unwrap_or(config.session.device_index);
    session
        .initialize(&config.session)
        .context("Failed to initialize accelerator session")
}
