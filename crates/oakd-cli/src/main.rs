use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use oakd_core::{BuildPlan, CaptureConfig, PipelineWorker, WorkerOptions};
use oakd_hw::SimulatedDevice;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "oakctl", about = "oakd capture pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the pipeline nodes a capture configuration builds
    Plan {
        #[command(flatten)]
        capture: CaptureArgs,
    },
    /// Run the pipeline against the simulated device and report what it captured
    Capture {
        #[command(flatten)]
        capture: CaptureArgs,
        /// How long to run before stopping
        #[arg(long, default_value_t = 3)]
        seconds: u64,
        /// Write the latest color image to this PNG file
        #[arg(long)]
        png: Option<PathBuf>,
        /// Link-loss faults to inject before starting
        #[arg(long, default_value_t = 0)]
        inject_failures: u32,
        /// Watchdog period in milliseconds
        #[arg(long, default_value_t = 500)]
        watchdog_ms: u64,
    },
}

#[derive(Args)]
struct CaptureArgs {
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 480)]
    height: u32,
    #[arg(long, default_value_t = 30.0)]
    fps: f32,
    /// Capture the color camera
    #[arg(long)]
    color: bool,
    /// Capture stereo depth and the point cloud
    #[arg(long)]
    depth: bool,
}

impl CaptureArgs {
    fn to_config(&self) -> Result<CaptureConfig> {
        let config = CaptureConfig {
            width: self.width,
            height: self.height,
            frame_rate: self.fps,
            capture_color: self.color,
            capture_depth: self.depth,
        };
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { capture } => {
            let plan = BuildPlan::from_config(&capture.to_config()?);
            plan.validate()?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Capture {
            capture,
            seconds,
            png,
            inject_failures,
            watchdog_ms,
        } => {
            let config = capture.to_config()?;
            let device = SimulatedDevice::default();
            device.inject_drain_failures(inject_failures);

            let mut worker = PipelineWorker::new(config, Arc::new(device.clone()), || {
                println!("reconfigure requested by watchdog");
                Ok(())
            })
            .with_options(WorkerOptions {
                watchdog_period: Duration::from_millis(watchdog_ms.max(1)),
                ..WorkerOptions::default()
            });

            println!("Capturing for {seconds}s...");
            worker.start()?;
            std::thread::sleep(Duration::from_secs(seconds));
            worker.stop();
            worker.join();

            let snapshot = worker.reader().snapshot();
            match &snapshot.color {
                Some(img) => println!("color:       {}x{}", img.width(), img.height()),
                None => println!("color:       (empty)"),
            }
            match &snapshot.depth {
                Some(depth) => {
                    let valid: Vec<u16> = depth.iter().copied().filter(|&d| d > 0).collect();
                    let min = valid.iter().min().copied().unwrap_or(0);
                    let max = valid.iter().max().copied().unwrap_or(0);
                    println!(
                        "depth:       {}x{} ({min}-{max} mm)",
                        depth.ncols(),
                        depth.nrows()
                    );
                }
                None => println!("depth:       (empty)"),
            }
            match &snapshot.point_cloud {
                Some(cloud) => println!(
                    "point cloud: {} points{}",
                    cloud.len(),
                    if cloud.colors.is_some() { ", colorized" } else { "" }
                ),
                None => println!("point cloud: (empty)"),
            }
            println!("{}", serde_json::to_string_pretty(&worker.status())?);

            if let Some(path) = png {
                let img = snapshot
                    .color
                    .context("no color image captured; pass --color")?;
                img.save(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Wrote {}", path.display());
            }
        }
    }

    Ok(())
}
