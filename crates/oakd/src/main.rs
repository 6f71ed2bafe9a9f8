use anyhow::{bail, Result};
use oakd_core::PipelineWorker;
use oakd_hw::{Device, SimulatedDevice};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("oakd starting");

    let mut config = Config::load()?;
    let device = open_device(&config)?;

    // The watchdog asks for a reconfigure through this channel; the main
    // task answers by rebuilding the worker from freshly loaded config.
    let (reconfigure_tx, mut reconfigure_rx) = mpsc::channel::<()>(1);

    let mut worker = spawn_worker(&config, &device, &reconfigure_tx)?;
    tracing::info!(device = device.name(), "oakd ready");

    let mut status_tick =
        tokio::time::interval(Duration::from_secs(config.status_interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            _ = status_tick.tick() => {
                let status = serde_json::to_string(&worker.status())?;
                tracing::info!(status = %status, "worker status");
            }
            Some(()) = reconfigure_rx.recv() => {
                match Config::load() {
                    Ok(reloaded) => {
                        if reloaded.capture != config.capture {
                            tracing::info!(from = ?config.capture, to = ?reloaded.capture, "capture configuration changed");
                        }
                        config = reloaded;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to reload configuration; reusing current");
                    }
                }
                tracing::info!("rebuilding worker");
                shutdown_worker(worker).await;
                worker = spawn_worker(&config, &device, &reconfigure_tx)?;
            }
        }
    }

    tracing::info!("oakd shutting down");
    shutdown_worker(worker).await;
    Ok(())
}

fn open_device(config: &Config) -> Result<Arc<dyn Device>> {
    match config.device.as_str() {
        "sim" => {
            let device = SimulatedDevice::new("sim-oak");
            if config.sim_drain_failures > 0 {
                tracing::warn!(
                    count = config.sim_drain_failures,
                    "injecting drain failures into simulated device"
                );
                device.inject_drain_failures(config.sim_drain_failures);
            }
            Ok(Arc::new(device))
        }
        other => bail!("unsupported device backend: {other} (available: sim)"),
    }
}

fn spawn_worker(
    config: &Config,
    device: &Arc<dyn Device>,
    reconfigure_tx: &mpsc::Sender<()>,
) -> Result<PipelineWorker> {
    let tx = reconfigure_tx.clone();
    let mut worker = PipelineWorker::new(config.capture, Arc::clone(device), move || {
        match tx.try_send(()) {
            // A rebuild is already queued.
            Ok(()) | Err(TrySendError::Full(())) => Ok(()),
            Err(err) => Err(err.into()),
        }
    })
    .with_options(config.worker_options());
    worker.start()?;
    Ok(worker)
}

/// Stop and join a worker without blocking the runtime.
async fn shutdown_worker(mut worker: PipelineWorker) {
    worker.stop();
    let joined = tokio::task::spawn_blocking(move || {
        worker.join();
        worker.status()
    })
    .await;
    match joined {
        Ok(status) => tracing::info!(
            sessions = status.sessions_opened,
            reconfigurations = status.reconfigurations,
            "worker stopped"
        ),
        Err(err) => tracing::error!(error = %err, "worker join task failed"),
    }
}
