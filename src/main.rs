use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use kvm_bus::capture::CaptureSource;
use kvm_bus::context::MediaContext;
use kvm_bus::error::PipelineError;
use kvm_bus::pipeline::FailureHandler;
use kvm_bus::sample::{SampleStream, sample_channel};
use tokio_util::sync::CancellationToken;

mod config;
mod manager;
#[cfg(not(feature = "gstreamer"))]
mod pattern;

use manager::EncoderManager;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("kvm_bus", log::LevelFilter::Debug)
        .filter_module("mini_kvm", log::LevelFilter::Debug)
        .init();
}

#[cfg(feature = "gstreamer")]
fn backend() -> Arc<dyn kvm_bus::graph::Backend> {
    kvm_bus::gst::GstBackend::new()
}

#[cfg(not(feature = "gstreamer"))]
fn backend() -> Arc<kvm_bus::sim::SimBackend> {
    kvm_bus::sim::SimBackend::new()
}

/// Transport is out of scope: count samples per profile and log progress.
fn spawn_sample_drain(mut samples: SampleStream, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut counts: HashMap<String, u64> = HashMap::new();
        loop {
            let sample = tokio::select! {
                _ = cancel.cancelled() => break,
                sample = samples.next() => match sample {
                    Some(sample) => sample,
                    None => break,
                },
            };

            let count = counts.entry(sample.metadata.source.clone()).or_default();
            *count += 1;
            if *count == 1 || (sample.is_key_frame() && *count % 300 == 0) {
                log::info!("{} #{}", sample, count);
            }
        }
        log::info!("sample drain finished: {:?}", counts);
    });
}

async fn run(cancel: CancellationToken) -> anyhow::Result<Vec<EncoderManager>> {
    let config = config::load()?;
    let backend = backend();
    let ctx = Arc::new(MediaContext::new(backend.clone()).with_timeouts(config.timeouts.into()));

    let (tx, samples) = sample_channel(config.output_queue);
    spawn_sample_drain(samples, cancel.clone());

    let failure_cancel = cancel.clone();
    let on_failure: FailureHandler = Arc::new(move |err: PipelineError| {
        log::error!("media pipeline failed: {}", err);
        failure_cancel.cancel();
    });

    let mut managers = Vec::new();
    for media in config.media() {
        let eos_cancel = cancel.clone();
        let capture = CaptureSource::with_eos_handler(
            &ctx,
            media.capture.clone(),
            Arc::new(move || {
                log::warn!("capture device ended the stream");
                eos_cancel.cancel();
            }),
        )?;
        capture.set_failure_handler(Arc::clone(&on_failure));
        let capture = Arc::new(capture);

        #[cfg(not(feature = "gstreamer"))]
        if let Some(graph) = backend.last_graph() {
            pattern::spawn(graph, media.capture.clone(), cancel.clone());
        }

        capture.start()?;
        let manager = EncoderManager::new(&ctx, capture, tx.clone())
            .with_failure_handler(Arc::clone(&on_failure));
        for profile in &media.profiles {
            manager.add_profile(profile.clone()).await?;
        }
        managers.push(manager);
    }

    Ok(managers)
}

async fn shutdown(managers: &[EncoderManager]) {
    for manager in managers {
        manager.stop_all().await;
    }
    for manager in managers {
        manager.capture().stop().await;
    }
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    kvm_bus::init().unwrap_or_else(|e| {
        eprintln!("Error initialising media backend: {:#}", e);
        std::process::exit(1);
    });

    let cancel = CancellationToken::new();
    let managers = match run(cancel.clone()).await {
        Ok(managers) => managers,
        Err(e) => {
            eprintln!("Error starting media pipelines: {:#}", e);
            std::process::exit(1);
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    shutdown(&managers).await;
    log::info!("exited");
    std::process::exit(0);
}
