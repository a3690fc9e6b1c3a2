//! camgated - camera relay daemon
//!
//! This daemon:
//! 1. Loads camera and channel configuration (file + environment)
//! 2. Checks that the face-recognition worker answers
//! 3. Serves camera feeds, starting each transcoder on first viewer
//! 4. Serves the recognition channel, one request in flight per session
//! 5. Logs per-camera health until interrupted, then shuts everything down

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camgate::{
    spawn_feed_server, spawn_recognition_server, HttpRecognizer, RecognitionGateway, RelayConfig,
    SourceRegistry,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Relay lab camera feeds and face-recognition events to browser viewers"
)]
struct Args {
    /// Config file (TOML when the extension is .toml, JSON otherwise).
    #[arg(long, env = "CAMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Feed channel listen address; overrides the config file.
    #[arg(long)]
    feed_addr: Option<String>,

    /// Recognition channel listen address; overrides the config file.
    #[arg(long)]
    recognition_addr: Option<String>,

    /// Start even if the recognition worker does not answer.
    #[arg(long)]
    skip_recognizer_probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = RelayConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.feed_addr {
        cfg.feed.addr = addr;
    }
    if let Some(addr) = args.recognition_addr {
        cfg.recognition.addr = addr;
    }

    let recognizer = HttpRecognizer::new(
        &cfg.recognition.recognizer_url,
        cfg.recognition.request_timeout,
    );
    if cfg.recognition.probe_on_startup && !args.skip_recognizer_probe {
        let probe = recognizer.clone();
        tokio::task::spawn_blocking(move || probe.probe())
            .await
            .context("recognizer probe task")?
            .map_err(|e| {
                anyhow!(
                    "recognition worker at {} is unreachable: {}",
                    cfg.recognition.recognizer_url,
                    e
                )
            })?;
        log::info!("recognition worker reachable at {}", recognizer.endpoint());
    }

    for camera in &cfg.cameras {
        log::info!(
            "camera {} ({}): {}",
            camera.id,
            camera.label,
            camgate::ingest::redact_url(&camera.url)
        );
    }

    let registry = Arc::new(SourceRegistry::new(
        cfg.cameras.clone(),
        cfg.source.clone(),
        cfg.feed.queue_depth,
    ));
    let gateway = RecognitionGateway::new(Arc::new(recognizer), cfg.gateway_settings());

    let feed = spawn_feed_server(cfg.feed.addr.as_str(), registry.clone(), cfg.session.clone())
        .await
        .with_context(|| format!("bind feed channel on {}", cfg.feed.addr))?;
    let recognition = spawn_recognition_server(
        cfg.recognition.addr.as_str(),
        gateway.clone(),
        cfg.session.clone(),
    )
    .await
    .with_context(|| format!("bind recognition channel on {}", cfg.recognition.addr))?;

    log::info!(
        "camgated running: feed ws://{} recognition ws://{}",
        feed.local_addr(),
        recognition.local_addr()
    );

    let health = spawn_health_log(registry.clone(), gateway.clone(), cfg.health_interval);

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    log::info!("shutdown requested");

    if let Some(health) = health {
        health.abort();
    }
    feed.stop().await;
    recognition.stop().await;
    registry.shutdown().await;
    log::info!("camgated stopped");
    Ok(())
}

fn spawn_health_log(
    registry: Arc<SourceRegistry>,
    gateway: Arc<RecognitionGateway>,
    interval: Duration,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let active = registry
                .health()
                .into_iter()
                .filter(|camera| camera.state != camgate::LifecycleState::Idle);
            for camera in active {
                log::info!(
                    "camera {} health: state={} viewers={} frames={} starts={}",
                    camera.id,
                    camera.state,
                    camera.subscribers,
                    camera.frames_published,
                    camera.source_starts
                );
            }
            log::info!("recognition sessions={}", gateway.session_count());
        }
    }))
}
