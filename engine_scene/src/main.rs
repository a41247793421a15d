//! Headless scene runner binary.
//!
//! Usage:
//!   cargo run -p engine_scene --bin scene_runner -- [--config runner.json] [--frames 120]
//!     [--frame-hz 30] [--threads 2] [--seed 0] [--unpaced]
//!
//! Steps a synthetic physics scene with a host frame loop and prints a JSON run summary,
//! including the last stats snapshot, on exit.

use std::env;

use anyhow::Context;
use engine_scene::runner::run_frames;
use engine_shared::config::RunnerConfig;
use tracing::info;

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_args() -> anyhow::Result<(RunnerConfig, bool)> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match flag_value(&args, "--config") {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            RunnerConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?
        }
        None => RunnerConfig::default(),
    };

    let mut paced = true;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--frames" if i + 1 < args.len() => {
                cfg.frames = args[i + 1].parse().unwrap_or(cfg.frames);
                i += 2;
            }
            "--frame-hz" if i + 1 < args.len() => {
                cfg.frame_hz = args[i + 1].parse().unwrap_or(cfg.frame_hz);
                i += 2;
            }
            "--threads" if i + 1 < args.len() => {
                cfg.scene.worker_threads = args[i + 1].parse().unwrap_or(cfg.scene.worker_threads);
                i += 2;
            }
            "--seed" if i + 1 < args.len() => {
                cfg.seed = args[i + 1].parse().unwrap_or(cfg.seed);
                i += 2;
            }
            "--unpaced" => {
                paced = false;
                i += 1;
            }
            _ => i += 1,
        }
    }
    cfg.scene.validate().context("scene config")?;
    Ok((cfg, paced))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (cfg, paced) = parse_args()?;
    info!(
        frames = cfg.frames,
        frame_hz = cfg.frame_hz,
        threads = cfg.scene.worker_threads,
        seed = cfg.seed,
        "Starting scene runner"
    );

    let summary = run_frames(&cfg, paced).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
