//! ORACLE Brain - Demo Loop
//!
//! Drives a synthetic mover through the predictor at the configured frame
//! rate, logs accuracy as it learns and saves what it learned on the way.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oracle_brain::sim::{Simulation, SyntheticMover};
use oracle_brain::MovementPredictor;
use oracle_core::{LogicalClock, OracleConfig, OracleResult};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Frames per scripted movement style
const SEGMENT_FRAMES: u64 = 240;

/// Frames between progress reports
const REPORT_EVERY: u64 = 300;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!("ORACLE stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> OracleResult<()> {
    let config = match std::env::var("ORACLE_CONFIG") {
        Ok(path) => OracleConfig::load(Path::new(&path))?,
        Err(_) => {
            let config = OracleConfig::from_env();
            config.validate()?;
            config
        }
    };

    let frames: u64 = std::env::var("ORACLE_FRAMES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3_600);
    let state_path = PathBuf::from(
        std::env::var("ORACLE_STATE").unwrap_or_else(|_| "data/oracle.predictor".into()),
    );

    info!("ORACLE Brain v{}", VERSION);
    info!(
        "{} frames at {} fps, KNN k={} ({:?}), {:?} training",
        frames,
        config.ensemble.frame_rate,
        config.knn.k,
        config.knn.metric,
        config.training.mode
    );

    let clock = Arc::new(LogicalClock::new(0));
    let predictor = Arc::new(Mutex::new(MovementPredictor::load_or_create(
        &state_path,
        config.clone(),
        clock.clone(),
    )?));

    // Periodic save
    let predictor_save = predictor.clone();
    let save_path = state_path.clone();
    let saver = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            save(&predictor_save.lock(), &save_path);
        }
    });

    let seed = config.network.seed.unwrap_or(7);
    let mut sim = Simulation::new(&config, SyntheticMover::new(seed, SEGMENT_FRAMES), clock);
    let frame_time = std::time::Duration::from_secs_f32(1.0 / config.ensemble.frame_rate);
    let mut interval = tokio::time::interval(frame_time);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    for frame in 1..=frames {
        interval.tick().await;
        let mut guard = predictor.lock();
        let report = sim.tick(&mut guard)?;

        if frame % REPORT_EVERY == 0 {
            let stats = guard.stats();
            info!(
                "frame {}: style {} → predicted {} ({:.2}), hit rate {:.1}%, mean error {:.2}px, pattern rate {:.1}%, {} passes, {} KNN records",
                frame,
                report.frame.pattern,
                report.pattern.pattern,
                report.pattern.confidence,
                stats.accuracy.position_rate * 100.0,
                stats.accuracy.mean_error,
                stats.accuracy.pattern_rate * 100.0,
                stats.training_passes,
                stats.knn.records
            );
        }
    }

    saver.abort();
    let predictor = predictor.lock();
    save(&predictor, &state_path);

    let stats = predictor.stats();
    info!(
        "Done: {:.1}% position hits over {} frames, weights {:?}",
        stats.accuracy.position_rate * 100.0,
        stats.accuracy.position_samples,
        stats.weights
    );
    Ok(())
}

fn save(predictor: &MovementPredictor, path: &Path) {
    match predictor.save(path) {
        Ok(()) => info!("Predictor saved to {}", path.display()),
        Err(e) => warn!("Failed to save predictor: {}", e),
    }
}
