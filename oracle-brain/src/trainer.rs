//! # Trainer - Incremental Training Off the Simulation Tick
//!
//! A training pass runs on a private copy of the models, so the caller keeps
//! predicting with the previous weights until the pass is done. Jobs go to
//! one worker thread through a single-slot mailbox:
//!
//! ```text
//! submit(gen N) ──► mailbox ──► worker ── trains copy ──► results channel
//!                      ▲                     │
//!   submit(gen N+1) ───┘     aborts when     │
//!   (replaces unstarted)     gen != N ◄──────┘
//! ```
//!
//! A newer submission abandons the older pass at its next batch boundary.
//! Only the result of the most recent generation is ever collected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use oracle_compute::{classifier_spec, regression_spec, Network};
use oracle_core::config::{NetworkConfig, TrainingConfig};
use oracle_core::{FeatureVector, OracleResult, FEATURE_DIMS, PATTERN_CLASSES};

/// One realized outcome, queued until the next training pass
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub features: FeatureVector,
    /// Normalized offset from the current position
    pub position_target: [f32; 2],
    /// Normalized velocity
    pub velocity_target: [f32; 2],
    pub pattern_target: [f32; PATTERN_CLASSES],
    pub timestamp: u64,
}

/// The three networks trained together
#[derive(Clone, Debug)]
pub struct Models {
    pub position: Network,
    pub velocity: Network,
    pub pattern: Network,
}

impl Models {
    pub fn new(config: &NetworkConfig) -> OracleResult<Self> {
        let seed = |offset: u64| config.seed.map(|s| s.wrapping_add(offset));
        Ok(Self {
            position: Network::new(regression_spec("position", FEATURE_DIMS, 2, config), seed(0))?,
            velocity: Network::new(regression_spec("velocity", FEATURE_DIMS, 2, config), seed(1))?,
            pattern: Network::new(
                classifier_spec("pattern", FEATURE_DIMS, PATTERN_CLASSES, config),
                seed(2),
            )?,
        })
    }

    pub fn parameter_count(&self) -> usize {
        [&self.position, &self.velocity, &self.pattern]
            .iter()
            .flat_map(|n| n.layers())
            .map(|l| l.parameter_count())
            .sum()
    }
}

/// Outcome of one incremental pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    pub examples: usize,
    pub position_loss: Option<f32>,
    pub velocity_loss: Option<f32>,
    pub pattern_loss: Option<f32>,
    pub aborted: bool,
}

/// Train every network on `batch`. `should_abort` is polled between
/// mini-batches; an aborted report means the models are partially trained
/// and should be discarded.
pub fn train_batch(
    models: &mut Models,
    batch: &[TrainingExample],
    config: &TrainingConfig,
    should_abort: impl Fn() -> bool,
) -> OracleResult<BatchReport> {
    let inputs: Vec<Vec<f32>> = batch.iter().map(|e| e.features.as_slice().to_vec()).collect();
    let positions: Vec<Vec<f32>> = batch.iter().map(|e| e.position_target.to_vec()).collect();
    let velocities: Vec<Vec<f32>> = batch.iter().map(|e| e.velocity_target.to_vec()).collect();
    let patterns: Vec<Vec<f32>> = batch.iter().map(|e| e.pattern_target.to_vec()).collect();

    let mut report = BatchReport {
        examples: batch.len(),
        ..BatchReport::default()
    };

    let jobs: [(&mut Network, &[Vec<f32>], &mut Option<f32>); 3] = [
        (&mut models.position, positions.as_slice(), &mut report.position_loss),
        (&mut models.velocity, velocities.as_slice(), &mut report.velocity_loss),
        (&mut models.pattern, patterns.as_slice(), &mut report.pattern_loss),
    ];
    let mut aborted = false;
    for (network, targets, loss) in jobs {
        let run = network.train_until(
            &inputs,
            targets,
            config.epochs,
            config.batch_size,
            &should_abort,
        )?;
        *loss = run.final_loss();
        if run.aborted {
            aborted = true;
            break;
        }
    }
    report.aborted = aborted;

    Ok(report)
}

// ============================================================================
// WORKER
// ============================================================================

struct TrainingJob {
    generation: u64,
    models: Models,
    batch: Vec<TrainingExample>,
}

#[derive(Default)]
struct Mailbox {
    job: Option<TrainingJob>,
    shutdown: bool,
}

struct Shared {
    mailbox: Mutex<Mailbox>,
    wakeup: Condvar,
    /// Generation of the newest submitted job
    generation: AtomicU64,
}

/// Models trained by the worker, ready to swap in
#[derive(Debug)]
pub struct TrainedModels {
    pub models: Models,
    pub report: BatchReport,
}

/// Message from the worker
#[derive(Debug)]
pub struct TrainingResult {
    pub generation: u64,
    pub outcome: OracleResult<TrainedModels>,
}

/// Background training thread
pub struct TrainingWorker {
    shared: Arc<Shared>,
    results: mpsc::UnboundedReceiver<TrainingResult>,
    handle: Option<JoinHandle<()>>,
    submitted: u64,
    pending: bool,
}

impl TrainingWorker {
    pub fn spawn(config: TrainingConfig) -> OracleResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            mailbox: Mutex::new(Mailbox::default()),
            wakeup: Condvar::new(),
            generation: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("oracle-trainer".into())
            .spawn(move || run_worker(worker_shared, tx, config))?;

        tracing::debug!("Training worker started");

        Ok(Self {
            shared,
            results: rx,
            handle: Some(handle),
            submitted: 0,
            pending: false,
        })
    }

    /// Queue a pass, abandoning whatever was queued or running before.
    /// Returns the job's generation.
    pub fn submit(&mut self, models: Models, batch: Vec<TrainingExample>) -> u64 {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut mailbox = self.shared.mailbox.lock();
            let stale = mailbox.job.replace(TrainingJob {
                generation,
                models,
                batch,
            });
            if let Some(stale) = stale {
                tracing::debug!("Dropping unstarted training job {}", stale.generation);
            }
        }
        self.shared.wakeup.notify_one();

        if self.pending {
            tracing::debug!("Training job {} supersedes {}", generation, self.submitted);
        }
        self.submitted = generation;
        self.pending = true;
        generation
    }

    /// A submitted job has not been collected yet
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Latest submitted generation
    pub fn generation(&self) -> u64 {
        self.submitted
    }

    /// Non-blocking: the result of the latest job, if it has arrived
    pub fn try_collect(&mut self) -> Option<TrainingResult> {
        while let Ok(result) = self.results.try_recv() {
            if let Some(result) = self.accept(result) {
                return Some(result);
            }
        }
        None
    }

    /// Block until the latest job finishes. Must not be called from inside
    /// an async runtime.
    pub fn wait(&mut self) -> Option<TrainingResult> {
        while self.pending {
            match self.results.blocking_recv() {
                Some(result) => {
                    if let Some(result) = self.accept(result) {
                        return Some(result);
                    }
                }
                None => {
                    tracing::warn!("Training worker stopped unexpectedly");
                    self.pending = false;
                }
            }
        }
        None
    }

    fn accept(&mut self, result: TrainingResult) -> Option<TrainingResult> {
        if result.generation == self.submitted {
            self.pending = false;
            Some(result)
        } else {
            tracing::debug!("Ignoring stale training result {}", result.generation);
            None
        }
    }
}

impl Drop for TrainingWorker {
    fn drop(&mut self) {
        self.shared.mailbox.lock().shutdown = true;
        // Abort any pass in progress
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Training worker panicked");
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>, tx: mpsc::UnboundedSender<TrainingResult>, config: TrainingConfig) {
    loop {
        let job = {
            let mut mailbox = shared.mailbox.lock();
            loop {
                if mailbox.shutdown {
                    return;
                }
                if let Some(job) = mailbox.job.take() {
                    break job;
                }
                shared.wakeup.wait(&mut mailbox);
            }
        };

        let TrainingJob {
            generation,
            mut models,
            batch,
        } = job;
        let superseded = || shared.generation.load(Ordering::SeqCst) != generation;

        let outcome = match train_batch(&mut models, &batch, &config, superseded) {
            Ok(report) if report.aborted => {
                tracing::debug!("Training job {} abandoned", generation);
                continue;
            }
            Ok(report) => Ok(TrainedModels { models, report }),
            Err(e) => Err(e),
        };

        if tx.send(TrainingResult { generation, outcome }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oracle_core::Pattern;

    fn config() -> NetworkConfig {
        NetworkConfig {
            seed: Some(5),
            ..NetworkConfig::default()
        }
    }

    fn batch(n: usize) -> Vec<TrainingExample> {
        (0..n)
            .map(|i| {
                let t = i as f32 / n as f32;
                TrainingExample {
                    features: FeatureVector::from_values((0..FEATURE_DIMS).map(|j| (t + j as f32 * 0.01).sin())),
                    position_target: [t, -t],
                    velocity_target: [0.5 * t, 0.1],
                    pattern_target: Pattern::ALL[i % PATTERN_CLASSES].one_hot(),
                    timestamp: i as u64,
                }
            })
            .collect()
    }

    #[test]
    fn test_models_are_seeded() {
        let a = Models::new(&config()).unwrap();
        let b = Models::new(&config()).unwrap();
        let input = vec![0.2; FEATURE_DIMS];
        assert_eq!(a.position.predict(&input).unwrap(), b.position.predict(&input).unwrap());
        assert_ne!(a.position.predict(&input).unwrap(), a.velocity.predict(&input).unwrap());
        assert!(a.parameter_count() > 0);
    }

    #[test]
    fn test_train_batch_trains_all_networks() {
        let mut models = Models::new(&config()).unwrap();
        let report = train_batch(&mut models, &batch(20), &TrainingConfig::default(), || false).unwrap();

        assert_eq!(report.examples, 20);
        assert!(!report.aborted);
        assert!(report.position_loss.is_some());
        assert!(report.velocity_loss.is_some());
        assert!(report.pattern_loss.is_some());
        assert_eq!(models.pattern.examples_seen(), 60);
    }

    #[test]
    fn test_train_batch_abort() {
        let mut models = Models::new(&config()).unwrap();
        let report = train_batch(&mut models, &batch(20), &TrainingConfig::default(), || true).unwrap();
        assert!(report.aborted);
        assert!(!models.position.is_trained());
    }

    #[test]
    fn test_worker_returns_trained_models() {
        let mut worker = TrainingWorker::spawn(TrainingConfig::default()).unwrap();
        let models = Models::new(&config()).unwrap();
        let generation = worker.submit(models, batch(20));
        assert!(worker.is_pending());

        let result = worker.wait().unwrap();
        assert_eq!(result.generation, generation);
        let trained = result.outcome.unwrap();
        assert!(trained.models.position.is_trained());
        assert!(!worker.is_pending());
    }

    #[test]
    fn test_worker_only_delivers_latest_generation() {
        let mut worker = TrainingWorker::spawn(TrainingConfig::default()).unwrap();
        let models = Models::new(&config()).unwrap();
        worker.submit(models.clone(), batch(20));
        worker.submit(models.clone(), batch(20));
        let latest = worker.submit(models, batch(20));

        let result = worker.wait().unwrap();
        assert_eq!(result.generation, latest);
        assert!(worker.try_collect().is_none());
    }
}
