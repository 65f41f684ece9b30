//! Staggered worker start-up and per-worker supervision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use uns_api::Worker;

use crate::backoff::{Backoff, sleep_or_cancel};
use crate::config::RestartPolicy;
use crate::error::EngineError;

// ═══════════════════════════════════════════════════════════════
//  WorkerSet
// ═══════════════════════════════════════════════════════════════

/// Name → worker map, built once at startup.
#[derive(Default)]
pub struct WorkerSet {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under its own name. A second worker with the same
    /// name is rejected.
    pub fn insert(&mut self, worker: Arc<dyn Worker>) -> Result<(), EngineError> {
        let name = worker.name().to_string();
        if self.workers.contains_key(&name) {
            return Err(EngineError::Config(format!("duplicate worker '{name}'")));
        }
        self.workers.insert(name, worker);
        Ok(())
    }

    /// Resolve every name, in order, or fail on the first unknown one.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Worker>>, EngineError> {
        names
            .iter()
            .map(|n| {
                self.workers
                    .get(n)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownWorker(n.clone()))
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Orchestrator
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub start_delay: Duration,
    pub restart: RestartPolicy,
    pub restart_backoff: Backoff,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_secs(2),
            restart: RestartPolicy::Always,
            restart_backoff: Backoff::default(),
        }
    }
}

/// Ordered list of resolved workers, ready to start.
pub struct Orchestrator {
    workers: Vec<Arc<dyn Worker>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Resolve `names` against `set` eagerly; nothing is started here.
    pub fn new(set: &WorkerSet, names: &[String], settings: OrchestratorSettings) -> Result<Self, EngineError> {
        let workers = set.resolve(names)?;
        Ok(Self { workers, settings })
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.name()).collect()
    }

    /// Start the workers in order, `start_delay` apart, each under its own
    /// supervisor. Returns at once; starting continues in the background.
    pub fn start(self, token: CancellationToken) -> Supervisor {
        let handle = tokio::spawn(async move {
            let mut running = JoinSet::new();
            for (i, worker) in self.workers.into_iter().enumerate() {
                if i > 0 && !sleep_or_cancel(self.settings.start_delay, &token).await {
                    break;
                }
                tracing::info!(worker = %worker.name(), "starting worker");
                running.spawn(supervise(worker, self.settings, token.clone()));
            }
            while running.join_next().await.is_some() {}
        });
        Supervisor { handle }
    }
}

/// Keep one worker running according to the restart policy until `token`
/// fires or the policy gives up, then call `Worker::stop`.
async fn supervise(worker: Arc<dyn Worker>, settings: OrchestratorSettings, token: CancellationToken) {
    let name = worker.name().to_string();
    let mut attempt: u32 = 0;

    loop {
        let started = Instant::now();
        let w = worker.clone();
        let mut run: JoinHandle<_> = tokio::spawn(async move { w.run().await });

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                run.abort();
                let _ = (&mut run).await;
                break;
            }
            outcome = &mut run => outcome,
        };

        match outcome {
            Ok(Ok(())) => tracing::info!(worker = %name, "worker finished"),
            Ok(Err(e)) => tracing::error!(worker = %name, error = %e, "worker failed"),
            Err(e) if e.is_panic() => tracing::error!(worker = %name, "worker panicked"),
            Err(e) => tracing::error!(worker = %name, error = %e, "worker task ended abnormally"),
        }

        if settings.restart == RestartPolicy::Never {
            break;
        }

        // A run that outlived the longest delay counts as healthy.
        if started.elapsed() >= settings.restart_backoff.max {
            attempt = 0;
        }
        let delay = settings.restart_backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tracing::warn!(worker = %name, attempt, retry_in_ms = delay.as_millis() as u64, "restarting worker");
        if !sleep_or_cancel(delay, &token).await {
            break;
        }
    }

    tracing::info!(worker = %name, "stopping worker");
    if let Err(e) = worker.stop().await {
        tracing::error!(worker = %name, error = %e, "worker stop failed");
    }
}

// ═══════════════════════════════════════════════════════════════
//  Supervisor
// ═══════════════════════════════════════════════════════════════

/// Handle on the started workers.
pub struct Supervisor {
    handle: JoinHandle<()>,
}

impl Supervisor {
    /// Wait until every supervised worker is done.
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    /// Wait up to `grace` after cancellation, then abort what is left.
    /// Returns `false` when tasks had to be aborted.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "workers did not stop in time, aborting");
                self.handle.abort();
                let _ = self.handle.await;
                false
            }
        }
    }
}
