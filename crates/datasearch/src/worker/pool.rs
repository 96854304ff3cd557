use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::db::Database;
use crate::enrichment::{
    requeue_stale, EnrichmentRunner, ExecutorRegistry, PassReport, ReapReport, RetryPolicy,
    StagePlan,
};
use crate::error::WorkerError;

/// How often an idle worker re-checks the shutdown flag while sleeping.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(100);

/// Settings shared by every worker of a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub worker_count: usize,
    pub sources: Vec<String>,
    pub plan: StagePlan,
    pub policy: RetryPolicy,
    pub batch_size: u32,
    /// Sleep after a round in which no source had work.
    pub poll_interval: Duration,
    /// Claims older than this are released by the reaper.
    pub stale_after: chrono::Duration,
    /// Worker ids are `<prefix>-<pid>-<n>`.
    pub worker_prefix: String,
}

/// Something a worker reports back to the pool owner.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Pass { worker_id: String, report: PassReport },
    Reaped { worker_id: String, report: ReapReport },
    Error { worker_id: String, message: String },
}

/// A fixed set of OS threads, each repeatedly running enrichment passes over
/// every configured source. Workers coordinate only through the store.
pub struct WorkerPool {
    event_receiver: Receiver<WorkerEvent>,
    workers: Vec<JoinHandle<()>>,
    worker_ids: Vec<String>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(
        db: Database,
        registry: Arc<ExecutorRegistry>,
        settings: PoolSettings,
    ) -> Result<Self, WorkerError> {
        if settings.worker_count == 0 {
            return Err(WorkerError::NoWorkers);
        }
        if settings.sources.is_empty() {
            return Err(WorkerError::NoSources);
        }

        let (event_sender, event_receiver) = bounded::<WorkerEvent>(settings.worker_count * 4);
        let shutdown = Arc::new(AtomicBool::new(false));
        let settings = Arc::new(settings);
        let pid = std::process::id();

        let mut workers = Vec::with_capacity(settings.worker_count);
        let mut worker_ids = Vec::with_capacity(settings.worker_count);

        for n in 0..settings.worker_count {
            let worker_id = format!("{}-{}-{}", settings.worker_prefix, pid, n);
            let runner = EnrichmentRunner::new(
                db.clone(),
                Arc::clone(&registry),
                settings.plan.clone(),
                settings.policy,
                worker_id.clone(),
            )?
            .with_batch_size(settings.batch_size);

            let worker = Worker {
                runner,
                db: db.clone(),
                settings: Arc::clone(&settings),
                events: event_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                reaps: n == 0,
            };

            let spawned = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => {
                    workers.push(handle);
                    worker_ids.push(worker_id);
                }
                Err(source) => {
                    shutdown.store(true, Ordering::Relaxed);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(WorkerError::SpawnFailed { worker_id, source });
                }
            }
        }

        info!(
            "Started {} enrichment workers for {} sources",
            workers.len(),
            settings.sources.len()
        );

        Ok(Self {
            event_receiver,
            workers,
            worker_ids,
            shutdown,
        })
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    pub fn try_recv_event(&self) -> Option<WorkerEvent> {
        self.event_receiver.try_recv().ok()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
        self.event_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Signals shutdown and joins every worker. A worker finishes its
    /// current stage invocation before it stops.
    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        drop(self.event_receiver);

        for (worker, id) in self.workers.into_iter().zip(self.worker_ids.iter()) {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", id, e);
            } else {
                debug!("Worker {} finished", id);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

struct Worker {
    runner: EnrichmentRunner,
    db: Database,
    settings: Arc<PoolSettings>,
    events: Sender<WorkerEvent>,
    shutdown: Arc<AtomicBool>,
    reaps: bool,
}

impl Worker {
    fn run(self) {
        let id = self.runner.worker_id().to_string();
        debug!("Worker {} started", id);

        while !self.stopping() {
            if self.reaps {
                self.reap(&id);
            }

            let mut busy = false;
            for source in &self.settings.sources {
                if self.stopping() {
                    break;
                }
                match self.runner.run_pass(source) {
                    Ok(report) if report.is_idle() => {}
                    Ok(report) => {
                        busy = true;
                        self.emit(WorkerEvent::Pass {
                            worker_id: id.clone(),
                            report,
                        });
                    }
                    Err(e) => {
                        error!("Worker {} pass over '{}' failed: {}", id, source, e);
                        self.emit(WorkerEvent::Error {
                            worker_id: id.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }

            if !busy {
                self.idle();
            }
        }

        debug!("Worker {} stopped", id);
    }

    fn reap(&self, id: &str) {
        let result = requeue_stale(
            &self.db,
            self.runner.plan(),
            self.runner.policy(),
            self.settings.stale_after,
            Utc::now(),
        );
        match result {
            Ok(report) if report.released() > 0 || report.errors > 0 => {
                self.emit(WorkerEvent::Reaped {
                    worker_id: id.to_string(),
                    report,
                })
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Worker {} reaper failed: {}", id, e);
                self.emit(WorkerEvent::Error {
                    worker_id: id.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Reports are dropped when nobody drains the channel.
    fn emit(&self, event: WorkerEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => debug!("Worker event channel full, dropping event"),
        }
    }

    fn idle(&self) {
        let until = Instant::now() + self.settings.poll_interval;
        while !self.stopping() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            thread::sleep(SHUTDOWN_CHECK.min(until - now));
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
