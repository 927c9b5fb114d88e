//! Worker manager
//!
//! Registry of live workers. Tracks each worker's set of running jobs and
//! its RAM / slot reservations, and guards against concurrent
//! exclusive-class (real CPU / virtual CPU) jobs on one worker. The
//! dispatch decision and the registry update happen in the same critical
//! section; no lock is held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::env::{ExecClass, JobEnv, required_ram_mb_for_job};
use crate::error::WorkerError;
use crate::worker::{LinkError, WorkerHello, WorkerLink};

/// Default per-job execution timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// RAM statistics over the live workers. `None` (not zero) when the
/// partition has no workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub min_any_cpu_worker_ram: Option<u64>,
    pub max_any_cpu_worker_ram: Option<u64>,
    pub min_vcpu_only_worker_ram: Option<u64>,
    pub max_vcpu_only_worker_ram: Option<u64>,
}

/// Snapshot of one worker, handed to the scheduler.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub name: String,
    pub can_run_cpu_exec: bool,
    pub free_slots: u32,
    pub free_ram_mb: u64,
    pub exclusive_running: Option<ExecClass>,
}

#[derive(Debug, Clone, Copy)]
struct RunningJob {
    class: ExecClass,
    ram_mb: u64,
}

struct WorkerEntry {
    uid: String,
    hello: WorkerHello,
    link: Arc<dyn WorkerLink>,
    running: HashMap<String, RunningJob>,
    gone_tx: watch::Sender<bool>,
}

impl WorkerEntry {
    fn exclusive_running(&self) -> Option<ExecClass> {
        self.running
            .values()
            .map(|j| j.class)
            .find(|c| c.is_exclusive())
    }

    fn used_ram_mb(&self) -> u64 {
        self.running.values().map(|j| j.ram_mb).sum()
    }
}

type Observer = Box<dyn Fn(&str) + Send + Sync>;

enum RunOutcome {
    Finished(Result<JobEnv, LinkError>),
    Gone,
}

pub struct WorkerManager {
    task_timeout: Duration,
    // Keyed by worker name. The unique_id embeds the name, so per-name
    // uniqueness implies per-unique_id uniqueness.
    workers: Mutex<HashMap<String, WorkerEntry>>,
    new_observers: Mutex<Vec<Observer>>,
    lost_observers: Mutex<Vec<Observer>>,
}

fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl WorkerManager {
    pub fn new(task_timeout: Duration) -> Self {
        Self {
            task_timeout,
            workers: Mutex::new(HashMap::new()),
            new_observers: Mutex::new(Vec::new()),
            lost_observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer for worker arrival. Called with the worker name
    /// after the registry mutation.
    pub fn notify_on_new_worker(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.new_observers).push(Box::new(cb));
    }

    /// Register an observer for worker loss.
    pub fn notify_on_lost_worker(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.lost_observers).push(Box::new(cb));
    }

    fn fire(observers: &Mutex<Vec<Observer>>, name: &str) {
        for cb in lock(observers).iter() {
            cb(name);
        }
    }

    /// Register a connection that has completed its handshake.
    ///
    /// Invalid hello, reconnection with running jobs, and duplicates all
    /// close the connection and reject. A reconnecting worker's in-flight
    /// jobs have no record on the dispatcher side (only groups are
    /// persisted, not individual jobs), so there is no way to reconcile and
    /// the worker must be rejected.
    pub async fn new_worker(
        &self,
        uid: &str,
        link: Arc<dyn WorkerLink>,
    ) -> Result<(), WorkerError> {
        let hello = match WorkerHello::from_value(link.hello()) {
            Ok(h) => h,
            Err(reason) => {
                tracing::warn!(uid, %reason, "worker hello rejected");
                link.close();
                return Err(WorkerError::WorkerRejected(reason));
            }
        };

        if lock(&self.workers).contains_key(&hello.name) {
            link.close();
            return Err(WorkerError::DuplicateWorker(uid.to_string()));
        }

        let running = match link.get_running().await {
            Ok(r) => r,
            Err(e) => {
                link.close();
                return Err(WorkerError::WorkerRejected(format!(
                    "get_running failed: {e}"
                )));
            }
        };
        if !running.is_empty() {
            link.close();
            return Err(WorkerError::WorkerRejected(format!(
                "reconnected with {} running job(s)",
                running.len()
            )));
        }

        {
            let mut workers = lock(&self.workers);
            // a same-name connection may have won the race while get_running
            // was awaited
            if workers.contains_key(&hello.name) {
                drop(workers);
                link.close();
                return Err(WorkerError::DuplicateWorker(uid.to_string()));
            }
            let (gone_tx, _) = watch::channel(false);
            workers.insert(
                hello.name.clone(),
                WorkerEntry {
                    uid: uid.to_string(),
                    hello: hello.clone(),
                    link,
                    running: HashMap::new(),
                    gone_tx,
                },
            );
        }
        tracing::info!(
            uid,
            name = %hello.name,
            concurrency = hello.concurrency,
            ram_mb = hello.available_ram_mb,
            can_run_cpu_exec = hello.can_run_cpu_exec,
            "worker registered"
        );
        Self::fire(&self.new_observers, &hello.name);
        Ok(())
    }

    /// Handle loss of a worker connection: drop it from the registry and
    /// fail its in-flight jobs with `WorkerGone`. No-op if already gone.
    pub fn worker_lost(&self, name: &str) {
        let entry = lock(&self.workers).remove(name);
        if let Some(entry) = entry {
            let _ = entry.gone_tx.send(true);
            tracing::info!(uid = %entry.uid, name, "worker lost");
            Self::fire(&self.lost_observers, name);
        }
    }

    /// Run a job on a worker.
    ///
    /// Checking free slots, free RAM and class compatibility is the
    /// caller's (the scheduler's) job. The internal guard only rejects a
    /// second exclusive-class dispatch. On timeout the whole connection is
    /// cut; the worker is not trusted to still be alive.
    pub async fn run_on_worker(&self, name: &str, mut env: JobEnv) -> Result<JobEnv, WorkerError> {
        let task_id = env
            .task_id()
            .ok_or_else(|| WorkerError::InvalidJob("missing task_id".to_string()))?
            .to_string();
        let job_type = env
            .job_type()
            .ok_or_else(|| WorkerError::InvalidJob("missing job_type".to_string()))?
            .to_string();
        let class = ExecClass::of_job_type(&job_type);
        let ram_mb = required_ram_mb_for_job(&env);

        let (link, mut gone_rx) = {
            let mut workers = lock(&self.workers);
            let w = workers
                .get_mut(name)
                .ok_or_else(|| WorkerError::NoSuchWorker(name.to_string()))?;
            if class.is_exclusive() && w.exclusive_running().is_some() {
                return Err(WorkerError::ExclusivityViolation(name.to_string()));
            }
            debug_assert!(w.running.len() < w.hello.concurrency as usize);
            debug_assert!(w.used_ram_mb() + ram_mb <= w.hello.available_ram_mb);
            w.running.insert(task_id.clone(), RunningJob { class, ram_mb });
            (Arc::clone(&w.link), w.gone_tx.subscribe())
        };

        tracing::debug!(worker = name, task_id, job_type, ram_mb, "job dispatched");
        let raced = tokio::time::timeout(self.task_timeout, async {
            tokio::select! {
                r = link.run(env.clone()) => RunOutcome::Finished(r),
                _ = wait_gone(&mut gone_rx) => RunOutcome::Gone,
            }
        })
        .await;

        // Release the reservation. If the worker is gone, remove is a no-op.
        {
            let mut workers = lock(&self.workers);
            if let Some(w) = workers.get_mut(name) {
                w.running.remove(&task_id);
            }
        }

        match raced {
            Err(_elapsed) => {
                tracing::warn!(worker = name, task_id, "job timed out, dropping worker");
                link.close();
                self.worker_lost(name);
                Err(WorkerError::Timeout(name.to_string()))
            }
            Ok(RunOutcome::Gone) => Err(WorkerError::WorkerGone(name.to_string())),
            Ok(RunOutcome::Finished(Ok(result))) => {
                env.merge_from(&result);
                Ok(env)
            }
            Ok(RunOutcome::Finished(Err(LinkError::Closed))) => {
                Err(WorkerError::WorkerGone(name.to_string()))
            }
            Ok(RunOutcome::Finished(Err(LinkError::Remote { kind, message }))) => {
                Err(WorkerError::Remote { kind, message })
            }
            Ok(RunOutcome::Finished(Err(LinkError::Protocol(reason)))) => {
                tracing::warn!(worker = name, task_id, %reason, "protocol error, dropping worker");
                link.close();
                self.worker_lost(name);
                Err(WorkerError::WorkerGone(name.to_string()))
            }
        }
    }

    /// RAM statistics over the live workers.
    pub fn stats(&self) -> WorkerStats {
        let workers = lock(&self.workers);
        let mut stats = WorkerStats::default();
        for w in workers.values() {
            let ram = w.hello.available_ram_mb;
            let (min, max) = if w.hello.can_run_cpu_exec {
                (
                    &mut stats.min_any_cpu_worker_ram,
                    &mut stats.max_any_cpu_worker_ram,
                )
            } else {
                (
                    &mut stats.min_vcpu_only_worker_ram,
                    &mut stats.max_vcpu_only_worker_ram,
                )
            };
            *min = Some(min.map_or(ram, |v| v.min(ram)));
            *max = Some(max.map_or(ram, |v| v.max(ram)));
        }
        stats
    }

    /// Snapshots for the scheduler.
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let workers = lock(&self.workers);
        workers
            .values()
            .map(|w| WorkerSnapshot {
                name: w.hello.name.clone(),
                can_run_cpu_exec: w.hello.can_run_cpu_exec,
                free_slots: w
                    .hello
                    .concurrency
                    .saturating_sub(w.running.len() as u32),
                free_ram_mb: w.hello.available_ram_mb.saturating_sub(w.used_ram_mb()),
                exclusive_running: w.exclusive_running(),
            })
            .collect()
    }

    pub fn has_worker(&self, name: &str) -> bool {
        lock(&self.workers).contains_key(name)
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Number of jobs running on a worker; `None` if the worker is gone.
    pub fn running_count(&self, name: &str) -> Option<usize> {
        lock(&self.workers).get(name).map(|w| w.running.len())
    }

    pub fn total_running(&self) -> usize {
        lock(&self.workers).values().map(|w| w.running.len()).sum()
    }
}

async fn wait_gone(rx: &mut watch::Receiver<bool>) {
    // a dropped sender also counts as gone
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
