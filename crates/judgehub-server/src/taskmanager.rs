//! Task manager
//!
//! The orchestrator: accept group -> persist -> feed the scheduler ->
//! dispatch -> collect results -> respond -> delete the record. Every
//! scheduling decision is serialized on a single event loop; only worker
//! RPC and store I/O are awaited outside it.
//!
//! Failure policy: `RemoteError` and timeouts fail the whole group (no
//! partial results), `WorkerGone` bumps retry_cnt and re-queues, and an
//! exhausted retry budget fails the group.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::env::{ExecClass, GroupEnv, JobEnv, required_ram_mb_for_job};
use crate::error::{TaskError, WorkerError};
use crate::manager::WorkerManager;
use crate::scheduler::{PrioritizingScheduler, QueuedJob};
use crate::store::{GroupRecord, GroupStatus, TaskStore};

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Process-wide ceiling on the RAM a single job may require (MiB).
    pub max_task_ram_mb: u64,
    /// Retry budget for WorkerGone. Exceeding it fails the group.
    pub retry_limit: u32,
    /// Interval between periodic write-backs of dirty records.
    pub sync_interval: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_task_ram_mb: 8192,
            retry_limit: 3,
            sync_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Queued,
    Running,
}

struct TaskEntry {
    group_id: String,
    env: JobEnv,
    state: TaskState,
}

struct GroupState {
    env: GroupEnv,
    timestamp: f64,
    retry_cnt: u32,
    pending: HashSet<String>,
    /// Response channel to the submitter. Restored groups have none.
    waiter: Option<oneshot::Sender<Result<GroupEnv, TaskError>>>,
    dirty: bool,
}

#[derive(Default)]
struct TmState {
    groups: HashMap<String, GroupState>,
    /// task_id -> in-progress job, both queued and running.
    tasks: HashMap<String, TaskEntry>,
    /// group_ids reserved before store.put completes (guards duplicate adds).
    reserved: HashSet<String>,
}

enum Event {
    Poke,
    JobFinished {
        task_id: String,
        outcome: Result<JobEnv, WorkerError>,
    },
    Flush,
}

fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    wm: Arc<WorkerManager>,
    sched: Mutex<PrioritizingScheduler>,
    store: TaskStore,
    cfg: TaskManagerConfig,
    state: Mutex<TmState>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl TaskManager {
    pub fn new(wm: Arc<WorkerManager>, store: TaskStore, cfg: TaskManagerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                wm,
                sched: Mutex::new(PrioritizingScheduler::new()),
                store,
                cfg,
                state: Mutex::new(TmState::default()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Recover persisted groups and start the event loop. Call once at
    /// process startup.
    pub async fn start(&self) -> Result<(), TaskError> {
        let inner = &self.inner;
        let Some(events_rx) = lock(&inner.events_rx).take() else {
            tracing::warn!("task manager already started");
            return Ok(());
        };

        for record in inner.store.load_all().await? {
            if record.status != GroupStatus::ToJudge {
                // leftover of a crash right before completion; nobody is
                // waiting for the result, so just remove it
                inner.store.delete(&record.id).await?;
                continue;
            }
            match normalize_group(record.env) {
                Ok(env) => {
                    tracing::info!(group_id = %record.id, retry_cnt = record.retry_cnt, "restored task group");
                    inner.insert_group(record.id, env, record.timestamp, record.retry_cnt, None);
                }
                Err(e) => {
                    tracing::error!(group_id = %record.id, error = %e, "dropping unrecoverable record");
                    inner.store.delete(&record.id).await?;
                }
            }
        }

        let tx = inner.events_tx.clone();
        inner.wm.notify_on_new_worker(move |_| {
            let _ = tx.send(Event::Poke);
        });
        let tx = inner.events_tx.clone();
        inner.wm.notify_on_lost_worker(move |_| {
            let _ = tx.send(Event::Poke);
        });

        tokio::spawn(event_loop(Arc::clone(inner), events_rx));
        let tx = inner.events_tx.clone();
        let interval = inner.cfg.sync_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(Event::Flush).is_err() {
                    break;
                }
            }
        });

        let _ = inner.events_tx.send(Event::Poke);
        Ok(())
    }

    /// Accept a task group and return the aggregated env once every job has
    /// completed.
    ///
    /// A huge-task is a synchronous rejection returned as *success* with an
    /// `error` key on the env (and is never persisted). Job failure,
    /// timeout and an exhausted retry budget are `Err`.
    pub async fn add_task_group(&self, env: GroupEnv) -> Result<GroupEnv, TaskError> {
        let mut env = normalize_group(env)?;
        let group_id = env
            .group_id()
            .ok_or_else(|| TaskError::MalformedGroup("missing group_id".to_string()))?
            .to_string();
        let jobs = env
            .workers_jobs()
            .ok_or_else(|| TaskError::MalformedGroup("missing workers_jobs".to_string()))?;

        {
            let mut st = lock(&self.inner.state);
            if st.groups.contains_key(&group_id) || !st.reserved.insert(group_id.clone()) {
                return Err(TaskError::DuplicateGroup(group_id));
            }
        }

        // Admission: a job no worker in the fleet could ever hold would sit
        // in the queue forever, so reject it synchronously here.
        let stats = self.inner.wm.stats();
        for (task_id, job) in &jobs {
            let ram_mb = required_ram_mb_for_job(job);
            let class = ExecClass::of_job_type(job.job_type().unwrap_or_default());
            if ram_mb > self.inner.cfg.max_task_ram_mb
                || !PrioritizingScheduler::fleet_can_ever_run(&stats, class, ram_mb)
            {
                lock(&self.inner.state).reserved.remove(&group_id);
                tracing::warn!(group_id, task_id = %task_id, ram_mb, "rejecting huge task");
                env.set_error(
                    "huge-task",
                    &format!("job {task_id} requires {ram_mb} MiB of RAM"),
                );
                return Ok(env);
            }
        }

        let timestamp = now_ts();
        let record = GroupRecord {
            id: group_id.clone(),
            status: GroupStatus::ToJudge,
            timestamp,
            retry_cnt: 0,
            env: env.clone(),
        };
        if let Err(e) = self.inner.store.put(&record).await {
            lock(&self.inner.state).reserved.remove(&group_id);
            return Err(e.into());
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .insert_group(group_id.clone(), env, timestamp, 0, Some(tx));
        let _ = self.inner.events_tx.send(Event::Poke);
        tracing::info!(group_id, jobs = jobs.len(), "task group accepted");

        rx.await.map_err(|_| TaskError::Shutdown)?
    }

    /// The in-progress (queued + running) task_ids.
    pub fn in_progress_tasks(&self) -> Vec<String> {
        lock(&self.inner.state).tasks.keys().cloned().collect()
    }

    /// The env of an in-progress job.
    pub fn in_progress_env(&self, task_id: &str) -> Option<JobEnv> {
        lock(&self.inner.state)
            .tasks
            .get(task_id)
            .map(|t| t.env.clone())
    }

    pub fn group_count(&self) -> usize {
        lock(&self.inner.state).groups.len()
    }

    /// Queued task_ids of a class, in execution order.
    pub fn queued_tasks(&self, class: ExecClass) -> Vec<String> {
        lock(&self.inner.sched).queued_tasks(class)
    }

    pub fn total_queued(&self) -> usize {
        lock(&self.inner.sched).total_queued()
    }

    /// Write dirty records back now (for shutdown).
    pub async fn flush(&self) {
        self.inner.flush_dirty().await;
    }
}

/// Normalization shared by accept and restore. Burns task_id / group_id
/// into each job env and defaults `contest_uid`.
fn normalize_group(mut env: GroupEnv) -> Result<GroupEnv, TaskError> {
    let group_id = env
        .group_id()
        .ok_or_else(|| TaskError::MalformedGroup("missing group_id".to_string()))?
        .to_string();
    let mut jobs = env
        .workers_jobs()
        .ok_or_else(|| TaskError::MalformedGroup("missing workers_jobs".to_string()))?;
    if jobs.is_empty() {
        return Err(TaskError::MalformedGroup("empty workers_jobs".to_string()));
    }
    for (task_id, job) in jobs.iter_mut() {
        job.set("task_id", json!(task_id));
        job.set("group_id", json!(group_id.clone()));
        if job.job_type().is_none() {
            return Err(TaskError::MalformedGroup(format!(
                "job {task_id} is missing job_type"
            )));
        }
        job.ensure_contest_uid();
        env.set_job_env(task_id, job);
    }
    Ok(env)
}

impl Inner {
    fn insert_group(
        &self,
        group_id: String,
        env: GroupEnv,
        timestamp: f64,
        retry_cnt: u32,
        waiter: Option<oneshot::Sender<Result<GroupEnv, TaskError>>>,
    ) {
        let jobs = env.workers_jobs().unwrap_or_default();
        let priority = env.priority();
        let mut st = lock(&self.state);
        let mut sched = lock(&self.sched);
        let mut pending = HashSet::new();
        for (task_id, job) in jobs {
            pending.insert(task_id.clone());
            sched.enqueue(QueuedJob {
                task_id: task_id.clone(),
                group_id: group_id.clone(),
                class: ExecClass::of_job_type(job.job_type().unwrap_or_default()),
                required_ram_mb: required_ram_mb_for_job(&job),
                priority,
            });
            st.tasks.insert(
                task_id,
                TaskEntry {
                    group_id: group_id.clone(),
                    env: job,
                    state: TaskState::Queued,
                },
            );
        }
        st.reserved.remove(&group_id);
        st.groups.insert(
            group_id,
            GroupState {
                env,
                timestamp,
                retry_cnt,
                pending,
                waiter,
                dirty: false,
            },
        );
    }

    /// Decide one round of assignments and dispatch them. Only the event
    /// loop calls this, so decisions are serialized.
    fn dispatch_round(self: &Arc<Self>) {
        let snapshots = self.wm.snapshots();
        let assignments = lock(&self.sched).schedule(&snapshots);
        for a in assignments {
            let env = {
                let mut st = lock(&self.state);
                match st.tasks.get_mut(&a.task_id) {
                    // only take queued tasks (group failure and requeue race
                    // with assignments)
                    Some(entry) if entry.state == TaskState::Queued => {
                        entry.state = TaskState::Running;
                        entry.env.clone()
                    }
                    _ => continue,
                }
            };
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = inner.wm.run_on_worker(&a.worker, env).await;
                let _ = inner.events_tx.send(Event::JobFinished {
                    task_id: a.task_id,
                    outcome,
                });
            });
        }
    }

    async fn handle_job_finished(&self, task_id: String, outcome: Result<JobEnv, WorkerError>) {
        match outcome {
            Ok(result) => self.complete_task(&task_id, result).await,
            Err(WorkerError::Remote { kind, message }) => {
                self.fail_group_of(&task_id, TaskError::Remote { kind, message })
                    .await;
            }
            Err(WorkerError::Timeout(worker)) => {
                let err = TaskError::Timeout {
                    task_id: task_id.clone(),
                    worker,
                };
                self.fail_group_of(&task_id, err).await;
            }
            Err(WorkerError::WorkerGone(_)) | Err(WorkerError::NoSuchWorker(_)) => {
                self.requeue(&task_id).await;
            }
            Err(WorkerError::InvalidJob(reason)) => {
                self.fail_group_of(&task_id, TaskError::MalformedGroup(reason))
                    .await;
            }
            Err(e) => {
                // ExclusivityViolation and friends: a scheduler defect.
                // Record it and pick the job back up.
                tracing::error!(task_id, error = %e, "unexpected dispatch failure");
                self.requeue(&task_id).await;
            }
        }
    }

    async fn complete_task(&self, task_id: &str, result: JobEnv) {
        let finished = {
            let mut st = lock(&self.state);
            // a completion arriving after its group already failed is dropped
            let Some(entry) = st.tasks.remove(task_id) else {
                return;
            };
            let group_id = entry.group_id;
            let Some(group) = st.groups.get_mut(&group_id) else {
                return;
            };
            group.env.set_job_env(task_id, &result);
            group.pending.remove(task_id);
            if group.pending.is_empty() {
                st.groups.remove(&group_id).map(|g| (group_id, g))
            } else {
                None
            }
        };
        if let Some((group_id, group)) = finished {
            if let Err(e) = self.store.delete(&group_id).await {
                tracing::error!(group_id, error = %e, "failed to delete completed record");
            }
            tracing::info!(group_id, "task group complete");
            match group.waiter {
                Some(waiter) => {
                    let _ = waiter.send(Ok(group.env));
                }
                // A restored group has no submitter anymore; delivery is the
                // outer return_url layer's business, the core lets go here.
                None => tracing::info!(group_id, "restored group finished without waiter"),
            }
        }
    }

    async fn requeue(&self, task_id: &str) {
        let exhausted = {
            let mut guard = lock(&self.state);
            let st = &mut *guard;
            let Some(entry) = st.tasks.get_mut(task_id) else {
                return;
            };
            let group_id = entry.group_id.clone();
            let Some(group) = st.groups.get_mut(&group_id) else {
                return;
            };
            group.retry_cnt += 1;
            if group.retry_cnt > self.cfg.retry_limit {
                Some(group_id)
            } else {
                group.dirty = true;
                entry.state = TaskState::Queued;
                let job = QueuedJob {
                    task_id: task_id.to_string(),
                    group_id: group_id.clone(),
                    class: ExecClass::of_job_type(entry.env.job_type().unwrap_or_default()),
                    required_ram_mb: required_ram_mb_for_job(&entry.env),
                    priority: group.env.priority(),
                };
                tracing::warn!(
                    task_id,
                    group_id,
                    retry_cnt = group.retry_cnt,
                    "requeueing job after worker loss"
                );
                lock(&self.sched).enqueue(job);
                None
            }
        };
        if let Some(group_id) = exhausted {
            self.fail_group(&group_id, TaskError::RetriesExhausted(group_id.clone()))
                .await;
        }
    }

    async fn fail_group_of(&self, task_id: &str, err: TaskError) {
        let group_id = {
            let st = lock(&self.state);
            st.tasks.get(task_id).map(|t| t.group_id.clone())
        };
        if let Some(group_id) = group_id {
            self.fail_group(&group_id, err).await;
        }
    }

    /// Terminal failure of a group: cancel its queued jobs, delete the
    /// record, report the error to the submitter. Running sibling jobs are
    /// dropped when their results arrive.
    async fn fail_group(&self, group_id: &str, err: TaskError) {
        let group = {
            let mut st = lock(&self.state);
            let Some(group) = st.groups.remove(group_id) else {
                return;
            };
            st.tasks.retain(|_, t| t.group_id != group_id);
            lock(&self.sched).remove_group(group_id);
            group
        };
        if let Err(e) = self.store.delete(group_id).await {
            tracing::error!(group_id, error = %e, "failed to delete record of failed group");
        }
        tracing::warn!(group_id, error = %err, "task group failed");
        if let Some(waiter) = group.waiter {
            let _ = waiter.send(Err(err));
        }
    }

    async fn flush_dirty(&self) {
        let records: Vec<GroupRecord> = {
            let mut st = lock(&self.state);
            st.groups
                .iter_mut()
                .filter(|(_, g)| g.dirty)
                .map(|(id, g)| {
                    g.dirty = false;
                    GroupRecord {
                        id: id.clone(),
                        status: GroupStatus::ToJudge,
                        timestamp: g.timestamp,
                        retry_cnt: g.retry_cnt,
                        env: g.env.clone(),
                    }
                })
                .collect()
        };
        for record in records {
            if let Err(e) = self.store.put(&record).await {
                tracing::error!(group_id = %record.id, error = %e, "periodic sync failed");
            }
        }
    }
}

async fn event_loop(inner: Arc<Inner>, mut events_rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events_rx.recv().await {
        match event {
            Event::Poke => {}
            Event::JobFinished { task_id, outcome } => {
                inner.handle_job_finished(task_id, outcome).await;
            }
            Event::Flush => inner.flush_dirty().await,
        }
        inner.dispatch_round();
    }
}
