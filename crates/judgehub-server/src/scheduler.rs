//! Prioritizing scheduler
//!
//! A pure policy module holding three logical FIFOs, one per execution
//! class. Order is arrival order, broken only by the group priority (the
//! env's `priority` key, larger first). Decisions are made from worker
//! manager snapshots; the scheduler never dispatches anything itself.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::env::ExecClass;
use crate::manager::{WorkerSnapshot, WorkerStats};

/// One queued job.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub task_id: String,
    pub group_id: String,
    pub class: ExecClass,
    pub required_ram_mb: u64,
    pub priority: i64,
}

/// An assignment the scheduler decided on. Dispatch is done by the task
/// manager.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task_id: String,
    pub group_id: String,
    pub worker: String,
}

// (priority descending, arrival seq ascending), so the first BTreeMap entry
// is the next job to run
type QueueKey = (Reverse<i64>, u64);

#[derive(Default)]
pub struct PrioritizingScheduler {
    real_cpu: BTreeMap<QueueKey, QueuedJob>,
    virtual_cpu: BTreeMap<QueueKey, QueuedJob>,
    other: BTreeMap<QueueKey, QueuedJob>,
    next_seq: u64,
}

struct SimWorker {
    name: String,
    can_run_cpu_exec: bool,
    free_slots: u32,
    free_ram_mb: u64,
    exclusive: Option<ExecClass>,
}

impl PrioritizingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, class: ExecClass) -> &BTreeMap<QueueKey, QueuedJob> {
        match class {
            ExecClass::RealCpu => &self.real_cpu,
            ExecClass::VirtualCpu => &self.virtual_cpu,
            ExecClass::Other => &self.other,
        }
    }

    fn queue_mut(&mut self, class: ExecClass) -> &mut BTreeMap<QueueKey, QueuedJob> {
        match class {
            ExecClass::RealCpu => &mut self.real_cpu,
            ExecClass::VirtualCpu => &mut self.virtual_cpu,
            ExecClass::Other => &mut self.other,
        }
    }

    pub fn enqueue(&mut self, job: QueuedJob) {
        let key = (Reverse(job.priority), self.next_seq);
        self.next_seq += 1;
        self.queue_mut(job.class).insert(key, job);
    }

    /// Drop every queued job of a group (cancellation on terminal failure).
    pub fn remove_group(&mut self, group_id: &str) -> usize {
        let mut removed = 0;
        for class in [ExecClass::RealCpu, ExecClass::VirtualCpu, ExecClass::Other] {
            let q = self.queue_mut(class);
            let before = q.len();
            q.retain(|_, j| j.group_id != group_id);
            removed += before - q.len();
        }
        removed
    }

    /// Peek at the head of a class queue (highest priority, oldest).
    pub fn choose_task(&self, class: ExecClass) -> Option<&QueuedJob> {
        self.queue(class).first_key_value().map(|(_, j)| j)
    }

    /// The queued task_ids of a class, in execution order.
    pub fn queued_tasks(&self, class: ExecClass) -> Vec<String> {
        self.queue(class).values().map(|j| j.task_id.clone()).collect()
    }

    pub fn total_queued(&self) -> usize {
        self.real_cpu.len() + self.virtual_cpu.len() + self.other.len()
    }

    /// Whether the current fleet could ever run this job (huge-task check).
    ///
    /// Judged against the current maxima. The fleet is expected to be sized
    /// to the workload by its operators; a bigger worker appearing later is
    /// not accounted for.
    pub fn fleet_can_ever_run(stats: &WorkerStats, class: ExecClass, ram_mb: u64) -> bool {
        let max = match class {
            ExecClass::RealCpu => stats.max_any_cpu_worker_ram,
            ExecClass::VirtualCpu | ExecClass::Other => {
                match (stats.max_any_cpu_worker_ram, stats.max_vcpu_only_worker_ram) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                }
            }
        };
        max.is_some_and(|m| ram_mb <= m)
    }

    /// Decide one round of assignments.
    ///
    /// For each free slot of each worker, take from the head of a
    /// compatible queue the first job whose RAM fits. Reservations are
    /// simulated within the round, so an exclusive class never exceeds one
    /// per worker. A head job whose RAM does not fit is skipped, not
    /// blocking.
    pub fn schedule(&mut self, snapshots: &[WorkerSnapshot]) -> Vec<Assignment> {
        let mut sims: Vec<SimWorker> = snapshots
            .iter()
            .map(|s| SimWorker {
                name: s.name.clone(),
                can_run_cpu_exec: s.can_run_cpu_exec,
                free_slots: s.free_slots,
                free_ram_mb: s.free_ram_mb,
                exclusive: s.exclusive_running,
            })
            .collect();

        let mut out = Vec::new();
        for sim in sims.iter_mut() {
            while sim.free_slots > 0 {
                let Some(job) = self.pick_for(sim) else { break };
                sim.free_slots -= 1;
                sim.free_ram_mb -= job.required_ram_mb;
                if job.class.is_exclusive() {
                    sim.exclusive = Some(job.class);
                }
                out.push(Assignment {
                    task_id: job.task_id,
                    group_id: job.group_id,
                    worker: sim.name.clone(),
                });
            }
        }
        out
    }

    fn pick_for(&mut self, sim: &SimWorker) -> Option<QueuedJob> {
        const ANY_CPU: [ExecClass; 3] =
            [ExecClass::RealCpu, ExecClass::VirtualCpu, ExecClass::Other];
        const VCPU_ONLY: [ExecClass; 2] = [ExecClass::VirtualCpu, ExecClass::Other];
        let classes: &[ExecClass] = if sim.can_run_cpu_exec {
            &ANY_CPU
        } else {
            &VCPU_ONLY
        };
        for &class in classes {
            if class.is_exclusive() && sim.exclusive.is_some() {
                continue;
            }
            let q = self.queue_mut(class);
            let key = q
                .iter()
                .find(|(_, j)| j.required_ram_mb <= sim.free_ram_mb)
                .map(|(k, _)| *k);
            if let Some(key) = key {
                return q.remove(&key);
            }
        }
        None
    }
}
