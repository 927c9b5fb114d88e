//! Job / task group envs
//!
//! An env is an open `string -> JSON value` mapping. Only the well-known
//! keys are read with types; everything else passes through to the worker
//! verbatim. The `*_mem_limit` values are KiB; [`required_ram_mb_for_job`]
//! returns MiB (integer division).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Execution class of a job. Real CPU and virtual CPU are mutually
/// exclusive on the same worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecClass {
    /// `cpu-exec`. Latency-sensitive, owns the worker's CPU.
    RealCpu,
    /// `vcpu-exec` / `sio2jail-exec`. Runs under a measured jail.
    VirtualCpu,
    /// Everything else (compile / ingen / inwer / ping / exec /
    /// unsafe-exec / ...). Runnable on any worker.
    Other,
}

impl ExecClass {
    pub fn of_job_type(job_type: &str) -> ExecClass {
        match job_type {
            "cpu-exec" => ExecClass::RealCpu,
            "vcpu-exec" | "sio2jail-exec" => ExecClass::VirtualCpu,
            _ => ExecClass::Other,
        }
    }

    /// Whether at most one job of this class may run on a worker at a time.
    pub fn is_exclusive(self) -> bool {
        !matches!(self, ExecClass::Other)
    }
}

/// The env of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct JobEnv(Map<String, Value>);

impl JobEnv {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn task_id(&self) -> Option<&str> {
        self.0.get("task_id").and_then(Value::as_str)
    }

    pub fn group_id(&self) -> Option<&str> {
        self.0.get("group_id").and_then(Value::as_str)
    }

    pub fn job_type(&self) -> Option<&str> {
        self.0.get("job_type").and_then(Value::as_str)
    }

    /// Read a mem-limit key given in KiB. Non-numeric values are ignored.
    pub fn mem_limit_kib(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// Loose truthiness for env values. Absent / null / 0 / empty string /
    /// empty collection are false.
    pub fn truthy(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }

    /// Normalization on accept and restore. Inserts `contest_uid` as
    /// `[null, null]` when absent.
    pub fn ensure_contest_uid(&mut self) {
        if !self.0.contains_key("contest_uid") {
            self.0
                .insert("contest_uid".to_string(), json!([null, null]));
        }
    }

    /// Merge the env returned by a worker into this one (worker side wins).
    pub fn merge_from(&mut self, other: &JobEnv) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

/// The env of a whole task group. `workers_jobs` maps task_id -> job env.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct GroupEnv(Map<String, Value>);

impl GroupEnv {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn group_id(&self) -> Option<&str> {
        self.0.get("group_id").and_then(Value::as_str)
    }

    /// Group priority. Breaks FIFO order; larger runs first.
    pub fn priority(&self) -> i64 {
        self.0.get("priority").and_then(Value::as_i64).unwrap_or(0)
    }

    /// Extract `workers_jobs` as task_id -> [`JobEnv`]. Absent or
    /// wrongly-typed entries yield `None`.
    pub fn workers_jobs(&self) -> Option<BTreeMap<String, JobEnv>> {
        let jobs = self.0.get("workers_jobs")?.as_object()?;
        let mut out = BTreeMap::new();
        for (task_id, job) in jobs {
            out.insert(
                task_id.clone(),
                JobEnv::from_map(job.as_object()?.clone()),
            );
        }
        Some(out)
    }

    /// Rewrite `workers_jobs[task_id]`. Used both for normalization and for
    /// writing results back.
    pub fn set_job_env(&mut self, task_id: &str, job: &JobEnv) {
        if let Some(jobs) = self
            .0
            .get_mut("workers_jobs")
            .and_then(Value::as_object_mut)
        {
            jobs.insert(task_id.to_string(), Value::Object(job.as_map().clone()));
        }
    }

    /// Attach a terminal error. The submitter receives the env in this form.
    pub fn set_error(&mut self, kind: &str, message: &str) {
        self.0.insert(
            "error".to_string(),
            json!({ "kind": kind, "message": message }),
        );
    }

    pub fn has_error(&self) -> bool {
        self.0.contains_key("error")
    }
}

/// Estimate the RAM a job needs, in MiB.
///
/// `*_mem_limit` values are given in KiB and clamped to a per-class floor:
/// 64 for exec-style jobs (256 with a checker), 512 for compile, 256 for
/// everything else.
pub fn required_ram_mb_for_job(env: &JobEnv) -> u64 {
    let job_type = env.job_type().unwrap_or_default();
    match job_type {
        "cpu-exec" | "exec" | "unsafe-exec" | "vcpu-exec" | "sio2jail-exec" => {
            let base = (env.mem_limit_kib("exec_mem_limit").unwrap_or(0) / 1024).max(64);
            if env.truthy("check_output") {
                base.max(env.mem_limit_kib("checker_mem_limit").unwrap_or(0) / 1024)
                    .max(256)
            } else {
                base
            }
        }
        "ingen" => (env.mem_limit_kib("ingen_mem_limit").unwrap_or(0) / 1024).max(256),
        "inwer" => (env.mem_limit_kib("inwer_mem_limit").unwrap_or(0) / 1024).max(256),
        "compile" => (env.mem_limit_kib("compile_mem_limit").unwrap_or(0) / 1024).max(512),
        other => {
            let key = format!("{other}_mem_limit");
            (env.mem_limit_kib(&key).unwrap_or(0) / 1024).max(256)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(pairs: &[(&str, Value)]) -> JobEnv {
        let mut env = JobEnv::new();
        for (k, v) in pairs {
            env.set(k, v.clone());
        }
        env
    }

    #[test]
    fn test_required_ram_exec() {
        let mut env = job(&[("task_id", json!("asdf")), ("job_type", json!("cpu-exec"))]);
        assert_eq!(required_ram_mb_for_job(&env), 64);
        env.set("exec_mem_limit", json!(768 * 1024));
        assert_eq!(required_ram_mb_for_job(&env), 768);
    }

    #[test]
    fn test_required_ram_exec_with_checker() {
        let mut env = job(&[("task_id", json!("asdf")), ("job_type", json!("cpu-exec"))]);
        assert_eq!(required_ram_mb_for_job(&env), 64);
        env.set("check_output", json!(1));
        assert_eq!(required_ram_mb_for_job(&env), 256);
        env.set("exec_mem_limit", json!(768 * 1024));
        env.set("checker_mem_limit", json!(896 * 1024));
        assert_eq!(required_ram_mb_for_job(&env), 896);
    }

    #[test]
    fn test_required_ram_ingen() {
        let mut env = job(&[("task_id", json!("asdf")), ("job_type", json!("ingen"))]);
        assert_eq!(required_ram_mb_for_job(&env), 256);
        env.set("ingen_mem_limit", json!(768 * 1024));
        assert_eq!(required_ram_mb_for_job(&env), 768);
    }

    #[test]
    fn test_required_ram_inwer() {
        let mut env = job(&[("task_id", json!("asdf")), ("job_type", json!("inwer"))]);
        assert_eq!(required_ram_mb_for_job(&env), 256);
        env.set("inwer_mem_limit", json!(768 * 1024));
        assert_eq!(required_ram_mb_for_job(&env), 768);
    }

    #[test]
    fn test_required_ram_compile() {
        let mut env = job(&[("task_id", json!("asdf")), ("job_type", json!("compile"))]);
        assert_eq!(required_ram_mb_for_job(&env), 512);
        env.set("compile_mem_limit", json!(768 * 1024));
        assert_eq!(required_ram_mb_for_job(&env), 768);
    }

    #[test]
    fn test_required_ram_default() {
        let mut env = job(&[("task_id", json!("asdf")), ("job_type", json!("abc"))]);
        assert_eq!(required_ram_mb_for_job(&env), 256);
        env.set("abc_mem_limit", json!(768 * 1024));
        assert_eq!(required_ram_mb_for_job(&env), 768);
    }

    #[test]
    fn test_exec_class_partition() {
        assert_eq!(ExecClass::of_job_type("cpu-exec"), ExecClass::RealCpu);
        assert_eq!(ExecClass::of_job_type("vcpu-exec"), ExecClass::VirtualCpu);
        assert_eq!(ExecClass::of_job_type("sio2jail-exec"), ExecClass::VirtualCpu);
        // exec / unsafe-exec share the exec-style RAM rule but classify as other
        assert_eq!(ExecClass::of_job_type("exec"), ExecClass::Other);
        assert_eq!(ExecClass::of_job_type("unsafe-exec"), ExecClass::Other);
        assert_eq!(ExecClass::of_job_type("compile"), ExecClass::Other);
        assert_eq!(ExecClass::of_job_type("ping"), ExecClass::Other);
    }

    #[test]
    fn test_contest_uid_default() {
        let mut env = job(&[("task_id", json!("t"))]);
        env.ensure_contest_uid();
        assert_eq!(env.get("contest_uid"), Some(&json!([null, null])));
        // an existing value is left alone
        env.set("contest_uid", json!([1, 2]));
        env.ensure_contest_uid();
        assert_eq!(env.get("contest_uid"), Some(&json!([1, 2])));
    }

    #[test]
    fn test_group_env_roundtrip() {
        let group: GroupEnv = serde_json::from_value(json!({
            "group_id": "g",
            "priority": 5,
            "workers_jobs": {
                "t1": {"task_id": "t1", "group_id": "g", "job_type": "compile"}
            },
            "custom_key": {"nested": true}
        }))
        .unwrap();
        assert_eq!(group.group_id(), Some("g"));
        assert_eq!(group.priority(), 5);
        let jobs = group.workers_jobs().unwrap();
        assert_eq!(jobs["t1"].job_type(), Some("compile"));
        // pass-through keys survive
        assert_eq!(group.as_map()["custom_key"]["nested"], json!(true));
    }
}
