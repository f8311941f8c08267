//! Subagent Scheduler (§4.5): a bounded-parallelism executor for
//! delegated sub-turns, persisted so in-flight jobs survive a restart.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::storage::atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentJob {
    pub job_id: String,
    pub session_id: String,
    pub sub_session_id: String,
    pub status: JobStatus,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recovered: bool,
}

impl SubagentJob {
    fn new(job_id: String, session_id: String, input: Value, provider_id: Option<String>, timeout_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            sub_session_id: format!("{session_id}:subagent:{job_id}"),
            job_id,
            session_id,
            status: JobStatus::Queued,
            input,
            provider_id,
            timeout_ms,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            recovered: false,
        }
    }
}

/// The host hook a gateway wires in to actually run a delegated turn — the
/// scheduler itself only owns admission, timeout, and persistence.
#[async_trait]
pub trait DelegatedTurnRunner: Send + Sync {
    async fn run_delegated_turn(
        &self,
        job_id: &str,
        session_id: &str,
        sub_session_id: &str,
        input: &Value,
        provider_id: Option<&str>,
        cancel: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<Value, String>;
}

fn encode_job_id(job_id: &str) -> String {
    urlencoding::encode(job_id).into_owned()
}

/// Bounded executor for subagent jobs, persisted under
/// `<workspace>/.drost/subagents/{jobs,logs}/`.
pub struct SubagentScheduler {
    jobs_dir: PathBuf,
    logs_dir: PathBuf,
    max_parallel_jobs: usize,
    semaphore: Arc<Semaphore>,
    jobs: Mutex<HashMap<String, SubagentJob>>,
    queue: Mutex<VecDeque<String>>,
    cancel_senders: Mutex<HashMap<String, tokio::sync::oneshot::Sender<()>>>,
}

impl SubagentScheduler {
    /// `max_parallel_jobs` is clamped to 1 when the caller's lock mode is
    /// `workspace` or `exclusive` — the caller passes the already-clamped
    /// value in per §4.5.
    pub fn new(workspace_subagents_dir: PathBuf, max_parallel_jobs: usize) -> Self {
        let effective = max_parallel_jobs.max(1);
        Self {
            jobs_dir: workspace_subagents_dir.join("jobs"),
            logs_dir: workspace_subagents_dir.join("logs"),
            max_parallel_jobs: effective,
            semaphore: Arc::new(Semaphore::new(effective)),
            jobs: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            cancel_senders: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ensure_dirs(&self) -> Result<(), GatewayError> {
        tokio::fs::create_dir_all(&self.jobs_dir)
            .await
            .map_err(|e| GatewayError::Io(e.to_string()))?;
        tokio::fs::create_dir_all(&self.logs_dir)
            .await
            .map_err(|e| GatewayError::Io(e.to_string()))?;
        Ok(())
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}.json", encode_job_id(job_id)))
    }

    fn log_path(&self, job_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{}.jsonl", encode_job_id(job_id)))
    }

    async fn persist(&self, job: &SubagentJob) -> Result<(), GatewayError> {
        let path = self.job_path(&job.job_id);
        let contents = serde_json::to_vec_pretty(job).map_err(|e| GatewayError::Io(e.to_string()))?;
        atomic::write(&path, &contents).await.map_err(|e| GatewayError::Io(e.to_string()))
    }

    async fn append_log(&self, job_id: &str, line: &Value) {
        let path = self.log_path(job_id);
        let mut bytes = match serde_json::to_vec(line) {
            Ok(b) => b,
            Err(_) => return,
        };
        bytes.push(b'\n');
        if let Err(err) = atomic::append(&path, &bytes).await {
            warn!(job_id, error = %err, "failed to append subagent job log");
        }
    }

    /// Submit a new job; persists it `queued` and appends it to the queue.
    pub async fn submit(
        &self,
        session_id: &str,
        input: Value,
        provider_id: Option<String>,
        timeout_ms: u64,
    ) -> Result<SubagentJob, GatewayError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let job = SubagentJob::new(job_id.clone(), session_id.to_string(), input, provider_id, timeout_ms);
        self.persist(&job).await?;
        self.jobs.lock().await.insert(job_id.clone(), job.clone());
        self.queue.lock().await.push_back(job_id);
        Ok(job)
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), GatewayError> {
        let mut senders = self.cancel_senders.lock().await;
        if let Some(sender) = senders.remove(job_id) {
            let _ = sender.send(());
            Ok(())
        } else {
            Err(GatewayError::NotFound(format!("subagent job {job_id} is not running")))
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<SubagentJob> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn list(&self, session_id: Option<&str>, limit: usize) -> Vec<SubagentJob> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<SubagentJob> = jobs
            .values()
            .filter(|j| session_id.map_or(true, |sid| j.session_id == sid))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(1));
        out
    }

    /// Tail-limited read of a job's log file.
    pub async fn tail_logs(&self, job_id: &str, limit: usize) -> Result<Vec<Value>, GatewayError> {
        let path = self.log_path(job_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(GatewayError::Io(err.to_string())),
        };
        let lines: Vec<Value> = contents
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let start = lines.len().saturating_sub(limit.max(1));
        Ok(lines[start..].to_vec())
    }

    /// Drain the queue, running up to `max_parallel_jobs` jobs concurrently
    /// against `runner`. Returns once the queue snapshot at call time has
    /// fully drained; callers loop this as new submissions arrive.
    pub async fn drain(self: &Arc<Self>, runner: Arc<dyn DelegatedTurnRunner>) {
        loop {
            let job_id = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            };
            let Some(job_id) = job_id else { break };

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            let scheduler = self.clone();
            let runner = runner.clone();
            tokio::spawn(async move {
                scheduler.run_one(&job_id, runner).await;
                drop(permit);
            });
        }
    }

    async fn run_one(self: &Arc<Self>, job_id: &str, runner: Arc<dyn DelegatedTurnRunner>) {
        let Some(mut job) = self.jobs.lock().await.get(job_id).cloned() else {
            return;
        };
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.updated_at = Utc::now();
        self.jobs.lock().await.insert(job_id.to_string(), job.clone());
        if let Err(err) = self.persist(&job).await {
            warn!(job_id, error = %err, "failed to persist subagent job transition to running");
        }
        self.append_log(job_id, &serde_json::json!({"event": "started", "at": job.started_at})).await;

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        self.cancel_senders.lock().await.insert(job_id.to_string(), cancel_tx);

        let timeout = std::time::Duration::from_millis(job.timeout_ms);
        let fut = runner.run_delegated_turn(
            &job.job_id,
            &job.session_id,
            &job.sub_session_id,
            &job.input,
            job.provider_id.as_deref(),
            cancel_rx,
        );

        let outcome = tokio::time::timeout(timeout, fut).await;
        self.cancel_senders.lock().await.remove(job_id);

        job.finished_at = Some(Utc::now());
        job.updated_at = Utc::now();
        match outcome {
            Err(_elapsed) => {
                job.status = JobStatus::TimedOut;
                job.error = Some("timeout_triggered".to_string());
            }
            Ok(Err(message)) if message == "cancelled" => {
                job.status = JobStatus::Cancelled;
            }
            Ok(Err(message)) => {
                job.status = JobStatus::Failed;
                job.error = Some(format!("execution_error: {message}"));
            }
            Ok(Ok(result)) => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
            }
        }
        self.append_log(job_id, &serde_json::json!({"event": "finished", "status": job.status})).await;
        self.jobs.lock().await.insert(job_id.to_string(), job.clone());
        if let Err(err) = self.persist(&job).await {
            warn!(job_id, error = %err, "failed to persist subagent job completion");
        }
    }

    /// On startup, any job persisted as `queued` or `running` is
    /// re-admitted as `queued` with `recovered=true`.
    pub async fn recover(&self) -> Result<usize, GatewayError> {
        self.ensure_dirs().await?;
        let mut recovered = 0;
        let mut read_dir = tokio::fs::read_dir(&self.jobs_dir)
            .await
            .map_err(|e| GatewayError::Io(e.to_string()))?;
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| GatewayError::Io(e.to_string()))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(contents) = tokio::fs::read(&path).await else { continue };
            let Ok(mut job) = serde_json::from_slice::<SubagentJob>(&contents) else { continue };
            if matches!(job.status, JobStatus::Queued | JobStatus::Running) {
                job.status = JobStatus::Queued;
                job.recovered = true;
                job.updated_at = Utc::now();
                self.persist(&job).await?;
                self.queue.lock().await.push_back(job.job_id.clone());
                self.jobs.lock().await.insert(job.job_id.clone(), job);
                recovered += 1;
            } else {
                self.jobs.lock().await.insert(job.job_id.clone(), job);
            }
        }
        if recovered > 0 {
            info!(recovered, "re-admitted interrupted subagent jobs as queued");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct EchoRunner;
    #[async_trait]
    impl DelegatedTurnRunner for EchoRunner {
        async fn run_delegated_turn(
            &self,
            _job_id: &str,
            _session_id: &str,
            _sub_session_id: &str,
            input: &Value,
            _provider_id: Option<&str>,
            _cancel: tokio::sync::oneshot::Receiver<()>,
        ) -> Result<Value, String> {
            Ok(input.clone())
        }
    }

    struct HangingRunner;
    #[async_trait]
    impl DelegatedTurnRunner for HangingRunner {
        async fn run_delegated_turn(
            &self,
            _job_id: &str,
            _session_id: &str,
            _sub_session_id: &str,
            _input: &Value,
            _provider_id: Option<&str>,
            _cancel: tokio::sync::oneshot::Receiver<()>,
        ) -> Result<Value, String> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn submitted_job_completes_and_persists_result() {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(SubagentScheduler::new(dir.path().to_path_buf(), 2));
        scheduler.ensure_dirs().await.unwrap();
        let job = scheduler
            .submit("s1", serde_json::json!({"q": "hi"}), None, 5_000)
            .await
            .unwrap();

        scheduler.drain(Arc::new(EchoRunner)).await;
        tokio::task::yield_now().await;

        let updated = scheduler.get(&job.job_id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        assert_eq!(updated.result.unwrap()["q"], "hi");
    }

    #[tokio::test]
    async fn job_exceeding_timeout_is_marked_timed_out() {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(SubagentScheduler::new(dir.path().to_path_buf(), 1));
        scheduler.ensure_dirs().await.unwrap();
        let job = scheduler.submit("s1", Value::Null, None, 20).await.unwrap();
        scheduler.drain(Arc::new(HangingRunner)).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let updated = scheduler.get(&job.job_id).await.unwrap();
        assert_eq!(updated.status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn recover_re_admits_queued_and_running_jobs() {
        let dir = TempDir::new().unwrap();
        let scheduler = SubagentScheduler::new(dir.path().to_path_buf(), 2);
        scheduler.ensure_dirs().await.unwrap();
        let mut job = SubagentJob::new("job-1".to_string(), "s1".to_string(), Value::Null, None, 1_000);
        job.status = JobStatus::Running;
        scheduler.persist(&job).await.unwrap();

        let recovered = scheduler.recover().await.unwrap();
        assert_eq!(recovered, 1);
        let reloaded = scheduler.get("job-1").await.unwrap();
        assert_eq!(reloaded.status, JobStatus::Queued);
        assert!(reloaded.recovered);
    }
}
