//! Submitting tasks to the queue engine and waiting for their results.

use crate::config::{DEFAULT_RESULT_POLL_INTERVAL, DEFAULT_RESULT_TIMEOUT, HarnessConfig};
use crate::error::{DispatchError, QueueError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Opaque identifier the queue engine assigns to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final state of a job, as reported by the queue engine.
///
/// Serialized as the plain status string. Statuses the harness has no variant for, e.g. `retry`
/// or `interrupt`, are kept verbatim in [JobStatus::Other].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Success,
    Failed,
    Cancelled,
    Other(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Other(status) => status,
        }
    }
}

impl From<String> for JobStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "success" => JobStatus::Success,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Other(status),
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Other(status) => status,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The observed outcome of a finished job.
///
/// A job that failed inside the worker is still a `JobResult`. The harness does not interpret
/// job outcomes, see [JobResult::status].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    /// The value returned by the task, or error details for failed jobs.
    pub value: Value,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// One unit of work to submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Identifies the task implementation, e.g. `tests.tasks.general.Add`.
    pub path: String,
    pub params: Value,
    /// Queue to pin the task to. The engine's default queue otherwise.
    pub queue: Option<String>,
}

/// Client side of the queue engine.
///
/// Implementations only submit and observe. They must never consume queues themselves, that is
/// the worker's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues `task` and returns the id the engine assigned to it.
    async fn submit(&self, task: &TaskRequest) -> Result<JobId, QueueError>;

    /// Returns the result of `job_id` if the job finished, `None` while it is pending or running.
    async fn fetch_result(&self, job_id: &JobId) -> Result<Option<JobResult>, QueueError>;
}

/// How [TaskDispatcher::send] submits tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    /// Wait for all results before returning.
    ///
    /// default: true
    pub block: bool,

    /// Queue to pin all tasks to.
    ///
    /// default: None
    pub queue: Option<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            block: true,
            queue: None,
        }
    }
}

impl SendOptions {
    /// Return job ids right after submission.
    pub fn non_blocking() -> Self {
        Self {
            block: false,
            ..Self::default()
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

/// What [TaskDispatcher::send] returned, depending on [SendOptions::block].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Job ids in submission order. Nothing was awaited.
    Enqueued(Vec<JobId>),

    /// Results in submission order.
    Completed(Vec<JobResult>),
}

impl SendOutcome {
    pub fn job_ids(&self) -> Vec<JobId> {
        match self {
            SendOutcome::Enqueued(job_ids) => job_ids.clone(),
            SendOutcome::Completed(results) => results.iter().map(|r| r.job_id.clone()).collect(),
        }
    }

    /// The results, or `None` if the tasks were sent without blocking.
    pub fn into_results(self) -> Option<Vec<JobResult>> {
        match self {
            SendOutcome::Enqueued(_) => None,
            SendOutcome::Completed(results) => Some(results),
        }
    }

    /// The outcome of the first task, if any was sent.
    pub fn into_single(self) -> Option<SingleSendOutcome> {
        match self {
            SendOutcome::Enqueued(job_ids) => {
                job_ids.into_iter().next().map(SingleSendOutcome::Enqueued)
            }
            SendOutcome::Completed(results) => {
                results.into_iter().next().map(SingleSendOutcome::Completed)
            }
        }
    }
}

/// [SendOutcome] of a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleSendOutcome {
    Enqueued(JobId),
    Completed(JobResult),
}

impl SingleSendOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            SingleSendOutcome::Enqueued(job_id) => job_id,
            SingleSendOutcome::Completed(result) => &result.job_id,
        }
    }

    pub fn into_result(self) -> Option<JobResult> {
        match self {
            SingleSendOutcome::Enqueued(_) => None,
            SingleSendOutcome::Completed(result) => Some(result),
        }
    }
}

/// Submits tasks through a [TaskQueue] and polls for their results.
#[derive(Debug)]
pub struct TaskDispatcher<Q> {
    queue: Q,
    poll_interval: Duration,
    result_timeout: Option<Duration>,
}

impl<Q: TaskQueue> TaskDispatcher<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            poll_interval: DEFAULT_RESULT_POLL_INTERVAL,
            result_timeout: Some(DEFAULT_RESULT_TIMEOUT),
        }
    }

    /// Takes poll interval and result timeout from `config`.
    pub fn with_config(queue: Q, config: &HarnessConfig) -> Self {
        Self::new(queue)
            .poll_interval(config.result_poll_interval)
            .result_timeout(config.result_timeout)
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bounds the wait for each individual result. `None` waits forever.
    pub fn result_timeout(mut self, result_timeout: Option<Duration>) -> Self {
        self.result_timeout = result_timeout;
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Submits a single `path` task and returns the id the engine assigned to it.
    pub async fn submit_one(
        &self,
        path: &str,
        params: &Value,
        queue: Option<&str>,
    ) -> Result<JobId, DispatchError> {
        let request = TaskRequest {
            path: path.to_owned(),
            params: params.clone(),
            queue: queue.map(str::to_owned),
        };
        let job_id = self.queue.submit(&request).await?;
        tracing::debug!(%job_id, path, queue, "Submitted task");
        Ok(job_id)
    }

    /// Submits one task per entry of `params_list` and returns their ids in the same order.
    pub async fn submit(
        &self,
        path: &str,
        params_list: &[Value],
        queue: Option<&str>,
    ) -> Result<Vec<JobId>, DispatchError> {
        let mut job_ids = Vec::with_capacity(params_list.len());
        for params in params_list {
            job_ids.push(self.submit_one(path, params, queue).await?);
        }
        Ok(job_ids)
    }

    /// Polls until the result of `job_id` is available.
    pub async fn wait_for_result(&self, job_id: &JobId) -> Result<JobResult, DispatchError> {
        let deadline = self.result_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(result) = self.queue.fetch_result(job_id).await? {
                tracing::debug!(%job_id, status = ?result.status, "Job finished");
                return Ok(result);
            }
            if let (Some(deadline), Some(timeout)) = (deadline, self.result_timeout) {
                if Instant::now() >= deadline {
                    return Err(DispatchError::ResultTimeout {
                        job_id: job_id.to_string(),
                        timeout,
                    });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Waits for all `job_ids`. Results keep the order of `job_ids`, whatever order the jobs
    /// finish in.
    pub async fn wait_for_results(&self, job_ids: &[JobId]) -> Result<Vec<JobResult>, DispatchError> {
        let mut results = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            results.push(self.wait_for_result(job_id).await?);
        }
        Ok(results)
    }

    /// Submits one task per entry of `params_list`, then waits for the results if
    /// `options.block` is set.
    pub async fn send(
        &self,
        path: &str,
        params_list: &[Value],
        options: &SendOptions,
    ) -> Result<SendOutcome, DispatchError> {
        let job_ids = self
            .submit(path, params_list, options.queue.as_deref())
            .await?;
        if !options.block {
            return Ok(SendOutcome::Enqueued(job_ids));
        }
        let results = self.wait_for_results(&job_ids).await?;
        Ok(SendOutcome::Completed(results))
    }

    /// [TaskDispatcher::send] for a single task.
    pub async fn send_one(
        &self,
        path: &str,
        params: &Value,
        options: &SendOptions,
    ) -> Result<SingleSendOutcome, DispatchError> {
        let job_id = self
            .submit_one(path, params, options.queue.as_deref())
            .await?;
        if !options.block {
            return Ok(SingleSendOutcome::Enqueued(job_id));
        }
        let result = self.wait_for_result(&job_id).await?;
        Ok(SingleSendOutcome::Completed(result))
    }
}
