use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobgate::{ExecutionOutcome, Job, JobExecutor, JobId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// What [`MockExecutor`] does with each job it receives.
#[derive(Clone, Debug)]
pub enum ExecutorBehavior {
    Succeed(Option<serde_json::Value>),
    Fail(String),
    /// Block until the job's token fires, then report `Cancelled`.
    WaitForCancel,
    /// Sleep, then succeed; returns `Cancelled` early if the token fires.
    Sleep(Duration),
}

#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    pub attempt: u32,
    pub job_type: String,
}

#[derive(Clone, Debug)]
pub struct MockExecutor {
    executions: Arc<Mutex<Vec<ExecutionRecord>>>,
    cancelled: Arc<Mutex<Vec<JobId>>>,
    behavior: Arc<Mutex<ExecutorBehavior>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::with_behavior(ExecutorBehavior::Succeed(None))
    }

    pub fn with_behavior(behavior: ExecutorBehavior) -> Self {
        Self {
            executions: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
            behavior: Arc::new(Mutex::new(behavior)),
        }
    }

    pub fn set_behavior(&self, behavior: ExecutorBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn record(&self) -> Vec<ExecutionRecord> {
        self.executions.lock().clone()
    }

    /// Jobs whose token fired while they were executing.
    pub fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().clone()
    }

    pub fn assert_execution_count_eq(&self, expected: usize) {
        let actual = self.executions.lock().len();
        assert_eq!(actual, expected, "Expected {expected} executions, got {actual}");
    }

    /// Polls until `count` executions have started or `timeout` elapses.
    pub async fn wait_for_executions(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.executions.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.executions.lock().len() >= count
    }

    fn observe_cancel(&self, job_id: JobId) -> ExecutionOutcome {
        self.cancelled.lock().push(job_id);
        ExecutionOutcome::Cancelled
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobExecutor for MockExecutor {
    async fn execute(&self, job: &Job, cancel: CancellationToken) -> ExecutionOutcome {
        self.executions.lock().push(ExecutionRecord {
            job_id: job.id,
            attempt: job.attempts,
            job_type: job.job_type.to_string(),
        });

        let behavior = self.behavior.lock().clone();
        match behavior {
            ExecutorBehavior::Succeed(output) => ExecutionOutcome::Succeeded { output },
            ExecutorBehavior::Fail(error) => ExecutionOutcome::Failed { error },
            ExecutorBehavior::WaitForCancel => {
                cancel.cancelled().await;
                self.observe_cancel(job.id)
            }
            ExecutorBehavior::Sleep(duration) => {
                tokio::select! {
                    _ = cancel.cancelled() => self.observe_cancel(job.id),
                    _ = tokio::time::sleep(duration) => ExecutionOutcome::Succeeded { output: None },
                }
            }
        }
    }
}
