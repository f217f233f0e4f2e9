use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Run the first activity of an instance started asynchronously.
    AsyncStart,
}

/// "Continue this execution later", handed to the scheduler after commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContinuationJob {
    pub job_id: String,
    pub kind: JobKind,
    pub process_instance_id: ProcessInstanceId,
    pub execution_id: ExecutionId,
    pub created_at: DateTime<Utc>,
}

impl ContinuationJob {
    pub fn async_start(process_instance_id: &str) -> Self {
        Self {
            job_id: new_id(),
            kind: JobKind::AsyncStart,
            process_instance_id: process_instance_id.to_string(),
            execution_id: process_instance_id.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Accepts continuation jobs and later runs them through
/// `RuntimeService::execute_job`.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule(&self, job: ContinuationJob) -> Result<()>;
}

/// FIFO queue that only collects jobs. Tests drain it and execute the
/// jobs themselves.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<VecDeque<ContinuationJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_all(&self) -> Result<Vec<ContinuationJob>> {
        let mut jobs = self.jobs.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(jobs.drain(..).collect())
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobScheduler for MemoryJobQueue {
    async fn schedule(&self, job: ContinuationJob) -> Result<()> {
        let mut jobs = self.jobs.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        jobs.push_back(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_drains_in_order() {
        let queue = MemoryJobQueue::new();
        queue.schedule(ContinuationJob::async_start("a")).await.unwrap();
        queue.schedule(ContinuationJob::async_start("b")).await.unwrap();
        assert_eq!(queue.len(), 2);

        let jobs = queue.take_all().unwrap();
        assert_eq!(
            jobs.iter().map(|j| j.process_instance_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(queue.is_empty());
    }
}
