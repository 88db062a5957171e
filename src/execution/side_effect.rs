//! Side-effect capability: the one place a task touches the outside world.
//!
//! Adapters receive a task snapshot and a read-only view of the project and
//! return evidence or an error. They never mutate project state; the
//! coordinator applies their receipts.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::core::project::Project;
use crate::core::task::{Evidence, Task, TaskId};
use crate::{klog_debug, Error, Result};

/// What an adapter hands back for a task it carried out.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskReceipt {
    pub evidence: Vec<Evidence>,
    /// Who did the work, if anyone was hired.
    pub worker: Option<String>,
}

#[async_trait]
pub trait SideEffect: Send + Sync {
    async fn perform(&self, task: Task, context: Arc<Project>) -> Result<TaskReceipt>;

    fn name(&self) -> &str;
}

/// Does nothing and says so.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSideEffect;

#[async_trait]
impl SideEffect for NoopSideEffect {
    async fn perform(&self, task: Task, _context: Arc<Project>) -> Result<TaskReceipt> {
        Ok(TaskReceipt {
            evidence: vec![Evidence::new(
                "noop",
                task.id.as_str(),
                "no side effect performed",
            )],
            worker: None,
        })
    }

    fn name(&self) -> &str {
        "noop"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Posted,
    Hired,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub worker: String,
    pub amount: f64,
}

/// A job posted to the mock marketplace.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub task_id: TaskId,
    pub status: JobStatus,
    pub bids: Vec<Bid>,
    pub hired: Option<Bid>,
}

/// Price multipliers of the three standing crews, applied to the task's
/// estimated cost.
const CREW_RATES: [(&str, f64); 3] = [("crew-a", 1.1), ("crew-b", 0.9), ("crew-c", 1.0)];

/// In-memory labor marketplace.
///
/// Each task becomes a job: post it, collect one bid per crew, hire the
/// lowest bidder, mark it done. The job store belongs to this instance, so
/// two runs with two marketplaces never see each other's jobs.
#[derive(Default)]
pub struct MockMarketplace {
    jobs: AsyncMutex<HashMap<String, Job>>,
    failing: HashSet<TaskId>,
    delay: Option<Duration>,
    task_delays: HashMap<TaskId, Duration>,
    invocations: Mutex<Vec<TaskId>>,
}

impl MockMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs for these tasks receive no bids and fail.
    pub fn with_failures(mut self, ids: &[&str]) -> Self {
        self.failing.extend(ids.iter().map(|id| TaskId::from(*id)));
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep this long for one task, overriding `with_delay`.
    pub fn with_task_delay(mut self, id: &str, delay: Duration) -> Self {
        self.task_delays.insert(TaskId::from(id), delay);
        self
    }

    /// Task ids in the order `perform` was called.
    pub fn invocations(&self) -> Vec<TaskId> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        jobs
    }

    async fn post_job(&self, task: &Task) -> String {
        let id = format!("job-{}", Uuid::new_v4());
        let job = Job {
            id: id.clone(),
            task_id: task.id.clone(),
            status: JobStatus::Posted,
            bids: Vec::new(),
            hired: None,
        };
        self.jobs.lock().await.insert(id.clone(), job);
        klog_debug!("marketplace: posted {} for task {}", id, task.id);
        id
    }

    fn bids_for(&self, task: &Task) -> Vec<Bid> {
        if self.failing.contains(&task.id) {
            return Vec::new();
        }
        let trade = task.skills.first().map(String::as_str).unwrap_or("general");
        CREW_RATES
            .iter()
            .map(|(crew, rate)| Bid {
                worker: format!("{}-{}", trade, crew),
                amount: task.estimated_cost * rate,
            })
            .collect()
    }

    async fn hire(&self, job_id: &str, bids: Vec<Bid>) -> Result<Bid> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::SideEffect(format!("job {} vanished", job_id)))?;
        job.bids = bids;

        let lowest = job
            .bids
            .iter()
            .min_by(|a, b| a.amount.total_cmp(&b.amount))
            .cloned();
        match lowest {
            Some(bid) => {
                job.status = JobStatus::Hired;
                job.hired = Some(bid.clone());
                Ok(bid)
            }
            None => {
                job.status = JobStatus::Failed;
                Err(Error::SideEffect(format!(
                    "no bids received for task {}",
                    job.task_id
                )))
            }
        }
    }

    async fn mark_done(&self, job_id: &str) {
        if let Some(job) = self.jobs.lock().await.get_mut(job_id) {
            job.status = JobStatus::Done;
        }
    }
}

#[async_trait]
impl SideEffect for MockMarketplace {
    async fn perform(&self, task: Task, _context: Arc<Project>) -> Result<TaskReceipt> {
        if let Ok(mut calls) = self.invocations.lock() {
            calls.push(task.id.clone());
        }

        let job_id = self.post_job(&task).await;
        let hired = self.hire(&job_id, self.bids_for(&task)).await?;
        klog_debug!(
            "marketplace: {} hired {} at {:.2}",
            job_id,
            hired.worker,
            hired.amount
        );

        if let Some(delay) = self.task_delays.get(&task.id).copied().or(self.delay) {
            tokio::time::sleep(delay).await;
        }
        self.mark_done(&job_id).await;

        Ok(TaskReceipt {
            evidence: vec![Evidence::new(
                "marketplace_job",
                &job_id,
                &format!("{} completed by {} for {:.2}", task.name, hired.worker, hired.amount),
            )],
            worker: Some(hired.worker),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
