//! Local job table consumed by the federation manager.
//!
//! The scheduler owns job records; the federation manager reads and mutates
//! them only through the [`JobStore`] capability. [`MemoryJobStore`] is a
//! complete in-process implementation used by tests and embedders that do
//! not have a scheduler of their own.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use snafu::OptionExt;

use crate::constants::MAX_LOCAL_JOB_ID;
use crate::error::JobExistsSnafu;
use crate::error::JobIdsExhaustedSnafu;
use crate::error::JobNotFoundSnafu;
use crate::error::Result;
use crate::types::ClusterId;
use crate::types::JobId;
use crate::types::JobState;

/// A job as submitted by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    pub name: String,
    pub user_id: u32,
    pub partition: Option<String>,
    /// Explicit cluster-name filter; `None` means every cluster.
    pub clusters: Option<Vec<String>>,
    /// Cluster feature constraint expression.
    pub cluster_features: Option<String>,
    /// Dependency expression (`afterok:123,...`).
    pub dependency: Option<String>,
    pub is_array: bool,
    pub time_limit_mins: Option<u32>,
    pub script: String,
}

/// Fields changed by an update request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub partition: Option<String>,
    pub time_limit_mins: Option<u32>,
    /// Set by the origin when a cross-cluster dependency resolves.
    pub dependency: Option<DependencyStatus>,
}

impl JobUpdate {
    pub fn apply_to(&self, record: &mut JobRecord) {
        if let Some(name) = &self.name {
            record.description.name = name.clone();
        }
        if let Some(partition) = &self.partition {
            record.description.partition = Some(partition.clone());
        }
        if let Some(limit) = self.time_limit_mins {
            record.description.time_limit_mins = Some(limit);
        }
        if let Some(dependency) = self.dependency {
            record.dependency = dependency;
        }
    }

    /// Whether the update changes anything the user asked for.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.partition.is_none() && self.time_limit_mins.is_none() && self.dependency.is_none()
    }
}

/// Scheduler-facing dependency status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyStatus {
    #[default]
    None,
    Waiting,
    Satisfied,
    /// The dependency can never be satisfied.
    Never,
}

/// A local job copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub description: JobDescription,
    pub state: JobState,
    pub submit_time_ms: u64,
    pub start_time_ms: Option<u64>,
    pub end_time_ms: Option<u64>,
    pub exit_code: i32,
    pub federated: bool,
    /// Origin tracking copy; the job runs or ran elsewhere.
    pub revoked: bool,
    /// Cluster running the job, when known.
    pub running_cluster: Option<ClusterId>,
    /// The origin is not viable; the record only tracks remote copies.
    pub tracking_only: bool,
    pub dependency: DependencyStatus,
}

impl JobRecord {
    pub fn new(id: JobId, description: JobDescription, submit_time_ms: u64) -> Self {
        Self {
            id,
            description,
            state: JobState::Pending,
            submit_time_ms,
            start_time_ms: None,
            end_time_ms: None,
            exit_code: 0,
            federated: false,
            revoked: false,
            running_cluster: None,
            tracking_only: false,
            dependency: DependencyStatus::None,
        }
    }

    /// Whether the local scheduler may start this copy.
    pub fn is_runnable(&self) -> bool {
        self.state.is_pending()
            && !self.revoked
            && !self.tracking_only
            && matches!(self.dependency, DependencyStatus::None | DependencyStatus::Satisfied)
    }
}

/// Capability over the local scheduler's job table.
pub trait JobStore: Send + Sync {
    /// Allocate the next job id from the local cluster's range.
    fn allocate_job_id(&self) -> Result<JobId>;

    /// Insert a new record; fails if the id exists.
    fn insert(&self, record: JobRecord) -> Result<()>;

    fn get(&self, job_id: JobId) -> Option<JobRecord>;

    /// Mutate a record in place.
    fn update(&self, job_id: JobId, f: &mut dyn FnMut(&mut JobRecord)) -> Result<()>;

    /// Remove a record entirely.
    fn purge(&self, job_id: JobId) -> Option<JobRecord>;

    fn list(&self) -> Vec<JobRecord>;

    /// Deliver a signal to a running job.
    fn signal(&self, job_id: JobId, signal: u16) -> Result<()>;
}

/// In-memory job table.
#[derive(Debug)]
pub struct MemoryJobStore {
    local_cluster: ClusterId,
    inner: Mutex<MemoryJobStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryJobStoreInner {
    next_local_id: u32,
    jobs: BTreeMap<JobId, JobRecord>,
    signals: Vec<(JobId, u16)>,
}

impl MemoryJobStore {
    pub fn new(local_cluster: ClusterId) -> Self {
        Self {
            local_cluster,
            inner: Mutex::new(MemoryJobStoreInner {
                next_local_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Signals delivered so far, in order.
    pub fn delivered_signals(&self) -> Vec<(JobId, u16)> {
        self.inner.lock().signals.clone()
    }
}

impl JobStore for MemoryJobStore {
    fn allocate_job_id(&self) -> Result<JobId> {
        let mut inner = self.inner.lock();
        while inner.next_local_id <= MAX_LOCAL_JOB_ID {
            let local = inner.next_local_id;
            inner.next_local_id += 1;
            let id = JobId::new(self.local_cluster, local).context(JobIdsExhaustedSnafu)?;
            if !inner.jobs.contains_key(&id) {
                return Ok(id);
            }
        }
        JobIdsExhaustedSnafu.fail()
    }

    fn insert(&self, record: JobRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&record.id) {
            return JobExistsSnafu { job_id: record.id }.fail();
        }
        inner.jobs.insert(record.id, record);
        Ok(())
    }

    fn get(&self, job_id: JobId) -> Option<JobRecord> {
        self.inner.lock().jobs.get(&job_id).cloned()
    }

    fn update(&self, job_id: JobId, f: &mut dyn FnMut(&mut JobRecord)) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.jobs.get_mut(&job_id).context(JobNotFoundSnafu { job_id })?;
        f(record);
        Ok(())
    }

    fn purge(&self, job_id: JobId) -> Option<JobRecord> {
        self.inner.lock().jobs.remove(&job_id)
    }

    fn list(&self) -> Vec<JobRecord> {
        self.inner.lock().jobs.values().cloned().collect()
    }

    fn signal(&self, job_id: JobId, signal: u16) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.jobs.contains_key(&job_id) {
            return JobNotFoundSnafu { job_id }.fail();
        }
        inner.signals.push((job_id, signal));
        Ok(())
    }
}
