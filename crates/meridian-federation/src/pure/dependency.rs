//! Dependency expressions and cross-cluster aggregation.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::MAX_DEPENDENCY_CLAUSES;
use crate::types::ClusterId;
use crate::types::JobId;
use crate::types::JobState;
use crate::types::RemoteDependencyState;

/// Dependency kind, following the usual `after*` vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Satisfied once the referenced job has started.
    After,
    /// Satisfied once the referenced job has ended in any way.
    AfterAny,
    /// Satisfied once the referenced job completed successfully.
    AfterOk,
    /// Satisfied once the referenced job failed or was cancelled.
    AfterNotOk,
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "after" => Ok(DependencyKind::After),
            "afterany" => Ok(DependencyKind::AfterAny),
            "afterok" => Ok(DependencyKind::AfterOk),
            "afternotok" => Ok(DependencyKind::AfterNotOk),
            other => Err(format!("unknown dependency type '{other}'")),
        }
    }
}

/// A single `kind:job` requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyClause {
    pub kind: DependencyKind,
    pub job_id: JobId,
}

impl DependencyClause {
    /// Cluster owning the referenced job, by the job id's origin bits.
    pub fn owner(&self) -> Option<ClusterId> {
        self.job_id.origin()
    }
}

/// Parse `kind:job[:job...][,kind:job...]` into flat clauses.
pub fn parse_dependency(expression: &str) -> Result<Vec<DependencyClause>, String> {
    let mut clauses = Vec::new();
    for group in expression.split(',') {
        let group = group.trim();
        if group.is_empty() {
            continue;
        }
        let mut parts = group.split(':');
        let kind: DependencyKind = parts.next().unwrap_or_default().trim().parse()?;
        let mut saw_job = false;
        for raw in parts {
            let job_id: JobId = raw.parse().map_err(|_| format!("invalid job id '{raw}'"))?;
            clauses.push(DependencyClause { kind, job_id });
            saw_job = true;
        }
        if !saw_job {
            return Err(format!("'{group}' names no job"));
        }
    }
    if clauses.len() > MAX_DEPENDENCY_CLAUSES {
        return Err(format!("{} clauses exceed the limit of {MAX_DEPENDENCY_CLAUSES}", clauses.len()));
    }
    Ok(clauses)
}

/// Evaluate one clause against the referenced job's local state.
///
/// `job` is `None` when the referenced job no longer exists; a purged job
/// has finished long ago, so the clause is treated as satisfied.
pub fn evaluate_clause(kind: DependencyKind, job: Option<(JobState, i32)>) -> RemoteDependencyState {
    let Some((state, exit_code)) = job else {
        return RemoteDependencyState::Satisfied;
    };
    match kind {
        DependencyKind::After if state.is_started() || state.is_terminal() => RemoteDependencyState::Satisfied,
        DependencyKind::AfterAny if state.is_terminal() => RemoteDependencyState::Satisfied,
        DependencyKind::AfterOk => match state {
            JobState::Completed if exit_code == 0 => RemoteDependencyState::Satisfied,
            JobState::Completed | JobState::Failed | JobState::Cancelled => RemoteDependencyState::Failed,
            _ => RemoteDependencyState::Pending,
        },
        DependencyKind::AfterNotOk => match state {
            JobState::Failed | JobState::Cancelled => RemoteDependencyState::Satisfied,
            JobState::Completed if exit_code != 0 => RemoteDependencyState::Satisfied,
            JobState::Completed => RemoteDependencyState::Failed,
            _ => RemoteDependencyState::Pending,
        },
        _ => RemoteDependencyState::Pending,
    }
}

/// AND-combine clause states: any failure fails, all satisfied satisfies.
pub fn combine<I>(states: I) -> RemoteDependencyState
where
    I: IntoIterator<Item = RemoteDependencyState>,
{
    let mut all_satisfied = true;
    for state in states {
        match state {
            RemoteDependencyState::Failed => return RemoteDependencyState::Failed,
            RemoteDependencyState::Pending => all_satisfied = false,
            RemoteDependencyState::Satisfied => {}
        }
    }
    if all_satisfied {
        RemoteDependencyState::Satisfied
    } else {
        RemoteDependencyState::Pending
    }
}

/// One-shot transition of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateTransition {
    BecameSatisfied,
    BecameFailed,
}

/// Origin-side view of a dependent job: its local portion plus one report
/// per sibling that owns referenced jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyAggregate {
    pub local: RemoteDependencyState,
    pub remote: BTreeMap<ClusterId, RemoteDependencyState>,
    settled: bool,
}

impl DependencyAggregate {
    pub fn new(local: RemoteDependencyState, remote_owners: impl IntoIterator<Item = ClusterId>) -> Self {
        Self {
            local,
            remote: remote_owners.into_iter().map(|id| (id, RemoteDependencyState::Pending)).collect(),
            settled: false,
        }
    }

    /// Combined state over the local portion and all remote reports.
    pub fn overall(&self) -> RemoteDependencyState {
        combine(std::iter::once(self.local).chain(self.remote.values().copied()))
    }

    /// Whether the aggregate already reported its final transition.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Emit the final transition at most once.
    pub fn take_transition(&mut self) -> Option<AggregateTransition> {
        if self.settled {
            return None;
        }
        let transition = match self.overall() {
            RemoteDependencyState::Satisfied => AggregateTransition::BecameSatisfied,
            RemoteDependencyState::Failed => AggregateTransition::BecameFailed,
            RemoteDependencyState::Pending => return None,
        };
        self.settled = true;
        Some(transition)
    }

    pub fn set_local(&mut self, state: RemoteDependencyState) -> Option<AggregateTransition> {
        self.local = state;
        self.take_transition()
    }

    /// Record a sibling report. Reports from clusters that were never asked
    /// are ignored.
    pub fn record_remote(&mut self, cluster: ClusterId, state: RemoteDependencyState) -> Option<AggregateTransition> {
        match self.remote.get_mut(&cluster) {
            Some(slot) => *slot = state,
            None => return None,
        }
        self.take_transition()
    }

    /// Forget a departed sibling.
    pub fn remove_cluster(&mut self, cluster: ClusterId) -> Option<AggregateTransition> {
        if self.remote.remove(&cluster).is_none() {
            return None;
        }
        self.take_transition()
    }
}
