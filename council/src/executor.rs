//! Competitive round execution
//!
//! Partitions a roster snapshot into groups, runs every group against the
//! same task concurrently on a `JoinSet`, and collects one report per group.
//! The whole fan-out is bounded by the round deadline: groups still running
//! when it elapses are cancelled and reported as infra faults, while the
//! candidates that already finished go on to the vote.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::config::CouncilConfig;
use crate::otel;
use crate::state::{
    Candidate, Councillor, CouncillorId, Group, GroupFailure, GroupOutcome, GroupReport, RoundId,
    Submission, Task,
};

/// Runs a task on behalf of one group.
///
/// Return [`GroupFailure::agent_fault`] when the group itself failed (it is
/// scored as a loss) and [`GroupFailure::infra_fault`] when the environment
/// did (it is retried, then excluded from scoring).
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, group: &Group) -> Result<Submission, GroupFailure>;
}

pub type SharedTaskExecutor = Arc<dyn TaskExecutor>;

/// Groups for one round plus whoever sat out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub groups: Vec<Group>,
    pub held_out: Vec<CouncillorId>,
}

/// Split `roster` into `floor(N / group_size)` groups.
///
/// The roster is ordered by id and rotated by `round_id mod N` before
/// chunking, so membership changes each round and the remainder that is
/// held out rotates through the roster instead of always hitting the
/// highest ids.
pub fn partition(round_id: RoundId, roster: &[Councillor], group_size: usize) -> Partition {
    let mut ordered: Vec<&Councillor> = roster.iter().collect();
    ordered.sort_by_key(|c| c.id);

    if ordered.is_empty() || group_size == 0 {
        return Partition {
            groups: Vec::new(),
            held_out: ordered.iter().map(|c| c.id).collect(),
        };
    }

    let offset = (round_id % ordered.len() as u64) as usize;
    ordered.rotate_left(offset);

    let group_count = ordered.len() / group_size;
    let (grouped, rest) = ordered.split_at(group_count * group_size);

    let groups = grouped
        .chunks(group_size)
        .enumerate()
        .map(|(idx, members)| Group {
            id: idx as u32,
            round_id,
            members: members.iter().map(|c| c.id).collect(),
            specializations: members.iter().map(|c| c.specialization).collect(),
        })
        .collect();

    let mut held_out: Vec<CouncillorId> = rest.iter().map(|c| c.id).collect();
    held_out.sort();

    Partition { groups, held_out }
}

/// Everything the executor learned in one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundExecution {
    pub round_id: RoundId,
    /// One per group, sorted by group id
    pub reports: Vec<GroupReport>,
    pub held_out: Vec<CouncillorId>,
    pub elapsed_ms: u64,
}

impl RoundExecution {
    /// Candidates in group-id order.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.reports
            .iter()
            .filter_map(|r| r.candidate().cloned())
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Group, &GroupFailure)> {
        self.reports
            .iter()
            .filter_map(|r| r.failure().map(|f| (&r.group, f)))
    }

    pub fn infra_fault_count(&self) -> usize {
        self.failures().filter(|(_, f)| f.is_infra()).count()
    }
}

/// Fan-out / fan-in driver for one round
pub struct RoundExecutor {
    executor: SharedTaskExecutor,
    group_size: usize,
    round_deadline: Duration,
    infra_retry_limit: u32,
}

impl RoundExecutor {
    pub fn new(
        executor: SharedTaskExecutor,
        group_size: usize,
        round_deadline: Duration,
        infra_retry_limit: u32,
    ) -> Self {
        Self {
            executor,
            group_size,
            round_deadline,
            infra_retry_limit,
        }
    }

    pub fn from_config(executor: SharedTaskExecutor, config: &CouncilConfig) -> Self {
        Self::new(
            executor,
            config.group_size,
            config.round_deadline(),
            config.infra_retry_limit,
        )
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Partition the roster, dispatch every group and wait for all of them
    /// or the round deadline, whichever comes first.
    pub async fn execute_round(
        &self,
        round_id: RoundId,
        task: &Task,
        roster: &[Councillor],
    ) -> RoundExecution {
        let start = Instant::now();
        let deadline = start + self.round_deadline;
        let Partition { groups, held_out } = partition(round_id, roster, self.group_size);

        info!(
            round_id,
            groups = groups.len(),
            held_out = held_out.len(),
            "Dispatching groups"
        );

        let task = Arc::new(task.clone());
        let mut join_set: JoinSet<GroupReport> = JoinSet::new();

        for group in &groups {
            let executor = self.executor.clone();
            let task = task.clone();
            let group = group.clone();
            let retry_limit = self.infra_retry_limit;
            let span = otel::group_span(round_id, group.id, group.members.len());

            join_set.spawn(
                async move { run_group(executor, task, group, deadline, retry_limit).await }
                    .instrument(span),
            );
        }

        let mut reports: Vec<GroupReport> = Vec::with_capacity(groups.len());
        loop {
            match timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok(report))) => reports.push(report),
                Ok(Some(Err(e))) => {
                    warn!(round_id, error = %e, "Group task panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        round_id,
                        still_running = join_set.len(),
                        "Round deadline elapsed, cancelling remaining groups"
                    );
                    join_set.abort_all();
                    break;
                }
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;

        // Groups with no report panicked or were cancelled at the deadline
        for group in groups {
            if reports.iter().all(|r| r.group.id != group.id) {
                reports.push(GroupReport {
                    group,
                    outcome: GroupOutcome::Failed(GroupFailure::infra_fault(
                        "group did not report before the round deadline",
                    )),
                    attempts: 0,
                    elapsed_ms,
                });
            }
        }
        reports.sort_by_key(|r| r.group.id);

        RoundExecution {
            round_id,
            reports,
            held_out,
            elapsed_ms,
        }
    }
}

async fn run_group(
    executor: SharedTaskExecutor,
    task: Arc<Task>,
    group: Group,
    deadline: Instant,
    retry_limit: u32,
) -> GroupReport {
    let start = Instant::now();
    let mut attempts = 0u32;

    let outcome = loop {
        attempts += 1;
        let failure = match timeout_at(deadline, executor.execute(&task, &group)).await {
            Ok(Ok(submission)) => {
                break GroupOutcome::Candidate(Candidate {
                    group_id: group.id,
                    authors: group.members.clone(),
                    content: submission.content,
                    confidence: submission.confidence,
                });
            }
            Ok(Err(failure)) => failure,
            Err(_) => GroupFailure::infra_fault("timed out at the round deadline"),
        };

        let retryable =
            failure.is_infra() && attempts <= retry_limit && Instant::now() < deadline;
        if !retryable {
            break GroupOutcome::Failed(failure);
        }
        debug!(group_id = group.id, attempts, error = %failure, "Retrying after infra fault");
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    let label = match &outcome {
        GroupOutcome::Candidate(_) => "candidate".to_string(),
        GroupOutcome::Failed(f) => f.kind.to_string(),
    };
    otel::record_group_result(&tracing::Span::current(), &label, attempts, elapsed_ms);

    GroupReport {
        group,
        outcome,
        attempts,
        elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::state::{FailureKind, Specialization};

    fn roster(n: u64) -> Vec<Councillor> {
        (1..=n)
            .map(|id| Councillor::new(CouncillorId(id), Specialization::ALL[(id % 5) as usize], 0, 0.5, 50.0, 5))
            .collect()
    }

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(&self, task: &Task, group: &Group) -> Result<Submission, GroupFailure> {
            Ok(Submission::new(format!("{}#{}", task.prompt, group.id), 0.8))
        }
    }

    /// Group 1 hangs forever, group 2 fails as an agent
    struct Mixed;

    #[async_trait]
    impl TaskExecutor for Mixed {
        async fn execute(&self, _task: &Task, group: &Group) -> Result<Submission, GroupFailure> {
            match group.id {
                1 => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Submission::new("late", 1.0))
                }
                2 => Err(GroupFailure::agent_fault("bad answer")),
                _ => Ok(Submission::new("ok", 0.5)),
            }
        }
    }

    /// Fails with an infra fault on the first call, then succeeds
    struct FlakyOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskExecutor for FlakyOnce {
        async fn execute(&self, _task: &Task, _group: &Group) -> Result<Submission, GroupFailure> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GroupFailure::infra_fault("connection reset"))
            } else {
                Ok(Submission::new("recovered", 0.6))
            }
        }
    }

    #[test]
    fn test_partition_nine_by_three() {
        let p = partition(0, &roster(9), 3);
        assert_eq!(p.groups.len(), 3);
        assert!(p.held_out.is_empty());
        assert_eq!(p.groups[0].members, vec![CouncillorId(1), CouncillorId(2), CouncillorId(3)]);
        assert!(p.groups.iter().all(|g| g.members.len() == 3));
        assert!(p.groups.iter().all(|g| g.specializations.len() == 3));
    }

    #[test]
    fn test_partition_rotates_hold_outs() {
        let roster = roster(10);
        let first = partition(0, &roster, 3);
        let second = partition(1, &roster, 3);

        assert_eq!(first.held_out, vec![CouncillorId(10)]);
        assert_eq!(second.held_out, vec![CouncillorId(1)]);

        // Every councillor is in exactly one group or held out
        for p in [&first, &second] {
            let mut seen: Vec<CouncillorId> = p
                .groups
                .iter()
                .flat_map(|g| g.members.iter().copied())
                .chain(p.held_out.iter().copied())
                .collect();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), 10);
        }
    }

    #[test]
    fn test_partition_ignores_input_order() {
        let mut shuffled = roster(7);
        shuffled.reverse();
        assert_eq!(partition(3, &shuffled, 2), partition(3, &roster(7), 2));
    }

    #[tokio::test]
    async fn test_all_groups_produce_candidates() {
        let exec = RoundExecutor::new(Arc::new(Echo), 3, Duration::from_secs(5), 1);
        let result = exec.execute_round(1, &Task::new("sum"), &roster(9)).await;

        assert_eq!(result.reports.len(), 3);
        let candidates = result.candidates();
        assert_eq!(candidates.len(), 3);
        for (idx, candidate) in candidates.iter().enumerate() {
            assert_eq!(candidate.group_id, idx as u32);
            assert_eq!(candidate.content, format!("sum#{}", idx));
            assert_eq!(candidate.authors.len(), 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_infra_fault_and_others_survive() {
        let exec = RoundExecutor::new(Arc::new(Mixed), 3, Duration::from_secs(30), 1);
        let result = exec.execute_round(3, &Task::new("t"), &roster(9)).await;

        assert_eq!(result.reports.len(), 3);
        let ids: Vec<u32> = result.reports.iter().map(|r| r.group.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let hung = result.reports[1].failure().unwrap();
        assert_eq!(hung.kind, FailureKind::InfraFault);
        let bad = result.reports[2].failure().unwrap();
        assert_eq!(bad.kind, FailureKind::AgentFault);
        assert_eq!(result.reports[2].attempts, 1);
        assert_eq!(result.candidates().len(), 1);
        assert_eq!(result.infra_fault_count(), 1);
    }

    #[tokio::test]
    async fn test_infra_fault_is_retried() {
        let exec = RoundExecutor::new(
            Arc::new(FlakyOnce {
                calls: AtomicU32::new(0),
            }),
            3,
            Duration::from_secs(5),
            1,
        );
        let result = exec.execute_round(1, &Task::new("t"), &roster(3)).await;

        assert_eq!(result.reports.len(), 1);
        assert_eq!(result.reports[0].attempts, 2);
        assert_eq!(result.candidates()[0].content, "recovered");
    }

    #[tokio::test]
    async fn test_retry_limit_zero_excludes_immediately() {
        let exec = RoundExecutor::new(
            Arc::new(FlakyOnce {
                calls: AtomicU32::new(0),
            }),
            3,
            Duration::from_secs(5),
            0,
        );
        let result = exec.execute_round(1, &Task::new("t"), &roster(3)).await;
        assert!(result.reports[0].failure().unwrap().is_infra());
        assert_eq!(result.reports[0].attempts, 1);
    }
}
