//! OpenTelemetry-compatible span helpers
//!
//! Structured `tracing` span builders for the council pipeline. Field names
//! use dot notation so they export cleanly to an OTLP collector.
//!
//! # Span Hierarchy
//!
//! ```text
//! council.round            (one per run_round call)
//!   ├─ council.group       (one per dispatched group)
//!   ├─ council.vote        (ballot collection and tally)
//!   └─ council.culling     (every cull_every resolved rounds)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let span = otel::vote_span(round_id, eligible, candidates.len());
//! let result = voting.run_vote(round_id, &candidates, &roster).instrument(span.clone()).await?;
//! otel::record_vote_result(&span, result.session.participating, !result.degraded, Some(result.winner));
//! ```

use tracing::Span;

use crate::state::{GroupId, RoundId};

// ── Span Name Constants ──────────────────────────────────────────────

pub const SPAN_ROUND: &str = "council.round";
pub const SPAN_GROUP: &str = "council.group";
pub const SPAN_VOTE: &str = "council.vote";
pub const SPAN_CULLING: &str = "council.culling";

// ── Field Name Constants ─────────────────────────────────────────────

pub const FIELD_ROUND_ID: &str = "council.round.id";
pub const FIELD_TASK_ID: &str = "council.task.id";
pub const FIELD_GROUP_ID: &str = "council.group.id";
pub const FIELD_GROUP_SIZE: &str = "council.group.size";
pub const FIELD_OUTCOME: &str = "council.outcome";
pub const FIELD_ATTEMPTS: &str = "council.attempts";
pub const FIELD_WINNER: &str = "council.winner";
pub const FIELD_DEGRADED: &str = "council.degraded";
pub const FIELD_DURATION_MS: &str = "council.duration_ms";

// ── Span Builders ────────────────────────────────────────────────────

/// Root span for one round.
///
/// Fields filled later via [`record_round_result`]: winner, degraded, duration.
pub fn round_span(round_id: RoundId, task_id: &str) -> Span {
    tracing::info_span!(
        "council.round",
        "council.round.id" = round_id,
        "council.task.id" = %task_id,
        "council.winner" = tracing::field::Empty,
        "council.degraded" = tracing::field::Empty,
        "council.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_round_result(span: &Span, winner: Option<GroupId>, degraded: bool, duration_ms: u64) {
    if let Some(winner) = winner {
        span.record("council.winner", winner);
    }
    span.record("council.degraded", degraded);
    span.record("council.duration_ms", duration_ms);
}

/// Span for one group's execution, including infra retries.
pub fn group_span(round_id: RoundId, group_id: GroupId, group_size: usize) -> Span {
    tracing::info_span!(
        "council.group",
        "council.round.id" = round_id,
        "council.group.id" = group_id,
        "council.group.size" = group_size as u64,
        "council.outcome" = tracing::field::Empty,
        "council.attempts" = tracing::field::Empty,
        "council.duration_ms" = tracing::field::Empty,
    )
}

/// `outcome` is `candidate`, `agent_fault` or `infra_fault`.
pub fn record_group_result(span: &Span, outcome: &str, attempts: u32, duration_ms: u64) {
    span.record("council.outcome", outcome);
    span.record("council.attempts", attempts);
    span.record("council.duration_ms", duration_ms);
}

/// Span for ballot collection and tally.
pub fn vote_span(round_id: RoundId, eligible_voters: usize, candidates: usize) -> Span {
    tracing::info_span!(
        "council.vote",
        "council.round.id" = round_id,
        "council.vote.eligible" = eligible_voters as u64,
        "council.vote.candidates" = candidates as u64,
        "council.vote.participating" = tracing::field::Empty,
        "council.vote.quorum_met" = tracing::field::Empty,
        "council.winner" = tracing::field::Empty,
    )
}

pub fn record_vote_result(
    span: &Span,
    participating: usize,
    quorum_met: bool,
    winner: Option<GroupId>,
) {
    span.record("council.vote.participating", participating as u64);
    span.record("council.vote.quorum_met", quorum_met);
    if let Some(winner) = winner {
        span.record("council.winner", winner);
    }
}

/// Span for a culling cycle.
pub fn culling_span(round_id: RoundId, requested: usize) -> Span {
    tracing::info_span!(
        "council.culling",
        "council.round.id" = round_id,
        "council.culling.requested" = requested as u64,
        "council.culling.fired" = tracing::field::Empty,
        "council.culling.spawned" = tracing::field::Empty,
    )
}

pub fn record_culling_result(span: &Span, fired: usize, spawned: usize) {
    span.record("council.culling.fired", fired as u64);
    span.record("council.culling.spawned", spawned as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names_share_prefix() {
        for name in [SPAN_ROUND, SPAN_GROUP, SPAN_VOTE, SPAN_CULLING] {
            assert!(name.starts_with("council."));
        }
        for field in [FIELD_ROUND_ID, FIELD_GROUP_ID, FIELD_WINNER, FIELD_DURATION_MS] {
            assert!(field.starts_with("council."));
        }
    }

    #[test]
    fn test_builders_without_subscriber() {
        // Disabled spans accept records without panicking
        let span = round_span(1, "task-1");
        record_round_result(&span, Some(2), false, 15);

        let span = group_span(1, 0, 3);
        record_group_result(&span, "infra_fault", 2, 30_000);

        let span = vote_span(1, 9, 3);
        record_vote_result(&span, 5, true, None);

        let span = culling_span(10, 3);
        record_culling_result(&span, 3, 3);
    }
}
