//! Per-round telemetry for council runs.
//!
//! One [`RoundTelemetry`] line per resolved round is appended to a JSONL
//! file so long runs can be analyzed while they are still going.

use std::path::Path;
use std::time::Duration;

use council::state::{FailureKind, GroupId, RoundId};
use council::RoundResult;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundTelemetry {
    pub round_id: RoundId,
    pub task_id: String,
    pub winner: Option<GroupId>,
    pub degraded: bool,
    pub status: String,
    pub candidates: usize,
    pub participating: usize,
    pub quorum_required: usize,
    pub agent_faults: usize,
    pub infra_faults: usize,
    pub wins: usize,
    pub losses: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub culled: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub culling_pending: bool,
    pub duration_ms: u64,
    pub timestamp: String,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl RoundTelemetry {
    pub fn from_result(result: &RoundResult, duration: Duration) -> Self {
        let failures: Vec<FailureKind> = result
            .record
            .groups
            .iter()
            .filter_map(|r| r.failure().map(|f| f.kind))
            .collect();

        Self {
            round_id: result.round_id,
            task_id: result.record.task_id.clone(),
            winner: result.winner,
            degraded: result.degraded,
            status: result.status.to_string(),
            candidates: result
                .record
                .groups
                .iter()
                .filter(|r| r.candidate().is_some())
                .count(),
            participating: result.vote.as_ref().map_or(0, |v| v.participating),
            quorum_required: result.vote.as_ref().map_or(0, |v| v.quorum_required),
            agent_faults: failures
                .iter()
                .filter(|k| **k == FailureKind::AgentFault)
                .count(),
            infra_faults: failures
                .iter()
                .filter(|k| **k == FailureKind::InfraFault)
                .count(),
            wins: result.tracker.wins,
            losses: result.tracker.losses,
            culled: result.culling.as_ref().map_or(0, |c| c.fired_count()),
            culling_pending: result.culling_pending,
            duration_ms: duration.as_millis() as u64,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Emit as a structured tracing event.
    pub fn emit(&self) {
        tracing::info!(
            target: "council.metrics",
            round_id = self.round_id,
            winner = ?self.winner,
            degraded = self.degraded,
            participating = self.participating,
            agent_faults = self.agent_faults,
            infra_faults = self.infra_faults,
            culled = self.culled,
            duration_ms = self.duration_ms,
            "round_complete"
        );
    }
}

/// Append one telemetry line to `path`.
pub fn append_telemetry(entry: &RoundTelemetry, path: &Path) {
    match serde_json::to_string(entry) {
        Ok(json) => {
            use std::io::Write;
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        warn!("Failed to append telemetry: {e}");
                    }
                }
                Err(e) => warn!("Failed to open telemetry file: {e}"),
            }
        }
        Err(e) => warn!("Failed to serialize telemetry: {e}"),
    }
}

/// Read every telemetry line back from `path`.
pub fn read_telemetry(path: &Path) -> std::io::Result<Vec<RoundTelemetry>> {
    use std::io::{BufRead, BufReader};

    let file = std::fs::File::open(path)?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Totals over a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub rounds: usize,
    pub degraded: usize,
    pub no_winner: usize,
    pub agent_faults: usize,
    pub infra_faults: usize,
    pub culled: usize,
    pub total_ms: u64,
}

impl RunSummary {
    pub fn record(&mut self, entry: &RoundTelemetry) {
        self.rounds += 1;
        self.degraded += entry.degraded as usize;
        self.no_winner += entry.winner.is_none() as usize;
        self.agent_faults += entry.agent_faults;
        self.infra_faults += entry.infra_faults;
        self.culled += entry.culled;
        self.total_ms += entry.duration_ms;
    }

    pub fn degraded_rate(&self) -> f64 {
        if self.rounds == 0 {
            0.0
        } else {
            self.degraded as f64 / self.rounds as f64
        }
    }

    pub fn log(&self) {
        info!(
            rounds = self.rounds,
            degraded = self.degraded,
            degraded_rate = self.degraded_rate(),
            no_winner = self.no_winner,
            agent_faults = self.agent_faults,
            infra_faults = self.infra_faults,
            culled = self.culled,
            total_ms = self.total_ms,
            "Run complete"
        );
    }
}
