//! Happiness and performance tracking
//!
//! Runs once per resolved round, after the vote, on a staged copy of the
//! roster. Performance is an exponential moving average of win/loss
//! outcomes. Happiness drifts toward a neutral baseline every round and
//! moves by event deltas on wins, losses and streaks, always clamped to
//! [0, 100].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CouncilConfig, HappinessParams};
use crate::state::{Councillor, CouncillorId, HistoryEntry, MemberOutcome, RoundId, RoundOutcome};

/// Lower and upper bound for happiness
pub const HAPPINESS_MIN: f64 = 0.0;
pub const HAPPINESS_MAX: f64 = 100.0;

/// Counts from one tracker pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSummary {
    pub wins: usize,
    pub losses: usize,
    pub unscored: usize,
    pub streak_events: usize,
}

/// Applies round outcomes to councillor scores
#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    alpha: f64,
    happiness: HappinessParams,
}

impl PerformanceTracker {
    pub fn new(alpha: f64, happiness: HappinessParams) -> Self {
        Self { alpha, happiness }
    }

    pub fn from_config(config: &CouncilConfig) -> Self {
        Self::new(config.alpha, config.happiness)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// `score * (1 - alpha) + outcome * alpha`
    pub fn ema(&self, score: f64, outcome: f64) -> f64 {
        score * (1.0 - self.alpha) + outcome * self.alpha
    }

    /// Pull happiness a fraction of the way back toward neutral.
    pub fn decay(&self, councillor: &mut Councillor) {
        let neutral = self.happiness.neutral;
        councillor.happiness += (neutral - councillor.happiness) * self.happiness.decay_rate;
        councillor.happiness = clamp_happiness(councillor.happiness);
    }

    /// Apply one scored outcome. Returns true when a streak threshold fired.
    pub fn record_outcome(
        &self,
        councillor: &mut Councillor,
        round_id: RoundId,
        outcome: RoundOutcome,
    ) -> bool {
        councillor.performance_score = self.ema(councillor.performance_score, outcome.value());

        let threshold = self.happiness.streak_threshold;
        let mut delta = 0.0;
        let mut streak_fired = false;

        match outcome {
            RoundOutcome::Win => {
                councillor.win_streak += 1;
                councillor.loss_streak = 0;
                delta += self.happiness.win_delta;
                if threshold > 0 && councillor.win_streak % threshold == 0 {
                    delta += self.happiness.streak_bonus;
                    streak_fired = true;
                }
            }
            RoundOutcome::Loss => {
                councillor.loss_streak += 1;
                councillor.win_streak = 0;
                delta -= self.happiness.loss_delta;
                if threshold > 0 && councillor.loss_streak % threshold == 0 {
                    delta -= self.happiness.streak_penalty;
                    streak_fired = true;
                }
            }
        }

        councillor.happiness = clamp_happiness(councillor.happiness + delta);
        councillor.history.push(HistoryEntry { round_id, outcome });
        streak_fired
    }

    /// Apply a resolved round to every councillor in `roster`.
    ///
    /// Every councillor decays toward neutral. Councillors with a scored
    /// outcome then get their EMA, streak and happiness update; those with
    /// no entry or `NoContest` keep their score, streaks and history.
    pub fn apply_round<'a>(
        &self,
        round_id: RoundId,
        roster: impl IntoIterator<Item = &'a mut Councillor>,
        outcomes: &BTreeMap<CouncillorId, MemberOutcome>,
    ) -> TrackerSummary {
        let mut summary = TrackerSummary::default();

        for councillor in roster {
            self.decay(councillor);

            let scored = outcomes
                .get(&councillor.id)
                .and_then(|outcome| outcome.scored());

            match scored {
                Some(outcome) => {
                    if self.record_outcome(councillor, round_id, outcome) {
                        summary.streak_events += 1;
                    }
                    match outcome {
                        RoundOutcome::Win => summary.wins += 1,
                        RoundOutcome::Loss => summary.losses += 1,
                    }
                }
                None => summary.unscored += 1,
            }
        }

        debug!(
            round_id,
            wins = summary.wins,
            losses = summary.losses,
            unscored = summary.unscored,
            "Tracker applied round"
        );

        summary
    }
}

fn clamp_happiness(value: f64) -> f64 {
    if value.is_nan() {
        return HAPPINESS_MIN;
    }
    value.clamp(HAPPINESS_MIN, HAPPINESS_MAX)
}
