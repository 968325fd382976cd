//! Council configuration
//!
//! Every tunable of the council lives here: population shape, culling
//! cadence, quorum rule, vote-weight scaling, happiness dynamics and
//! deadlines. Configuration is layered: defaults, then an optional TOML
//! file, then `COUNCIL_*` environment variables, then validation.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// How many participating voters a vote session needs to be valid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum QuorumRule {
    /// Strict majority of eligible voters: `floor(n / 2) + 1`.
    Majority,
    /// A fixed number of voters regardless of roster size.
    Fixed { voters: usize },
    /// A fraction of eligible voters, rounded up.
    Fraction { ratio: f64 },
}

impl QuorumRule {
    /// Participating voters required out of `eligible`. Never below one.
    pub fn required(&self, eligible: usize) -> usize {
        let required = match self {
            Self::Majority => eligible / 2 + 1,
            Self::Fixed { voters } => *voters,
            // Products like 25 * 0.28 land just above the integer
            Self::Fraction { ratio } => ((eligible as f64 * ratio) - 1e-9).ceil() as usize,
        };
        required.max(1)
    }
}

impl Default for QuorumRule {
    fn default() -> Self {
        Self::Majority
    }
}

/// A scalar curve used for the `f(performance)` and `g(happiness)` weight terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalingCurve {
    /// Ignores the input.
    Constant { value: f64 },
    /// `intercept + slope * x`
    Linear { intercept: f64, slope: f64 },
}

impl ScalingCurve {
    pub fn eval(&self, x: f64) -> f64 {
        match self {
            Self::Constant { value } => *value,
            Self::Linear { intercept, slope } => intercept + slope * x,
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            Self::Constant { value } => value.is_finite(),
            Self::Linear { intercept, slope } => intercept.is_finite() && slope.is_finite(),
        }
    }
}

/// Vote weight: `base * clamp(f(performance) * g(happiness), min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightParams {
    pub base: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    /// `f`, applied to performance_score (nominally 0.0–1.0)
    pub performance: ScalingCurve,
    /// `g`, applied to happiness (0–100)
    pub happiness: ScalingCurve,
}

impl Default for WeightParams {
    fn default() -> Self {
        Self {
            base: 1.0,
            min_multiplier: 1.0,
            max_multiplier: 3.0,
            performance: ScalingCurve::Linear {
                intercept: 1.0,
                slope: 2.0,
            },
            happiness: ScalingCurve::Linear {
                intercept: 0.5,
                slope: 0.01,
            },
        }
    }
}

/// Happiness dynamics applied by the tracker after each resolved round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HappinessParams {
    /// Value new councillors start at and decay pulls toward.
    pub neutral: f64,
    /// Fraction of the distance to `neutral` recovered per round.
    pub decay_rate: f64,
    pub win_delta: f64,
    pub loss_delta: f64,
    /// Streak length (and multiples of it) that triggers a bonus or penalty.
    pub streak_threshold: u32,
    pub streak_bonus: f64,
    pub streak_penalty: f64,
}

impl Default for HappinessParams {
    fn default() -> Self {
        Self {
            neutral: 50.0,
            decay_rate: 0.05,
            win_delta: 6.0,
            loss_delta: 4.0,
            streak_threshold: 3,
            streak_bonus: 5.0,
            streak_penalty: 5.0,
        }
    }
}

/// One ranking key for culling selection. Every key ranks worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CullKey {
    /// Lowest performance_score first.
    Performance,
    /// Lowest happiness first.
    Happiness,
    /// Oldest (lowest created_round) first.
    Age,
}

/// Which specialization assignment strategy the factory uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    RoundRobin,
    NeedBased,
}

impl Default for PolicyKind {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// Top-level council configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CouncilConfig {
    /// Active roster size N, held constant across culling cycles.
    pub population_size: usize,
    /// Group arity G.
    pub group_size: usize,
    /// Cull after every this many resolved rounds.
    pub cull_every: u64,
    /// Councillors retired (and respawned) per culling cycle.
    pub cull_count: usize,
    /// Culling never takes the roster below this size.
    pub min_population: usize,
    /// Rounds a new councillor spends exempt from culling.
    pub probation_rounds: u64,
    /// Capacity of each councillor's outcome ring buffer.
    pub history_len: usize,
    /// EMA smoothing factor for performance_score.
    pub alpha: f64,
    /// Performance score assigned at spawn.
    pub baseline_performance: f64,
    pub quorum: QuorumRule,
    pub weights: WeightParams,
    pub happiness: HappinessParams,
    pub specialization_policy: PolicyKind,
    /// Culling rank order; id breaks whatever ties remain.
    pub culling_order: [CullKey; 3],
    pub round_deadline_ms: u64,
    pub vote_deadline_ms: u64,
    /// Extra attempts granted to a group after an infra fault.
    pub infra_retry_limit: u32,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            population_size: 9,
            group_size: 3,
            cull_every: 10,
            cull_count: 3,
            min_population: 6,
            probation_rounds: 5,
            history_len: 10,
            alpha: 0.2,
            baseline_performance: 0.5,
            quorum: QuorumRule::Majority,
            weights: WeightParams::default(),
            happiness: HappinessParams::default(),
            specialization_policy: PolicyKind::RoundRobin,
            culling_order: [CullKey::Performance, CullKey::Happiness, CullKey::Age],
            round_deadline_ms: 30_000,
            vote_deadline_ms: 10_000,
            infra_retry_limit: 1,
        }
    }
}

impl CouncilConfig {
    /// Defaults overlaid with `COUNCIL_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from an optional TOML file, apply env overrides, then validate.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };

        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `COUNCIL_*` environment variables on top of this config.
    pub fn with_env_overrides(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok()?.trim().parse().ok()
        }

        if let Some(n) = parsed("COUNCIL_POPULATION_SIZE") {
            self.population_size = n;
        }
        if let Some(n) = parsed("COUNCIL_GROUP_SIZE") {
            self.group_size = n;
        }
        if let Some(n) = parsed("COUNCIL_CULL_EVERY") {
            self.cull_every = n;
        }
        if let Some(n) = parsed("COUNCIL_CULL_COUNT") {
            self.cull_count = n;
        }
        if let Some(n) = parsed("COUNCIL_MIN_POPULATION") {
            self.min_population = n;
        }
        if let Some(n) = parsed("COUNCIL_PROBATION_ROUNDS") {
            self.probation_rounds = n;
        }
        if let Some(a) = parsed("COUNCIL_ALPHA") {
            self.alpha = a;
        }
        if let Some(rate) = parsed("COUNCIL_HAPPINESS_DECAY") {
            self.happiness.decay_rate = rate;
        }
        if let Some(ms) = parsed("COUNCIL_ROUND_DEADLINE_MS") {
            self.round_deadline_ms = ms;
        }
        if let Some(ms) = parsed("COUNCIL_VOTE_DEADLINE_MS") {
            self.vote_deadline_ms = ms;
        }
        if let Some(n) = parsed("COUNCIL_INFRA_RETRIES") {
            self.infra_retry_limit = n;
        }
        if let Ok(raw) = std::env::var("COUNCIL_QUORUM") {
            if let Some(rule) = parse_quorum(&raw) {
                self.quorum = rule;
            }
        }

        self
    }

    pub fn round_deadline(&self) -> Duration {
        Duration::from_millis(self.round_deadline_ms)
    }

    pub fn vote_deadline(&self) -> Duration {
        Duration::from_millis(self.vote_deadline_ms)
    }

    /// Groups formed per round, `floor(N / G)`.
    pub fn groups_per_round(&self) -> usize {
        if self.group_size == 0 {
            0
        } else {
            self.population_size / self.group_size
        }
    }

    /// Reject configurations that would break council invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.group_size == 0 {
            return invalid("group_size must be at least 1".into());
        }
        if self.population_size < self.group_size {
            return invalid(format!(
                "population_size ({}) must be >= group_size ({})",
                self.population_size, self.group_size
            ));
        }
        if self.min_population > self.population_size {
            return invalid(format!(
                "min_population ({}) exceeds population_size ({})",
                self.min_population, self.population_size
            ));
        }
        if self.cull_every == 0 {
            return invalid("cull_every must be at least 1".into());
        }
        if self.cull_count > self.population_size {
            return invalid(format!(
                "cull_count ({}) exceeds population_size ({})",
                self.cull_count, self.population_size
            ));
        }
        if self.history_len == 0 {
            return invalid("history_len must be at least 1".into());
        }
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return invalid(format!("alpha must be in (0, 1], got {}", self.alpha));
        }
        if !self.baseline_performance.is_finite() {
            return invalid("baseline_performance must be finite".into());
        }
        if let QuorumRule::Fraction { ratio } = self.quorum {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return invalid(format!("quorum ratio must be in (0, 1], got {ratio}"));
            }
        }

        let w = &self.weights;
        if !(w.base.is_finite() && w.base > 0.0) {
            return invalid("weights.base must be positive".into());
        }
        if !(w.min_multiplier.is_finite() && w.min_multiplier > 0.0) {
            return invalid("weights.min_multiplier must be positive".into());
        }
        if !(w.max_multiplier.is_finite() && w.max_multiplier >= w.min_multiplier) {
            return invalid("weights.max_multiplier must be >= min_multiplier".into());
        }
        if !w.performance.is_finite() || !w.happiness.is_finite() {
            return invalid("weight curves must have finite parameters".into());
        }

        let h = &self.happiness;
        if !(0.0..=100.0).contains(&h.neutral) {
            return invalid(format!("happiness.neutral must be in [0, 100], got {}", h.neutral));
        }
        if !(0.0..=1.0).contains(&h.decay_rate) {
            return invalid(format!(
                "happiness.decay_rate must be in [0, 1], got {}",
                h.decay_rate
            ));
        }
        for (name, value) in [
            ("win_delta", h.win_delta),
            ("loss_delta", h.loss_delta),
            ("streak_bonus", h.streak_bonus),
            ("streak_penalty", h.streak_penalty),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("happiness.{name} must be a non-negative number"));
            }
        }

        let [a, b, c] = self.culling_order;
        if a == b || b == c || a == c {
            return invalid(format!(
                "culling_order must name each key once, got {:?}",
                self.culling_order
            ));
        }

        if self.round_deadline_ms == 0 || self.vote_deadline_ms == 0 {
            return invalid("deadlines must be non-zero".into());
        }

        Ok(())
    }
}

/// Parse `majority`, an integer voter count, or a fraction like `0.6`.
pub fn parse_quorum(raw: &str) -> Option<QuorumRule> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("majority") {
        return Some(QuorumRule::Majority);
    }
    if let Ok(voters) = raw.parse::<usize>() {
        return Some(QuorumRule::Fixed { voters });
    }
    match raw.parse::<f64>() {
        Ok(ratio) if ratio > 0.0 && ratio <= 1.0 => Some(QuorumRule::Fraction { ratio }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CouncilConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.groups_per_round(), 3);
    }

    #[test]
    fn test_majority_quorum() {
        assert_eq!(QuorumRule::Majority.required(9), 5);
        assert_eq!(QuorumRule::Majority.required(10), 6);
        assert_eq!(QuorumRule::Majority.required(0), 1);
    }

    #[test]
    fn test_fraction_quorum_rounds_up() {
        let rule = QuorumRule::Fraction { ratio: 0.6 };
        assert_eq!(rule.required(9), 6);
        assert_eq!(rule.required(5), 3);

        // Exact products must not gain a voter from float error
        assert_eq!(QuorumRule::Fraction { ratio: 0.28 }.required(25), 7);
        assert_eq!(QuorumRule::Fraction { ratio: 0.14 }.required(50), 7);
        assert_eq!(QuorumRule::Fraction { ratio: 0.5 }.required(10), 5);
        assert_eq!(QuorumRule::Fraction { ratio: 0.5 }.required(11), 6);
        assert_eq!(QuorumRule::Fraction { ratio: 1.0 }.required(9), 9);
    }

    #[test]
    fn test_parse_quorum() {
        assert_eq!(parse_quorum("majority"), Some(QuorumRule::Majority));
        assert_eq!(parse_quorum(" 4 "), Some(QuorumRule::Fixed { voters: 4 }));
        assert_eq!(
            parse_quorum("0.75"),
            Some(QuorumRule::Fraction { ratio: 0.75 })
        );
        assert_eq!(parse_quorum("1.5"), None);
        assert_eq!(parse_quorum("most"), None);
    }

    #[test]
    fn test_toml_partial_override() {
        let config = CouncilConfig::from_toml_str(
            r#"
            population_size = 12
            group_size = 4
            alpha = 0.3
            culling_order = ["happiness", "performance", "age"]

            [quorum]
            rule = "fixed"
            voters = 7

            [weights.performance]
            kind = "constant"
            value = 2.0
            "#,
        )
        .unwrap();

        assert_eq!(config.population_size, 12);
        assert_eq!(config.group_size, 4);
        assert_eq!(config.quorum, QuorumRule::Fixed { voters: 7 });
        assert_eq!(config.culling_order[0], CullKey::Happiness);
        assert_eq!(
            config.weights.performance,
            ScalingCurve::Constant { value: 2.0 }
        );
        // Untouched keys keep their defaults
        assert_eq!(config.cull_every, 10);
        assert_eq!(config.weights.max_multiplier, 3.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut config = CouncilConfig::default();
        config.group_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = CouncilConfig::default();
        config.min_population = 20;
        assert!(config.validate().is_err());

        let mut config = CouncilConfig::default();
        config.alpha = 0.0;
        assert!(config.validate().is_err());

        let mut config = CouncilConfig::default();
        config.weights.max_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = CouncilConfig::default();
        config.happiness.neutral = 120.0;
        assert!(config.validate().is_err());

        let mut config = CouncilConfig::default();
        config.culling_order = [CullKey::Age, CullKey::Happiness, CullKey::Age];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = CouncilConfig::load(Some(Path::new("/nonexistent/council.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
