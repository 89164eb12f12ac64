//! Success-rate update policies.

use serde::{Deserialize, Serialize};

/// How `update_stats` folds one outcome into a tool's `success_rate`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuccessRatePolicy {
    /// Exact mean over every recorded outcome. The initial rate of a new
    /// tool is a prior, not an observation, and is replaced by the first one.
    RunningAverage,
    /// `alpha * outcome + (1 - alpha) * previous`.
    ExponentialMovingAverage { alpha: f64 },
}

impl Default for SuccessRatePolicy {
    fn default() -> Self {
        SuccessRatePolicy::ExponentialMovingAverage { alpha: 0.1 }
    }
}

impl SuccessRatePolicy {
    /// New rate after one more outcome. `prior_uses` is the usage count
    /// before this outcome.
    pub fn apply(&self, previous: f64, prior_uses: u64, success: bool) -> f64 {
        let outcome = if success { 1.0 } else { 0.0 };
        let next = match *self {
            SuccessRatePolicy::RunningAverage => {
                let n = prior_uses as f64;
                (previous * n + outcome) / (n + 1.0)
            }
            SuccessRatePolicy::ExponentialMovingAverage { alpha } => {
                alpha * outcome + (1.0 - alpha) * previous
            }
        };
        next.clamp(0.0, 1.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            SuccessRatePolicy::ExponentialMovingAverage { alpha }
                if !(alpha > 0.0 && alpha <= 1.0) =>
            {
                Err(format!("alpha must be in (0, 1], got {alpha}"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(policy: SuccessRatePolicy, outcomes: impl IntoIterator<Item = bool>) -> f64 {
        let mut rate = 1.0;
        for (uses, success) in outcomes.into_iter().enumerate() {
            rate = policy.apply(rate, uses as u64, success);
        }
        rate
    }

    #[test]
    fn running_average_is_exact_mean() {
        // 3 successes out of 4 outcomes.
        let rate = run(
            SuccessRatePolicy::RunningAverage,
            [true, false, true, true],
        );
        assert!((rate - 0.75).abs() < 1e-12);
    }

    #[test]
    fn running_average_converges_to_true_rate() {
        // Periodic pattern with 70% successes.
        let pattern = [true, true, false, true, true, false, true, false, true, true];
        let outcomes = pattern.iter().copied().cycle().take(1000);
        let rate = run(SuccessRatePolicy::RunningAverage, outcomes);
        assert!((rate - 0.7).abs() < 1e-9);
    }

    #[test]
    fn ema_follows_geometric_decay() {
        let ema = SuccessRatePolicy::ExponentialMovingAverage { alpha: 0.1 };
        let after_ten_failures = run(ema, std::iter::repeat(false).take(10));
        assert!((after_ten_failures - 0.9f64.powi(10)).abs() < 1e-12);
    }

    #[test]
    fn ema_converges_toward_recent_behaviour() {
        let ema = SuccessRatePolicy::ExponentialMovingAverage { alpha: 0.1 };
        let outcomes = std::iter::repeat(false)
            .take(100)
            .chain(std::iter::repeat(true).take(100));
        let rate = run(ema, outcomes);
        assert!(rate > 0.99, "rate {rate}");
    }

    #[test]
    fn ema_stays_bounded_with_mixed_outcomes() {
        let ema = SuccessRatePolicy::ExponentialMovingAverage { alpha: 0.1 };
        let pattern = [true, false];
        let rate = run(ema, pattern.iter().copied().cycle().take(500));
        assert!(rate > 0.4 && rate < 0.6, "rate {rate}");
    }

    #[test]
    fn validate_rejects_bad_alpha() {
        assert!(SuccessRatePolicy::ExponentialMovingAverage { alpha: 0.0 }
            .validate()
            .is_err());
        assert!(SuccessRatePolicy::ExponentialMovingAverage { alpha: 1.5 }
            .validate()
            .is_err());
        assert!(SuccessRatePolicy::RunningAverage.validate().is_ok());
    }
}
