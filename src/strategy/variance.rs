//! Bounded variance telemetry, see spec.md §4.4 "Variance telemetry" and
//! §4.4 step 5 of `shouldExecute`.
//!
//! A `VecDeque`-backed ring buffer, same shape as the teacher's
//! `route_quality::prober` sampling history.

use std::collections::VecDeque;

const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct VarianceSample {
    pub buy_variance_percent: f64,
    pub sell_variance_percent: f64,
    pub profit_impact_percent: f64,
    pub accepted: bool,
}

#[derive(Default)]
pub struct VarianceHistory {
    samples: VecDeque<VarianceSample>,
}

impl VarianceHistory {
    pub fn new() -> Self {
        Self { samples: VecDeque::with_capacity(HISTORY_CAPACITY) }
    }

    pub fn record(&mut self, sample: VarianceSample) {
        if self.samples.len() == HISTORY_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn telemetry(&self) -> VarianceTelemetry {
        if self.samples.is_empty() {
            return VarianceTelemetry::default();
        }
        let total_variance: f64 = self
            .samples
            .iter()
            .map(|s| s.buy_variance_percent.abs() + s.sell_variance_percent.abs())
            .sum();
        let max_variance = self
            .samples
            .iter()
            .map(|s| s.buy_variance_percent.abs().max(s.sell_variance_percent.abs()))
            .fold(0.0, f64::max);
        let avg_profit_impact: f64 =
            self.samples.iter().map(|s| s.profit_impact_percent).sum::<f64>() / self.samples.len() as f64;

        VarianceTelemetry {
            avg_variance: total_variance / self.samples.len() as f64,
            max_variance,
            recent_count: self.samples.len(),
            avg_profit_impact,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VarianceTelemetry {
    pub avg_variance: f64,
    pub max_variance: f64,
    pub recent_count: usize,
    pub avg_profit_impact: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_history_capacity() {
        let mut history = VarianceHistory::new();
        for i in 0..150 {
            history.record(VarianceSample {
                buy_variance_percent: i as f64,
                sell_variance_percent: 0.0,
                profit_impact_percent: 0.0,
                accepted: true,
            });
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn telemetry_on_empty_history_is_zeroed() {
        let history = VarianceHistory::new();
        let t = history.telemetry();
        assert_eq!(t.recent_count, 0);
        assert_eq!(t.avg_variance, 0.0);
    }

    #[test]
    fn telemetry_averages_across_samples() {
        let mut history = VarianceHistory::new();
        history.record(VarianceSample { buy_variance_percent: 0.1, sell_variance_percent: 0.1, profit_impact_percent: 5.0, accepted: true });
        history.record(VarianceSample { buy_variance_percent: 0.3, sell_variance_percent: 0.1, profit_impact_percent: 15.0, accepted: false });
        let t = history.telemetry();
        assert_eq!(t.recent_count, 2);
        assert!((t.avg_profit_impact - 10.0).abs() < 1e-9);
        assert!((t.max_variance - 0.3).abs() < 1e-9);
    }
}
