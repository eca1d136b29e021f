//! Forecast model seam.
//!
//! The production model is external to this crate; the core only needs a
//! black-box train-and-predict function. [`SeasonalNaive`] is the built-in
//! default, good enough for tests and bootstrapping before a trained model
//! is wired in.

use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};

use crate::error::Result;

/// Black-box seasonal forecasting function.
///
/// Implementations train on `history` and return one prediction per entry
/// of `targets`, in order.
pub trait ForecastModel: Send + Sync {
    /// Fits the model to `history` and predicts at `targets`.
    fn fit_predict(
        &self,
        history: &[(DateTime<Utc>, f64)],
        targets: &[DateTime<Utc>],
    ) -> Result<Vec<f64>>;
}

/// Daily-seasonal naive model: each target gets the mean of all history
/// samples that fell in the same hour of day, falling back to the overall
/// mean for hours with no samples. An empty history predicts zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeasonalNaive;

impl ForecastModel for SeasonalNaive {
    fn fit_predict(
        &self,
        history: &[(DateTime<Utc>, f64)],
        targets: &[DateTime<Utc>],
    ) -> Result<Vec<f64>> {
        if history.is_empty() {
            return Ok(vec![0.0; targets.len()]);
        }

        let mut by_hour: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
        let mut total = 0.0;
        for (timestamp, value) in history {
            let slot = by_hour.entry(timestamp.hour()).or_insert((0.0, 0));
            slot.0 += value;
            slot.1 += 1;
            total += value;
        }
        let overall_mean = total / history.len() as f64;

        Ok(targets
            .iter()
            .map(|target| {
                by_hour
                    .get(&target.hour())
                    .map_or(overall_mean, |(sum, count)| sum / *count as f64)
            })
            .collect())
    }
}
