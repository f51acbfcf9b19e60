/// In-memory accumulation of weight samples for one session
use crate::models::{Summary, WeightSample};
use crate::utils::{median, median_absolute_deviation};

/// Append-only series of samples in receipt order
#[derive(Debug, Default)]
pub struct SampleAggregator {
    series: Vec<WeightSample>,
}

impl SampleAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample as received. Timestamps are not checked for
    /// monotonicity; the device counter wraps after about 71 minutes.
    pub fn append(&mut self, sample: WeightSample) {
        self.series.push(sample);
    }

    pub fn extend(&mut self, samples: impl IntoIterator<Item = WeightSample>) {
        self.series.extend(samples);
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Latest timestamp seen, in seconds
    pub fn last_timestamp(&self) -> Option<f64> {
        self.series.last().map(|s| s.timestamp)
    }

    /// Snapshot of everything appended so far
    pub fn finalize(&self) -> Vec<WeightSample> {
        self.series.clone()
    }
}

/// Median and MAD of the second half of a series
///
/// The first half covers the ramp up of a pull, the second half the steady
/// hold, so only the latter is summarised.
pub fn summarize(series: &[WeightSample]) -> Option<Summary> {
    let half = series.len() / 2;
    let hold: Vec<f32> = series[half..].iter().map(|s| s.weight).collect();

    Some(Summary {
        median: median(&hold)?,
        mad: median_absolute_deviation(&hold)?,
    })
}
