use serde::Serialize;
use std::time::Duration;

/// Summary of a window of duration samples, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleStatistics {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation (n - 1 denominator). Zero for a single sample.
    pub stdev: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
}

impl SampleStatistics {
    /// Returns `None` for an empty window.
    pub fn from_durations(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut secs: Vec<f64> = samples.iter().map(Duration::as_secs_f64).collect();
        secs.sort_by(f64::total_cmp);

        let count = secs.len();
        let mean = secs.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 0 {
            (secs[count / 2 - 1] + secs[count / 2]) / 2.0
        } else {
            secs[count / 2]
        };
        let variance = if count > 1 {
            secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (count - 1) as f64
        } else {
            0.0
        };

        Some(Self {
            count,
            mean,
            median,
            stdev: variance.sqrt(),
            variance,
            min: secs[0],
            max: secs[count - 1],
        })
    }
}
