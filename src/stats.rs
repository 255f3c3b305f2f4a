use crate::model::{Measurement, ProbeResult};
use hdrhistogram::Histogram;

#[derive(Debug, Default, Clone)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn mean(&self) -> Option<f64> {
        if self.n == 0 {
            None
        } else {
            Some(self.mean)
        }
    }

    pub fn stddev(&self) -> Option<f64> {
        if self.n < 2 {
            None
        } else {
            Some((self.m2 / ((self.n - 1) as f64)).sqrt())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueSummary {
    pub count: usize,
    pub min: Option<f64>,
    pub median: Option<f64>,
    pub mean: Option<f64>,
    pub max: Option<f64>,
    pub stddev: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportSummary {
    pub processed: usize,
    pub latency_ms: ValueSummary,
    pub throughput_mbps: ValueSummary,
}

/// Summarise the measured values of a report. Unmeasured entries are skipped.
pub fn summarize(results: &[ProbeResult]) -> ReportSummary {
    let latencies: Vec<f64> = results.iter().filter_map(|r| r.latency_ms.value()).collect();
    let speeds: Vec<f64> = results
        .iter()
        .filter_map(|r| r.throughput_mbps.value())
        .collect();
    ReportSummary {
        processed: results.len(),
        latency_ms: value_summary(&latencies),
        throughput_mbps: value_summary(&speeds),
    }
}

fn value_summary(values: &[f64]) -> ValueSummary {
    if values.is_empty() {
        return ValueSummary::default();
    }

    let mut online = OnlineStats::default();
    // HDRHistogram wants integers; store thousandths to keep three decimals.
    let mut h = Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3)
        .expect("static histogram bounds are valid");
    for &v in values {
        online.push(v);
        let scaled = (v * 1000.0).round().clamp(1.0, 3_600_000_000.0) as u64;
        let _ = h.record(scaled);
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    ValueSummary {
        count: values.len(),
        min: Some(min),
        median: Some((h.value_at_quantile(0.50) as f64) / 1000.0),
        mean: online.mean(),
        max: Some(max),
        stddev: online.stddev(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    Good,
    Average,
    Poor,
}

impl Grade {
    pub fn label(self) -> &'static str {
        match self {
            Grade::Good => "good",
            Grade::Average => "average",
            Grade::Poor => "poor",
        }
    }
}

pub fn latency_grade(latency: Measurement) -> Option<Grade> {
    let ms = latency.value()?;
    Some(if ms < 100.0 {
        Grade::Good
    } else if ms < 200.0 {
        Grade::Average
    } else {
        Grade::Poor
    })
}

pub fn throughput_grade(throughput: Measurement) -> Option<Grade> {
    let mbps = throughput.value()?;
    Some(if mbps > 10.0 {
        Grade::Good
    } else if mbps > 5.0 {
        Grade::Average
    } else {
        Grade::Poor
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Target;

    fn result(latency: Option<f64>, mbps: Option<f64>) -> ProbeResult {
        ProbeResult {
            index: 0,
            target: Target::new("http://x.example").unwrap(),
            latency_ms: latency.into(),
            throughput_mbps: mbps.into(),
            error: None,
        }
    }

    #[test]
    fn test_online_stats() {
        let mut s = OnlineStats::default();
        assert_eq!(s.mean(), None);
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.push(x);
        }
        assert!((s.mean().unwrap() - 5.0).abs() < 1e-9);
        assert!((s.stddev().unwrap() - 2.138_089_935).abs() < 1e-6);
    }

    #[test]
    fn test_summarize_skips_unmeasured() {
        let results = vec![
            result(Some(10.0), Some(20.0)),
            result(None, Some(0.0)),
            result(Some(30.0), None),
            result(Some(20.0), Some(40.0)),
        ];
        let s = summarize(&results);
        assert_eq!(s.processed, 4);
        assert_eq!(s.latency_ms.count, 3);
        assert_eq!(s.latency_ms.min, Some(10.0));
        assert_eq!(s.latency_ms.max, Some(30.0));
        assert!((s.latency_ms.median.unwrap() - 20.0).abs() < 0.05);
        assert!((s.latency_ms.stddev.unwrap() - 10.0).abs() < 1e-9);
        // A cancelled zero still counts as a measurement
        assert_eq!(s.throughput_mbps.count, 3);
        assert!((s.throughput_mbps.mean.unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_empty() {
        let s = summarize(&[]);
        assert_eq!(s.processed, 0);
        assert_eq!(s.latency_ms, ValueSummary::default());
    }

    #[test]
    fn test_grades() {
        assert_eq!(latency_grade(Measurement::Measured(50.0)), Some(Grade::Good));
        assert_eq!(latency_grade(Measurement::Measured(150.0)), Some(Grade::Average));
        assert_eq!(latency_grade(Measurement::Measured(250.0)), Some(Grade::Poor));
        assert_eq!(latency_grade(Measurement::Unmeasured), None);
        assert_eq!(throughput_grade(Measurement::Measured(11.0)), Some(Grade::Good));
        assert_eq!(throughput_grade(Measurement::Measured(6.0)), Some(Grade::Average));
        assert_eq!(throughput_grade(Measurement::Measured(0.0)), Some(Grade::Poor));
    }
}
