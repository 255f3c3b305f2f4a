use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default bytes read per throughput sample (100 KiB).
pub const DEFAULT_SAMPLE_BYTES: u64 = 100 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub download_timeout: Duration,
    pub sample_bytes: u64,
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(2),
            download_timeout: Duration::from_secs(10),
            sample_bytes: DEFAULT_SAMPLE_BYTES,
            user_agent: format!("endpoint-probe/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// One endpoint to probe, as it appeared in the input (trimmed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    /// Returns `None` when the string is empty after trimming.
    pub fn new(raw: &str) -> Option<Self> {
        let t = raw.trim();
        if t.is_empty() {
            None
        } else {
            Some(Self(t.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A probe value, or the absence of one. `Unmeasured` is never the same as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub enum Measurement {
    Measured(f64),
    Unmeasured,
}

impl Measurement {
    pub fn value(self) -> Option<f64> {
        match self {
            Measurement::Measured(v) => Some(v),
            Measurement::Unmeasured => None,
        }
    }

    pub fn is_measured(self) -> bool {
        matches!(self, Measurement::Measured(_))
    }

    /// Two-decimal rendering used by exports and the text table.
    pub fn display(self) -> String {
        match self {
            Measurement::Measured(v) => format!("{:.2}", v),
            Measurement::Unmeasured => "Error".to_string(),
        }
    }
}

impl From<Option<f64>> for Measurement {
    fn from(v: Option<f64>) -> Self {
        v.map(Measurement::Measured).unwrap_or(Measurement::Unmeasured)
    }
}

impl From<Measurement> for Option<f64> {
    fn from(m: Measurement) -> Self {
        m.value()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Zero-based position of the target in the input list.
    pub index: usize,
    pub target: Target,
    pub latency_ms: Measurement,
    pub throughput_mbps: Measurement,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    Stopped,
    Crashed,
}

/// Event stream of a run, as delivered over a channel.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    Result { result: ProbeResult },
    Progress { percent: u8 },
    Error { target: Target, message: String },
    Done { outcome: RunOutcome },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp_utc: String,
    pub run_id: String,
    pub total_targets: usize,
    pub outcome: Option<RunOutcome>,
    pub results: Vec<ProbeResult>,
    #[serde(default)]
    pub errors: Vec<String>,
}
