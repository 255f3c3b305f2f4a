use thiserror::Error;

/// Failure of a single latency or throughput probe. These never escape a run;
/// the engine turns them into `Measurement::Unmeasured`.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("no host in target '{0}'")]
    MalformedTarget(String),

    #[error("host {host} unreachable: {reason}")]
    UnreachableHost { host: String, reason: String },

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("probe panicked: {0}")]
    Panicked(String),
}

impl ProbeError {
    pub fn unreachable<S: Into<String>>(host: &str, reason: S) -> Self {
        Self::UnreachableHost {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transport<S: Into<String>>(url: &str, reason: S) -> Self {
        Self::Transport {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}
