use crate::engine::CancelHandle;
use crate::error::ProbeError;
use crate::model::{ProbeConfig, Target};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::{Duration, Instant};

/// Elapsed time never counts as less than this.
const MIN_ELAPSED: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub bytes: u64,
    pub duration_ms: u64,
    pub mbps: f64,
    /// The read was cut short by cancellation; `mbps` is reported as zero.
    pub cancelled: bool,
}

#[async_trait]
pub trait ThroughputProbe: Send + Sync {
    async fn measure(
        &self,
        target: &Target,
        cancel: &CancelHandle,
    ) -> Result<ThroughputSample, ProbeError>;
}

pub fn throughput_sample(bytes: u64, duration: Duration) -> ThroughputSample {
    let secs = duration.max(MIN_ELAPSED).as_secs_f64();
    ThroughputSample {
        bytes,
        duration_ms: duration.as_millis() as u64,
        mbps: (bytes as f64 * 8.0) / (secs * 1_000_000.0),
        cancelled: false,
    }
}

fn cancelled_sample(bytes: u64, duration: Duration) -> ThroughputSample {
    ThroughputSample {
        bytes,
        duration_ms: duration.as_millis() as u64,
        mbps: 0.0,
        cancelled: true,
    }
}

/// Partial HTTP(S) download of the target URL.
pub struct HttpThroughputProbe {
    http: reqwest::Client,
    sample_bytes: u64,
    read_timeout: Duration,
}

impl HttpThroughputProbe {
    pub fn new(cfg: &ProbeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.download_timeout)
            .tcp_keepalive(Duration::from_secs(15))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            http,
            sample_bytes: cfg.sample_bytes,
            read_timeout: cfg.download_timeout,
        })
    }
}

#[async_trait]
impl ThroughputProbe for HttpThroughputProbe {
    async fn measure(
        &self,
        target: &Target,
        cancel: &CancelHandle,
    ) -> Result<ThroughputSample, ProbeError> {
        let url = target.as_str();
        log::debug!("Testing download speed for {}", url);

        let start = Instant::now();
        if cancel.is_cancelled() {
            log::debug!("Download test for {} skipped, run is stopping", url);
            return Ok(cancelled_sample(0, start.elapsed()));
        }

        let resp = match tokio::time::timeout(self.read_timeout, self.http.get(url).send()).await
        {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(ProbeError::transport(url, e.to_string())),
            Err(_) => return Err(ProbeError::transport(url, "timed out waiting for response")),
        };
        let resp = resp
            .error_for_status()
            .map_err(|e| ProbeError::transport(url, e.to_string()))?;

        let mut stream = resp.bytes_stream();
        let mut bytes = 0u64;
        loop {
            let next = tokio::time::timeout(self.read_timeout, stream.next())
                .await
                .map_err(|_| ProbeError::transport(url, "timed out reading response body"))?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| ProbeError::transport(url, e.to_string()))?;

            if cancel.is_cancelled() {
                log::debug!("Download test for {} stopped after {} bytes", url, bytes);
                return Ok(cancelled_sample(bytes, start.elapsed()));
            }

            bytes += chunk.len() as u64;
            if bytes >= self.sample_bytes {
                break;
            }
        }

        let sample = throughput_sample(bytes, start.elapsed());
        log::debug!("Download speed for {}: {:.2} Mbps", url, sample.mbps);
        Ok(sample)
    }
}
