mod latency;
mod throughput;

pub use latency::{LatencyProbe, PingProbe};
pub use throughput::{HttpThroughputProbe, ThroughputProbe};

use crate::error::ProbeError;
use crate::model::{Measurement, ProbeConfig, ProbeEvent, ProbeResult, RunOutcome, Target};
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_FINISHED: u8 = 2;

/// Cooperative stop signal for a run. Cloned handles share the same flag.
///
/// The flag is polled before each target and between throughput chunks. A
/// request made while no run is in progress is ignored.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
    cancelled: Arc<AtomicBool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        if self.state.load(Ordering::SeqCst) == STATE_RUNNING {
            log::info!("Stopping probe run");
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn begin(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.state.store(STATE_FINISHED, Ordering::SeqCst);
    }
}

/// Receives run events in target order: for each target zero or more
/// `on_error`, then `on_result`, then `on_progress`; finally `on_done` once.
#[async_trait]
pub trait ProbeObserver: Send {
    async fn on_result(&mut self, result: &ProbeResult);
    async fn on_progress(&mut self, percent: u8);
    async fn on_error(&mut self, target: &Target, message: &str);
    async fn on_done(&mut self, outcome: RunOutcome);
}

#[async_trait]
impl ProbeObserver for mpsc::Sender<ProbeEvent> {
    async fn on_result(&mut self, result: &ProbeResult) {
        self.send(ProbeEvent::Result {
            result: result.clone(),
        })
        .await
        .ok();
    }

    async fn on_progress(&mut self, percent: u8) {
        self.send(ProbeEvent::Progress { percent }).await.ok();
    }

    async fn on_error(&mut self, target: &Target, message: &str) {
        self.send(ProbeEvent::Error {
            target: target.clone(),
            message: message.to_string(),
        })
        .await
        .ok();
    }

    async fn on_done(&mut self, outcome: RunOutcome) {
        self.send(ProbeEvent::Done { outcome }).await.ok();
    }
}

/// `round(100 * (index + 1) / total)`
pub fn progress_percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((index + 1) as f64 * 100.0 / total as f64).round().min(100.0) as u8
}

/// Sequential latency + throughput prober over a target list.
///
/// `run` and `spawn` consume the engine, so one instance drives exactly one run.
pub struct ProbeEngine<L = PingProbe, T = HttpThroughputProbe> {
    latency: L,
    throughput: T,
    cancel: CancelHandle,
}

impl ProbeEngine {
    pub fn new(cfg: &ProbeConfig) -> Result<Self> {
        Ok(Self::with_probes(
            PingProbe::new(cfg.ping_timeout),
            HttpThroughputProbe::new(cfg)?,
        ))
    }
}

impl<L, T> ProbeEngine<L, T>
where
    L: LatencyProbe + 'static,
    T: ThroughputProbe + 'static,
{
    pub fn with_probes(latency: L, throughput: T) -> Self {
        Self {
            latency,
            throughput,
            cancel: CancelHandle::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run on a separate tokio task. The run counts as started as soon as this
    /// returns, so a cancel issued right after takes effect before the first target.
    /// The task hands the observer back when it finishes.
    pub fn spawn<O>(self, targets: Vec<Target>, observer: O) -> JoinHandle<O>
    where
        O: ProbeObserver + 'static,
    {
        self.cancel.begin();
        tokio::spawn(async move {
            let mut observer = observer;
            self.drive(&targets, &mut observer).await;
            observer
        })
    }

    pub async fn run<O: ProbeObserver>(self, targets: &[Target], observer: &mut O) -> RunOutcome {
        self.cancel.begin();
        self.drive(targets, observer).await
    }

    async fn drive<O: ProbeObserver>(self, targets: &[Target], observer: &mut O) -> RunOutcome {
        log::info!("Starting probe run with {} targets", targets.len());

        let outcome = match AssertUnwindSafe(self.probe_all(targets, observer))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                log::error!("Probe run crashed: {}", panic_message(panic.as_ref()));
                RunOutcome::Crashed
            }
        };
        self.cancel.finish();

        match outcome {
            RunOutcome::Completed => log::info!("Probe run completed"),
            RunOutcome::Stopped => log::info!("Probe run stopped by user"),
            RunOutcome::Crashed => {}
        }

        if let Err(panic) = AssertUnwindSafe(observer.on_done(outcome))
            .catch_unwind()
            .await
        {
            log::error!("Done handler panicked: {}", panic_message(panic.as_ref()));
        }
        outcome
    }

    async fn probe_all<O: ProbeObserver>(&self, targets: &[Target], observer: &mut O) -> RunOutcome {
        let total = targets.len();
        for (index, target) in targets.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!("Run stopped before target {}/{}", index + 1, total);
                return RunOutcome::Stopped;
            }

            log::debug!("Testing URL {}/{}: {}", index + 1, total, target);
            let result = self.probe_target(index, target, observer).await;
            log::debug!(
                "Results for {}: ping={:?} speed={:?}",
                target,
                result.latency_ms.value(),
                result.throughput_mbps.value()
            );

            observer.on_result(&result).await;
            observer.on_progress(progress_percent(index, total)).await;
        }

        // A cancel that truncated the last target's read still stops the run
        if self.cancel.is_cancelled() {
            RunOutcome::Stopped
        } else {
            RunOutcome::Completed
        }
    }

    async fn probe_target<O: ProbeObserver>(
        &self,
        index: usize,
        target: &Target,
        observer: &mut O,
    ) -> ProbeResult {
        let mut errors: Vec<String> = Vec::new();

        let latency_ms = match isolate(self.latency.measure(target)).await {
            Ok(ms) => Measurement::Measured(ms),
            Err(e @ ProbeError::Panicked(_)) => {
                let msg = format!("Error testing {}: {}", target, e);
                log::error!("{}", msg);
                observer.on_error(target, &msg).await;
                errors.push(msg);
                Measurement::Unmeasured
            }
            Err(e) => {
                log::warn!("Ping test failed for {}: {}", target, e);
                Measurement::Unmeasured
            }
        };

        let throughput_mbps = match isolate(self.throughput.measure(target, &self.cancel)).await {
            Ok(sample) => {
                log::debug!(
                    "Read {} bytes from {} in {} ms{}",
                    sample.bytes,
                    target,
                    sample.duration_ms,
                    if sample.cancelled { " (stopped)" } else { "" }
                );
                Measurement::Measured(sample.mbps)
            }
            Err(e) => {
                let msg = match e {
                    ProbeError::Transport { .. } => e.to_string(),
                    _ => format!("Error testing {}: {}", target, e),
                };
                log::warn!("{}", msg);
                observer.on_error(target, &msg).await;
                errors.push(msg);
                Measurement::Unmeasured
            }
        };

        ProbeResult {
            index,
            target: target.clone(),
            latency_ms,
            throughput_mbps,
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }
}

/// Await a probe, turning a panic inside it into an error for this target only.
async fn isolate<F, V>(probe: F) -> Result<V, ProbeError>
where
    F: Future<Output = Result<V, ProbeError>>,
{
    AssertUnwindSafe(probe)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ProbeError::Panicked(panic_message(panic.as_ref()))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
