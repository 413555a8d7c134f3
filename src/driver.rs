use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::probe::{Probe, ProbeSet};
use crate::stopwatch::RateStopwatch;

/// Bounded worker pool that repeatedly submits the probe set.
///
/// Construction only allocates; [`start`](Self::start) spawns the workers
/// and the control loop, [`drain`](Self::drain) stops intake, lets
/// in-flight and queued work finish within the configured grace period,
/// then aborts whatever remains. Drain is one-way and idempotent.
pub struct TaskDriver {
    name: String,
    probes: Arc<ProbeSet>,
    settings: DriverConfig,
    job_tx: Option<mpsc::Sender<Arc<Probe>>>,
    job_rx: Option<mpsc::Receiver<Arc<Probe>>>,
    draining: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    control: Option<JoinHandle<()>>,
}

impl TaskDriver {
    #[must_use]
    pub fn new(name: impl Into<String>, probes: Arc<ProbeSet>, settings: &DriverConfig) -> Self {
        let (job_tx, job_rx) = mpsc::channel(settings.queue_size.max(1));
        Self {
            name: name.into(),
            probes,
            settings: settings.clone(),
            job_tx: Some(job_tx),
            job_rx: Some(job_rx),
            draining: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            control: None,
        }
    }

    /// Spawns the worker pool and the control loop. Must be called exactly
    /// once, before any drain.
    pub fn start(&mut self) {
        let Some(job_rx) = self.job_rx.take() else {
            return;
        };
        let Some(job_tx) = self.job_tx.clone() else {
            return;
        };

        let shared_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        for _ in 0..self.settings.workers.max(1) {
            self.workers.push(tokio::spawn(worker_loop(shared_rx.clone())));
        }

        self.control = Some(tokio::spawn(control_loop(
            self.name.clone(),
            self.probes.clone(),
            job_tx,
            self.draining.clone(),
            self.settings.clone(),
        )));
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn reached_minimum_stats_population(&self) -> bool {
        self.probes.all_reached_minimum_population()
    }

    /// Stops intake and shuts the pool down gracefully. Work already
    /// queued still runs, bounded by the drain grace period; stragglers
    /// are aborted after it.
    pub async fn drain(&mut self) {
        let already = self.draining.swap(true, Ordering::AcqRel);
        if !already {
            info!(driver = %self.name, "draining");
        }

        // Closing our sender half; the control loop drops its clone on
        // exit, after which the workers see the channel close once the
        // queue is empty.
        self.job_tx.take();
        self.job_rx.take();

        let grace = Duration::from_millis(self.settings.drain_grace_ms);
        let deadline = time::Instant::now() + grace;

        if let Some(mut control) = self.control.take() {
            if time::timeout_at(deadline, &mut control).await.is_err() {
                warn!(driver = %self.name, "control loop outlived drain grace, aborting");
                control.abort();
            }
        }

        for mut worker in std::mem::take(&mut self.workers) {
            if time::timeout_at(deadline, &mut worker).await.is_err() {
                warn!(driver = %self.name, "timed out waiting for drain, aborting worker");
                worker.abort();
            }
        }
    }

    /// Drains, then reports the joined CSV of all probes. Stable across
    /// repeated calls.
    pub async fn drain_and_collect_stats(&mut self) -> String {
        self.drain().await;
        self.probes.to_csv()
    }
}

async fn worker_loop(jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<Probe>>>>) {
    loop {
        let job = { jobs.lock().await.recv().await };
        match job {
            Some(probe) => probe.run_once(),
            None => return,
        }
    }
}

async fn control_loop(
    name: String,
    probes: Arc<ProbeSet>,
    job_tx: mpsc::Sender<Arc<Probe>>,
    draining: Arc<AtomicBool>,
    settings: DriverConfig,
) {
    info!(driver = %name, "starting up operations");
    let mut stats_stopwatch =
        RateStopwatch::new(Duration::from_millis(settings.stats_report_interval_ms));
    let backoff = Duration::from_millis(settings.submit_backoff_ms);

    'rounds: while !draining.load(Ordering::Acquire) {
        for probe in probes.iter() {
            if draining.load(Ordering::Acquire) {
                break 'rounds;
            }
            if !submit(&job_tx, &draining, probe.clone(), backoff).await {
                break 'rounds;
            }
            if !draining.load(Ordering::Acquire) && stats_stopwatch.is_time_over() {
                info!(driver = %name, stats = %probes.to_stats_string(), "stats report");
            }
        }
        tokio::task::yield_now().await;
    }

    debug!(driver = %name, "control loop exiting");
}

/// Attempts enqueue, backing off on saturation. Returns false when the
/// driver is draining or the queue has closed; work is never dropped
/// silently.
async fn submit(
    job_tx: &mpsc::Sender<Arc<Probe>>,
    draining: &AtomicBool,
    probe: Arc<Probe>,
    backoff: Duration,
) -> bool {
    let mut job = probe;
    loop {
        if draining.load(Ordering::Acquire) {
            return false;
        }
        match job_tx.try_send(job) {
            Ok(()) => return true,
            Err(TrySendError::Full(returned)) => {
                job = returned;
                debug!("job queue saturated, backing off");
                time::sleep(backoff).await;
            }
            Err(TrySendError::Closed(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tokio::time;

    use super::TaskDriver;
    use crate::config::DriverConfig;
    use crate::probe::{Operation, Probe, ProbeError, ProbeSet};
    use crate::stats::WindowedStats;

    struct CountingOp {
        invocations: Arc<AtomicU64>,
        delay: Duration,
    }

    impl Operation for CountingOp {
        fn name(&self) -> &str {
            "counting"
        }

        fn invoke(&self) -> Result<(), ProbeError> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.invocations.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn counting_set(delay: Duration) -> (Arc<ProbeSet>, Arc<AtomicU64>) {
        let invocations = Arc::new(AtomicU64::new(0));
        let probe = Arc::new(Probe::new(
            Box::new(CountingOp {
                invocations: invocations.clone(),
                delay,
            }),
            true,
            WindowedStats::new(64, 25, 10.0),
        ));
        (Arc::new(ProbeSet::new(vec![probe])), invocations)
    }

    fn settings() -> DriverConfig {
        DriverConfig {
            workers: 2,
            queue_size: 4,
            submit_backoff_ms: 10,
            drain_grace_ms: 500,
            stats_report_interval_ms: 60_000,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_probe_executions_after_drain() {
        let (probes, invocations) = counting_set(Duration::ZERO);
        let mut driver = TaskDriver::new("test", probes, &settings());
        driver.start();

        time::sleep(Duration::from_millis(100)).await;
        driver.drain().await;
        assert!(driver.is_draining());

        let after_drain = invocations.load(Ordering::Acquire);
        assert!(after_drain > 0);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(invocations.load(Ordering::Acquire), after_drain);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drain_and_collect_stats_is_stable() {
        let (probes, _) = counting_set(Duration::ZERO);
        let mut driver = TaskDriver::new("test", probes, &settings());
        driver.start();

        time::sleep(Duration::from_millis(50)).await;
        let first = driver.drain_and_collect_stats().await;
        let second = driver.drain_and_collect_stats().await;
        assert_eq!(first, second);
        assert!(first.starts_with("counting,"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saturated_pool_backs_off_and_drain_stays_bounded() {
        let (probes, invocations) = counting_set(Duration::from_millis(30));
        let mut driver = TaskDriver::new(
            "test",
            probes,
            &DriverConfig {
                workers: 1,
                queue_size: 1,
                submit_backoff_ms: 5,
                drain_grace_ms: 100,
                ..settings()
            },
        );
        driver.start();

        time::sleep(Duration::from_millis(150)).await;
        let begun = std::time::Instant::now();
        driver.drain().await;

        assert!(invocations.load(Ordering::Acquire) > 0);
        assert!(begun.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn drain_before_start_is_a_safe_no_op() {
        let (probes, invocations) = counting_set(Duration::ZERO);
        let mut driver = TaskDriver::new("test", probes, &settings());

        driver.drain().await;
        driver.drain().await;

        assert!(driver.is_draining());
        assert_eq!(invocations.load(Ordering::Acquire), 0);
    }
}
