use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::driver::TaskDriver;
use crate::health::ClusterHealthMonitor;
use crate::probe::{FillOp, IsEmptyOp, KeyBoundary, Probe, ProbeSet, PutIfAbsentOp};
use crate::report::{ProbeReport, ReportError, RunArtifact, TestResultRecord, write_run_artifact};
use crate::responder::ProtocolResponder;
use crate::stats::WindowedStats;
use crate::stopwatch::RateStopwatch;
use crate::store::{KvStore, StoreError, value_payload};

const FILL_POLL_SLICE_MS: u64 = 50;

/// Test timeline. Strictly linear; a stage never regresses and is never
/// skipped. The only way back to `Load` is the full per-run reset after
/// the peer acknowledges the results.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestStage {
    Load,
    ReadyForChaosStart,
    ChaosStarted,
    ReadyForChaosStop,
    ChaosStopped,
    Draining,
    Reported,
    Finished,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("report error: {0}")]
    Report(#[from] ReportError),
    #[error("invalid test state: {message}")]
    InvalidState { message: &'static str },
}

/// Clears the store and drives unconditional sets until the target entry
/// count is reached, logging map size and a smoothed fill rate on the
/// fill-check cadence. Returns the key range that was written.
///
/// # Errors
///
/// Returns [`OrchestratorError::Store`] when clearing or sizing the store
/// fails.
pub async fn populate_store(
    store: &Arc<dyn KvStore>,
    config: &AppConfig,
) -> Result<KeyBoundary, OrchestratorError> {
    info!("clearing map before load");
    store.clear()?;

    let target = config.map.target_entries;
    #[allow(clippy::cast_precision_loss)]
    let approx_mb =
        target as f64 * config.map.value_size_bytes as f64 / 1024.0 / 1024.0;
    info!(
        target_entries = target,
        approx_mb = format_args!("{approx_mb:.1}"),
        "target map size"
    );

    let payload = value_payload(config.map.value_size_bytes, config.map.payload_seed);
    let fill = FillOp::new(store.clone(), payload, config.map.first_key);

    let probes = Arc::new(ProbeSet::new(vec![Arc::new(Probe::new(
        Box::new(fill.clone()),
        true,
        windowed_stats(config),
    ))]));
    let mut loader = TaskDriver::new("maploader", probes, &config.driver);
    loader.start();

    let mut fullness =
        RateStopwatch::new(Duration::from_millis(config.test.fill_check_interval_ms));
    let mut size = 0_u64;
    while size < target {
        time::sleep(Duration::from_millis(FILL_POLL_SLICE_MS)).await;
        if fullness.is_time_over() {
            let current = store.len()?;
            fullness.add_units(current.saturating_sub(size));
            size = current;
            info!(
                map_size = size,
                rate_per_second = format_args!("{:.0}", fullness.rate_per_second()),
                "map fill progress"
            );
        }
    }

    loader.drain().await;
    let boundary = fill.key_boundary();
    info!(map_size = size, "map populated");
    Ok(boundary)
}

/// Builds the steady-state probe set: an emptiness check plus
/// put-if-absent cycling over the filled key range.
#[must_use]
pub fn steady_state_probes(
    store: &Arc<dyn KvStore>,
    boundary: KeyBoundary,
    config: &AppConfig,
) -> Arc<ProbeSet> {
    let payload = value_payload(config.map.value_size_bytes, config.map.payload_seed);
    Arc::new(ProbeSet::new(vec![
        Arc::new(Probe::new(
            Box::new(IsEmptyOp::new(store.clone())),
            false,
            windowed_stats(config),
        )),
        Arc::new(Probe::new(
            Box::new(PutIfAbsentOp::new(store.clone(), payload, boundary)),
            false,
            windowed_stats(config),
        )),
    ]))
}

fn windowed_stats(config: &AppConfig) -> WindowedStats {
    WindowedStats::new(
        config.stats.window_capacity,
        config.stats.min_population_percent,
        config.stats.outlier_threshold_stddev,
    )
}

/// The top-level state machine. One `step()` per poll tick evaluates the
/// current stage's guard; guards never block the poll loop — an absent
/// signal simply leaves the stage unchanged until the next tick.
pub struct TestOrchestrator {
    config: AppConfig,
    probes: Arc<ProbeSet>,
    driver: TaskDriver,
    health: Arc<ClusterHealthMonitor>,
    responder: Arc<ProtocolResponder>,
    stage: TestStage,
    local_mode: bool,
    chaos_started_at: Option<Instant>,
    baseline_csv: Option<String>,
    baseline_reports: Vec<ProbeReport>,
}

impl TestOrchestrator {
    #[must_use]
    pub fn new(
        config: AppConfig,
        probes: Arc<ProbeSet>,
        health: Arc<ClusterHealthMonitor>,
        responder: Arc<ProtocolResponder>,
        local_mode: bool,
    ) -> Self {
        let driver = TaskDriver::new("latency-test", probes.clone(), &config.driver);
        Self {
            config,
            probes,
            driver,
            health,
            responder,
            stage: TestStage::Load,
            local_mode,
            chaos_started_at: None,
            baseline_csv: None,
            baseline_reports: Vec::new(),
        }
    }

    #[must_use]
    pub const fn stage(&self) -> TestStage {
        self.stage
    }

    /// Runs the driver and the poll loop until the timeline reaches
    /// `Finished`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when a phase action (drain capture,
    /// result publication, artifact write) fails.
    pub async fn run(&mut self) -> Result<(), OrchestratorError> {
        info!("starting test driver");
        self.driver.start();
        info!(
            probes = %self.probes.to_stats_string(),
            "running operations until minimum stats population is reached"
        );

        let mut poll = time::interval(Duration::from_millis(
            self.config.test.state_check_interval_ms,
        ));
        let mut health_stopwatch = RateStopwatch::new(Duration::from_millis(
            self.config.test.migration_check_interval_ms,
        ));

        while self.stage != TestStage::Finished {
            poll.tick().await;

            if health_stopwatch.is_time_over() {
                self.health.log_if_missing_members();
                self.health.log_active_migrations();
            }

            self.step().await?;
        }

        info!("test driver finished");
        Ok(())
    }

    /// Evaluates one poll tick of the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] when an advance action fails; guard
    /// evaluation itself never errors.
    pub async fn step(&mut self) -> Result<(), OrchestratorError> {
        match self.stage {
            TestStage::Load => self.step_load(),
            TestStage::ReadyForChaosStart => self.step_ready_for_chaos_start(),
            TestStage::ChaosStarted => self.step_chaos_started(),
            TestStage::ReadyForChaosStop => self.step_ready_for_chaos_stop(),
            TestStage::ChaosStopped => self.step_chaos_stopped().await,
            TestStage::Draining => self.publish_results(),
            TestStage::Reported => Ok(self.step_reported()),
            TestStage::Finished => Ok(()),
        }
    }

    fn step_load(&mut self) -> Result<(), OrchestratorError> {
        if !self.driver.reached_minimum_stats_population() {
            return Ok(());
        }

        info!("capturing baseline stats with good network");
        self.baseline_csv = Some(self.probes.to_csv());
        self.baseline_reports = capture_reports(&self.probes);
        info!(stats = %self.probes.to_stats_string(), "baseline stats");

        self.responder.set_ready_for_chaos_start();
        if self.local_mode {
            let responder = self.responder.clone();
            let delay = Duration::from_millis(self.config.local.chaos_start_delay_ms);
            tokio::spawn(async move {
                time::sleep(delay).await;
                responder.set_chaos_start_time();
            });
        }

        self.stage = TestStage::ReadyForChaosStart;
        Ok(())
    }

    fn step_ready_for_chaos_start(&mut self) -> Result<(), OrchestratorError> {
        let Some(started_at) = self.responder.chaos_start_time() else {
            return Ok(());
        };

        // Block the peer from starting another iteration mid-run.
        self.responder.clear_ready_for_chaos_start();
        info!("resetting stats after chaos start");
        self.probes.clear_all_stats();
        debug!(stats = %self.probes.to_stats_string(), "stats after reset");

        self.chaos_started_at = Some(started_at);
        self.stage = TestStage::ChaosStarted;
        Ok(())
    }

    fn step_chaos_started(&mut self) -> Result<(), OrchestratorError> {
        let Some(started_at) = self.chaos_started_at else {
            return Err(OrchestratorError::InvalidState {
                message: "chaos running without a start timestamp",
            });
        };

        let chaos_duration = Duration::from_millis(self.config.test.chaos_duration_ms);
        if started_at.elapsed() < chaos_duration {
            return Ok(());
        }

        info!("signaling that the chaos period should end");
        self.responder.clear_ready_for_chaos_start();
        self.responder.set_ready_for_chaos_stop();
        if self.local_mode {
            self.responder.set_chaos_stopped();
        }

        self.stage = TestStage::ReadyForChaosStop;
        Ok(())
    }

    fn step_ready_for_chaos_stop(&mut self) -> Result<(), OrchestratorError> {
        if !self.responder.is_chaos_stopped() {
            return Ok(());
        }

        self.responder.clear_ready_for_chaos_stop();
        info!("chaos stopped, waiting for migration completion");
        if self.local_mode {
            let health = self.health.clone();
            let delay = Duration::from_millis(self.config.local.migration_settle_delay_ms);
            tokio::spawn(async move {
                time::sleep(delay).await;
                health.migration_finished();
            });
        }

        self.stage = TestStage::ChaosStopped;
        Ok(())
    }

    async fn step_chaos_stopped(&mut self) -> Result<(), OrchestratorError> {
        let settled = self.health.last_migration_end().is_some()
            && !self.health.is_migration_active()
            && !self.health.cluster_is_missing_members();
        if !settled {
            return Ok(());
        }

        info!("draining remaining tasks");
        let _ = self.driver.drain_and_collect_stats().await;
        self.stage = TestStage::Draining;

        // Publication is immediate; draining is not an awaited stage.
        self.publish_results()
    }

    fn publish_results(&mut self) -> Result<(), OrchestratorError> {
        let Some(started_at) = self.chaos_started_at else {
            return Err(OrchestratorError::InvalidState {
                message: "publishing results without a chaos start timestamp",
            });
        };
        let Some(migration_end) = self.health.last_migration_end() else {
            return Err(OrchestratorError::InvalidState {
                message: "publishing results without a migration completion",
            });
        };
        let Some(baseline_csv) = self.baseline_csv.clone() else {
            return Err(OrchestratorError::InvalidState {
                message: "publishing results without a baseline capture",
            });
        };

        let record = TestResultRecord {
            target_entries: self.config.map.target_entries,
            value_size_bytes: self.config.map.value_size_bytes as u64,
            chaos_duration_ms: self.config.test.chaos_duration_ms,
            settle_seconds: migration_end.saturating_duration_since(started_at).as_secs(),
            baseline_csv,
            post_chaos_csv: self.probes.to_csv(),
        };

        info!("clearing last migration and sending test results");
        self.responder.set_test_result(record.to_csv());
        self.health.clear_last_migration();

        if let Some(path) = self.config.test.artifact_path.clone() {
            let artifact = RunArtifact {
                result: record,
                baseline: std::mem::take(&mut self.baseline_reports),
                post_chaos: capture_reports(&self.probes),
            };
            write_run_artifact(&path, &artifact)?;
            info!(path = %path.display(), "run artifact written");
        }

        if self.local_mode {
            self.responder.set_test_result_received();
        }

        self.stage = TestStage::Reported;
        Ok(())
    }

    fn step_reported(&mut self) {
        if !self.responder.is_test_result_received() {
            return;
        }

        info!("peer received test results");
        self.probes.clear_all_stats();
        self.responder.reset_test();
        self.chaos_started_at = None;
        self.baseline_csv = None;
        self.baseline_reports = Vec::new();

        if self.config.test.repeat {
            info!("restarting test run");
            self.driver = TaskDriver::new("latency-test", self.probes.clone(), &self.config.driver);
            self.driver.start();
            self.stage = TestStage::Load;
        } else {
            self.stage = TestStage::Finished;
        }
    }
}

fn capture_reports(probes: &ProbeSet) -> Vec<ProbeReport> {
    probes
        .iter()
        .map(|probe| ProbeReport {
            name: probe.name().to_owned(),
            snapshot: probe.snapshot(),
        })
        .collect()
}
