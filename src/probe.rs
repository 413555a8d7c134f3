use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use crate::stats::{Outlier, StatsSnapshot, WindowedStats};
use crate::store::{Key, KvStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("probe precondition violated: {0}")]
    Precondition(&'static str),
}

/// One repeatable timed operation against the store under test.
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self) -> Result<(), ProbeError>;
}

/// Key range handed from the fill phase to the steady-state probes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KeyBoundary {
    pub first_key: Key,
    pub last_key: Key,
}

/// Times an [`Operation`], recording exactly one latency sample per run
/// whether it succeeds or fails. Failures are swallowed into the
/// statistics, never propagated. The quiet flag suppresses outlier
/// diagnostics for operations whose outliers are expected and
/// uninteresting (bulk fill).
pub struct Probe {
    op: Box<dyn Operation>,
    quiet: bool,
    stats: Mutex<WindowedStats>,
}

impl Probe {
    #[must_use]
    pub fn new(op: Box<dyn Operation>, quiet: bool, stats: WindowedStats) -> Self {
        Self {
            op,
            quiet,
            stats: Mutex::new(stats),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.op.name()
    }

    /// Runs the operation once and records its latency. The stats mutex
    /// serializes recording against [`clear_stats`](Self::clear_stats).
    pub fn run_once(&self) {
        let start = Instant::now();
        let outcome = self.op.invoke();
        let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

        if let Err(error) = &outcome {
            warn!(probe = self.name(), %error, "operation failed");
        }

        let judgment = self
            .stats
            .lock()
            .record(elapsed_ms, outcome.is_err());

        if self.quiet {
            return;
        }
        match judgment {
            Some(Outlier::Deviant {
                deviations,
                value_ms,
                mean_ms,
                stddev_ms,
            }) => warn!(
                probe = self.name(),
                deviations,
                value_ms = format_args!("{value_ms:.2}"),
                mean_ms = format_args!("{mean_ms:.2}"),
                stddev_ms = format_args!("{stddev_ms:.2}"),
                "latency outlier"
            ),
            Some(Outlier::ZeroSpread { value_ms, mean_ms }) => warn!(
                probe = self.name(),
                value_ms = format_args!("{value_ms:.2}"),
                mean_ms = format_args!("{mean_ms:.2}"),
                "latency outlier against zero-spread window"
            ),
            None => {}
        }
    }

    #[must_use]
    pub fn has_reached_minimum_population(&self) -> bool {
        self.stats.lock().is_ready()
    }

    /// Starts a fresh measurement epoch. Race-free against concurrent
    /// [`run_once`](Self::run_once) recording.
    pub fn clear_stats(&self) {
        self.stats.lock().reset();
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.lock().snapshot()
    }

    /// `name()->{N=.. µ=.. σ=.. [min..max]} [k FAILED]`
    #[must_use]
    pub fn to_stats_string(&self) -> String {
        let snapshot = self.snapshot();
        let mut rendered = format!("{}()->{{N={}", self.name(), snapshot.count);
        if snapshot.count > 0 {
            rendered.push_str(&format!(
                " µ={:.2} σ={:.2} [{:.2}..{:.2}]",
                snapshot.mean_ms, snapshot.stddev_ms, snapshot.min_ms, snapshot.max_ms
            ));
        }
        rendered.push('}');
        if snapshot.failed_count > 0 {
            rendered.push_str(&format!(" [{} FAILED]", snapshot.failed_count));
        }
        rendered
    }

    /// `name,count,mean,stddev,min,max` with rounded millisecond fields.
    #[must_use]
    pub fn to_csv(&self) -> String {
        format!("{},{}", self.name(), self.snapshot().to_csv())
    }
}

/// Ordered set of probes driven together and reported together.
#[derive(Clone, Default)]
pub struct ProbeSet {
    probes: Vec<Arc<Probe>>,
}

impl ProbeSet {
    #[must_use]
    pub fn new(probes: Vec<Arc<Probe>>) -> Self {
        Self { probes }
    }

    pub fn push(&mut self, probe: Arc<Probe>) {
        self.probes.push(probe);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Probe>> {
        self.probes.iter()
    }

    #[must_use]
    pub fn all_reached_minimum_population(&self) -> bool {
        self.probes
            .iter()
            .all(|probe| probe.has_reached_minimum_population())
    }

    pub fn clear_all_stats(&self) {
        for probe in &self.probes {
            probe.clear_stats();
        }
    }

    #[must_use]
    pub fn to_stats_string(&self) -> String {
        self.probes
            .iter()
            .map(|probe| probe.to_stats_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    #[must_use]
    pub fn to_csv(&self) -> String {
        self.probes
            .iter()
            .map(|probe| probe.to_csv())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Asserts the map under load is non-empty. An empty map is a broken test
/// precondition and is recorded as a probe failure.
pub struct IsEmptyOp {
    store: Arc<dyn KvStore>,
}

impl IsEmptyOp {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

impl Operation for IsEmptyOp {
    fn name(&self) -> &str {
        "is_empty"
    }

    fn invoke(&self) -> Result<(), ProbeError> {
        if self.store.is_empty()? {
            return Err(ProbeError::Precondition("map is empty under load"));
        }
        Ok(())
    }
}

/// Cycles `put_if_absent` through `[first_key, last_key)`, wrapping from
/// the last key back to the first. Every key in the range was written by
/// the fill phase, so a key found absent is a failure of the probe's own
/// fill invariant.
pub struct PutIfAbsentOp {
    store: Arc<dyn KvStore>,
    value: String,
    first_key: Key,
    last_key: Key,
    next_key: AtomicI64,
}

impl PutIfAbsentOp {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, value: String, boundary: KeyBoundary) -> Self {
        Self {
            store,
            value,
            first_key: boundary.first_key,
            last_key: boundary.last_key,
            next_key: AtomicI64::new(boundary.first_key),
        }
    }

    fn take_next_key(&self) -> Key {
        let first = self.first_key;
        let last = self.last_key;
        self.next_key
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |key| {
                let advanced = key + 1;
                Some(if advanced == last { first } else { advanced })
            })
            .unwrap_or(first)
    }
}

impl Operation for PutIfAbsentOp {
    fn name(&self) -> &str {
        "put_if_absent"
    }

    fn invoke(&self) -> Result<(), ProbeError> {
        let key = self.take_next_key();
        let existing = self.store.put_if_absent(key, self.value.clone())?;
        if existing.is_none() {
            return Err(ProbeError::Precondition("filled key was absent"));
        }
        Ok(())
    }
}

/// Unconditional `set` over monotonically increasing keys; tracks the last
/// key written so the boundary can be handed to [`PutIfAbsentOp`]. Clones
/// share the key counters, letting the fill phase keep a handle for
/// boundary reads after the operation is boxed into its probe.
#[derive(Clone)]
pub struct FillOp {
    store: Arc<dyn KvStore>,
    value: String,
    first_key: Key,
    next_key: Arc<AtomicI64>,
    last_key: Arc<AtomicI64>,
}

impl FillOp {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, value: String, first_key: Key) -> Self {
        Self {
            store,
            value,
            first_key,
            next_key: Arc::new(AtomicI64::new(first_key)),
            last_key: Arc::new(AtomicI64::new(first_key)),
        }
    }

    #[must_use]
    pub fn key_boundary(&self) -> KeyBoundary {
        KeyBoundary {
            first_key: self.first_key,
            last_key: self.last_key.load(Ordering::Acquire),
        }
    }
}

impl Operation for FillOp {
    fn name(&self) -> &str {
        "set"
    }

    fn invoke(&self) -> Result<(), ProbeError> {
        let key = self.next_key.fetch_add(1, Ordering::AcqRel);
        self.store.set(key, self.value.clone())?;
        self.last_key.fetch_max(key, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        FillOp, IsEmptyOp, KeyBoundary, Operation, Probe, ProbeError, ProbeSet, PutIfAbsentOp,
    };
    use crate::stats::WindowedStats;
    use crate::store::{KvStore, MemoryStore, StoreError};

    fn probe(op: Box<dyn Operation>) -> Probe {
        Probe::new(op, false, WindowedStats::new(16, 25, 10.0))
    }

    struct FailingStore;

    impl KvStore for FailingStore {
        fn get(&self, _key: i64) -> Result<Option<String>, StoreError> {
            Err(unavailable())
        }

        fn set(&self, _key: i64, _value: String) -> Result<(), StoreError> {
            Err(unavailable())
        }

        fn put_if_absent(&self, _key: i64, _value: String) -> Result<Option<String>, StoreError> {
            Err(unavailable())
        }

        fn clear(&self) -> Result<(), StoreError> {
            Err(unavailable())
        }

        fn len(&self) -> Result<u64, StoreError> {
            Err(unavailable())
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable {
            reason: "injected".to_owned(),
        }
    }

    #[test]
    fn every_run_records_exactly_one_sample_even_on_failure() {
        let probe = probe(Box::new(IsEmptyOp::new(Arc::new(FailingStore))));

        for _ in 0..3 {
            probe.run_once();
        }

        let snapshot = probe.snapshot();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.failed_count, 3);
    }

    #[test]
    fn is_empty_probe_fails_on_empty_map() {
        let store = Arc::new(MemoryStore::new());
        let op = IsEmptyOp::new(store.clone());

        assert!(matches!(op.invoke(), Err(ProbeError::Precondition(_))));

        assert!(store.set(1, "v".to_owned()).is_ok());
        assert!(op.invoke().is_ok());
    }

    #[test]
    fn put_if_absent_wraps_from_last_key_to_first() {
        let store = Arc::new(MemoryStore::new());
        for key in 10..13 {
            assert!(store.set(key, "seed".to_owned()).is_ok());
        }

        let op = PutIfAbsentOp::new(
            store,
            "v".to_owned(),
            KeyBoundary {
                first_key: 10,
                last_key: 13,
            },
        );

        // Two full cycles over {10, 11, 12}: every key present, no failures.
        for _ in 0..6 {
            assert!(op.invoke().is_ok());
        }
    }

    #[test]
    fn put_if_absent_flags_missing_key_as_precondition_failure() {
        let store = Arc::new(MemoryStore::new());
        let op = PutIfAbsentOp::new(
            store,
            "v".to_owned(),
            KeyBoundary {
                first_key: 0,
                last_key: 4,
            },
        );

        assert!(matches!(op.invoke(), Err(ProbeError::Precondition(_))));
    }

    #[test]
    fn fill_tracks_last_key_written() {
        let store = Arc::new(MemoryStore::new());
        let op = FillOp::new(store.clone(), "v".to_owned(), -5);

        for _ in 0..4 {
            assert!(op.invoke().is_ok());
        }

        let boundary = op.key_boundary();
        assert_eq!(
            boundary,
            KeyBoundary {
                first_key: -5,
                last_key: -2,
            }
        );
        assert!(matches!(store.len(), Ok(4)));
    }

    #[test]
    fn probe_set_readiness_and_csv_join() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        assert!(store.set(1, "v".to_owned()).is_ok());

        let first = Arc::new(Probe::new(
            Box::new(IsEmptyOp::new(store.clone())),
            false,
            WindowedStats::new(4, 50, 10.0),
        ));
        let second = Arc::new(Probe::new(
            Box::new(IsEmptyOp::new(store)),
            false,
            WindowedStats::new(4, 50, 10.0),
        ));
        let set = ProbeSet::new(vec![first.clone(), second.clone()]);

        assert!(!set.all_reached_minimum_population());
        for _ in 0..2 {
            first.run_once();
            second.run_once();
        }
        assert!(set.all_reached_minimum_population());

        let csv = set.to_csv();
        let fields: Vec<_> = csv.split(',').collect();
        // Two probes, six fields each.
        assert_eq!(fields.len(), 12);
        assert_eq!(fields[0], "is_empty");

        set.clear_all_stats();
        assert_eq!(first.snapshot().count, 0);
        assert!(!set.all_reached_minimum_population());
    }
}
