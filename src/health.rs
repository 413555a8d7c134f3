use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Membership and migration notifications delivered by the cluster client.
/// Delivery callbacks must stay quick and non-blocking; all variants mutate
/// small in-memory state only.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClusterEvent {
    MemberAdded,
    MemberRemoved,
    MigrationStarted { planned: u32, completed: u32 },
    ReplicaMigrationCompleted { planned: u32, completed: u32 },
    ReplicaMigrationFailed { planned: u32, completed: u32 },
    MigrationFinished,
}

/// Progress of the migration currently in flight.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MigrationProgress {
    pub planned: u32,
    pub completed: u32,
}

#[derive(Debug)]
struct HealthState {
    expected_members: u32,
    current_members: u32,
    migration: Option<MigrationProgress>,
    last_migration_end: Option<Instant>,
}

/// Tracks cluster health independently of the load path: current vs.
/// expected member count, whether a migration is in flight, and when the
/// last migration completed.
///
/// Count bounds and migration-descriptor consistency are programming
/// invariants; violating them panics rather than returning an error.
#[derive(Debug)]
pub struct ClusterHealthMonitor {
    state: Mutex<HealthState>,
}

impl ClusterHealthMonitor {
    /// Captures the expected member count at test start.
    #[must_use]
    pub fn new(expected_members: u32) -> Self {
        info!(expected_members, "initializing cluster health monitor");
        Self {
            state: Mutex::new(HealthState {
                expected_members,
                current_members: expected_members,
                migration: None,
                last_migration_end: None,
            }),
        }
    }

    /// Consumes cluster events until the sender side closes.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ClusterEvent>) {
        while let Some(event) = events.recv().await {
            self.apply(event);
        }
        debug!("cluster event stream closed");
    }

    pub fn apply(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::MemberAdded => self.member_added(),
            ClusterEvent::MemberRemoved => self.member_removed(),
            ClusterEvent::MigrationStarted { planned, completed } => {
                self.migration_started(planned, completed);
            }
            ClusterEvent::ReplicaMigrationCompleted { planned, completed } => {
                self.replica_migration_completed(planned, completed);
            }
            ClusterEvent::ReplicaMigrationFailed { planned, completed } => {
                self.replica_migration_failed(planned, completed);
            }
            ClusterEvent::MigrationFinished => self.migration_finished(),
        }
    }

    pub fn member_added(&self) {
        let mut state = self.state.lock();
        assert!(
            state.current_members < state.expected_members,
            "member count would exceed expected ({}/{})",
            state.current_members,
            state.expected_members
        );
        state.current_members += 1;
        if state.current_members == state.expected_members {
            info!(
                current = state.current_members,
                expected = state.expected_members,
                "member added, all members back in cluster"
            );
        } else {
            info!(
                current = state.current_members,
                expected = state.expected_members,
                "member added"
            );
        }
    }

    pub fn member_removed(&self) {
        let mut state = self.state.lock();
        assert!(state.current_members > 0, "member count would go negative");
        state.current_members -= 1;
        info!(
            current = state.current_members,
            expected = state.expected_members,
            "member removed"
        );
    }

    pub fn migration_started(&self, planned: u32, completed: u32) {
        self.set_migration_active(planned, completed);
        info!(planned, completed, "migration started");
    }

    pub fn replica_migration_completed(&self, planned: u32, completed: u32) {
        self.set_migration_active(planned, completed);
    }

    pub fn replica_migration_failed(&self, planned: u32, completed: u32) {
        warn!(planned, completed, "replica migration failed");
        self.set_migration_active(planned, completed);
    }

    fn set_migration_active(&self, planned: u32, completed: u32) {
        assert!(
            planned >= completed,
            "migration descriptor planned {planned} < completed {completed}"
        );
        let mut state = self.state.lock();
        state.migration = Some(MigrationProgress { planned, completed });
        state.last_migration_end = None;
    }

    /// Clears the active-migration descriptor and records the completion
    /// timestamp.
    pub fn migration_finished(&self) {
        let mut state = self.state.lock();
        state.migration = None;
        state.last_migration_end = Some(Instant::now());
        info!("migration finished");
    }

    /// Forgets the last completed migration; used at test-run reset.
    pub fn clear_last_migration(&self) {
        let mut state = self.state.lock();
        state.migration = None;
        state.last_migration_end = None;
    }

    #[must_use]
    pub fn cluster_is_missing_members(&self) -> bool {
        let state = self.state.lock();
        state.current_members < state.expected_members
    }

    #[must_use]
    pub fn is_migration_active(&self) -> bool {
        self.state.lock().migration.is_some()
    }

    #[must_use]
    pub fn active_migration(&self) -> Option<MigrationProgress> {
        self.state.lock().migration
    }

    #[must_use]
    pub fn last_migration_end(&self) -> Option<Instant> {
        self.state.lock().last_migration_end
    }

    /// Periodic diagnostics, called on the orchestrator's health cadence.
    pub fn log_if_missing_members(&self) {
        let (current, expected) = {
            let state = self.state.lock();
            (state.current_members, state.expected_members)
        };
        if current < expected {
            info!(current, expected, "members remain in cluster");
        }
    }

    pub fn log_active_migrations(&self) {
        if let Some(progress) = self.active_migration() {
            info!(
                completed = progress.completed,
                planned = progress.planned,
                "migrations complete"
            );
        }
    }
}
