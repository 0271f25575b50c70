use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use tokio::time::Instant;

/// The long-running workers owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Chat,
    Stats,
    UrlMonitor,
    Watchdog,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::Chat,
        WorkerKind::Stats,
        WorkerKind::UrlMonitor,
        WorkerKind::Watchdog,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WorkerKind::Chat => "chat",
            WorkerKind::Stats => "stats",
            WorkerKind::UrlMonitor => "url-monitor",
            WorkerKind::Watchdog => "watchdog",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time copy of one worker's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub running: bool,
    /// Last forward progress; for the chat worker this is the heartbeat.
    pub last_activity: Instant,
    pub consecutive_failures: u32,
}

/// Shared, lock-guarded health registry.
///
/// Created once by the supervisor and handed to every worker. Writers are
/// the workers themselves (activity) and the supervisor (start, stop,
/// failures); the watchdog only reads. All operations hold the lock for a
/// single map access, so contention is negligible.
#[derive(Debug, Default)]
pub struct WorkerHealth {
    workers: RwLock<HashMap<WorkerKind, WorkerStatus>>,
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a (re)started worker. Starting counts as activity so a
    /// worker that never makes progress still becomes stale.
    pub fn mark_started(&self, kind: WorkerKind) {
        let now = Instant::now();
        let mut workers = self.workers.write();
        let status = workers.entry(kind).or_insert(WorkerStatus {
            running: true,
            last_activity: now,
            consecutive_failures: 0,
        });
        status.running = true;
        status.last_activity = now;
    }

    pub fn mark_stopped(&self, kind: WorkerKind) {
        if let Some(status) = self.workers.write().get_mut(&kind) {
            status.running = false;
        }
    }

    /// Records forward progress and clears the failure streak.
    pub fn touch(&self, kind: WorkerKind) {
        let at = Instant::now();
        let mut workers = self.workers.write();
        let status = workers.entry(kind).or_insert(WorkerStatus {
            running: true,
            last_activity: at,
            consecutive_failures: 0,
        });
        status.last_activity = at;
        status.consecutive_failures = 0;
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&self, kind: WorkerKind) -> u32 {
        let mut workers = self.workers.write();
        let status = workers.entry(kind).or_insert(WorkerStatus {
            running: false,
            last_activity: Instant::now(),
            consecutive_failures: 0,
        });
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        status.consecutive_failures
    }

    pub fn last_activity(&self, kind: WorkerKind) -> Option<Instant> {
        self.workers.read().get(&kind).map(|s| s.last_activity)
    }

    pub fn status(&self, kind: WorkerKind) -> Option<WorkerStatus> {
        self.workers.read().get(&kind).copied()
    }
}
