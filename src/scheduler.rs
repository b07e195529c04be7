//! Periodic collection driver
//!
//! Each registered group gets its own tokio task and interval timer, so a
//! slow group never delays another. A tick runs `collect()` and the sink
//! dispatch on the blocking pool; the readers are synchronous and may block
//! for a second or more.
//!
//! Lifecycle: `Idle -> Running -> Draining -> Stopped`. On shutdown each task
//! finishes its in-flight tick, then every group releases its readers.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{PimanError, Result};
use crate::group::ReaderGroup;
use crate::sink::Sink;
use crate::snapshot::Snapshot;

/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Per-group totals of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub group: String,
    pub ticks: u64,
    pub sink_failures: u64,
}

/// Outcome of [`Scheduler::run_until`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub groups: Vec<GroupReport>,
}

impl RunReport {
    pub fn group(&self, name: &str) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.group == name)
    }

    pub fn total_ticks(&self) -> u64 {
        self.groups.iter().map(|g| g.ticks).sum()
    }
}

#[derive(Clone)]
struct ScheduledGroup {
    name: String,
    group: Arc<Mutex<ReaderGroup>>,
    interval: Duration,
    sinks: Vec<Arc<dyn Sink>>,
}

/// Drives reader groups on independent intervals
pub struct Scheduler {
    groups: Vec<ScheduledGroup>,
    start_delay: Duration,
    state: Arc<AtomicU8>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            start_delay: Duration::ZERO,
            state: Arc::new(AtomicU8::new(SchedulerState::Idle as u8)),
        }
    }

    /// Delay before the first tick of every group
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Register `group`, collected every `interval` and dispatched to `sinks` in order
    pub fn add_group(
        &mut self,
        group: ReaderGroup,
        interval: Duration,
        sinks: Vec<Arc<dyn Sink>>,
    ) -> Result<()> {
        if self.state() != SchedulerState::Idle {
            return Err(PimanError::Scheduler(format!(
                "cannot add group {} while {}",
                group.name(),
                self.state()
            )));
        }
        if interval.is_zero() {
            return Err(PimanError::Scheduler(format!(
                "group {} has a zero interval",
                group.name()
            )));
        }
        if self.groups.iter().any(|g| g.name == group.name()) {
            return Err(PimanError::Scheduler(format!(
                "group {} is already registered",
                group.name()
            )));
        }

        info!(
            group = group.name(),
            readers = group.len(),
            interval_ms = interval.as_millis() as u64,
            sinks = sinks.len(),
            "Registered reader group"
        );
        self.groups.push(ScheduledGroup {
            name: group.name().to_string(),
            group: Arc::new(Mutex::new(group)),
            interval,
            sinks,
        });
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::SeqCst);
        debug!(%state, "Scheduler state changed");
    }

    /// Run every group until `shutdown` resolves
    ///
    /// Can only be called once; later calls fail without touching any group.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        if self
            .state
            .compare_exchange(
                SchedulerState::Idle as u8,
                SchedulerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(PimanError::Scheduler(format!(
                "cannot start while {}",
                self.state()
            )));
        }
        info!(
            groups = self.groups.len(),
            start_delay_ms = self.start_delay.as_millis() as u64,
            "Scheduler running"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let first_tick = Instant::now() + self.start_delay;
        let handles: Vec<_> = self
            .groups
            .iter()
            .cloned()
            .map(|scheduled| {
                tokio::spawn(drive(
                    scheduled,
                    first_tick,
                    stop_rx.clone(),
                    self.state.clone(),
                ))
            })
            .collect();

        shutdown.await;
        // Stop signal first: no tick may start once the state reads Draining.
        let _ = stop_tx.send(true);
        self.set_state(SchedulerState::Draining);
        info!("Shutdown requested, draining");

        let mut report = RunReport::default();
        for (scheduled, handle) in self.groups.iter().zip(handles) {
            match handle.await {
                Ok(group_report) => report.groups.push(group_report),
                Err(e) => {
                    error!(group = %scheduled.name, "Group task failed: {}", e);
                    report.groups.push(GroupReport {
                        group: scheduled.name.clone(),
                        ..GroupReport::default()
                    });
                }
            }
        }

        for scheduled in &self.groups {
            let group = scheduled.group.clone();
            let released = task::spawn_blocking(move || {
                group
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .release()
            })
            .await;
            if let Err(e) = released {
                error!(group = %scheduled.name, "Failed to release readers: {}", e);
            }
        }

        self.set_state(SchedulerState::Stopped);
        info!(ticks = report.total_ticks(), "Scheduler stopped");
        Ok(report)
    }
}

async fn drive(
    scheduled: ScheduledGroup,
    first_tick: Instant,
    mut stop: watch::Receiver<bool>,
    state: Arc<AtomicU8>,
) -> GroupReport {
    let mut report = GroupReport {
        group: scheduled.name.clone(),
        ..GroupReport::default()
    };
    let mut ticker = time::interval_at(first_tick, scheduled.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            // A dropped sender also stops the task.
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop.borrow()
            || SchedulerState::from_u8(state.load(Ordering::SeqCst)) != SchedulerState::Running
        {
            break;
        }

        let group = scheduled.group.clone();
        let sinks = scheduled.sinks.clone();
        match task::spawn_blocking(move || tick(&group, &sinks)).await {
            Ok(failures) => {
                report.ticks += 1;
                report.sink_failures += failures;
            }
            Err(e) => error!(group = %scheduled.name, "Collection task failed: {}", e),
        }
    }

    debug!(group = %report.group, ticks = report.ticks, "Group task finished");
    report
}

fn tick(group: &Mutex<ReaderGroup>, sinks: &[Arc<dyn Sink>]) -> u64 {
    let snapshot = group
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .collect();
    debug!(
        group = snapshot.group(),
        metrics = snapshot.len(),
        present = snapshot.present_count(),
        "Collected snapshot"
    );
    dispatch(&snapshot, sinks)
}

/// Hand `snapshot` to every sink in order; returns the number of failed sinks
pub fn dispatch(snapshot: &Snapshot, sinks: &[Arc<dyn Sink>]) -> u64 {
    let mut failures = 0;
    for sink in sinks {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            sink.consume(snapshot.group(), snapshot)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(group = snapshot.group(), sink = sink.name(), "Sink write failed: {}", e);
                failures += 1;
            }
            Err(_) => {
                error!(group = snapshot.group(), sink = sink.name(), "Sink panicked");
                failures += 1;
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SensorError, SinkError};
    use crate::logging::Logger;
    use crate::metric::Metric;
    use crate::reader::SensorReader;
    use crate::sink::MemorySink;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Counter {
        reads: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    impl SensorReader for Counter {
        fn label(&self) -> &str {
            "counter"
        }

        fn metric_names(&self) -> Vec<String> {
            vec!["count".to_string()]
        }

        fn read(&mut self) -> std::result::Result<Vec<Metric>, SensorError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            Ok(vec![Metric::new("count", n)])
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn counting_group(name: &str) -> (ReaderGroup, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let group = ReaderGroup::new(name, Logger::disabled(name)).with_reader(Counter {
            reads: reads.clone(),
            released: released.clone(),
        });
        (group, reads, released)
    }

    struct Broken;

    impl Sink for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn consume(&self, _group: &str, _snapshot: &Snapshot) -> std::result::Result<(), SinkError> {
            Err(SinkError::WriteFailure {
                sink: "broken".to_string(),
                reason: "disk full".to_string(),
            })
        }
    }

    struct Panicking;

    impl Sink for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn consume(&self, _group: &str, _snapshot: &Snapshot) -> std::result::Result<(), SinkError> {
            panic!("sink bug")
        }
    }

    #[test]
    fn test_add_group_rejects_zero_interval() {
        let (group, _, _) = counting_group("a");
        let mut scheduler = Scheduler::new();
        assert!(scheduler.add_group(group, Duration::ZERO, vec![]).is_err());
    }

    #[test]
    fn test_add_group_rejects_duplicate_name() {
        let (first, _, _) = counting_group("a");
        let (second, _, _) = counting_group("a");
        let mut scheduler = Scheduler::new();
        scheduler
            .add_group(first, Duration::from_secs(1), vec![])
            .unwrap();
        assert!(scheduler
            .add_group(second, Duration::from_secs(1), vec![])
            .is_err());
    }

    #[test]
    fn test_dispatch_survives_failing_sinks() {
        let memory = Arc::new(MemorySink::new());
        let sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(Broken),
            Arc::new(Panicking),
            memory.clone() as Arc<dyn Sink>,
        ];
        let mut builder = crate::snapshot::SnapshotBuilder::new("g");
        builder.insert(Metric::new("count", 1i64));
        let failures = dispatch(&builder.build(), &sinks);
        assert_eq!(failures, 2);
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_until_ticks_and_releases() {
        let (group, reads, released) = counting_group("fast");
        let memory = Arc::new(MemorySink::new());
        let mut scheduler = Scheduler::new();
        scheduler
            .add_group(group, Duration::from_millis(20), vec![memory.clone() as Arc<dyn Sink>])
            .unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let report = scheduler
            .run_until(time::sleep(Duration::from_millis(150)))
            .await
            .unwrap();

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(released.load(Ordering::SeqCst));
        let ticks = report.group("fast").unwrap().ticks;
        assert!(ticks >= 3, "only {} ticks", ticks);
        assert_eq!(ticks as usize, reads.load(Ordering::SeqCst));
        assert_eq!(memory.len() as u64, ticks);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_until_twice_fails() {
        let scheduler = Scheduler::new();
        scheduler.run_until(async {}).await.unwrap();
        assert!(scheduler.run_until(async {}).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drive_stops_when_not_running() {
        let (group, reads, _) = counting_group("late");
        let scheduled = ScheduledGroup {
            name: "late".to_string(),
            group: Arc::new(Mutex::new(group)),
            interval: Duration::from_millis(10),
            sinks: vec![],
        };
        let (_stop_tx, stop_rx) = watch::channel(false);
        let state = Arc::new(AtomicU8::new(SchedulerState::Draining as u8));

        let report = time::timeout(
            Duration::from_secs(1),
            drive(scheduled, Instant::now(), stop_rx, state),
        )
        .await
        .unwrap();

        assert_eq!(report.ticks, 0);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_during_start_delay_skips_ticks() {
        let (group, reads, released) = counting_group("delayed");
        let mut scheduler = Scheduler::new().with_start_delay(Duration::from_secs(60));
        scheduler
            .add_group(group, Duration::from_millis(10), vec![])
            .unwrap();

        let report = scheduler
            .run_until(time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(report.total_ticks(), 0);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert!(released.load(Ordering::SeqCst));
    }
}
