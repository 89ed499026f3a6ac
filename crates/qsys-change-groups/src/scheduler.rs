//! Auto-poll scheduling
//!
//! One background task per enabled group. Each task owns a ticker and
//! spawns at most one poll at a time; a tick that finds the previous poll
//! still running is skipped, never queued. Polls of different groups
//! never wait on each other.
//!
//! ## States
//!
//! ```text
//! Stopped --enable--> Running --disable / group gone--> Stopped
//!                        |
//!                        +--threshold consecutive failures--> Disabled
//! ```
//!
//! `Disabled` is terminal until `enable` is called again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use qsys_logging::{PollCorrelation, fields};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ChangeGroupError, ChangeGroupResult};
use crate::registry::ChangeGroupRegistry;

/// Auto-poll state of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoPollState {
    Stopped,
    Running,
    /// Stopped after too many consecutive failures
    Disabled,
}

/// Snapshot of a group's auto-poll schedule
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoPollStatus {
    pub state: AutoPollState,
    pub interval: Duration,
    pub consecutive_failures: u32,
    /// Timer ticks since the schedule was enabled
    pub ticks: u64,
    /// Ticks that found a poll already in flight
    pub skipped_ticks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AutoPollStatus {
    fn running(interval: Duration) -> Self {
        Self {
            state: AutoPollState::Running,
            interval,
            consecutive_failures: 0,
            ticks: 0,
            skipped_ticks: 0,
            last_error: None,
        }
    }
}

/// State shared between a schedule entry and its tasks
struct ScheduleShared {
    group_id: String,
    registry: Arc<ChangeGroupRegistry>,
    status: Mutex<AutoPollStatus>,
    cancel: CancellationToken,
    failure_threshold: u32,
    poll_timeout: Duration,
}

impl ScheduleShared {
    fn record_failure(&self, status: &mut AutoPollStatus, message: String) {
        status.consecutive_failures += 1;
        status.last_error = Some(message);

        if status.consecutive_failures >= self.failure_threshold {
            status.state = AutoPollState::Disabled;
            self.cancel.cancel();
            warn!(
                group_id = %self.group_id,
                { fields::CONSECUTIVE_FAILURES } = status.consecutive_failures,
                last_error = status.last_error.as_deref().unwrap_or_default(),
                "Auto-poll disabled after repeated failures"
            );
        } else {
            debug!(
                group_id = %self.group_id,
                { fields::CONSECUTIVE_FAILURES } = status.consecutive_failures,
                "Scheduled poll failed"
            );
        }
    }
}

struct Schedule {
    shared: Arc<ScheduleShared>,
    task: Option<JoinHandle<()>>,
}

impl Schedule {
    /// Cancel the timer task if one is running
    fn stop(&mut self) -> bool {
        self.shared.cancel.cancel();
        self.task.take().is_some_and(|task| !task.is_finished())
    }
}

/// Owns every auto-poll timer
///
/// All transitions go through this type; nothing else touches the tasks.
/// Must be used from within a tokio runtime.
pub struct AutoPollScheduler {
    registry: Arc<ChangeGroupRegistry>,
    schedules: DashMap<String, Schedule>,
}

impl AutoPollScheduler {
    pub fn new(registry: Arc<ChangeGroupRegistry>) -> Self {
        Self {
            registry,
            schedules: DashMap::new(),
        }
    }

    fn validate_interval(&self, interval_secs: f64) -> ChangeGroupResult<Duration> {
        let config = self.registry.config();
        let min = config.min_poll_interval.as_secs_f64();
        let max = config.max_poll_interval.as_secs_f64();
        if !interval_secs.is_finite() || interval_secs < min || interval_secs > max {
            return Err(ChangeGroupError::IntervalOutOfRange {
                interval_secs,
                min_secs: min,
                max_secs: max,
            });
        }
        Ok(Duration::from_secs_f64(interval_secs))
    }

    /// Start polling a group every `interval_secs`
    ///
    /// Replaces any existing schedule for the group. The first poll happens
    /// one interval after enabling.
    pub fn enable(&self, group_id: &str, interval_secs: f64) -> ChangeGroupResult<AutoPollStatus> {
        let interval = self.validate_interval(interval_secs)?;
        if !self.registry.contains(group_id) {
            return Err(ChangeGroupError::not_found(group_id));
        }

        let config = self.registry.config();
        let shared = Arc::new(ScheduleShared {
            group_id: group_id.to_string(),
            registry: Arc::clone(&self.registry),
            status: Mutex::new(AutoPollStatus::running(interval)),
            cancel: CancellationToken::new(),
            failure_threshold: config.failure_threshold,
            poll_timeout: config.poll_timeout,
        });

        let task = tokio::spawn(run_schedule(Arc::clone(&shared), interval));
        let schedule = Schedule {
            shared: Arc::clone(&shared),
            task: Some(task),
        };
        // Cancel-and-replace under the entry lock so two enables for one
        // group cannot both leave a task behind.
        let replaced = match self.schedules.entry(group_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let replaced = entry.get_mut().stop();
                entry.insert(schedule);
                replaced
            }
            Entry::Vacant(entry) => {
                entry.insert(schedule);
                false
            }
        };
        let status = shared.status.lock().clone();

        info!(
            group_id,
            { fields::INTERVAL_MS } = interval.as_millis() as u64,
            replaced,
            "Auto-poll enabled"
        );
        Ok(status)
    }

    /// Stop polling a group and reset its failure count
    ///
    /// Returns whether a running timer was cancelled. Fails only when the
    /// group does not exist and has no schedule.
    pub fn disable(&self, group_id: &str) -> ChangeGroupResult<bool> {
        let Some(mut schedule) = self.schedules.get_mut(group_id) else {
            return if self.registry.contains(group_id) {
                Ok(false)
            } else {
                Err(ChangeGroupError::not_found(group_id))
            };
        };

        let was_running = schedule.stop();
        let mut status = schedule.shared.status.lock();
        status.state = AutoPollState::Stopped;
        status.consecutive_failures = 0;
        drop(status);

        info!(group_id, was_running, "Auto-poll disabled");
        Ok(was_running)
    }

    /// Cancel and forget a group's schedule
    pub fn remove(&self, group_id: &str) -> bool {
        match self.schedules.remove(group_id) {
            Some((_, mut schedule)) => {
                let was_running = schedule.stop();
                debug!(group_id, was_running, "Auto-poll schedule removed");
                was_running
            }
            None => false,
        }
    }

    pub fn status(&self, group_id: &str) -> Option<AutoPollStatus> {
        self.schedules
            .get(group_id)
            .map(|s| s.shared.status.lock().clone())
    }

    pub fn state(&self, group_id: &str) -> AutoPollState {
        self.status(group_id)
            .map(|s| s.state)
            .unwrap_or(AutoPollState::Stopped)
    }

    pub fn is_active(&self, group_id: &str) -> bool {
        self.state(group_id) == AutoPollState::Running
    }

    /// Number of groups currently polling
    pub fn active_count(&self) -> usize {
        self.schedules
            .iter()
            .filter(|s| s.shared.status.lock().state == AutoPollState::Running)
            .count()
    }

    /// Cancel every schedule
    pub fn shutdown(&self) {
        let mut cancelled = 0;
        for mut schedule in self.schedules.iter_mut() {
            if schedule.stop() {
                cancelled += 1;
            }
            let mut status = schedule.shared.status.lock();
            if status.state == AutoPollState::Running {
                status.state = AutoPollState::Stopped;
            }
        }
        info!(cancelled, "Auto-poll scheduler shut down");
    }
}

impl Drop for AutoPollScheduler {
    fn drop(&mut self) {
        for schedule in self.schedules.iter() {
            schedule.shared.cancel.cancel();
        }
    }
}

async fn run_schedule(shared: Arc<ScheduleShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    let mut ctx = PollCorrelation::scheduled(&shared.group_id);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let busy = in_flight.as_ref().is_some_and(|poll| !poll.is_finished());
        {
            let mut status = shared.status.lock();
            status.ticks += 1;
            if busy {
                status.skipped_ticks += 1;
            }
        }
        if busy {
            trace!(group_id = %shared.group_id, "Skipping tick, previous poll still running");
            continue;
        }

        in_flight = Some(tokio::spawn(poll_once(Arc::clone(&shared), ctx.clone())));
        ctx = ctx.next_tick();
    }

    debug!(group_id = %shared.group_id, "Auto-poll task stopped");
}

async fn poll_once(shared: Arc<ScheduleShared>, ctx: PollCorrelation) {
    let result = tokio::select! {
        _ = shared.cancel.cancelled() => return,
        result = timeout(shared.poll_timeout, shared.registry.poll_if_idle(&shared.group_id, &ctx)) => result,
    };

    let mut status = shared.status.lock();
    if shared.cancel.is_cancelled() {
        return;
    }

    match result {
        Ok(Ok(Some(outcome))) => {
            status.consecutive_failures = 0;
            status.last_error = None;
            trace!(
                group_id = %shared.group_id,
                { fields::TICK } = ctx.tick,
                { fields::CHANGE_COUNT } = outcome.change_count,
                "Scheduled poll complete"
            );
        }
        Ok(Ok(None)) => {
            status.skipped_ticks += 1;
        }
        Ok(Err(ChangeGroupError::GroupNotFound(_))) => {
            status.state = AutoPollState::Stopped;
            shared.cancel.cancel();
            info!(group_id = %shared.group_id, "Group no longer exists, stopping auto-poll");
        }
        Ok(Err(e)) => shared.record_failure(&mut status, e.to_string()),
        Err(_) => shared.record_failure(
            &mut status,
            format!(
                "poll timed out after {}ms",
                shared.poll_timeout.as_millis()
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsys_core::{ManualClock, MockGateway};

    use crate::cache::EventCache;
    use crate::config::ChangeGroupConfig;

    struct Fixture {
        scheduler: AutoPollScheduler,
        registry: Arc<ChangeGroupRegistry>,
        gateway: Arc<MockGateway>,
    }

    async fn fixture(config: ChangeGroupConfig) -> Fixture {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_control("A.gain", 0.0);
        gateway.set_control("B.gain", 0.0);

        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let cache = Arc::new(EventCache::new(config.cache.clone(), clock.clone()));
        let registry = Arc::new(ChangeGroupRegistry::new(
            gateway.clone(),
            cache,
            clock,
            config,
        ));
        for (group, control) in [("g1", "A.gain"), ("g2", "B.gain")] {
            registry.create(group).unwrap();
            registry
                .add_controls(group, &[control.to_string()])
                .await
                .unwrap();
        }

        Fixture {
            scheduler: AutoPollScheduler::new(registry.clone()),
            registry,
            gateway,
        }
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_validates_interval() {
        let f = fixture(ChangeGroupConfig::default()).await;
        for bad in [0.01, 3601.0, f64::NAN, -1.0] {
            let err = f.scheduler.enable("g1", bad).unwrap_err();
            assert!(matches!(err, ChangeGroupError::IntervalOutOfRange { .. }));
        }
        assert!(f.scheduler.enable("g1", 0.03).is_ok());
        assert!(f.scheduler.enable("g1", 3600.0).is_ok());

        let err = f.scheduler.enable("nope", 1.0).unwrap_err();
        assert!(matches!(err, ChangeGroupError::GroupNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_every_interval() {
        let f = fixture(ChangeGroupConfig::default()).await;
        f.scheduler.enable("g1", 1.0).unwrap();

        sleep_ms(3_500).await;
        let status = f.scheduler.status("g1").unwrap();
        assert_eq!(status.state, AutoPollState::Running);
        assert_eq!(status.ticks, 3);
        assert_eq!(f.registry.get("g1").unwrap().poll_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_replaces_existing_timer() {
        let f = fixture(ChangeGroupConfig::default()).await;
        f.scheduler.enable("g1", 1.0).unwrap();
        f.scheduler.enable("g1", 1.0).unwrap();
        f.scheduler.enable("g1", 1.0).unwrap();

        sleep_ms(2_500).await;
        assert_eq!(f.registry.get("g1").unwrap().poll_count(), 2);
        assert_eq!(f.scheduler.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_after_threshold_failures() {
        let f = fixture(ChangeGroupConfig::default()).await;
        f.gateway.set_failing(true);
        f.scheduler.enable("g1", 1.0).unwrap();

        sleep_ms(9_500).await;
        let status = f.scheduler.status("g1").unwrap();
        assert_eq!(status.state, AutoPollState::Running);
        assert_eq!(status.consecutive_failures, 9);

        sleep_ms(1_000).await;
        let status = f.scheduler.status("g1").unwrap();
        assert_eq!(status.state, AutoPollState::Disabled);
        assert_eq!(status.consecutive_failures, 10);
        assert!(status.last_error.is_some());
        assert!(!f.scheduler.is_active("g1"));

        // No further ticks once disabled
        let calls = f.gateway.call_count();
        sleep_ms(5_000).await;
        assert_eq!(f.gateway.call_count(), calls);
        assert_eq!(f.scheduler.status("g1").unwrap().ticks, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let f = fixture(ChangeGroupConfig::default()).await;
        f.gateway.fail_next(9);
        f.scheduler.enable("g1", 1.0).unwrap();

        sleep_ms(9_500).await;
        assert_eq!(f.scheduler.status("g1").unwrap().consecutive_failures, 9);

        sleep_ms(1_000).await;
        let status = f.scheduler.status("g1").unwrap();
        assert_eq!(status.state, AutoPollState::Running);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_resets_and_reenable() {
        let f = fixture(ChangeGroupConfig::default().with_failure_threshold(3)).await;
        f.gateway.set_failing(true);
        f.scheduler.enable("g1", 1.0).unwrap();
        sleep_ms(3_500).await;
        assert_eq!(f.scheduler.state("g1"), AutoPollState::Disabled);

        assert!(!f.scheduler.disable("g1").unwrap());
        let status = f.scheduler.status("g1").unwrap();
        assert_eq!(status.state, AutoPollState::Stopped);
        assert_eq!(status.consecutive_failures, 0);

        f.gateway.set_failing(false);
        f.scheduler.enable("g1", 1.0).unwrap();
        sleep_ms(1_500).await;
        assert!(f.scheduler.is_active("g1"));
        assert!(f.scheduler.disable("g1").unwrap());

        assert!(!f.scheduler.disable("g2").unwrap());
        assert!(f.scheduler.disable("nope").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_skips_ticks() {
        let f = fixture(ChangeGroupConfig::default()).await;
        f.gateway.set_latency(Duration::from_millis(2_500));
        f.scheduler.enable("g1", 1.0).unwrap();

        sleep_ms(6_500).await;
        let status = f.scheduler.status("g1").unwrap();
        assert_eq!(status.ticks, 6);
        assert!(status.skipped_ticks >= 2);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout_counts_as_failure() {
        let config = ChangeGroupConfig::default()
            .with_poll_timeout(Duration::from_millis(200))
            .with_failure_threshold(2);
        let f = fixture(config).await;
        f.gateway.set_latency(Duration::from_millis(500));
        f.scheduler.enable("g1", 1.0).unwrap();

        sleep_ms(2_500).await;
        let status = f.scheduler.status("g1").unwrap();
        assert_eq!(status.state, AutoPollState::Disabled);
        assert!(status.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_group_destroyed() {
        let f = fixture(ChangeGroupConfig::default()).await;
        f.scheduler.enable("g1", 1.0).unwrap();
        f.registry.destroy("g1").unwrap();

        sleep_ms(1_500).await;
        assert_eq!(f.scheduler.state("g1"), AutoPollState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_group_does_not_delay_others() {
        let f = fixture(ChangeGroupConfig::default()).await;
        f.scheduler.enable("g1", 1.0).unwrap();
        f.scheduler.enable("g2", 1.0).unwrap();

        // Hold g1's snapshot as if a poll were stuck
        let g1 = f.registry.get("g1").unwrap();
        let stuck = g1.lock_snapshot().await;

        sleep_ms(4_500).await;
        assert_eq!(f.registry.get("g2").unwrap().poll_count(), 4);
        assert_eq!(f.registry.get("g1").unwrap().poll_count(), 0);
        assert_eq!(f.scheduler.status("g1").unwrap().skipped_ticks, 4);
        drop(stuck);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_shutdown() {
        let f = fixture(ChangeGroupConfig::default()).await;
        f.scheduler.enable("g1", 1.0).unwrap();
        f.scheduler.enable("g2", 1.0).unwrap();

        assert!(f.scheduler.remove("g1"));
        assert!(!f.scheduler.remove("g1"));
        assert!(f.scheduler.status("g1").is_none());

        f.scheduler.shutdown();
        assert_eq!(f.scheduler.active_count(), 0);
        sleep_ms(3_000).await;
        assert_eq!(f.registry.get("g2").unwrap().poll_count(), 0);
    }
}
