//! Change group manager
//!
//! Ties the registry, the auto-poll scheduler and the event cache together
//! and exposes every operation an outer request layer needs. Results can be
//! turned into uniform [`OperationReport`] records.

use std::sync::Arc;

use qsys_core::{Clock, CommandGateway, SystemClock};
use serde::Serialize;
use tracing::info;

use crate::cache::{CacheStats, EventCache, EventQuery, EvictionReport, QueryResult};
use crate::config::{BufferConfig, CachePriority, ChangeGroupConfig};
use crate::error::{ChangeGroupError, ChangeGroupResult, ErrorCode};
use crate::registry::ChangeGroupRegistry;
use crate::scheduler::{AutoPollScheduler, AutoPollState, AutoPollStatus};
use crate::types::{
    AddControlsOutcome, ClearOutcome, CreateOutcome, DestroyOutcome, GroupSummary, PollOutcome,
    RemoveControlsOutcome,
};

/// Entry point for change group monitoring
pub struct ChangeGroupManager {
    registry: Arc<ChangeGroupRegistry>,
    scheduler: AutoPollScheduler,
    cache: Arc<EventCache>,
}

impl ChangeGroupManager {
    /// Create a manager on the system clock
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        config: ChangeGroupConfig,
    ) -> ChangeGroupResult<Self> {
        Self::with_clock(gateway, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        gateway: Arc<dyn CommandGateway>,
        clock: Arc<dyn Clock>,
        config: ChangeGroupConfig,
    ) -> ChangeGroupResult<Self> {
        config.validate()?;
        let cache = Arc::new(EventCache::new(config.cache.clone(), Arc::clone(&clock)));
        let registry = Arc::new(ChangeGroupRegistry::new(
            gateway,
            Arc::clone(&cache),
            clock,
            config,
        ));
        let scheduler = AutoPollScheduler::new(Arc::clone(&registry));
        Ok(Self {
            registry,
            scheduler,
            cache,
        })
    }

    pub fn registry(&self) -> &Arc<ChangeGroupRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &AutoPollScheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<EventCache> {
        &self.cache
    }

    pub fn config(&self) -> &ChangeGroupConfig {
        self.registry.config()
    }

    fn require_group(&self, group_id: &str) -> ChangeGroupResult<()> {
        if self.registry.contains(group_id) {
            Ok(())
        } else {
            Err(ChangeGroupError::not_found(group_id))
        }
    }

    pub fn create_group(&self, group_id: &str) -> ChangeGroupResult<CreateOutcome> {
        self.registry.create(group_id)
    }

    pub async fn add_controls(
        &self,
        group_id: &str,
        names: &[String],
    ) -> ChangeGroupResult<AddControlsOutcome> {
        self.registry.add_controls(group_id, names).await
    }

    pub async fn remove_controls(
        &self,
        group_id: &str,
        names: &[String],
    ) -> ChangeGroupResult<RemoveControlsOutcome> {
        self.registry.remove_controls(group_id, names).await
    }

    /// Drop every member; auto-poll keeps running
    pub async fn clear_group(&self, group_id: &str) -> ChangeGroupResult<ClearOutcome> {
        self.registry.clear(group_id).await
    }

    /// Remove a group, its auto-poll timer and its cached events
    pub fn destroy_group(&self, group_id: &str) -> ChangeGroupResult<DestroyOutcome> {
        let group = self.registry.destroy(group_id)?;
        let auto_poll_cancelled = self.scheduler.remove(group_id);
        let cached_events_dropped = self.cache.remove_group(group_id);

        info!(
            group_id,
            auto_poll_cancelled, cached_events_dropped, "Change group torn down"
        );
        Ok(DestroyOutcome {
            group_id: group_id.to_string(),
            members: group.member_count(),
            auto_poll_cancelled,
            cached_events_dropped,
        })
    }

    pub async fn poll(
        &self,
        group_id: &str,
        include_unchanged: bool,
    ) -> ChangeGroupResult<PollOutcome> {
        self.registry.poll(group_id, include_unchanged).await
    }

    pub fn enable_auto_poll(
        &self,
        group_id: &str,
        interval_secs: f64,
    ) -> ChangeGroupResult<AutoPollStatus> {
        self.scheduler.enable(group_id, interval_secs)
    }

    pub fn disable_auto_poll(&self, group_id: &str) -> ChangeGroupResult<bool> {
        self.scheduler.disable(group_id)
    }

    pub fn auto_poll_status(&self, group_id: &str) -> Option<AutoPollStatus> {
        self.scheduler.status(group_id)
    }

    /// Every group with its member count and auto-poll state
    pub fn list_groups(&self) -> Vec<GroupSummary> {
        let mut groups = self.registry.list();
        for group in &mut groups {
            group.has_auto_poll = self.scheduler.is_active(&group.id);
        }
        groups
    }

    pub fn query_events(&self, query: &EventQuery) -> ChangeGroupResult<QueryResult> {
        Ok(self.cache.query(query)?)
    }

    pub fn configure_cache(
        &self,
        group_id: &str,
        config: BufferConfig,
    ) -> ChangeGroupResult<EvictionReport> {
        self.require_group(group_id)?;
        Ok(self.cache.configure_group(group_id, config))
    }

    pub fn set_cache_priority(
        &self,
        group_id: &str,
        priority: CachePriority,
    ) -> ChangeGroupResult<()> {
        self.require_group(group_id)?;
        self.cache.set_priority(group_id, priority);
        Ok(())
    }

    /// Drop a group's cached events without touching the group
    pub fn clear_cache(&self, group_id: &str) -> ChangeGroupResult<usize> {
        self.require_group(group_id)?;
        Ok(self.cache.clear_group(group_id))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Cancel every auto-poll timer
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

/// Human-readable one-line summary of an outcome
pub trait Describe {
    fn describe(&self) -> String;
}

impl Describe for CreateOutcome {
    fn describe(&self) -> String {
        match &self.warning {
            Some(warning) => warning.clone(),
            None => format!("Change group '{}' created", self.group_id),
        }
    }
}

impl Describe for AddControlsOutcome {
    fn describe(&self) -> String {
        let mut message = format!(
            "Added {} of {} controls to '{}' ({} total)",
            self.added, self.requested, self.group_id, self.total_members
        );
        if !self.invalid_controls.is_empty() {
            message.push_str(&format!("; {} invalid", self.invalid_controls.len()));
        }
        if !self.skipped_controls.is_empty() {
            message.push_str(&format!("; {} skipped", self.skipped_controls.len()));
        }
        message
    }
}

impl Describe for RemoveControlsOutcome {
    fn describe(&self) -> String {
        format!(
            "Removed {} controls from '{}' ({} remaining)",
            self.removed, self.group_id, self.total_members
        )
    }
}

impl Describe for ClearOutcome {
    fn describe(&self) -> String {
        format!("Cleared {} controls from '{}'", self.removed, self.group_id)
    }
}

impl Describe for DestroyOutcome {
    fn describe(&self) -> String {
        format!("Change group '{}' destroyed", self.group_id)
    }
}

impl Describe for PollOutcome {
    fn describe(&self) -> String {
        let mut message = format!("{} changes in '{}'", self.change_count, self.group_id);
        if !self.errors.is_empty() {
            message.push_str(&format!("; {} controls unreadable", self.errors.len()));
        }
        message
    }
}

impl Describe for AutoPollStatus {
    fn describe(&self) -> String {
        match self.state {
            AutoPollState::Running => {
                format!("Auto-poll running every {:.3}s", self.interval.as_secs_f64())
            }
            AutoPollState::Stopped => "Auto-poll stopped".to_string(),
            AutoPollState::Disabled => format!(
                "Auto-poll disabled after {} consecutive failures",
                self.consecutive_failures
            ),
        }
    }
}

impl Describe for Vec<GroupSummary> {
    fn describe(&self) -> String {
        format!("{} active change groups", self.len())
    }
}

impl Describe for QueryResult {
    fn describe(&self) -> String {
        match &self.summary {
            Some(summary) => format!("Summarized {} events", summary.event_count),
            None => format!("Returned {} of {} events", self.returned, self.total_matched),
        }
    }
}

impl Describe for CacheStats {
    fn describe(&self) -> String {
        format!(
            "{} cached events across {} groups",
            self.total_entries,
            self.groups.len()
        )
    }
}

/// Error half of an [`OperationReport`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
}

/// Uniform result record for an outer request layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OperationReport {
    pub fn success(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            data,
        }
    }

    pub fn failure(error: &ChangeGroupError) -> Self {
        let message = error.to_string();
        Self {
            success: false,
            message: message.clone(),
            error: Some(ErrorReport {
                code: error.code(),
                message,
            }),
            data: None,
        }
    }

    pub fn from_result<T: Serialize + Describe>(result: &ChangeGroupResult<T>) -> Self {
        Self::from_result_with(result, T::describe)
    }

    /// Like [`OperationReport::from_result`], with an explicit message
    pub fn from_result_with<T: Serialize>(
        result: &ChangeGroupResult<T>,
        describe: impl FnOnce(&T) -> String,
    ) -> Self {
        match result {
            Ok(value) => Self::success(describe(value), serde_json::to_value(value).ok()),
            Err(e) => Self::failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsys_core::{ManualClock, MockGateway};
    use std::time::Duration;

    fn manager() -> (ChangeGroupManager, Arc<MockGateway>) {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_control("A.gain", 0.0);
        gateway.set_control("A.mute", false);
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let manager =
            ChangeGroupManager::with_clock(gateway.clone(), clock, ChangeGroupConfig::default())
                .unwrap();
        (manager, gateway)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let gateway = Arc::new(MockGateway::new());
        let config = ChangeGroupConfig::default().with_failure_threshold(0);
        let err = ChangeGroupManager::new(gateway, config).err().unwrap();
        assert_eq!(err.code(), ErrorCode::Config);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_tears_everything_down() {
        let (manager, _gateway) = manager();
        manager.create_group("g1").unwrap();
        manager.add_controls("g1", &names(&["A.gain", "A.mute"])).await.unwrap();
        manager.poll("g1", false).await.unwrap();
        manager.enable_auto_poll("g1", 1.0).unwrap();
        assert_eq!(manager.cache().group_len("g1"), 2);

        let outcome = manager.destroy_group("g1").unwrap();
        assert_eq!(outcome.members, 2);
        assert!(outcome.auto_poll_cancelled);
        assert_eq!(outcome.cached_events_dropped, 2);
        assert!(manager.list_groups().is_empty());
        assert!(manager.auto_poll_status("g1").is_none());

        let err = manager.destroy_group("g1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::GroupNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_merges_auto_poll_state() {
        let (manager, _gateway) = manager();
        manager.create_group("g1").unwrap();
        manager.create_group("g2").unwrap();
        manager.enable_auto_poll("g2", 0.5).unwrap();

        let groups = manager.list_groups();
        assert!(!groups[0].has_auto_poll);
        assert!(groups[1].has_auto_poll);

        manager.disable_auto_poll("g2").unwrap();
        assert!(!manager.list_groups()[1].has_auto_poll);
    }

    #[tokio::test]
    async fn test_cache_admin_requires_group() {
        let (manager, _gateway) = manager();
        assert!(manager.clear_cache("nope").is_err());
        assert!(manager.set_cache_priority("nope", CachePriority::High).is_err());

        manager.create_group("g1").unwrap();
        manager.set_cache_priority("g1", CachePriority::Low).unwrap();
        let config = BufferConfig::new(10, Duration::from_secs(60), CachePriority::Low).unwrap();
        manager.configure_cache("g1", config).unwrap();
        assert_eq!(manager.cache_stats().groups[0].max_entries, 10);
        assert_eq!(manager.clear_cache("g1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_operation_report_success() {
        let (manager, _gateway) = manager();
        manager.create_group("g1").unwrap();
        let result = manager.add_controls("g1", &names(&["A.gain", "bad."])).await;
        let report = OperationReport::from_result(&result);
        assert!(report.success);
        assert!(report.message.contains("Added 1 of 2"));
        assert!(report.message.contains("1 invalid"));
        let data = report.data.unwrap();
        assert_eq!(data["added"], 1);
        assert_eq!(data["invalidControls"][0]["name"], "bad.");
    }

    #[tokio::test]
    async fn test_operation_report_failure() {
        let (manager, _gateway) = manager();
        let result = manager.poll("missing", false).await;
        let report = OperationReport::from_result(&result);
        assert!(!report.success);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["error"]["code"], "GROUP_NOT_FOUND");
        assert!(json.get("data").is_none());

        let result = manager.disable_auto_poll("missing");
        let report = OperationReport::from_result_with(&result, |cancelled| {
            format!("cancelled: {}", cancelled)
        });
        assert_eq!(report.error.unwrap().code, ErrorCode::GroupNotFound);
    }

    #[test]
    fn test_create_warning_becomes_message() {
        let outcome = CreateOutcome {
            group_id: "g1".into(),
            created: false,
            warning: Some("Change group 'g1' already exists; existing state kept".into()),
        };
        assert!(outcome.describe().contains("already exists"));
    }
}
