//! Poll correlation
//!
//! Every poll (manual or scheduled) gets a correlation context so the
//! gateway calls, detector output and cache appends it causes can be tied
//! together in the JSONL stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation context for one poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCorrelation {
    /// Unique id of this poll
    pub poll_id: Uuid,
    /// Group being polled
    pub group_id: String,
    /// Id shared by every tick of one auto-poll run
    ///
    /// `None` for manual polls.
    pub schedule_id: Option<Uuid>,
    /// Tick number within the schedule, starting at 1
    pub tick: u64,
}

impl PollCorrelation {
    /// Context for a manual poll
    pub fn manual(group_id: impl Into<String>) -> Self {
        Self {
            poll_id: Uuid::new_v4(),
            group_id: group_id.into(),
            schedule_id: None,
            tick: 0,
        }
    }

    /// Context for the first tick of a new schedule
    pub fn scheduled(group_id: impl Into<String>) -> Self {
        Self {
            poll_id: Uuid::new_v4(),
            group_id: group_id.into(),
            schedule_id: Some(Uuid::new_v4()),
            tick: 1,
        }
    }

    /// Context for the following tick of the same schedule
    pub fn next_tick(&self) -> Self {
        Self {
            poll_id: Uuid::new_v4(),
            group_id: self.group_id.clone(),
            schedule_id: self.schedule_id,
            tick: self.tick + 1,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule_id.is_some()
    }

    /// Open a span carrying this context's fields
    pub fn span(&self) -> tracing::Span {
        let span = tracing::info_span!(
            "poll_group",
            poll_id = %self.poll_id,
            group_id = %self.group_id,
            schedule_id = tracing::field::Empty,
            tick = self.tick,
        );
        if let Some(schedule_id) = self.schedule_id {
            span.record(fields::SCHEDULE_ID, schedule_id.to_string());
        }
        span
    }
}

/// Helper trait to record a poll context onto an existing span
///
/// The span must declare the fields (as `tracing::field::Empty` when not
/// known at creation).
pub trait PollCorrelationExt {
    fn record_poll(&self, ctx: &PollCorrelation);
}

impl PollCorrelationExt for tracing::Span {
    fn record_poll(&self, ctx: &PollCorrelation) {
        self.record(fields::POLL_ID, ctx.poll_id.to_string());
        self.record(fields::GROUP_ID, ctx.group_id.as_str());
        if let Some(schedule_id) = ctx.schedule_id {
            self.record(fields::SCHEDULE_ID, schedule_id.to_string());
        }
        self.record(fields::TICK, ctx.tick);
    }
}

/// Standard field names
pub mod fields {
    pub const POLL_ID: &str = "poll_id";
    pub const SCHEDULE_ID: &str = "schedule_id";
    pub const TICK: &str = "tick";
    pub const GROUP_ID: &str = "group_id";
    pub const CONTROL: &str = "control";
    pub const CORE_NAME: &str = "core_name";
    pub const INSTANCE_ID: &str = "instance_id";
    pub const INTERVAL_MS: &str = "interval_ms";
    pub const CONSECUTIVE_FAILURES: &str = "consecutive_failures";
    pub const CHANGE_COUNT: &str = "change_count";
    pub const EVICTED: &str = "evicted";
    pub const LATENCY_MS: &str = "latency_ms";
}

/// Standard span names
pub mod spans {
    // Registry
    pub const CREATE_GROUP: &str = "create_group";
    pub const ADD_CONTROLS: &str = "add_controls";
    pub const DESTROY_GROUP: &str = "destroy_group";

    // Polling
    pub const POLL_GROUP: &str = "poll_group";
    pub const READ_CONTROLS: &str = "read_controls";
    pub const AUTO_POLL_TICK: &str = "auto_poll_tick";

    // Event cache
    pub const CACHE_RECORD: &str = "cache_record";
    pub const CACHE_QUERY: &str = "cache_query";
    pub const CACHE_EVICT: &str = "cache_evict";
}
