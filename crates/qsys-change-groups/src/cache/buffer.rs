//! Per-group event buffer

use std::collections::VecDeque;

use qsys_core::ControlValue;
use serde::Serialize;

use crate::config::BufferConfig;

/// A recorded change event
///
/// Immutable once appended; leaves the cache only through eviction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEvent {
    pub group_id: String,
    pub control_name: String,
    pub value: ControlValue,
    pub string_value: String,
    pub timestamp_ms: u64,
    /// Cache-wide counter, breaks timestamp ties
    pub sequence: u64,
}

/// An event handed to the cache for recording
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub control_name: String,
    pub value: ControlValue,
    pub string_value: String,
    pub timestamp_ms: u64,
}

impl EventRecord {
    pub fn new(
        control_name: impl Into<String>,
        value: impl Into<ControlValue>,
        timestamp_ms: u64,
    ) -> Self {
        let value = value.into();
        Self {
            control_name: control_name.into(),
            string_value: value.to_string(),
            value,
            timestamp_ms,
        }
    }

    pub fn with_string(mut self, string_value: impl Into<String>) -> Self {
        self.string_value = string_value.into();
        self
    }
}

/// Events of one group in arrival order, oldest at the front
#[derive(Debug)]
pub struct EventBuffer {
    config: BufferConfig,
    events: VecDeque<CachedEvent>,
    /// Set once the buffer is unmapped; appends are refused from then on
    closed: bool,
}

impl EventBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            events: VecDeque::new(),
            closed: false,
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: BufferConfig) {
        self.config = config;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn push(&mut self, event: CachedEvent) {
        self.events.push_back(event);
    }

    pub fn iter(&self) -> impl Iterator<Item = &CachedEvent> {
        self.events.iter()
    }

    pub fn events_mut(&mut self) -> &mut VecDeque<CachedEvent> {
        &mut self.events
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drop every event and refuse further appends
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.clear()
    }

    /// Drop every event, keeping the configuration
    pub fn clear(&mut self) -> usize {
        let dropped = self.events.len();
        self.events.clear();
        dropped
    }

    pub fn oldest_ms(&self) -> Option<u64> {
        self.events.front().map(|e| e.timestamp_ms)
    }

    pub fn newest_ms(&self) -> Option<u64> {
        self.events.back().map(|e| e.timestamp_ms)
    }
}
