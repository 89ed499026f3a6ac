//! Event cache queries
//!
//! Queries are built with [`EventQuery::builder`] and validated at
//! `build()`, so the cache only ever sees well-formed filters.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use qsys_core::ControlValue;
use serde::{Deserialize, Serialize};

use crate::cache::buffer::CachedEvent;
use crate::error::CacheError;

/// Comparison applied by a [`ValueFilter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Value became the target on this event
    ChangedTo,
    /// Value left the target on this event
    ChangedFrom,
}

impl std::str::FromStr for FilterOperator {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "eq" => FilterOperator::Eq,
            "neq" => FilterOperator::Neq,
            "gt" => FilterOperator::Gt,
            "gte" => FilterOperator::Gte,
            "lt" => FilterOperator::Lt,
            "lte" => FilterOperator::Lte,
            "changed_to" => FilterOperator::ChangedTo,
            "changed_from" => FilterOperator::ChangedFrom,
            other => {
                return Err(CacheError::InvalidQuery(format!(
                    "unknown operator {:?}",
                    other
                )));
            }
        })
    }
}

/// Filter on an event's value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueFilter {
    pub operator: FilterOperator,
    pub value: ControlValue,
}

impl ValueFilter {
    pub fn new(operator: FilterOperator, value: impl Into<ControlValue>) -> Self {
        Self {
            operator,
            value: value.into(),
        }
    }

    /// Does `current` pass, given the previous event's value for the same
    /// control (in sequence order)?
    ///
    /// The first event seen for a control counts as a change to its value.
    pub fn matches(&self, current: &ControlValue, previous: Option<&ControlValue>) -> bool {
        use std::cmp::Ordering::*;

        let target = &self.value;
        match self.operator {
            FilterOperator::Eq => current.loosely_eq(target),
            FilterOperator::Neq => !current.loosely_eq(target),
            FilterOperator::Gt => current.compare(target) == Some(Greater),
            FilterOperator::Gte => matches!(current.compare(target), Some(Greater | Equal)),
            FilterOperator::Lt => current.compare(target) == Some(Less),
            FilterOperator::Lte => matches!(current.compare(target), Some(Less | Equal)),
            FilterOperator::ChangedTo => {
                current.loosely_eq(target) && !previous.is_some_and(|p| p.loosely_eq(target))
            }
            FilterOperator::ChangedFrom => {
                !current.loosely_eq(target) && previous.is_some_and(|p| p.loosely_eq(target))
            }
        }
    }
}

/// Shape of the query result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Every matching event
    #[default]
    Raw,
    /// Drop events that repeat the previous value of the same control
    ChangesOnly,
    /// Counts and rates instead of events
    Summary,
}

/// A validated query against the event cache
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    pub group_id: Option<String>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
    pub control_names: Option<HashSet<String>>,
    pub value_filter: Option<ValueFilter>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub aggregation: Aggregation,
    pub timeout: Option<Duration>,
}

impl EventQuery {
    pub fn builder() -> EventQueryBuilder {
        EventQueryBuilder::default()
    }

    /// Every group, default window and limit
    pub fn all() -> Self {
        Self {
            group_id: None,
            start_ms: None,
            end_ms: None,
            control_names: None,
            value_filter: None,
            limit: None,
            offset: 0,
            aggregation: Aggregation::Raw,
            timeout: None,
        }
    }

    pub(crate) fn wants_control(&self, name: &str) -> bool {
        self.control_names
            .as_ref()
            .is_none_or(|names| names.contains(name))
    }
}

/// Builder for [`EventQuery`]
#[derive(Debug, Default)]
pub struct EventQueryBuilder {
    group_id: Option<String>,
    start_ms: Option<u64>,
    end_ms: Option<u64>,
    control_names: Option<Vec<String>>,
    value_filter: Option<ValueFilter>,
    limit: Option<usize>,
    offset: usize,
    aggregation: Aggregation,
    timeout: Option<Duration>,
}

impl EventQueryBuilder {
    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn start_ms(mut self, start_ms: u64) -> Self {
        self.start_ms = Some(start_ms);
        self
    }

    pub fn end_ms(mut self, end_ms: u64) -> Self {
        self.end_ms = Some(end_ms);
        self
    }

    /// Restrict to these controls
    pub fn controls<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.control_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn value_filter(mut self, filter: ValueFilter) -> Self {
        self.value_filter = Some(filter);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<EventQuery, CacheError> {
        if let Some(id) = &self.group_id
            && id.trim().is_empty()
        {
            return Err(CacheError::InvalidQuery("group id is empty".into()));
        }
        if let (Some(start), Some(end)) = (self.start_ms, self.end_ms)
            && start > end
        {
            return Err(CacheError::InvalidQuery(format!(
                "start time {} is after end time {}",
                start, end
            )));
        }
        if self.limit == Some(0) {
            return Err(CacheError::InvalidQuery("limit must be at least 1".into()));
        }
        let control_names = match self.control_names {
            Some(names) if names.is_empty() => {
                return Err(CacheError::InvalidQuery(
                    "control name list is empty".into(),
                ));
            }
            Some(names) => Some(names.into_iter().collect()),
            None => None,
        };

        Ok(EventQuery {
            group_id: self.group_id,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            control_names,
            value_filter: self.value_filter,
            limit: self.limit,
            offset: self.offset,
            aggregation: self.aggregation,
            timeout: self.timeout,
        })
    }
}

/// Aggregate view returned for [`Aggregation::Summary`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub event_count: usize,
    pub distinct_controls: usize,
    pub first_timestamp_ms: Option<u64>,
    pub last_timestamp_ms: Option<u64>,
    /// Time between the first and last matching event
    pub span_ms: u64,
    /// Matching events over the length of the query window
    pub events_per_second: f64,
    pub per_control: BTreeMap<String, usize>,
}

impl EventSummary {
    /// Summarize time-ordered events seen over a window of `window_ms`
    pub fn from_events(events: &[CachedEvent], window_ms: u64) -> Self {
        let mut per_control: BTreeMap<String, usize> = BTreeMap::new();
        for event in events {
            *per_control.entry(event.control_name.clone()).or_default() += 1;
        }

        let first = events.first().map(|e| e.timestamp_ms);
        let last = events.last().map(|e| e.timestamp_ms);
        let span_ms = match (first, last) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        };
        let window_secs = window_ms.max(1) as f64 / 1000.0;

        Self {
            event_count: events.len(),
            distinct_controls: per_control.len(),
            first_timestamp_ms: first,
            last_timestamp_ms: last,
            span_ms,
            events_per_second: events.len() as f64 / window_secs,
            per_control,
        }
    }
}

/// Result of a cache query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Page of events; empty for summaries
    pub events: Vec<CachedEvent>,
    /// Matches before pagination
    pub total_matched: usize,
    pub returned: usize,
    pub has_more: bool,
    pub offset: usize,
    pub limit: usize,
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<EventSummary>,
}
