//! Bounded history of change events
//!
//! Each group owns a buffer bounded by entry count and age; all buffers
//! together are bounded by a global budget enforced in priority order.
//!
//! ## Locking
//!
//! Buffers live in a `DashMap` of `Arc<RwLock<EventBuffer>>`. Recording
//! takes the group's write lock for the append and its local eviction,
//! then releases it before any cross-group trim. Cross-group trims run one
//! at a time under a cache-wide pass lock and write-lock one victim buffer
//! at a time. The entry counter only moves while the affected buffer is
//! write-locked. Queries hold a buffer's read lock for one scan of that
//! buffer only. Map shard locks are always taken before buffer locks.

pub mod buffer;
pub mod eviction;
pub mod query;

pub use buffer::{CachedEvent, EventBuffer, EventRecord};
pub use eviction::{BufferUsage, EvictionReport, plan_pressure_trim};
pub use query::{
    Aggregation, EventQuery, EventQueryBuilder, EventSummary, FilterOperator, QueryResult,
    ValueFilter,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use qsys_core::{Clock, ControlValue, SystemClock};
use qsys_logging::fields;
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::{BufferConfig, CacheConfig, CachePriority};
use crate::error::CacheError;

/// Events scanned between deadline checks
const DEADLINE_CHECK_INTERVAL: usize = 256;

/// Result of [`EventCache::record`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordReport {
    pub appended: usize,
    pub evicted: EvictionReport,
}

/// Per-group cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCacheStats {
    pub group_id: String,
    pub entries: usize,
    pub max_entries: usize,
    pub max_age_ms: u64,
    pub priority: CachePriority,
    pub oldest_ms: Option<u64>,
    pub newest_ms: Option<u64>,
}

/// Cache-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub total_entries: usize,
    pub max_total_entries: usize,
    pub groups: Vec<GroupCacheStats>,
}

type SharedBuffer = Arc<RwLock<EventBuffer>>;

/// Per-group bounded event history with filtered queries
pub struct EventCache {
    buffers: DashMap<String, SharedBuffer>,
    sequence: AtomicU64,
    total_entries: AtomicUsize,
    /// Serializes cross-group trims
    pressure_pass: Mutex<()>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl EventCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            buffers: DashMap::new(),
            sequence: AtomicU64::new(0),
            total_entries: AtomicUsize::new(0),
            pressure_pass: Mutex::new(()),
            config,
            clock,
        }
    }

    pub fn with_system_clock(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Events currently held across all groups
    pub fn total_entries(&self) -> usize {
        self.total_entries.load(Ordering::SeqCst)
    }

    /// Events currently held for one group
    pub fn group_len(&self, group_id: &str) -> usize {
        self.buffers
            .get(group_id)
            .map(|b| b.read().len())
            .unwrap_or(0)
    }

    /// The group's buffer, and whether this call created it
    fn buffer(&self, group_id: &str) -> (SharedBuffer, bool) {
        if let Some(buffer) = self.buffers.get(group_id) {
            return (Arc::clone(&buffer), false);
        }
        let mut created = false;
        let buffer = self
            .buffers
            .entry(group_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(RwLock::new(EventBuffer::new(self.config.default_buffer)))
            })
            .clone();
        (buffer, created)
    }

    /// Must be called with the buffer's write lock held, so the counter
    /// never lags a buffer's own removals
    fn add_total(&self, added: usize, removed: usize) {
        if added > removed {
            self.total_entries.fetch_add(added - removed, Ordering::SeqCst);
        } else if removed > added {
            self.total_entries.fetch_sub(removed - added, Ordering::SeqCst);
        }
    }

    /// Append events for a group and run the eviction passes
    pub fn record(&self, group_id: &str, events: Vec<EventRecord>) -> RecordReport {
        self.record_while(group_id, events, || true)
    }

    /// Like [`EventCache::record`], but the batch is dropped unless `live`
    /// holds while the group's buffer is locked
    pub fn record_while(
        &self,
        group_id: &str,
        events: Vec<EventRecord>,
        live: impl Fn() -> bool,
    ) -> RecordReport {
        if !self.config.enabled || events.is_empty() || !live() {
            return RecordReport::default();
        }

        let (buffer, created) = self.buffer(group_id);
        let report = self.record_into(group_id, &buffer, events, &live);
        if report.appended == 0 && created {
            self.buffers.remove_if(group_id, |_, mapped| {
                Arc::ptr_eq(mapped, &buffer) && mapped.read().is_empty()
            });
        }
        report
    }

    fn record_into(
        &self,
        group_id: &str,
        buffer: &SharedBuffer,
        events: Vec<EventRecord>,
        live: &impl Fn() -> bool,
    ) -> RecordReport {
        let now_ms = self.clock.now_ms();
        let appended = events.len();

        let mut evicted = {
            let mut guard = buffer.write();
            if guard.is_closed() || !live() {
                debug!(group_id, dropped = appended, "Group gone, dropping events");
                return RecordReport::default();
            }
            for record in events {
                let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                guard.push(CachedEvent {
                    group_id: group_id.to_string(),
                    control_name: record.control_name,
                    value: record.value,
                    string_value: record.string_value,
                    timestamp_ms: record.timestamp_ms,
                    sequence,
                });
            }
            let config = *guard.config();
            let events = guard.events_mut();
            let expired = eviction::purge_expired(events, config.max_age_ms(), now_ms);
            let over_capacity = eviction::trim_to_capacity(events, config.max_entries);
            self.add_total(appended, expired + over_capacity);
            EvictionReport {
                expired,
                over_capacity,
                pressure: 0,
            }
        };

        evicted.pressure = self.relieve_pressure();

        trace!(
            group_id,
            appended,
            evicted = evicted.total(),
            "Recorded events"
        );
        RecordReport { appended, evicted }
    }

    /// Trim buffers in priority order until the global budget holds
    ///
    /// One pass at a time; the excess is read under the pass lock so
    /// concurrent writers never trim the same overflow twice.
    fn relieve_pressure(&self) -> usize {
        let max_total = self.config.max_total_entries;
        if self.total_entries() <= max_total {
            return 0;
        }

        let _pass = self.pressure_pass.lock();
        let total = self.total_entries();
        if total <= max_total {
            return 0;
        }

        let usage: Vec<BufferUsage> = self
            .buffers
            .iter()
            .map(|entry| {
                let guard = entry.value().read();
                BufferUsage {
                    group_id: entry.key().clone(),
                    priority: guard.config().priority,
                    len: guard.len(),
                }
            })
            .collect();

        let plan = plan_pressure_trim(&usage, total - max_total);
        let mut trimmed = 0;
        for (group_id, count) in plan {
            let Some(buffer) = self.buffers.get(&group_id).map(|b| Arc::clone(&b)) else {
                continue;
            };
            let mut guard = buffer.write();
            let removed = eviction::trim_oldest(guard.events_mut(), count);
            self.add_total(0, removed);
            drop(guard);

            trimmed += removed;
            debug!(
                group_id = %group_id,
                { fields::EVICTED } = removed,
                "Trimmed buffer under memory pressure"
            );
        }
        trimmed
    }

    /// Set a group's buffer bounds, applying them immediately
    pub fn configure_group(&self, group_id: &str, config: BufferConfig) -> EvictionReport {
        let now_ms = self.clock.now_ms();
        let (buffer, _) = self.buffer(group_id);
        let mut guard = buffer.write();
        guard.set_config(config);
        let events = guard.events_mut();
        let report = EvictionReport {
            expired: eviction::purge_expired(events, config.max_age_ms(), now_ms),
            over_capacity: eviction::trim_to_capacity(events, config.max_entries),
            pressure: 0,
        };
        self.add_total(0, report.expired + report.over_capacity);
        report
    }

    /// Change a group's eviction weight
    pub fn set_priority(&self, group_id: &str, priority: CachePriority) {
        let (buffer, _) = self.buffer(group_id);
        let mut guard = buffer.write();
        let config = guard.config().with_priority(priority);
        guard.set_config(config);
    }

    pub fn priority(&self, group_id: &str) -> Option<CachePriority> {
        self.buffers
            .get(group_id)
            .map(|b| b.read().config().priority)
    }

    /// Drop a group's events but keep its configuration
    pub fn clear_group(&self, group_id: &str) -> usize {
        let Some(buffer) = self.buffers.get(group_id).map(|b| Arc::clone(&b)) else {
            return 0;
        };
        let mut guard = buffer.write();
        let dropped = guard.clear();
        self.add_total(0, dropped);
        dropped
    }

    /// Drop a group's buffer entirely
    ///
    /// Writers still holding the buffer find it closed and drop their batch.
    pub fn remove_group(&self, group_id: &str) -> usize {
        let Some((_, buffer)) = self.buffers.remove(group_id) else {
            return 0;
        };
        let mut guard = buffer.write();
        let dropped = guard.close();
        self.add_total(0, dropped);
        dropped
    }

    pub fn stats(&self) -> CacheStats {
        let mut groups: Vec<GroupCacheStats> = self
            .buffers
            .iter()
            .map(|entry| {
                let guard = entry.value().read();
                let config = guard.config();
                GroupCacheStats {
                    group_id: entry.key().clone(),
                    entries: guard.len(),
                    max_entries: config.max_entries,
                    max_age_ms: config.max_age_ms(),
                    priority: config.priority,
                    oldest_ms: guard.oldest_ms(),
                    newest_ms: guard.newest_ms(),
                }
            })
            .collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));

        CacheStats {
            enabled: self.config.enabled,
            total_entries: self.total_entries(),
            max_total_entries: self.config.max_total_entries,
            groups,
        }
    }

    /// Run a query
    ///
    /// Fails with [`CacheError::QueryTimeout`] when the scan outlives the
    /// query's budget; a timed-out query never returns partial results.
    pub fn query(&self, query: &EventQuery) -> Result<QueryResult, CacheError> {
        let started = Instant::now();
        let budget = query.timeout.unwrap_or(self.config.default_query_timeout);

        let now_ms = self.clock.now_ms();
        let window_end = query.end_ms.unwrap_or(now_ms);
        let window_start = query
            .start_ms
            .unwrap_or_else(|| window_end.saturating_sub(self.config.default_window.as_millis() as u64));
        if window_start > window_end {
            return Err(CacheError::InvalidQuery(format!(
                "start time {} is after end time {}",
                window_start, window_end
            )));
        }

        let mut targets: Vec<(String, SharedBuffer)> = match &query.group_id {
            Some(id) => self
                .buffers
                .get(id)
                .map(|b| vec![(id.clone(), Arc::clone(&b))])
                .unwrap_or_default(),
            None => self
                .buffers
                .iter()
                .map(|e| (e.key().clone(), Arc::clone(e.value())))
                .collect(),
        };
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        let mut matched: Vec<CachedEvent> = Vec::new();
        for (_, buffer) in &targets {
            let guard = buffer.read();
            if guard.is_empty() {
                continue;
            }
            check_deadline(started, budget)?;

            let age_cutoff = now_ms.saturating_sub(guard.config().max_age_ms());
            let mut previous: HashMap<&str, &ControlValue> = HashMap::new();

            for (scanned, event) in guard.iter().enumerate() {
                if scanned > 0 && scanned % DEADLINE_CHECK_INTERVAL == 0 {
                    check_deadline(started, budget)?;
                }
                let prior = previous.insert(event.control_name.as_str(), &event.value);

                if event.timestamp_ms < age_cutoff
                    || event.timestamp_ms < window_start
                    || event.timestamp_ms > window_end
                    || !query.wants_control(&event.control_name)
                {
                    continue;
                }
                if let Some(filter) = &query.value_filter
                    && !filter.matches(&event.value, prior)
                {
                    continue;
                }
                matched.push(event.clone());
            }
        }

        let window = (window_start, window_end);
        let result = self.shape_result(query, matched, window, started, budget)?;

        debug!(
            group_id = query.group_id.as_deref().unwrap_or("*"),
            total_matched = result.total_matched,
            returned = result.returned,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Event cache query"
        );
        Ok(result)
    }

    /// Order, aggregate and paginate the matched events
    ///
    /// The deadline is checked again after the sort and the collapse; a
    /// large match set can outlast the budget here alone.
    fn shape_result(
        &self,
        query: &EventQuery,
        mut matched: Vec<CachedEvent>,
        (window_start, window_end): (u64, u64),
        started: Instant,
        budget: Duration,
    ) -> Result<QueryResult, CacheError> {
        if !matched.is_empty() {
            matched.sort_by_key(|e| (e.timestamp_ms, e.sequence));
            check_deadline(started, budget)?;
        }

        let limit = query
            .limit
            .unwrap_or(self.config.default_query_limit)
            .min(self.config.max_query_limit);

        let mut result = QueryResult {
            events: Vec::new(),
            total_matched: 0,
            returned: 0,
            has_more: false,
            offset: query.offset,
            limit,
            window_start_ms: window_start,
            window_end_ms: window_end,
            summary: None,
        };

        match query.aggregation {
            Aggregation::Summary => {
                result.total_matched = matched.len();
                result.summary = Some(EventSummary::from_events(
                    &matched,
                    window_end - window_start,
                ));
            }
            Aggregation::Raw | Aggregation::ChangesOnly => {
                if query.aggregation == Aggregation::ChangesOnly && !matched.is_empty() {
                    matched = collapse_repeats(matched);
                    check_deadline(started, budget)?;
                }
                result.total_matched = matched.len();
                result.events = matched
                    .into_iter()
                    .skip(query.offset)
                    .take(limit)
                    .collect();
                result.returned = result.events.len();
                result.has_more = query.offset + result.returned < result.total_matched;
            }
        }
        Ok(result)
    }
}

fn check_deadline(started: Instant, budget: Duration) -> Result<(), CacheError> {
    let elapsed = started.elapsed();
    if elapsed >= budget {
        return Err(CacheError::QueryTimeout {
            elapsed_ms: elapsed.as_millis() as u64,
            budget_ms: budget.as_millis() as u64,
        });
    }
    Ok(())
}

/// Keep an event only when it differs from the previous kept value of the
/// same control in the same group
fn collapse_repeats(events: Vec<CachedEvent>) -> Vec<CachedEvent> {
    let mut last: HashMap<(String, String), ControlValue> = HashMap::new();
    events
        .into_iter()
        .filter(|event| {
            let key = (event.group_id.clone(), event.control_name.clone());
            match last.get(&key) {
                Some(value) if *value == event.value => false,
                _ => {
                    last.insert(key, event.value.clone());
                    true
                }
            }
        })
        .collect()
}
