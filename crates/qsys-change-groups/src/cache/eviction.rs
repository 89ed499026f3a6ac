//! Eviction passes
//!
//! Three independent passes run in order after every append: age purge,
//! count trim, and (only when the global budget is exceeded) a
//! priority-weighted trim across groups. Each is a plain function over
//! buffer state.

use std::collections::VecDeque;

use serde::Serialize;

use crate::cache::buffer::CachedEvent;
use crate::config::CachePriority;

/// How many events each pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    pub expired: usize,
    pub over_capacity: usize,
    pub pressure: usize,
}

impl EvictionReport {
    pub fn total(&self) -> usize {
        self.expired + self.over_capacity + self.pressure
    }
}

/// Pop events older than `max_age_ms` off the front
///
/// Stops at the first event still in age; an out-of-order older event
/// behind it stays until it reaches the front. Queries filter by age
/// independently.
pub fn purge_expired(events: &mut VecDeque<CachedEvent>, max_age_ms: u64, now_ms: u64) -> usize {
    let cutoff = now_ms.saturating_sub(max_age_ms);
    let mut purged = 0;
    while events.front().is_some_and(|e| e.timestamp_ms < cutoff) {
        events.pop_front();
        purged += 1;
    }
    purged
}

/// Drop the oldest events until at most `max_entries` remain
pub fn trim_to_capacity(events: &mut VecDeque<CachedEvent>, max_entries: usize) -> usize {
    let excess = events.len().saturating_sub(max_entries);
    events.drain(..excess);
    excess
}

/// Drop up to `count` of the oldest events
pub fn trim_oldest(events: &mut VecDeque<CachedEvent>, count: usize) -> usize {
    let count = count.min(events.len());
    events.drain(..count);
    count
}

/// Size and weight of one buffer, as seen by the pressure planner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferUsage {
    pub group_id: String,
    pub priority: CachePriority,
    pub len: usize,
}

/// Decide how many events to take from which buffer to shed `excess`
///
/// Lower priority tiers are exhausted before a higher tier is touched.
/// Within a tier the largest buffer gives first (ties by group id), and
/// may be emptied completely.
pub fn plan_pressure_trim(usage: &[BufferUsage], excess: usize) -> Vec<(String, usize)> {
    let mut order: Vec<&BufferUsage> = usage.iter().filter(|u| u.len > 0).collect();
    order.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.len.cmp(&a.len))
            .then(a.group_id.cmp(&b.group_id))
    });

    let mut remaining = excess;
    let mut plan = Vec::new();
    for buffer in order {
        if remaining == 0 {
            break;
        }
        let take = buffer.len.min(remaining);
        plan.push((buffer.group_id.clone(), take));
        remaining -= take;
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsys_core::ControlValue;

    fn events(timestamps: &[u64]) -> VecDeque<CachedEvent> {
        timestamps
            .iter()
            .enumerate()
            .map(|(i, ts)| CachedEvent {
                group_id: "g1".into(),
                control_name: "A.gain".into(),
                value: ControlValue::Number(i as f64),
                string_value: i.to_string(),
                timestamp_ms: *ts,
                sequence: i as u64,
            })
            .collect()
    }

    fn usage(id: &str, priority: CachePriority, len: usize) -> BufferUsage {
        BufferUsage {
            group_id: id.into(),
            priority,
            len,
        }
    }

    #[test]
    fn test_purge_expired() {
        let mut buf = events(&[100, 200, 300, 400]);
        // cutoff = 450 - 200 = 250
        assert_eq!(purge_expired(&mut buf, 200, 450), 2);
        assert_eq!(buf.front().unwrap().timestamp_ms, 300);
    }

    #[test]
    fn test_purge_keeps_boundary_event() {
        let mut buf = events(&[250, 300]);
        assert_eq!(purge_expired(&mut buf, 200, 450), 0);
    }

    #[test]
    fn test_purge_with_clock_before_max_age() {
        let mut buf = events(&[0, 1]);
        assert_eq!(purge_expired(&mut buf, 10_000, 5), 0);
    }

    #[test]
    fn test_trim_to_capacity_drops_oldest() {
        let mut buf = events(&[1, 2, 3, 4, 5]);
        assert_eq!(trim_to_capacity(&mut buf, 3), 2);
        let left: Vec<u64> = buf.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(left, vec![3, 4, 5]);
        assert_eq!(trim_to_capacity(&mut buf, 3), 0);
    }

    #[test]
    fn test_trim_oldest_caps_at_len() {
        let mut buf = events(&[1, 2]);
        assert_eq!(trim_oldest(&mut buf, 10), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pressure_trims_low_before_normal_before_high() {
        let usage = vec![
            usage("high", CachePriority::High, 50),
            usage("normal", CachePriority::Normal, 50),
            usage("low", CachePriority::Low, 30),
        ];

        let plan = plan_pressure_trim(&usage, 60);
        assert_eq!(plan, vec![("low".to_string(), 30), ("normal".to_string(), 30)]);

        let plan = plan_pressure_trim(&usage, 120);
        assert_eq!(
            plan,
            vec![
                ("low".to_string(), 30),
                ("normal".to_string(), 50),
                ("high".to_string(), 40),
            ]
        );
    }

    #[test]
    fn test_pressure_takes_largest_within_tier() {
        let usage = vec![
            usage("a", CachePriority::Low, 10),
            usage("b", CachePriority::Low, 40),
            usage("c", CachePriority::Low, 40),
        ];
        let plan = plan_pressure_trim(&usage, 45);
        assert_eq!(plan, vec![("b".to_string(), 40), ("c".to_string(), 5)]);
    }

    #[test]
    fn test_pressure_nothing_to_do() {
        let usage = vec![usage("a", CachePriority::Low, 10)];
        assert!(plan_pressure_trim(&usage, 0).is_empty());
        assert!(plan_pressure_trim(&[], 5).is_empty());
    }

    #[test]
    fn test_report_total() {
        let report = EvictionReport {
            expired: 1,
            over_capacity: 2,
            pressure: 3,
        };
        assert_eq!(report.total(), 6);
    }
}
