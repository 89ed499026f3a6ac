//! Stress tests for qsys-change-groups
//!
//! These verify behaviour with many groups, many concurrent pollers, slow
//! gateways and sustained cache pressure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use qsys_change_groups::{
    AutoPollState, CacheConfig, CachePriority, ChangeGroupConfig, ChangeGroupManager,
    EventCache, EventQuery, EventRecord,
};
use qsys_core::{ManualClock, MockGateway, SystemClock};

const T0: u64 = 1_700_000_000_000;

fn manager_with(gateway: Arc<MockGateway>, config: ChangeGroupConfig) -> ChangeGroupManager {
    let clock = Arc::new(ManualClock::new(T0));
    ChangeGroupManager::with_clock(gateway, clock, config).expect("valid config")
}

// ============================================================================
// Scheduling
// ============================================================================

/// Test 50 groups auto-polling at once
///
/// Every group should get its own ticks regardless of the others.
#[tokio::test(start_paused = true)]
async fn test_many_groups_poll_independently() {
    let gateway = Arc::new(MockGateway::new());
    for i in 0..50 {
        gateway.set_control(&format!("Zone{}.gain", i), i as f64);
    }
    let manager = manager_with(gateway.clone(), ChangeGroupConfig::default());

    for i in 0..50 {
        let id = format!("zone-{}", i);
        manager.create_group(&id).unwrap();
        manager
            .add_controls(&id, &[format!("Zone{}.gain", i)])
            .await
            .unwrap();
        manager.enable_auto_poll(&id, 1.0).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(5_500)).await;

    for group in manager.list_groups() {
        assert!(group.has_auto_poll, "{} stopped", group.id);
        assert_eq!(group.poll_count, 5, "{} polled {} times", group.id, group.poll_count);
    }
    assert_eq!(manager.scheduler().active_count(), 50);

    manager.shutdown();
    assert_eq!(manager.scheduler().active_count(), 0);
}

/// Test a slow group does not delay a fast one
#[tokio::test(start_paused = true)]
async fn test_slow_gateway_only_skips_own_ticks() {
    let slow_gateway = Arc::new(MockGateway::new());
    slow_gateway.set_control("Slow.level", 0.0);
    slow_gateway.set_latency(Duration::from_millis(3_500));
    let slow = manager_with(slow_gateway, ChangeGroupConfig::default());

    let fast_gateway = Arc::new(MockGateway::new());
    fast_gateway.set_control("Fast.level", 0.0);
    let fast = manager_with(fast_gateway, ChangeGroupConfig::default());

    for (manager, id, control) in [(&slow, "slow", "Slow.level"), (&fast, "fast", "Fast.level")] {
        manager.create_group(id).unwrap();
        manager.add_controls(id, &[control.to_string()]).await.unwrap();
        manager.enable_auto_poll(id, 1.0).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(8_500)).await;

    let fast_status = fast.auto_poll_status("fast").unwrap();
    assert_eq!(fast_status.ticks, 8);
    assert_eq!(fast_status.skipped_ticks, 0);
    assert_eq!(fast.registry().get("fast").unwrap().poll_count(), 8);

    let slow_status = slow.auto_poll_status("slow").unwrap();
    assert_eq!(slow_status.ticks, 8);
    assert!(slow_status.skipped_ticks >= 4);
    assert_eq!(slow_status.state, AutoPollState::Running);
    assert_eq!(slow_status.consecutive_failures, 0);
}

/// Test manual polls racing each other stay serialized per group
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_manual_polls_report_each_change_once() {
    let gateway = Arc::new(MockGateway::new());
    gateway.set_control("A.gain", 0.0);
    gateway.set_control("A.mute", false);
    let manager = Arc::new(manager_with(gateway.clone(), ChangeGroupConfig::default()));

    manager.create_group("g1").unwrap();
    manager
        .add_controls("g1", &["A.gain".to_string(), "A.mute".to_string()])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.poll("g1", false).await.unwrap().change_count
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    // Both members are new exactly once, whichever poll got there first
    assert_eq!(total, 2);
    assert_eq!(manager.registry().get("g1").unwrap().poll_count(), 16);
}

/// Test destroy racing scheduled polls never leaves a cache buffer behind
#[tokio::test(start_paused = true)]
async fn test_destroy_during_slow_poll_drops_results() {
    let gateway = Arc::new(MockGateway::new());
    gateway.set_control("A.gain", 0.0);
    gateway.set_latency(Duration::from_millis(800));
    let manager = Arc::new(manager_with(gateway, ChangeGroupConfig::default()));

    manager.create_group("g1").unwrap();
    manager
        .add_controls("g1", &["A.gain".to_string()])
        .await
        .unwrap();

    let poller = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.poll("g1", false).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.destroy_group("g1").unwrap();

    let result = poller.await.unwrap();
    assert!(result.is_err());
    assert_eq!(manager.cache().group_len("g1"), 0);
    assert_eq!(manager.cache_stats().total_entries, 0);
}

/// Test a poll that outlives its group never feeds a group recreated under
/// the same id
#[tokio::test(start_paused = true)]
async fn test_recreated_group_keeps_only_its_own_events() {
    let gateway = Arc::new(MockGateway::new());
    gateway.set_control("A.gain", 0.0);
    gateway.set_latency(Duration::from_millis(800));
    let manager = Arc::new(manager_with(gateway, ChangeGroupConfig::default()));

    manager.create_group("g1").unwrap();
    manager
        .add_controls("g1", &["A.gain".to_string()])
        .await
        .unwrap();

    let stale = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.poll("g1", false).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.destroy_group("g1").unwrap();
    manager.create_group("g1").unwrap();
    manager
        .add_controls("g1", &["A.gain".to_string()])
        .await
        .unwrap();

    let fresh = manager.poll("g1", false).await.unwrap();
    assert_eq!(fresh.change_count, 1);
    assert!(stale.await.unwrap().is_err());

    assert_eq!(manager.cache().group_len("g1"), 1);
    assert_eq!(manager.cache_stats().total_entries, 1);
}

// ============================================================================
// Event cache
// ============================================================================

/// Test sustained recording under a global budget
///
/// Low priority buffers should absorb all of the pressure while the high
/// priority buffer keeps everything it was allowed.
#[test]
fn test_cache_pressure_respects_priority() {
    let config = CacheConfig {
        max_total_entries: 5_000,
        ..CacheConfig::default()
    };
    let clock = Arc::new(ManualClock::new(T0));
    let cache = EventCache::new(config, clock.clone());
    cache.set_priority("critical", CachePriority::High);
    cache.set_priority("background", CachePriority::Low);

    for batch in 0..100u64 {
        clock.advance(Duration::from_millis(10));
        for group in ["critical", "background", "normal"] {
            let events = (0..20)
                .map(|i| EventRecord::new(format!("{}.x{}", group, i), batch as f64, T0 + batch * 10))
                .collect();
            cache.record(group, events);
        }
    }

    assert!(cache.total_entries() <= 5_000);
    assert_eq!(cache.group_len("critical"), 2_000);
    assert_eq!(cache.group_len("normal"), 2_000);
    assert_eq!(cache.group_len("background"), 1_000);

    let stats = cache.stats();
    let background = stats
        .groups
        .iter()
        .find(|g| g.group_id == "background")
        .unwrap();
    // Oldest background events went first
    assert_eq!(background.newest_ms, Some(T0 + 990));
    assert_eq!(background.oldest_ms, Some(T0 + 500));
}

/// Test writers crossing the global budget at the same time
///
/// The overflow should be trimmed once: the cache ends exactly full and
/// every evicted event is accounted for by exactly one pressure pass.
#[test]
fn test_concurrent_writers_trim_overflow_once() {
    let config = CacheConfig {
        max_total_entries: 200,
        ..CacheConfig::default()
    };
    let clock = Arc::new(ManualClock::new(T0));
    let cache = Arc::new(EventCache::new(config, clock));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let group = format!("g{}", t);
                let mut appended = 0;
                let mut pressure = 0;
                for i in 0..5_000u64 {
                    let report =
                        cache.record(&group, vec![EventRecord::new("A.gain", i as f64, T0)]);
                    appended += report.appended;
                    pressure += report.evicted.pressure;
                }
                (appended, pressure)
            })
        })
        .collect();

    let (mut appended, mut pressure) = (0, 0);
    for handle in handles {
        let (a, p) = handle.join().unwrap();
        appended += a;
        pressure += p;
    }

    assert_eq!(appended, 40_000);
    assert_eq!(appended - pressure, 200);
    assert_eq!(cache.total_entries(), 200);
    let physical: usize = cache.stats().groups.iter().map(|g| g.entries).sum();
    assert_eq!(physical, 200);
}

/// Test query throughput over a large buffer
#[test]
fn test_large_query() {
    let clock = Arc::new(SystemClock);
    let cache = EventCache::new(CacheConfig::default(), clock);
    let now = qsys_core::Clock::now_ms(&SystemClock);

    let events = (0..50_000u64)
        .map(|i| EventRecord::new(format!("Mixer.ch{}", i % 32), (i % 7) as f64, now - 50_000 + i))
        .collect();
    cache.record("mixer", events);

    let start = Instant::now();
    let query = EventQuery::builder()
        .group("mixer")
        .start_ms(0)
        .controls(["Mixer.ch0", "Mixer.ch1"])
        .limit(10_000)
        .build()
        .unwrap();
    let result = cache.query(&query).unwrap();
    println!(
        "Scanned 50,000 events in {:?}, matched {}",
        start.elapsed(),
        result.total_matched
    );

    assert_eq!(result.total_matched, 50_000 / 32 * 2 + 2);
    assert!(result.events.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
}
