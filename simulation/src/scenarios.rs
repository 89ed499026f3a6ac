//! Scenarios exercising change groups against a simulated core

use std::sync::Arc;
use std::time::Duration;

use qsys_change_groups::{
    Aggregation, AutoPollState, BufferConfig, CacheConfig, CachePriority, ChangeGroupConfig,
    ChangeGroupError, ChangeGroupManager, Describe, EventQuery, FilterOperator, ValueFilter,
};
use qsys_core::ControlValue;
use tracing::info;

use crate::simulation::{SimConfig, SimulatedCore};
use crate::types::ScenarioReport;

fn manager_for(
    core: &Arc<SimulatedCore>,
    config: ChangeGroupConfig,
) -> anyhow::Result<ChangeGroupManager> {
    Ok(ChangeGroupManager::new(core.clone(), config)?)
}

fn finish(report: &mut ScenarioReport, manager: &ChangeGroupManager) {
    report.polls = manager.list_groups().iter().map(|g| g.poll_count).sum();
    report.cached_events = manager.cache_stats().total_entries;
    manager.shutdown();
}

/// Run the basic scenario: manual polls over a drifting venue, then auto-poll
pub async fn run_basic_scenario(
    config: ChangeGroupConfig,
    sim: SimConfig,
) -> anyhow::Result<ScenarioReport> {
    info!("=== Running Basic Scenario ===");

    let core = Arc::new(SimulatedCore::venue(sim));
    let manager = manager_for(&core, config)?;
    let mut report = ScenarioReport::new("basic");

    println!("\n--- Step 1: Create group and add controls ---");
    manager.create_group("lobby")?;
    let added = manager
        .add_controls(
            "lobby",
            &[
                "Mixer.gain".to_string(),
                "Mixer.mute".to_string(),
                "Router.select".to_string(),
                "MasterLevel".to_string(),
            ],
        )
        .await?;
    report.note(added.describe());

    println!("\n--- Step 2: First poll reports every member ---");
    let outcome = manager.poll("lobby", false).await?;
    report.changes += outcome.change_count as u64;
    report.note(outcome.describe());

    println!("\n--- Step 3: Poll while the core drifts ---");
    for round in 1..=5 {
        core.step();
        let outcome = manager.poll("lobby", false).await?;
        report.changes += outcome.change_count as u64;
        for change in &outcome.changes {
            println!("  round {}: {} -> {}", round, change.name, change.string);
        }
    }

    println!("\n--- Step 4: Operator switches the router ---");
    core.set_control("Router.select", "HDMI 2");
    let outcome = manager.poll("lobby", false).await?;
    report.changes += outcome.change_count as u64;
    report.note(outcome.describe());

    println!("\n--- Step 5: Auto-poll every 100ms for one second ---");
    let cached_before = manager.cache_stats().total_entries;
    manager.enable_auto_poll("lobby", 0.1)?;
    for _ in 0..10 {
        core.step();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if let Some(status) = manager.auto_poll_status("lobby") {
        report.note(status.describe());
    }
    manager.disable_auto_poll("lobby")?;

    // Scheduled polls report through the cache only
    let cached_after = manager.cache_stats().total_entries;
    report.changes += cached_after.saturating_sub(cached_before) as u64;

    let history =
        manager.query_events(&EventQuery::builder().group("lobby").start_ms(0).build()?)?;
    report.note(history.describe());

    finish(&mut report, &manager);
    print_statistics(&report, &core);
    Ok(report)
}

/// Run the outage scenario: failures disable auto-poll, recovery re-enables it
pub async fn run_outage_scenario(
    config: ChangeGroupConfig,
    sim: SimConfig,
) -> anyhow::Result<ScenarioReport> {
    info!("=== Running Outage Scenario ===");

    let threshold = config.failure_threshold;
    let core = Arc::new(SimulatedCore::venue(sim));
    let manager = manager_for(&core, config)?;
    let mut report = ScenarioReport::new("outage");

    manager.create_group("stage")?;
    manager
        .add_controls("stage", &["Mixer.gain".to_string(), "Mixer.mute".to_string()])
        .await?;
    report.changes += manager.poll("stage", false).await?.change_count as u64;

    println!("\n--- Step 1: Short outage during manual polls ---");
    core.disconnect_for(3);
    for _ in 0..5 {
        core.step();
        match manager.poll("stage", false).await {
            Ok(outcome) => report.changes += outcome.change_count as u64,
            Err(ChangeGroupError::Disconnected) => report.poll_errors += 1,
            Err(e) => return Err(e.into()),
        }
    }
    report.note(format!(
        "{} manual polls failed while the core was offline",
        report.poll_errors
    ));

    println!("\n--- Step 2: Long outage under auto-poll ---");
    let interval = Duration::from_millis(50);
    manager.enable_auto_poll("stage", interval.as_secs_f64())?;
    core.disconnect();
    tokio::time::sleep(interval * (threshold + 4)).await;

    let status = manager
        .auto_poll_status("stage")
        .ok_or_else(|| anyhow::anyhow!("auto-poll status missing for stage"))?;
    report.note(status.describe());
    if status.state != AutoPollState::Disabled {
        anyhow::bail!("auto-poll still {:?} after {} failures", status.state, threshold);
    }
    report.poll_errors += status.consecutive_failures as u64;

    println!("\n--- Step 3: Core returns, auto-poll re-enabled ---");
    core.reconnect();
    core.set_control("Mixer.gain", -3.0);
    manager.enable_auto_poll("stage", interval.as_secs_f64())?;
    tokio::time::sleep(interval * 4).await;

    if let Some(status) = manager.auto_poll_status("stage") {
        report.note(status.describe());
    }
    let gain = manager.query_events(
        &EventQuery::builder()
            .group("stage")
            .start_ms(0)
            .value_filter(ValueFilter::new(FilterOperator::ChangedTo, -3.0))
            .build()?,
    )?;
    report.note(format!(
        "Change to -3.0dB recorded {} time(s) after recovery",
        gain.total_matched
    ));

    finish(&mut report, &manager);
    print_statistics(&report, &core);
    Ok(report)
}

/// Run the pressure scenario: three priorities competing for a small budget
pub async fn run_pressure_scenario(
    config: ChangeGroupConfig,
    sim: SimConfig,
) -> anyhow::Result<ScenarioReport> {
    info!("=== Running Pressure Scenario ===");

    let cache = CacheConfig {
        max_total_entries: 300,
        default_buffer: BufferConfig {
            max_entries: 200,
            ..config.cache.default_buffer
        },
        ..config.cache.clone()
    };
    let config = config.with_cache(cache);
    let core = Arc::new(SimulatedCore::new(sim));
    let manager = manager_for(&core, config)?;
    let mut report = ScenarioReport::new("pressure");

    let groups = [
        ("critical", CachePriority::High),
        ("house", CachePriority::Normal),
        ("background", CachePriority::Low),
    ];

    println!("\n--- Step 1: Three groups of 20 controls ---");
    for (group, priority) in groups {
        let names: Vec<String> = (0..20).map(|i| format!("{}.ch{}", group, i)).collect();
        for name in &names {
            core.add_control(name, ControlValue::Number(0.0));
        }
        manager.create_group(group)?;
        manager.add_controls(group, &names).await?;
        manager.set_cache_priority(group, priority)?;
        report.changes += manager.poll(group, false).await?.change_count as u64;
    }

    println!("\n--- Step 2: Every control changes every round ---");
    for round in 1..=10 {
        for (group, _) in groups {
            for i in 0..20 {
                core.set_control(&format!("{}.ch{}", group, i), round as f64);
            }
            let outcome = manager.poll(group, false).await?;
            report.changes += outcome.change_count as u64;
        }
    }

    let stats = manager.cache_stats();
    for group in &stats.groups {
        println!(
            "  {:<10} {:>6?} {:>4} entries",
            group.group_id, group.priority, group.entries
        );
    }
    report.evicted_events = (report.changes as usize).saturating_sub(stats.total_entries);
    report.note(stats.describe());

    finish(&mut report, &manager);
    print_statistics(&report, &core);
    Ok(report)
}

/// Run the query scenario: a scripted history, then every query shape
pub async fn run_query_scenario(
    config: ChangeGroupConfig,
    sim: SimConfig,
) -> anyhow::Result<ScenarioReport> {
    info!("=== Running Query Scenario ===");

    let core = Arc::new(SimulatedCore::venue(sim));
    let manager = manager_for(&core, config)?;
    let mut report = ScenarioReport::new("query");

    manager.create_group("lobby")?;
    manager
        .add_controls("lobby", &["Mixer.gain".to_string(), "Mixer.mute".to_string()])
        .await?;
    report.changes += manager.poll("lobby", false).await?.change_count as u64;

    println!("\n--- Step 1: Scripted history ---");
    let script: [(&str, ControlValue); 6] = [
        ("Mixer.mute", true.into()),
        ("Mixer.mute", false.into()),
        ("Mixer.gain", (-10.0).into()),
        ("Mixer.mute", true.into()),
        ("Mixer.gain", (-5.0).into()),
        ("Mixer.gain", 0.0.into()),
    ];
    for (name, value) in script {
        core.set_control(name, value);
        report.changes += manager.poll("lobby", false).await?.change_count as u64;
    }

    let base = || EventQuery::builder().group("lobby").start_ms(0);

    println!("\n--- Step 2: Queries ---");
    let raw = manager.query_events(&base().build()?)?;
    report.note(format!("raw: {}", raw.describe()));

    let muted = manager.query_events(
        &base()
            .value_filter(ValueFilter::new(FilterOperator::ChangedTo, true))
            .build()?,
    )?;
    report.note(format!("mute changed to true: {} events", muted.total_matched));

    let loud = manager.query_events(
        &base()
            .controls(["Mixer.gain"])
            .value_filter(ValueFilter::new(FilterOperator::Gt, -8.0))
            .build()?,
    )?;
    report.note(format!("gain above -8dB: {} events", loud.total_matched));

    let changes = manager.query_events(&base().aggregation(Aggregation::ChangesOnly).build()?)?;
    report.note(format!("changes only: {} events", changes.total_matched));

    let summary = manager.query_events(&base().aggregation(Aggregation::Summary).build()?)?;
    if let Some(summary) = &summary.summary {
        report.note(format!(
            "summary: {} events over {} controls, per control {:?}",
            summary.event_count, summary.distinct_controls, summary.per_control
        ));
    }

    let page = manager.query_events(&base().limit(3).offset(3).build()?)?;
    report.note(format!(
        "page at offset 3: {} of {} (more: {})",
        page.returned, page.total_matched, page.has_more
    ));

    match manager.query_events(&base().timeout(Duration::ZERO).build()?) {
        Err(e) => report.note(format!("zero budget query: {} ({:?})", e, e.code())),
        Ok(_) => anyhow::bail!("zero budget query unexpectedly completed"),
    }

    finish(&mut report, &manager);
    print_statistics(&report, &core);
    Ok(report)
}

/// Run every scenario in turn
pub async fn run_all(
    config: ChangeGroupConfig,
    sim: SimConfig,
) -> anyhow::Result<Vec<ScenarioReport>> {
    Ok(vec![
        run_basic_scenario(config.clone(), sim.clone()).await?,
        run_outage_scenario(config.clone(), sim.clone()).await?,
        run_pressure_scenario(config.clone(), sim.clone()).await?,
        run_query_scenario(config, sim).await?,
    ])
}

fn print_statistics(report: &ScenarioReport, core: &SimulatedCore) {
    let stats = core.stats();
    println!("\n=== Final Statistics ===");
    println!("Polls: {}", report.polls);
    println!("Changes reported: {}", report.changes);
    println!("Poll errors: {}", report.poll_errors);
    println!("Cached events: {}", report.cached_events);
    println!("Evicted events: {}", report.evicted_events);
    println!("Core ticks: {}", stats.ticks);
    println!("Core value changes: {}", stats.value_changes);
    println!("Core outages: {}", stats.outages);
    println!("Gateway calls: {}", stats.gateway_calls);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_basic_scenario_frozen_core() {
        let report = run_basic_scenario(ChangeGroupConfig::default(), SimConfig::frozen())
            .await
            .unwrap();
        // Four new members, then the router switch
        assert_eq!(report.changes, 5);
        assert_eq!(report.cached_events, 5);
        assert!(report.polls >= 7 + 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_scenario_disables_then_recovers() {
        let report = run_outage_scenario(ChangeGroupConfig::default(), SimConfig::frozen())
            .await
            .unwrap();
        // Two manual failures during the short outage, ten scheduled ones
        assert_eq!(report.poll_errors, 12);
        assert!(report.notes.iter().any(|n| n.contains("recorded 1 time")));
    }

    #[tokio::test]
    async fn test_pressure_scenario_keeps_high_priority() {
        let report = run_pressure_scenario(ChangeGroupConfig::default(), SimConfig::frozen())
            .await
            .unwrap();
        // 60 first-poll events plus ten rounds of 60
        assert_eq!(report.changes, 660);
        assert!(report.cached_events <= 300);
        assert_eq!(report.evicted_events, 660 - report.cached_events);
    }

    #[tokio::test]
    async fn test_query_scenario() {
        let report = run_query_scenario(ChangeGroupConfig::default(), SimConfig::frozen())
            .await
            .unwrap();
        assert_eq!(report.changes, 8);
        assert!(report.notes.contains(&"mute changed to true: 2 events".to_string()));
        assert!(report.notes.contains(&"gain above -8dB: 2 events".to_string()));
        assert!(report.notes.contains(&"page at offset 3: 3 of 8 (more: true)".to_string()));
        assert!(report.notes.iter().any(|n| n.starts_with("zero budget query")));
    }
}
