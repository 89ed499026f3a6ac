//! Core types for the Q-SYS change group simulation

use std::fmt;

use serde::Serialize;

/// Counters kept by a simulated core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub ticks: u64,
    /// Control values changed by drift or by hand
    pub value_changes: u64,
    pub outages: u64,
    pub removed_controls: u64,
    /// Operations the change group side sent to the core
    pub gateway_calls: u64,
}

/// What a scenario observed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub polls: u64,
    /// Changes reported by polls
    pub changes: u64,
    pub poll_errors: u64,
    pub cached_events: usize,
    pub evicted_events: usize,
    pub notes: Vec<String>,
}

impl ScenarioReport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        println!("  {}", note);
        self.notes.push(note);
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} polls, {} changes, {} poll errors, {} cached events, {} evicted",
            self.name,
            self.polls,
            self.changes,
            self.poll_errors,
            self.cached_events,
            self.evicted_events
        )
    }
}
