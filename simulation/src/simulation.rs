//! Simulated Q-SYS core
//!
//! A control table whose values drift every tick, with scheduled outages
//! and removable controls. It speaks the same operations as a real core
//! through [`CommandGateway`], so change groups can be pointed at it
//! unchanged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qsys_core::{CommandGateway, ControlValue, GatewayError, MockGateway};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info};

use crate::types::SimStats;

/// Configuration for a simulated core
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Probability a numeric control moves on a tick
    pub drift_probability: f64,
    /// Largest step a numeric control takes in one tick
    pub max_drift: f64,
    /// Probability a boolean control flips on a tick
    pub toggle_probability: f64,
    /// Lower and upper bound for numeric controls
    pub value_range: (f64, f64),
    /// Added to every operation
    pub latency: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            drift_probability: 0.3,
            max_drift: 3.0,
            toggle_probability: 0.05,
            value_range: (-100.0, 20.0),
            latency: Duration::ZERO,
        }
    }
}

impl SimConfig {
    /// Nothing moves unless set by hand
    pub fn frozen() -> Self {
        Self {
            drift_probability: 0.0,
            toggle_probability: 0.0,
            ..Self::default()
        }
    }
}

/// A core whose controls drift over time
pub struct SimulatedCore {
    controls: MockGateway,
    config: SimConfig,
    tick: AtomicU64,
    outage_until: Mutex<Option<u64>>,
    stats: Mutex<SimStats>,
}

impl SimulatedCore {
    pub fn new(config: SimConfig) -> Self {
        let controls = MockGateway::new();
        controls.set_latency(config.latency);
        Self {
            controls,
            config,
            tick: AtomicU64::new(0),
            outage_until: Mutex::new(None),
            stats: Mutex::new(SimStats::default()),
        }
    }

    /// A mixer, a router and a standalone master level
    pub fn venue(config: SimConfig) -> Self {
        let core = Self::new(config);
        core.add_component(
            "Mixer",
            &[
                ("gain", ControlValue::Number(-12.0)),
                ("mute", ControlValue::Bool(false)),
                ("trim", ControlValue::Number(0.0)),
            ],
        );
        core.add_component(
            "Router",
            &[("select", ControlValue::Text("HDMI 1".into()))],
        );
        core.add_control("MasterLevel", ControlValue::Number(-6.0));
        core
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SimStats {
        let mut stats = self.stats.lock().clone();
        stats.gateway_calls = self.controls.call_count();
        stats
    }

    pub fn add_component(&self, component: &str, controls: &[(&str, ControlValue)]) {
        for (control, value) in controls {
            self.add_control(&format!("{}.{}", component, control), value.clone());
        }
    }

    pub fn add_control(&self, name: &str, value: ControlValue) {
        self.write_control(name, value);
    }

    /// Set a control by hand
    pub fn set_control(&self, name: &str, value: impl Into<ControlValue>) {
        self.write_control(name, value.into());
        self.stats.lock().value_changes += 1;
    }

    pub fn control_value(&self, name: &str) -> Option<ControlValue> {
        self.controls.control_value(name)
    }

    pub fn control_names(&self) -> Vec<String> {
        self.controls.control_names()
    }

    /// Delete a control, as if its component were removed from the design
    pub fn remove_control(&self, name: &str) -> bool {
        let removed = self.controls.remove_control(name);
        if removed {
            self.stats.lock().removed_controls += 1;
            info!(control = name, "Control removed from simulated core");
        }
        removed
    }

    /// Go offline for `ticks` ticks
    pub fn disconnect_for(&self, ticks: u64) {
        let until = self.tick() + ticks;
        *self.outage_until.lock() = Some(until);
        self.controls.set_connected(false);
        self.stats.lock().outages += 1;
        info!(until_tick = until, "Simulated core offline");
    }

    /// Go offline until [`SimulatedCore::reconnect`]
    pub fn disconnect(&self) {
        *self.outage_until.lock() = None;
        self.controls.set_connected(false);
        self.stats.lock().outages += 1;
        info!("Simulated core offline");
    }

    pub fn reconnect(&self) {
        *self.outage_until.lock() = None;
        self.controls.set_connected(true);
        info!(tick = self.tick(), "Simulated core back online");
    }

    pub fn is_online(&self) -> bool {
        self.controls.is_connected()
    }

    fn write_control(&self, name: &str, value: ControlValue) {
        match &value {
            ControlValue::Number(n) => {
                self.controls
                    .set_control_with_string(name, value.clone(), &format!("{:.1}dB", n))
            }
            _ => self.controls.set_control(name, value),
        }
    }

    /// Advance one tick, drifting values; returns the controls that moved
    pub fn step(&self) -> Vec<String> {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;

        let outage_over = self.outage_until.lock().is_some_and(|until| tick >= until);
        if outage_over {
            self.reconnect();
        }

        let mut rng = rand::rng();
        let (low, high) = self.config.value_range;
        let mut moved = Vec::new();

        for name in self.controls.control_names() {
            let Some(value) = self.controls.control_value(&name) else {
                continue;
            };
            let next = match value {
                ControlValue::Number(n) if rng.random::<f64>() < self.config.drift_probability => {
                    let step = rng.random_range(-self.config.max_drift..=self.config.max_drift);
                    let next = ((n + step).clamp(low, high) * 10.0).round() / 10.0;
                    (next != n).then_some(ControlValue::Number(next))
                }
                ControlValue::Bool(b) if rng.random::<f64>() < self.config.toggle_probability => {
                    Some(ControlValue::Bool(!b))
                }
                _ => None,
            };
            if let Some(next) = next {
                self.write_control(&name, next);
                moved.push(name);
            }
        }

        let mut stats = self.stats.lock();
        stats.ticks = tick;
        stats.value_changes += moved.len() as u64;
        drop(stats);

        debug!(tick, moved = moved.len(), "Simulated core tick");
        moved
    }

    pub fn run_ticks(&self, ticks: u64) -> usize {
        (0..ticks).map(|_| self.step().len()).sum()
    }
}

#[async_trait]
impl CommandGateway for SimulatedCore {
    fn is_connected(&self) -> bool {
        self.controls.is_connected()
    }

    async fn execute(&self, operation: &str, params: Value) -> Result<Value, GatewayError> {
        self.controls.execute(operation, params).await
    }
}
