//! Mock gateway implementation for testing
//!
//! Provides an in-memory core for exercising polling and change detection
//! without a real connection.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use qsys_core::{MockGateway, read_controls};
//!
//! let gateway = MockGateway::new();
//! gateway.set_control("Mixer.gain", -10.0);
//!
//! let result = read_controls(&gateway, &["Mixer.gain".to_string()]).await?;
//! assert_eq!(result.readings.len(), 1);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::gateway::{CommandGateway, operations};
use crate::value::{ControlReading, ControlValue};

/// An in-memory core
///
/// Controls are keyed by full name (`Component.Control` or a bare name).
/// Failures can be injected for the next N calls or indefinitely, and every
/// call can be delayed to simulate a slow link.
pub struct MockGateway {
    controls: DashMap<String, ControlReading>,
    connected: AtomicBool,
    fail_next: AtomicU32,
    failing: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl MockGateway {
    /// Create a connected gateway with no controls
    pub fn new() -> Self {
        Self {
            controls: DashMap::new(),
            connected: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            failing: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Set a control, rendering its display string from the value
    pub fn set_control(&self, name: &str, value: impl Into<ControlValue>) {
        self.controls
            .insert(name.to_string(), ControlReading::plain(name, value));
    }

    /// Set a control with an explicit display string
    pub fn set_control_with_string(
        &self,
        name: &str,
        value: impl Into<ControlValue>,
        string: &str,
    ) {
        self.controls.insert(
            name.to_string(),
            ControlReading::new(name, value.into(), string),
        );
    }

    /// Remove a control from the core
    pub fn remove_control(&self, name: &str) -> bool {
        self.controls.remove(name).is_some()
    }

    /// Current value of a control
    pub fn control_value(&self, name: &str) -> Option<ControlValue> {
        self.controls.get(name).map(|r| r.value.clone())
    }

    /// Names of every control, sorted
    pub fn control_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.controls.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with a transport error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every call with a transport error until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `execute` calls so far
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_call_count(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn entry(reading: &ControlReading, name: &str) -> Value {
        json!({
            "Name": name,
            "Value": reading.value.to_json(),
            "String": reading.string,
        })
    }

    fn control_get(&self, params: &Value) -> Result<Value, GatewayError> {
        let names = params.as_array().ok_or_else(|| {
            GatewayError::command_failed(operations::CONTROL_GET, "params must be an array")
        })?;

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let name = name
                .as_str()
                .or_else(|| name.get("Name").and_then(Value::as_str))
                .ok_or_else(|| {
                    GatewayError::command_failed(operations::CONTROL_GET, "invalid control name")
                })?;
            let reading = self
                .controls
                .get(name)
                .ok_or_else(|| GatewayError::ControlNotFound(name.to_string()))?;
            out.push(Self::entry(&reading, name));
        }
        Ok(Value::Array(out))
    }

    fn component_name<'a>(operation: &str, params: &'a Value) -> Result<&'a str, GatewayError> {
        params
            .get("Name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::command_failed(operation, "missing component Name"))
    }

    fn component_controls(&self, component: &str) -> Vec<(String, ControlReading)> {
        let prefix = format!("{}.", component);
        let mut controls: Vec<(String, ControlReading)> = self
            .controls
            .iter()
            .filter_map(|e| {
                e.key()
                    .strip_prefix(&prefix)
                    .map(|control| (control.to_string(), e.value().clone()))
            })
            .collect();
        controls.sort_by(|a, b| a.0.cmp(&b.0));
        controls
    }

    fn component_get(&self, params: &Value) -> Result<Value, GatewayError> {
        let component = Self::component_name(operations::COMPONENT_GET, params)?;
        if self.component_controls(component).is_empty() {
            return Err(GatewayError::command_failed(
                operations::COMPONENT_GET,
                format!("Component not found: {}", component),
            ));
        }

        let requested = params
            .get("Controls")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                GatewayError::command_failed(operations::COMPONENT_GET, "missing Controls")
            })?;

        let mut out = Vec::with_capacity(requested.len());
        for control in requested {
            let control = control.get("Name").and_then(Value::as_str).ok_or_else(|| {
                GatewayError::command_failed(operations::COMPONENT_GET, "invalid control entry")
            })?;
            let full = format!("{}.{}", component, control);
            let reading = self
                .controls
                .get(&full)
                .ok_or_else(|| GatewayError::ControlNotFound(full.clone()))?;
            out.push(Self::entry(&reading, control));
        }
        Ok(json!({ "Name": component, "Controls": out }))
    }

    fn component_get_controls(&self, params: &Value) -> Result<Value, GatewayError> {
        let component = Self::component_name(operations::COMPONENT_GET_CONTROLS, params)?;
        let controls = self.component_controls(component);
        if controls.is_empty() {
            return Err(GatewayError::command_failed(
                operations::COMPONENT_GET_CONTROLS,
                format!("Component not found: {}", component),
            ));
        }
        let out: Vec<Value> = controls
            .iter()
            .map(|(control, reading)| Self::entry(reading, control))
            .collect();
        Ok(json!({ "Name": component, "Controls": out }))
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandGateway for MockGateway {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn execute(&self, operation: &str, params: Value) -> Result<Value, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.is_connected() {
            return Err(GatewayError::Disconnected);
        }
        if self.take_injected_failure() {
            return Err(GatewayError::Transport("injected failure".to_string()));
        }

        match operation {
            operations::CONTROL_GET => self.control_get(&params),
            operations::COMPONENT_GET => self.component_get(&params),
            operations::COMPONENT_GET_CONTROLS => self.component_get_controls(&params),
            other => Err(GatewayError::command_failed(other, "unknown method")),
        }
    }
}
