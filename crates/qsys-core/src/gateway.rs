//! The command gateway capability and batched control reads
//!
//! The gateway is the only path to the core. Everything this workspace
//! needs from it is expressed through three operations: reading named
//! controls, reading controls of a component, and listing a component's
//! controls (for existence checks).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::control::ControlAddress;
use crate::error::GatewayError;
use crate::value::{ControlReading, ControlValue};

/// Operation names understood by the gateway
pub mod operations {
    /// Read named controls. Params: array of names.
    pub const CONTROL_GET: &str = "Control.Get";
    /// Read controls of one component. Params: `{Name, Controls: [{Name}]}`.
    pub const COMPONENT_GET: &str = "Component.Get";
    /// List every control of one component. Params: `{Name}`.
    pub const COMPONENT_GET_CONTROLS: &str = "Component.GetControls";
}

/// Executes remote operations on a core
///
/// Implementations own the transport and authentication; callers only see
/// operation names, JSON parameters and JSON results.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    /// Whether the link to the core is currently up
    fn is_connected(&self) -> bool;

    /// Execute a named operation
    async fn execute(&self, operation: &str, params: Value) -> Result<Value, GatewayError>;
}

/// A control that could not be read
#[derive(Debug, Clone, PartialEq)]
pub struct ControlReadFailure {
    pub name: String,
    pub error: GatewayError,
}

/// Outcome of [`read_controls`]
#[derive(Debug, Clone, Default)]
pub struct ControlReadResult {
    /// Successful readings, in request order
    pub readings: Vec<ControlReading>,
    /// Per-control failures, in request order
    pub failures: Vec<ControlReadFailure>,
}

impl ControlReadResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One gateway round trip worth of controls
#[derive(Debug, Clone)]
enum ReadBatch {
    Named(Vec<String>),
    Component {
        component: String,
        /// (control part, full name)
        controls: Vec<(String, String)>,
    },
}

impl ReadBatch {
    fn len(&self) -> usize {
        match self {
            ReadBatch::Named(names) => names.len(),
            ReadBatch::Component { controls, .. } => controls.len(),
        }
    }

    fn full_names(&self) -> Vec<String> {
        match self {
            ReadBatch::Named(names) => names.clone(),
            ReadBatch::Component { controls, .. } => {
                controls.iter().map(|(_, full)| full.clone()).collect()
            }
        }
    }

    /// One batch per control, used to isolate a bad member
    fn split(&self) -> Vec<ReadBatch> {
        match self {
            ReadBatch::Named(names) => names
                .iter()
                .map(|n| ReadBatch::Named(vec![n.clone()]))
                .collect(),
            ReadBatch::Component {
                component,
                controls,
            } => controls
                .iter()
                .map(|c| ReadBatch::Component {
                    component: component.clone(),
                    controls: vec![c.clone()],
                })
                .collect(),
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            ReadBatch::Named(_) => operations::CONTROL_GET,
            ReadBatch::Component { .. } => operations::COMPONENT_GET,
        }
    }

    fn params(&self) -> Value {
        match self {
            ReadBatch::Named(names) => json!(names),
            ReadBatch::Component {
                component,
                controls,
            } => {
                let controls: Vec<Value> = controls
                    .iter()
                    .map(|(control, _)| json!({ "Name": control }))
                    .collect();
                json!({ "Name": component, "Controls": controls })
            }
        }
    }

    /// Map the name used in a response entry back to the member's full name
    fn full_name_for(&self, response_name: &str) -> Option<String> {
        match self {
            ReadBatch::Named(names) => names.iter().find(|n| *n == response_name).cloned(),
            ReadBatch::Component { controls, .. } => controls
                .iter()
                .find(|(control, _)| control == response_name)
                .map(|(_, full)| full.clone()),
        }
    }
}

type EntryResults = HashMap<String, Result<ControlReading, GatewayError>>;

/// Read the current value of every named control
///
/// Standalone controls are read in one `Control.Get`; component controls
/// in one `Component.Get` per component. When a batch is rejected because
/// of one of its controls, the batch is re-read a control at a time so the
/// remaining members still report. Link failures abort the whole read.
pub async fn read_controls(
    gateway: &dyn CommandGateway,
    names: &[String],
) -> Result<ControlReadResult, GatewayError> {
    let mut results: EntryResults = HashMap::with_capacity(names.len());
    let mut batches: Vec<ReadBatch> = Vec::new();
    let mut named: Vec<String> = Vec::new();
    let mut component_index: HashMap<String, usize> = HashMap::new();

    for name in names {
        match ControlAddress::parse(name) {
            Ok(ControlAddress::Named(control)) => named.push(control),
            Ok(ControlAddress::Component { component, control }) => {
                let idx = *component_index.entry(component.clone()).or_insert_with(|| {
                    batches.push(ReadBatch::Component {
                        component,
                        controls: Vec::new(),
                    });
                    batches.len() - 1
                });
                if let Some(ReadBatch::Component { controls, .. }) = batches.get_mut(idx) {
                    controls.push((control, name.clone()));
                }
            }
            Err(e) => {
                results.insert(
                    name.clone(),
                    Err(GatewayError::ControlNotFound(e.to_string())),
                );
            }
        }
    }
    if !named.is_empty() {
        batches.insert(0, ReadBatch::Named(named));
    }

    for batch in &batches {
        read_batch(gateway, batch, &mut results).await?;
    }

    let mut out = ControlReadResult::default();
    for name in names {
        match results.remove(name) {
            Some(Ok(reading)) => out.readings.push(reading),
            Some(Err(error)) => out.failures.push(ControlReadFailure {
                name: name.clone(),
                error,
            }),
            // Duplicate names in the request consume a single result
            None => {}
        }
    }
    Ok(out)
}

async fn read_batch(
    gateway: &dyn CommandGateway,
    batch: &ReadBatch,
    results: &mut EntryResults,
) -> Result<(), GatewayError> {
    match fetch(gateway, batch).await {
        Ok(found) => {
            merge(batch, found, results);
            Ok(())
        }
        Err(e) if e.is_transient() => Err(e),
        Err(e) if e.is_control_scoped() && batch.len() > 1 => {
            debug!(
                operation = batch.operation(),
                batch_size = batch.len(),
                error = %e,
                "Batch rejected, reading controls individually"
            );
            for single in batch.split() {
                match fetch(gateway, &single).await {
                    Ok(found) => merge(&single, found, results),
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        for name in single.full_names() {
                            results.insert(name, Err(e.clone()));
                        }
                    }
                }
            }
            Ok(())
        }
        Err(e) => {
            for name in batch.full_names() {
                results.insert(name, Err(e.clone()));
            }
            Ok(())
        }
    }
}

fn merge(batch: &ReadBatch, mut found: EntryResults, results: &mut EntryResults) {
    for name in batch.full_names() {
        let entry = found
            .remove(&name)
            .unwrap_or_else(|| Err(GatewayError::ControlNotFound(name.clone())));
        results.insert(name, entry);
    }
}

async fn fetch(gateway: &dyn CommandGateway, batch: &ReadBatch) -> Result<EntryResults, GatewayError> {
    let operation = batch.operation();
    trace!(operation, batch_size = batch.len(), "Reading controls");
    let response = gateway.execute(operation, batch.params()).await?;

    let entries = match batch {
        ReadBatch::Named(_) => response.as_array(),
        ReadBatch::Component { .. } => response.get("Controls").and_then(Value::as_array),
    }
    .ok_or_else(|| {
        GatewayError::InvalidResponse(format!("{} returned no control list", operation))
    })?;

    let mut found = EntryResults::with_capacity(entries.len());
    for entry in entries {
        let Some(response_name) = entry.get("Name").and_then(Value::as_str) else {
            continue;
        };
        let Some(full_name) = batch.full_name_for(response_name) else {
            continue;
        };
        found.insert(full_name.clone(), parse_entry(&full_name, entry));
    }
    Ok(found)
}

fn parse_entry(full_name: &str, entry: &Value) -> Result<ControlReading, GatewayError> {
    let raw = entry.get("Value").ok_or_else(|| {
        GatewayError::InvalidResponse(format!("{} has no Value", full_name))
    })?;
    let value = ControlValue::from_json(raw).ok_or_else(|| {
        GatewayError::InvalidResponse(format!("{} has unsupported Value {}", full_name, raw))
    })?;
    let string = entry
        .get("String")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string());
    Ok(ControlReading::new(full_name, value, string))
}

/// Ask the core whether a control exists
///
/// Control-scoped rejections mean "no"; link failures are returned as errors.
pub async fn control_exists(
    gateway: &dyn CommandGateway,
    address: &ControlAddress,
) -> Result<bool, GatewayError> {
    let result = match address {
        ControlAddress::Named(name) => gateway
            .execute(operations::CONTROL_GET, json!([name]))
            .await
            .map(|v| {
                v.as_array()
                    .is_some_and(|entries| !entries.is_empty())
            }),
        ControlAddress::Component { component, control } => gateway
            .execute(
                operations::COMPONENT_GET_CONTROLS,
                json!({ "Name": component }),
            )
            .await
            .map(|v| {
                v.get("Controls")
                    .and_then(Value::as_array)
                    .is_some_and(|controls| {
                        controls
                            .iter()
                            .any(|c| c.get("Name").and_then(Value::as_str) == Some(control))
                    })
            }),
    };

    match result {
        Ok(exists) => Ok(exists),
        Err(e) if e.is_control_scoped() => Ok(false),
        Err(e) => Err(e),
    }
}
