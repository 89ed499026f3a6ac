//! # Q-SYS Change Group Simulation
//!
//! A simulated core and a set of scenarios that drive change groups
//! against it.
//!
//! ## Overview
//!
//! [`SimulatedCore`] holds a table of controls and answers the same
//! operations a real core does. Every [`SimulatedCore::step`] drifts
//! numeric controls and occasionally flips booleans. Outages can be
//! scheduled for a number of ticks, and controls can be removed to model a
//! design change underneath a running group.
//!
//! ## Scenarios
//!
//! - **basic**: manual polls while the venue drifts, then auto-poll
//! - **outage**: auto-poll disabling itself after repeated failures
//! - **pressure**: eviction order across cache priorities
//! - **query**: filters, pagination and aggregations
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use qsys_simulation::{SimConfig, SimulatedCore};
//!
//! let core = Arc::new(SimulatedCore::venue(SimConfig::default()));
//! let manager = ChangeGroupManager::new(core.clone(), ChangeGroupConfig::default())?;
//!
//! core.disconnect_for(3);
//! core.run_ticks(3);
//! assert!(core.is_online());
//! ```

pub mod scenarios;
pub mod simulation;
pub mod types;

pub use simulation::{SimConfig, SimulatedCore};
pub use types::{ScenarioReport, SimStats};
