//! # Q-SYS Core
//!
//! Shared types, the gateway capability, and errors for change group
//! monitoring of a Q-SYS-style control core.
//!
//! ## Key Types
//!
//! - [`ControlValue`]: Tagged raw value of a control (number, text, boolean)
//! - [`ControlReading`]: One observed control with its display string
//! - [`ControlAddress`]: Validated named or `Component.Control` address
//! - [`CommandGateway`]: Capability for executing remote operations
//! - [`MockGateway`]: In-memory core for tests and simulation
//! - [`Clock`]: Wall-clock milliseconds, replaceable in tests
//!
//! ## Reading Controls
//!
//! [`read_controls`] batches reads per component and isolates controls that
//! the core rejects, so one missing control never hides the rest.

pub mod clock;
pub mod control;
pub mod error;
pub mod gateway;
pub mod mock_gateway;
pub mod value;

// Re-export main types
pub use clock::*;
pub use control::*;
pub use error::*;
pub use gateway::*;
pub use mock_gateway::*;
pub use value::*;
