//! Control addressing
//!
//! A control is addressed either by a bare name (a named control) or as
//! `Component.Control`. The split happens on the first `.`, so control
//! names containing dots (`Matrix.input.1.gain`) stay intact.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ControlNameError;

/// Longest control name accepted
pub const MAX_CONTROL_NAME_LEN: usize = 256;

/// A validated control address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlAddress {
    /// A standalone named control
    Named(String),
    /// A control that belongs to a component
    Component { component: String, control: String },
}

impl ControlAddress {
    /// Validate and split a control name
    pub fn parse(name: &str) -> Result<Self, ControlNameError> {
        if name.trim().is_empty() {
            return Err(ControlNameError::Empty);
        }
        if name.trim() != name {
            return Err(ControlNameError::SurroundingWhitespace(name.to_string()));
        }
        if name.chars().any(char::is_control) {
            return Err(ControlNameError::ControlCharacters(name.to_string()));
        }
        let len = name.chars().count();
        if len > MAX_CONTROL_NAME_LEN {
            return Err(ControlNameError::TooLong {
                len,
                max: MAX_CONTROL_NAME_LEN,
            });
        }

        match name.split_once('.') {
            None => Ok(ControlAddress::Named(name.to_string())),
            Some((component, control)) => {
                if component.trim().is_empty() {
                    return Err(ControlNameError::EmptyComponent(name.to_string()));
                }
                if control.trim().is_empty() {
                    return Err(ControlNameError::EmptyControl(name.to_string()));
                }
                Ok(ControlAddress::Component {
                    component: component.to_string(),
                    control: control.to_string(),
                })
            }
        }
    }

    /// The component name, if this is a component control
    pub fn component(&self) -> Option<&str> {
        match self {
            ControlAddress::Named(_) => None,
            ControlAddress::Component { component, .. } => Some(component),
        }
    }

    /// The control part of the address
    pub fn control(&self) -> &str {
        match self {
            ControlAddress::Named(name) => name,
            ControlAddress::Component { control, .. } => control,
        }
    }

    /// Full name as members are stored in a group
    pub fn full_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAddress::Named(name) => write!(f, "{}", name),
            ControlAddress::Component { component, control } => {
                write!(f, "{}.{}", component, control)
            }
        }
    }
}
