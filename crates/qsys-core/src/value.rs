//! Control values as reported by a core
//!
//! A control carries a raw value (number, text or boolean) and a
//! human-readable display string. Change detection compares the raw
//! value only; the display string rides along for reporting.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The raw value of a control
///
/// Equality is strict and variant-aware: `Number(1.0)` is not equal to
/// `Bool(true)`. `NaN` compares equal to itself so a control stuck at `NaN`
/// does not report a change on every poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ControlValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl ControlValue {
    /// Normalize a JSON value returned by the gateway
    ///
    /// Returns `None` for arrays, objects and null, which no control reports.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(ControlValue::Number),
            serde_json::Value::String(s) => Some(ControlValue::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(ControlValue::Bool(*b)),
            _ => None,
        }
    }

    /// Convert back to JSON
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ControlValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ControlValue::Text(s) => serde_json::Value::String(s.clone()),
            ControlValue::Bool(b) => serde_json::Value::Bool(*b),
        }
    }

    /// Numeric view used by query filters
    ///
    /// Booleans map to 0/1 and text is parsed when it looks like a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ControlValue::Number(n) => Some(*n),
            ControlValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ControlValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Lenient equality used by query filters
    ///
    /// Falls back to numeric comparison when the variants differ, so a
    /// filter for `0` matches a `false` mute or a `"0"` text control.
    pub fn loosely_eq(&self, other: &ControlValue) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (ControlValue::Text(a), ControlValue::Text(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Ordering used by the `gt`/`gte`/`lt`/`lte` filters
    ///
    /// Numeric when both sides have a numeric view, lexical when both are
    /// text, otherwise incomparable.
    pub fn compare(&self, other: &ControlValue) -> Option<Ordering> {
        if let (ControlValue::Text(a), ControlValue::Text(b)) = (self, other)
            && (a.trim().parse::<f64>().is_err() || b.trim().parse::<f64>().is_err())
        {
            return Some(a.cmp(b));
        }
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        }
    }

    /// Short name of the variant, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControlValue::Number(_) => "number",
            ControlValue::Text(_) => "text",
            ControlValue::Bool(_) => "bool",
        }
    }
}

impl PartialEq for ControlValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ControlValue::Number(a), ControlValue::Number(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            (ControlValue::Text(a), ControlValue::Text(b)) => a == b,
            (ControlValue::Bool(a), ControlValue::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Number(n) => write!(f, "{}", n),
            ControlValue::Text(s) => write!(f, "{}", s),
            ControlValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<f64> for ControlValue {
    fn from(n: f64) -> Self {
        ControlValue::Number(n)
    }
}

impl From<i64> for ControlValue {
    fn from(n: i64) -> Self {
        ControlValue::Number(n as f64)
    }
}

impl From<bool> for ControlValue {
    fn from(b: bool) -> Self {
        ControlValue::Bool(b)
    }
}

impl From<&str> for ControlValue {
    fn from(s: &str) -> Self {
        ControlValue::Text(s.to_string())
    }
}

impl From<String> for ControlValue {
    fn from(s: String) -> Self {
        ControlValue::Text(s)
    }
}

/// One observed control: its full name, raw value and display string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReading {
    pub name: String,
    pub value: ControlValue,
    pub string: String,
}

impl ControlReading {
    pub fn new(name: impl Into<String>, value: ControlValue, string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            string: string.into(),
        }
    }

    /// Reading whose display string is the value's own rendering
    pub fn plain(name: impl Into<String>, value: impl Into<ControlValue>) -> Self {
        let value = value.into();
        let string = value.to_string();
        Self::new(name, value, string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_equality_is_variant_aware() {
        assert_eq!(ControlValue::Number(1.0), ControlValue::Number(1.0));
        assert_ne!(ControlValue::Number(1.0), ControlValue::Bool(true));
        assert_ne!(ControlValue::Number(0.0), ControlValue::Text("0".into()));
        assert_ne!(ControlValue::Text("on".into()), ControlValue::Text("On".into()));
    }

    #[test]
    fn test_nan_equals_nan() {
        assert_eq!(ControlValue::Number(f64::NAN), ControlValue::Number(f64::NAN));
        assert_ne!(ControlValue::Number(f64::NAN), ControlValue::Number(0.0));
    }

    #[test]
    fn test_from_json() {
        assert_eq!(ControlValue::from_json(&json!(-12.5)), Some(ControlValue::Number(-12.5)));
        assert_eq!(ControlValue::from_json(&json!(3)), Some(ControlValue::Number(3.0)));
        assert_eq!(ControlValue::from_json(&json!("HDMI 1")), Some(ControlValue::Text("HDMI 1".into())));
        assert_eq!(ControlValue::from_json(&json!(true)), Some(ControlValue::Bool(true)));
        assert_eq!(ControlValue::from_json(&json!(null)), None);
        assert_eq!(ControlValue::from_json(&json!([1, 2])), None);
    }

    #[test]
    fn test_loose_equality() {
        assert!(ControlValue::Bool(false).loosely_eq(&ControlValue::Number(0.0)));
        assert!(ControlValue::Text("0".into()).loosely_eq(&ControlValue::Number(0.0)));
        assert!(!ControlValue::Text("mute".into()).loosely_eq(&ControlValue::Number(0.0)));
        assert!(ControlValue::Text("mute".into()).loosely_eq(&ControlValue::Text("mute".into())));
    }

    #[test]
    fn test_compare() {
        let a = ControlValue::Number(-20.0);
        let b = ControlValue::Number(-10.0);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(ControlValue::Bool(true).compare(&ControlValue::Number(0.5)), Some(Ordering::Greater));
        assert_eq!(
            ControlValue::Text("b".into()).compare(&ControlValue::Text("a".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(
            ControlValue::Text("10".into()).compare(&ControlValue::Text("9".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(ControlValue::Text("loud".into()).compare(&ControlValue::Number(1.0)), None);
    }

    #[test]
    fn test_serde_shape() {
        let encoded = serde_json::to_value(ControlValue::Number(-6.0)).unwrap();
        assert_eq!(encoded, json!({"type": "number", "value": -6.0}));

        let decoded: ControlValue = serde_json::from_value(json!({"type": "bool", "value": true})).unwrap();
        assert_eq!(decoded, ControlValue::Bool(true));
    }

    #[test]
    fn test_plain_reading() {
        let reading = ControlReading::plain("Mixer.gain", -3.5);
        assert_eq!(reading.string, "-3.5");
        assert_eq!(reading.value, ControlValue::Number(-3.5));
    }
}
