//! Concrete parameter values passed to objective functions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Named parameter values, ordered by name so logs and messages are stable.
pub type Params = BTreeMap<String, ParamValue>;

/// A concrete parameter value: either fixed in the job spec or drawn by a
/// sampler from a distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    /// Produced by list-valued parameter spaces (one sample per element).
    List(Vec<ParamValue>),
    Json(serde_json::Value),
}

impl ParamValue {
    /// Normalise an arbitrary JSON value, preferring the numeric variants.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            other => Self::Json(other),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
            Self::List(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Json(v) => v.as_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Json(serde_json::Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Json(serde_json::Value::String(s)) => write!(f, "{s}"),
            Self::Json(v) => write!(f, "{v}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Json(serde_json::Value::Bool(v))
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Json(serde_json::Value::String(v.to_string()))
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Json(serde_json::Value::String(v))
    }
}

/// Merge fixed job parameters with sampled trial parameters. Sampled values
/// win on key collision.
pub fn merge_params(fixed: &Params, sampled: &Params) -> Params {
    let mut merged = fixed.clone();
    for (name, value) in sampled {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sampled_values_take_precedence() {
        let mut fixed = Params::new();
        fixed.insert("epochs".into(), ParamValue::Int(10));
        fixed.insert("lr".into(), ParamValue::Float(0.1));

        let mut sampled = Params::new();
        sampled.insert("lr".into(), ParamValue::Float(0.01));

        let merged = merge_params(&fixed, &sampled);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["lr"], ParamValue::Float(0.01));
        assert_eq!(merged["epochs"], ParamValue::Int(10));
    }

    #[test]
    fn untagged_deserialization_prefers_numbers() {
        let params: Params =
            serde_json::from_value(json!({"a": 3, "b": 0.5, "c": "adam", "d": [1, 2]})).unwrap();
        assert_eq!(params["a"], ParamValue::Int(3));
        assert_eq!(params["b"], ParamValue::Float(0.5));
        assert_eq!(params["c"].as_str(), Some("adam"));
        assert_eq!(
            params["d"],
            ParamValue::List(vec![ParamValue::Int(1), ParamValue::Int(2)])
        );
    }

    #[test]
    fn from_json_normalises_numbers() {
        assert_eq!(ParamValue::from_json(json!(4)), ParamValue::Int(4));
        assert_eq!(ParamValue::from_json(json!(0.25)), ParamValue::Float(0.25));
        assert_eq!(ParamValue::from_json(json!(true)).as_bool(), Some(true));
    }

    #[test]
    fn display_is_human_readable() {
        let list = ParamValue::List(vec![ParamValue::Int(1), ParamValue::from("relu")]);
        assert_eq!(list.to_string(), "[1, relu]");
        assert_eq!(ParamValue::Float(0.5).to_string(), "0.5");
    }
}
