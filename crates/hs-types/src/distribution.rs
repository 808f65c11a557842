//! Parameter-distribution grammar.
//!
//! Distributions are written in configuration files as short call-like
//! strings:
//!
//! ```text
//! choice([value1, value2, ...])
//! uniform(low, high)
//! loguniform(low, high)
//! randint(low, high)
//! range(start, stop[, step])
//! ```
//!
//! Parsing failures always name the exact grammar that was expected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;
use crate::params::ParamValue;

const CHOICE: &str = "choice([value1, value2, ...])";
const UNIFORM: &str = "uniform(low, high)";
const LOG_UNIFORM: &str = "loguniform(low, high)";
const RAND_INT: &str = "randint(low, high)";
const RANGE: &str = "range(start, stop[, step])";
const ANY: &str = "one of choice([value1, value2, ...]), uniform(low, high), \
                   loguniform(low, high), randint(low, high), range(start, stop[, step])";

/// How a single parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Distribution {
    /// Categorical choices.
    Choice { choices: Vec<serde_json::Value> },
    /// Continuous uniform range [low, high].
    Uniform { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    RandInt { low: i64, high: i64 },
    /// Integers `start, start + step, ...` strictly before `stop`.
    Range { start: i64, stop: i64, step: i64 },
}

impl Distribution {
    /// The grammar this distribution is written in.
    pub fn grammar(&self) -> &'static str {
        match self {
            Self::Choice { .. } => CHOICE,
            Self::Uniform { .. } => UNIFORM,
            Self::LogUniform { .. } => LOG_UNIFORM,
            Self::RandInt { .. } => RAND_INT,
            Self::Range { .. } => RANGE,
        }
    }

    /// Number of values a `range(...)` distribution produces. `None` for
    /// other distributions and for a zero step.
    pub fn range_len(&self) -> Option<u64> {
        match *self {
            Self::Range { start, stop, step } if step != 0 => {
                let span = i128::from(stop) - i128::from(start);
                let step = i128::from(step);
                if span == 0 || span.signum() != step.signum() {
                    return Some(0);
                }
                // Ceiling division; span and step share a sign here.
                u64::try_from((span + step - step.signum()) / step).ok()
            }
            _ => None,
        }
    }

    /// The `index`-th value of a `range(...)` distribution.
    pub fn range_value(&self, index: u64) -> Option<i64> {
        let Self::Range { start, step, .. } = *self else {
            return None;
        };
        if index >= self.range_len()? {
            return None;
        }
        i64::try_from(i128::from(start) + i128::from(step) * i128::from(index)).ok()
    }

    /// Whether `value` could have been drawn from this distribution.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match self {
            Self::Choice { choices } => choices
                .iter()
                .any(|c| ParamValue::from_json(c.clone()) == *value),
            Self::Uniform { low, high } | Self::LogUniform { low, high } => value
                .as_f64()
                .map(|v| v >= *low && v <= *high)
                .unwrap_or(false),
            Self::RandInt { low, high } => value
                .as_i64()
                .map(|v| v >= *low && v <= *high)
                .unwrap_or(false),
            Self::Range { start, step, .. } => match (value.as_i64(), self.range_len()) {
                (Some(v), Some(len)) if *step != 0 => {
                    let offset = i128::from(v) - i128::from(*start);
                    let step = i128::from(*step);
                    offset % step == 0
                        && u64::try_from(offset / step).map_or(false, |index| index < len)
                }
                _ => false,
            },
        }
    }
}

impl FromStr for Distribution {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let text = raw.trim();
        let (name, inner) = split_call(text).ok_or_else(|| invalid(ANY, raw))?;

        match name.to_ascii_lowercase().as_str() {
            "choice" => parse_choice(inner, raw),
            "uniform" => {
                let [low, high] = float_args::<2>(inner, UNIFORM, raw)?;
                if low > high || !(high - low).is_finite() {
                    return Err(invalid("uniform(low, high) with low <= high and a finite width", raw));
                }
                Ok(Self::Uniform { low, high })
            }
            "loguniform" => {
                let [low, high] = float_args::<2>(inner, LOG_UNIFORM, raw)?;
                if low <= 0.0 || low > high {
                    return Err(invalid("loguniform(low, high) with 0 < low <= high", raw));
                }
                Ok(Self::LogUniform { low, high })
            }
            "randint" => {
                let args = int_args(inner, 2, RAND_INT, raw)?;
                let (low, high) = (args[0], args[1]);
                if low > high {
                    return Err(invalid("randint(low, high) with low <= high", raw));
                }
                Ok(Self::RandInt { low, high })
            }
            "range" => {
                let args = match int_args(inner, 3, RANGE, raw) {
                    Ok(args) => args,
                    Err(_) => int_args(inner, 2, RANGE, raw)?,
                };
                let (start, stop, step) = match args[..] {
                    [start, stop] => (start, stop, 1),
                    [start, stop, step] => (start, stop, step),
                    _ => return Err(invalid(RANGE, raw)),
                };
                let dist = Self::Range { start, stop, step };
                if dist.range_len().map_or(true, |len| len == 0) {
                    return Err(invalid("range(start, stop[, step]) with a non-empty range", raw));
                }
                Ok(dist)
            }
            _ => Err(invalid(ANY, raw)),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Choice { choices } => {
                let rendered: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
                write!(f, "choice([{}])", rendered.join(", "))
            }
            Self::Uniform { low, high } => write!(f, "uniform({low}, {high})"),
            Self::LogUniform { low, high } => write!(f, "loguniform({low}, {high})"),
            Self::RandInt { low, high } => write!(f, "randint({low}, {high})"),
            Self::Range { start, stop, step } => write!(f, "range({start}, {stop}, {step})"),
        }
    }
}

impl TryFrom<String> for Distribution {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Distribution> for String {
    fn from(value: Distribution) -> Self {
        value.to_string()
    }
}

/// A parameter maps to one distribution, or to a list of them (sampled as
/// `<name>_0`, `<name>_1`, ... and delivered as a list value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamSpec {
    Single(Distribution),
    List(Vec<Distribution>),
}

impl fmt::Display for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(dist) => write!(f, "{dist}"),
            Self::List(dists) => {
                let items: Vec<String> = dists.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

/// The full search space of a group job.
pub type ParamSpace = BTreeMap<String, ParamSpec>;

fn invalid(expected: &str, got: &str) -> ConfigError {
    ConfigError::InvalidDistribution {
        expected: expected.to_string(),
        got: got.trim().to_string(),
    }
}

/// Split `name(inner)` into its name and the text between the outer parens.
fn split_call(text: &str) -> Option<(&str, &str)> {
    let open = text.find('(')?;
    let inner = text.get(open + 1..)?.strip_suffix(')')?;
    let name = text[..open].trim();
    if name.is_empty() {
        return None;
    }
    Some((name, inner))
}

fn parse_choice(inner: &str, raw: &str) -> Result<Distribution, ConfigError> {
    let list = inner.trim();
    if !(list.starts_with('[') && list.ends_with(']')) {
        return Err(invalid(CHOICE, raw));
    }
    let choices: Vec<serde_json::Value> =
        serde_json::from_str(&list.replace('\'', "\"")).map_err(|_| invalid(CHOICE, raw))?;
    if choices.is_empty() {
        return Err(invalid("choice([value1, value2, ...]) with at least one value", raw));
    }
    Ok(Distribution::Choice { choices })
}

fn float_args<const N: usize>(
    inner: &str,
    grammar: &str,
    raw: &str,
) -> Result<[f64; N], ConfigError> {
    let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(invalid(grammar, raw));
    }
    let mut out = [0.0; N];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = part
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| invalid(grammar, raw))?;
    }
    Ok(out)
}

const I64_MIN_F: f64 = -9_223_372_036_854_775_808.0;
const I64_MAX_F: f64 = 9_223_372_036_854_775_808.0;

fn int_args(inner: &str, n: usize, grammar: &str, raw: &str) -> Result<Vec<i64>, ConfigError> {
    let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
    if parts.len() != n {
        return Err(invalid(grammar, raw));
    }
    parts
        .into_iter()
        .map(|part| {
            if let Ok(v) = part.parse::<i64>() {
                return Ok(v);
            }
            // Accept integral floats such as `10.0`, but only when they fit.
            match part.parse::<f64>() {
                Ok(v) if v.fract() == 0.0 && v >= I64_MIN_F && v < I64_MAX_F => Ok(v as i64),
                _ => Err(invalid(grammar, raw)),
            }
        })
        .collect()
}
