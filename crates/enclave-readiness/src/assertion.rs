//! The closed assertion-token set and its evaluation semantics.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ReadinessError, ReadinessResult};

/// Comparison applied between an extracted recipe field and the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assertion {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    In,
    NotIn,
}

impl Assertion {
    /// Evaluate `actual <assertion> target`.
    pub fn evaluate(&self, actual: &Value, target: &Value) -> ReadinessResult<bool> {
        match self {
            Assertion::Equal => Ok(values_equal(actual, target)),
            Assertion::NotEqual => Ok(!values_equal(actual, target)),
            Assertion::LessThan => Ok(order(actual, target)? == Ordering::Less),
            Assertion::LessThanOrEqual => Ok(order(actual, target)? != Ordering::Greater),
            Assertion::GreaterThan => Ok(order(actual, target)? == Ordering::Greater),
            Assertion::GreaterThanOrEqual => Ok(order(actual, target)? != Ordering::Less),
            Assertion::In => Ok(member_of(actual, target)?),
            Assertion::NotIn => Ok(!member_of(actual, target)?),
        }
    }
}

/// Equality that treats numerically equal JSON numbers as equal (`200` vs
/// `200.0`).
fn values_equal(actual: &Value, target: &Value) -> bool {
    match (actual.as_f64(), target.as_f64()) {
        (Some(a), Some(t)) => a == t,
        _ => actual == target,
    }
}

fn order(actual: &Value, target: &Value) -> ReadinessResult<Ordering> {
    if let (Some(a), Some(t)) = (actual.as_f64(), target.as_f64()) {
        return a.partial_cmp(&t).ok_or_else(|| incomparable(actual, target));
    }
    if let (Some(a), Some(t)) = (actual.as_str(), target.as_str()) {
        return Ok(a.cmp(t));
    }
    Err(incomparable(actual, target))
}

fn member_of(actual: &Value, target: &Value) -> ReadinessResult<bool> {
    let candidates = target
        .as_array()
        .ok_or_else(|| ReadinessError::TargetNotArray(target.to_string()))?;
    Ok(candidates.iter().any(|c| values_equal(actual, c)))
}

fn incomparable(actual: &Value, target: &Value) -> ReadinessError {
    ReadinessError::Incomparable {
        actual: actual.to_string(),
        target: target.to_string(),
    }
}

impl FromStr for Assertion {
    type Err = ReadinessError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "==" => Ok(Assertion::Equal),
            "!=" => Ok(Assertion::NotEqual),
            "<" => Ok(Assertion::LessThan),
            "<=" => Ok(Assertion::LessThanOrEqual),
            ">" => Ok(Assertion::GreaterThan),
            ">=" => Ok(Assertion::GreaterThanOrEqual),
            "IN" => Ok(Assertion::In),
            "NOT_IN" => Ok(Assertion::NotIn),
            other => Err(ReadinessError::UnknownAssertion(other.to_string())),
        }
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Assertion::Equal => "==",
            Assertion::NotEqual => "!=",
            Assertion::LessThan => "<",
            Assertion::LessThanOrEqual => "<=",
            Assertion::GreaterThan => ">",
            Assertion::GreaterThanOrEqual => ">=",
            Assertion::In => "IN",
            Assertion::NotIn => "NOT_IN",
        };
        f.write_str(token)
    }
}
