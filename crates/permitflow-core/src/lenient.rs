//! Forgiving field decoders for agent-authored JSON.
//!
//! The agent is a language model; numbers sometimes arrive as strings and
//! statuses in odd spellings. These fall back to the field default instead of
//! rejecting the whole record.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::PermitStatus;

/// A finite number, or a numeric string; anything else is `0.0`.
pub fn number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(as_f64(&Value::deserialize(deserializer)?).unwrap_or(0.0))
}

/// Whole hours. Fractions round to nearest, negatives clamp to zero.
pub fn hours<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if let Some(n) = value.as_u64() {
        return Ok(u32::try_from(n).unwrap_or(u32::MAX));
    }
    Ok(as_f64(&value)
        .map(|n| n.round().clamp(0.0, f64::from(u32::MAX)) as u32)
        .unwrap_or(0))
}

/// Known spellings of a permit status; unknown or missing is `Draft`.
pub fn permit_status<'de, D>(deserializer: D) -> Result<PermitStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default())
}

fn as_f64(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}
