/// Row normalizer: turns the loosely-typed rows returned by the sheet
/// service into canonical cards.
///
/// Rules:
/// - rows that are not arrays, or have fewer than two cells, are dropped
/// - front/back are coerced to text; falsy cells (null, false, 0, "") become ""
/// - level is the numeric value of the third cell when it is finite,
///   otherwise `DEFAULT_LEVEL`; fractional levels are truncated
/// - ids are assigned from the position in the normalized output
use serde_json::Value;

use crate::types::{Card, DEFAULT_LEVEL};

pub fn normalize_rows(rows: &[Value]) -> Vec<Card> {
    rows.iter()
        .filter_map(|row| row.as_array())
        .filter(|cells| cells.len() >= 2)
        .enumerate()
        .map(|(i, cells)| Card {
            id: i + 1,
            front: cell_text(&cells[0]),
            back: cell_text(&cells[1]),
            level: cells.get(2).and_then(cell_level).unwrap_or(DEFAULT_LEVEL),
        })
        .collect()
}

/// Text coercion of one cell. Falsy cells map to the empty string.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(false) => String::new(),
        Value::Bool(true) => "true".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 => String::new(),
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Numeric coercion of a level cell. `None` means "use the default".
pub fn cell_level(value: &Value) -> Option<i64> {
    let f = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok()?
        }
        _ => return None,
    };
    if f.is_finite() {
        Some(f.trunc() as i64)
    } else {
        None
    }
}
