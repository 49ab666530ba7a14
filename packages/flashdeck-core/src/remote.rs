/// Contract with the remote sheet service.
///
/// The service exposes two calls:
///   fetch: GET  ?id=<sheet>            -> `[[front, back, level?], ...]` or `{ "data": [...] }`
///   save:  POST { "id": sheet, "data": [[front, back, level], ...] } -> `{ "status": "..." }`
///
/// Transport lives in the backend; this module only defines the trait,
/// the wire types and the body parsing rules.
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::SheetRow;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Server returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Unexpected response body: {0}")]
    Malformed(String),
}

/// Body of a save request.
#[derive(Debug, Clone, Serialize)]
pub struct SaveRequest<'a> {
    pub id: &'a str,
    pub data: &'a [SheetRow],
}

/// Acknowledgement returned by a save. Whether `status` means success is
/// decided by the sync settings, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveAck {
    pub status: String,
}

/// Remote sheet store. Implemented over HTTP by the backend and by fakes in tests.
pub trait SheetRemote: Send + Sync {
    /// Raw rows of `sheet`, not yet normalized.
    fn fetch_sheet(&self, sheet: &str) -> impl Future<Output = Result<Vec<Value>, RemoteError>> + Send;

    fn save_sheet(
        &self,
        sheet: &str,
        rows: &[SheetRow],
    ) -> impl Future<Output = Result<SaveAck, RemoteError>> + Send;
}

/// Extract the row list from a fetch response: either a bare array or an
/// object with a `data` array.
pub fn parse_fetch_body(body: Value) -> Result<Vec<Value>, RemoteError> {
    match body {
        Value::Array(rows) => Ok(rows),
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(rows)) => Ok(rows),
            Some(other) => Err(RemoteError::Malformed(format!(
                "`data` is not an array: {}",
                truncate(&other.to_string())
            ))),
            None => Err(RemoteError::Malformed("object without `data` field".to_string())),
        },
        other => Err(RemoteError::Malformed(truncate(&other.to_string()))),
    }
}

/// Read a save acknowledgement from the raw response text. JSON objects
/// carry a `status` field; anything else is taken as a plain-text status.
pub fn parse_save_ack(text: &str) -> SaveAck {
    let status = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => match map.get("status") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        },
        Ok(Value::String(s)) => s,
        _ => text.trim().to_string(),
    };
    SaveAck { status }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 120;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        let head: String = s.chars().take(MAX).collect();
        format!("{}...", head)
    }
}
