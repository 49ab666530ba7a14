/// HTTP client for the spreadsheet web app.
///
/// fetch: GET  <endpoint>?id=<sheet>
/// save:  POST <endpoint> with `{ "id": sheet, "data": rows }`
use flashdeck_core::remote::{parse_fetch_body, parse_save_ack, RemoteError, SaveAck, SaveRequest, SheetRemote};
use flashdeck_core::types::SheetRow;
use std::time::Duration;

pub struct HttpSheetRemote {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSheetRemote {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Client setup failed: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

impl SheetRemote for HttpSheetRemote {
    async fn fetch_sheet(&self, sheet: &str) -> Result<Vec<serde_json::Value>, RemoteError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("id", sheet)])
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            log::warn!("[flashdeck.remote] GET {} -> {}", sheet, status);
            return Err(RemoteError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        parse_fetch_body(body)
    }

    async fn save_sheet(&self, sheet: &str, rows: &[SheetRow]) -> Result<SaveAck, RemoteError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&SaveRequest { id: sheet, data: rows })
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            log::warn!("[flashdeck.remote] POST {} -> {}", sheet, status);
            return Err(RemoteError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let text = resp.text().await.map_err(transport)?;
        Ok(parse_save_ack(&text))
    }
}
