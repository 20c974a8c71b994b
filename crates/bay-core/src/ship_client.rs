//! Ship HTTP client (C3): readiness probing, tagged exec dispatch, file
//! streams, bounded log tails, and the WebSocket terminal proxy.
//!
//! The readiness probe polls every `interval` up to `timeout`, with no
//! back-off on transient non-2xx responses: fixed-interval polling, chosen
//! since nothing calls for a retry schedule beyond a flat timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_LOG_TAIL: u32 = 10_000;
const MAX_UPLOAD_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ShipClientError {
    #[error("ship not ready: {0}")]
    Unready(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("ship unreachable: {0}")]
    Unreachable(String),
    #[error("upload exceeds size limit")]
    OversizeUpload,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecRequest {
    #[serde(rename = "type")]
    pub exec_type: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
}

/// Thin HTTP client bound to one Ship endpoint for the duration of a call.
pub struct ShipClient {
    http: reqwest::Client,
    bearer_token: String,
}

impl ShipClient {
    pub fn new(bearer_token: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            bearer_token,
        }
    }

    fn base_url(endpoint: &str) -> String {
        format!("http://{endpoint}")
    }

    /// Polls `GET {endpoint}/health` every `interval` up to `timeout`.
    /// Returns `Ok(())` on the first 2xx; `Err(Timeout)` otherwise.
    pub async fn wait_until_ready(
        &self,
        endpoint: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), ShipClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let url = format!("{}/health", Self::base_url(endpoint));
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ShipClientError::Timeout(format!(
                    "ship at {endpoint} did not become ready within {}s",
                    timeout.as_secs()
                )));
            }
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                _ => {}
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn exec(
        &self,
        endpoint: &str,
        session_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecResponse, ShipClientError> {
        let url = format!("{}/exec", Self::base_url(endpoint));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .header("X-SESSION-ID", session_id)
            .json(request)
            .send()
            .await
            .map_err(|e| ShipClientError::Unreachable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(ShipClientError::Unready(format!(
                "ship at {endpoint} returned 503"
            )));
        }
        if resp.status().is_server_error() {
            return Err(ShipClientError::Unreachable(format!(
                "ship returned {}",
                resp.status()
            )));
        }

        resp.json::<ExecResponse>()
            .await
            .map_err(|e| ShipClientError::Unreachable(format!("malformed exec response: {e}")))
    }

    /// Uploads `bytes` as multipart to `{endpoint}/upload`, tagged with the
    /// destination path.
    pub async fn upload(
        &self,
        endpoint: &str,
        session_id: &str,
        dest_path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ShipClientError> {
        if bytes.len() as u64 > MAX_UPLOAD_BYTES {
            return Err(ShipClientError::OversizeUpload);
        }

        let part = reqwest::multipart::Part::bytes(bytes).file_name(dest_path.to_string());
        let form = reqwest::multipart::Form::new()
            .text("path", dest_path.to_string())
            .part("file", part);

        let url = format!("{}/upload", Self::base_url(endpoint));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .header("X-SESSION-ID", session_id)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ShipClientError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ShipClientError::Unreachable(format!(
                "upload returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Streams `{endpoint}/download?file_path=...` back as raw bytes.
    pub async fn download(
        &self,
        endpoint: &str,
        session_id: &str,
        file_path: &str,
    ) -> Result<Vec<u8>, ShipClientError> {
        let url = format!("{}/download", Self::base_url(endpoint));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .header("X-SESSION-ID", session_id)
            .query(&[("file_path", file_path)])
            .send()
            .await
            .map_err(|e| ShipClientError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ShipClientError::Unreachable(format!(
                "download returned {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ShipClientError::Unreachable(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Bounded tail of the Ship's own application logs (distinct from the
    /// driver's container-level logs).
    pub async fn logs(&self, endpoint: &str, tail: u32) -> Result<String, ShipClientError> {
        let tail = tail.min(MAX_LOG_TAIL);
        let url = format!("{}/logs", Self::base_url(endpoint));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .query(&[("tail", tail)])
            .send()
            .await
            .map_err(|e| ShipClientError::Unreachable(e.to_string()))?;

        resp.text()
            .await
            .map_err(|e| ShipClientError::Unreachable(e.to_string()))
    }

    /// Builds the upstream terminal URL, forwarding the client's requested
    /// initial PTY size if it gave one.
    pub fn terminal_ws_url(endpoint: &str, cols: Option<u16>, rows: Option<u16>) -> String {
        match (cols, rows) {
            (Some(cols), Some(rows)) => format!("ws://{endpoint}/term?cols={cols}&rows={rows}"),
            _ => format!("ws://{endpoint}/term"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_plain_http_base_url() {
        assert_eq!(ShipClient::base_url("10.0.0.5:8123"), "http://10.0.0.5:8123");
    }

    #[test]
    fn terminal_url_uses_ws_scheme() {
        assert_eq!(
            ShipClient::terminal_ws_url("127.0.0.1:9001", None, None),
            "ws://127.0.0.1:9001/term"
        );
    }

    #[test]
    fn terminal_url_forwards_initial_size() {
        assert_eq!(
            ShipClient::terminal_ws_url("127.0.0.1:9001", Some(80), Some(24)),
            "ws://127.0.0.1:9001/term?cols=80&rows=24"
        );
    }

    #[tokio::test]
    async fn wait_until_ready_times_out_against_closed_port() {
        let client = ShipClient::new("token".into());
        let result = client
            .wait_until_ready("127.0.0.1:1", Duration::from_millis(20), Duration::from_millis(80))
            .await;
        assert!(matches!(result, Err(ShipClientError::Timeout(_))));
    }
}
