//! `http_request`: one HTTP call via reqwest.
//!
//! Parameters:
//! - `url` (string, required)
//! - `method` (string, default `GET`)
//! - `headers` (object of strings, optional)
//! - `body` (string or any JSON value, optional; non-strings are sent as JSON)
//!
//! 5xx, 429 and transport errors are retryable. Other 4xx responses are not.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value, json};

use crate::actions::handler::{
    ActionContext, ActionHandler, ActionOutput, optional_str, require_str,
};
use crate::error::ActionError;

pub const ACTION: &str = "http_request";

/// Cap on the response body kept in the result.
const MAX_BODY_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Default)]
pub struct HttpRequestHandler {
    client: Client,
}

impl HttpRequestHandler {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn invalid(reason: impl Into<String>) -> ActionError {
        ActionError::InvalidParameters {
            action: ACTION.to_string(),
            reason: reason.into(),
        }
    }

    fn build(&self, params: &Map<String, Value>) -> Result<reqwest::RequestBuilder, ActionError> {
        let url = require_str(ACTION, params, "url")?;
        let url = reqwest::Url::parse(url).map_err(|e| Self::invalid(format!("bad url: {e}")))?;

        let method = optional_str(ACTION, params, "method")?.unwrap_or("GET");
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Self::invalid(format!("bad method `{method}`")))?;

        let mut request = self.client.request(method, url);

        if let Some(headers) = params.get("headers") {
            let headers = headers
                .as_object()
                .ok_or_else(|| Self::invalid("`headers` must be an object"))?;
            for (name, value) in headers {
                let value = value
                    .as_str()
                    .ok_or_else(|| Self::invalid(format!("header `{name}` must be a string")))?;
                request = request.header(name.as_str(), value);
            }
        }

        request = match params.get("body") {
            None | Some(Value::Null) => request,
            Some(Value::String(s)) => request.body(s.clone()),
            Some(other) => request.json(other),
        };
        Ok(request)
    }
}

fn classify_status(status: StatusCode, body: &str) -> Result<(), ActionError> {
    if status.is_success() || status.is_redirection() || status.is_informational() {
        return Ok(());
    }
    let reason = format!(
        "HTTP {status}: {}",
        body.chars().take(200).collect::<String>()
    );
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(ActionError::transient(ACTION, reason))
    } else {
        Err(ActionError::permanent(ACTION, reason))
    }
}

#[async_trait]
impl ActionHandler for HttpRequestHandler {
    fn action(&self) -> &str {
        ACTION
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        ctx: ActionContext,
    ) -> Result<ActionOutput, ActionError> {
        let request = self.build(params)?;

        let response = tokio::select! {
            r = request.send() => r.map_err(|e| {
                if e.is_builder() {
                    Self::invalid(e.to_string())
                } else {
                    ActionError::transient(ACTION, format!("request failed: {e}"))
                }
            })?,
            _ = ctx.cancel.cancelled() => return Err(ActionError::Cancelled),
        };
        ctx.progress.report(50);

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();

        let text = tokio::select! {
            t = response.text() => t.map_err(|e| {
                ActionError::transient(ACTION, format!("failed to read body: {e}"))
            })?,
            _ = ctx.cancel.cancelled() => return Err(ActionError::Cancelled),
        };

        classify_status(status, &text)?;

        let parsed = serde_json::from_str::<Value>(&text).ok();
        let body: String = if text.len() > MAX_BODY_SIZE {
            text.chars().take(MAX_BODY_SIZE).collect()
        } else {
            text
        };

        ctx.progress.report(100);
        Ok(ActionOutput::new(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
            "json": parsed,
        })))
    }
}
