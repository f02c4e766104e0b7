//! HTTP request runner.
//!
//! Input fields: `url` (required), `method` (default GET),
//! `request_headers`, `request_body` and `timeout_ms`. A response status of
//! 400 or above is reported as a step error alongside the response data.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde_json::{Map, Value};
use tracing::debug;

use super::{required_str, StepRunner};
use crate::domain::errors::ERROR_CODE_BAD_REQUEST;
use crate::domain::{StepError, StepExecutionStatus, StepInput, StepOutput};

/// Runner for `http` steps
pub struct HttpRunner {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout,
        }
    }

    fn method(input: &StepInput) -> Result<Method, StepError> {
        let method = input.get("method").and_then(Value::as_str).unwrap_or("GET");
        Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| StepError::new(ERROR_CODE_BAD_REQUEST, format!("invalid HTTP method '{}'", method)))
    }
}

#[async_trait]
impl StepRunner for HttpRunner {
    fn step_type(&self) -> &str {
        "http"
    }

    fn validate(&self, input: &StepInput) -> Result<(), StepError> {
        let url = required_str(input, "url")?;
        reqwest::Url::parse(url)
            .map_err(|e| StepError::new(ERROR_CODE_BAD_REQUEST, format!("invalid url '{}': {}", url, e)))?;
        Self::method(input)?;
        Ok(())
    }

    async fn run(&self, input: &StepInput, _step_timeout: Duration) -> Result<StepOutput, StepError> {
        self.validate(input)?;
        let url = required_str(input, "url")?;
        let method = Self::method(input)?;
        let request_timeout = input
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let started_at = Utc::now();
        let mut request = self.client.request(method.clone(), url).timeout(request_timeout);

        if let Some(Value::Object(headers)) = input.get("request_headers") {
            for (name, value) in headers {
                let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                request = request.header(name.as_str(), value);
            }
        }

        match input.get("request_body") {
            Some(Value::String(body)) => request = request.body(body.clone()),
            Some(Value::Null) | None => {}
            Some(body) => request = request.json(body),
        }

        let response = request
            .send()
            .await
            .map_err(|e| StepError::execution(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status();
        let mut response_headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.to_string(), Value::from(value));
            }
        }
        let is_json = response_headers
            .get("content-type")
            .and_then(Value::as_str)
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);

        let text = response
            .text()
            .await
            .map_err(|e| StepError::execution(format!("Failed to read response body: {}", e)))?;
        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };
        debug!(status = status.as_u16(), %url, "HTTP request finished");

        let mut vars = Map::new();
        vars.insert("status_code".to_string(), Value::from(status.as_u16()));
        vars.insert("status".to_string(), Value::from(status.to_string()));
        vars.insert("response_headers".to_string(), Value::Object(response_headers));
        vars.insert("response_body".to_string(), body);

        let mut output = StepOutput::finished(vars).with_times(started_at, Utc::now());
        if status.as_u16() >= 400 {
            output.status = StepExecutionStatus::Failed;
            output.errors = vec![StepError::execution(format!("{} {} returned {}", method, url, status))];
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runner() -> HttpRunner {
        HttpRunner::new(Duration::from_millis(3000))
    }

    #[test]
    fn test_validate_url() {
        let mut input = Map::new();
        assert!(runner().validate(&input).is_err());

        input.insert("url".to_string(), json!("not a url"));
        assert!(runner().validate(&input).is_err());

        input.insert("url".to_string(), json!("http://localhost:8080/health"));
        assert!(runner().validate(&input).is_ok());
    }

    #[test]
    fn test_validate_method() {
        let mut input = Map::new();
        input.insert("url".to_string(), json!("http://localhost"));
        input.insert("method".to_string(), json!("post"));
        assert!(runner().validate(&input).is_ok());

        input.insert("method".to_string(), json!("NOT A METHOD"));
        assert!(runner().validate(&input).is_err());
    }

    #[tokio::test]
    async fn test_connection_failure_is_step_error() {
        let mut input = Map::new();
        input.insert("url".to_string(), json!("http://127.0.0.1:1/"));
        input.insert("timeout_ms".to_string(), json!(500));

        let err = runner().run(&input, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.error_code, crate::domain::errors::ERROR_CODE_EXECUTION);
    }
}
