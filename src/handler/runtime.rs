//! Minimal Lambda Runtime API client for the `provided.al2023` runtime

use super::{ActionGroupEvent, ActionGroupHandler, Retriever};
use crate::error::KitError;
use crate::Result;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";
const API_VERSION: &str = "2018-06-01";
const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";

/// One event handed out by the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub request_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorReport<'a> {
    error_message: &'a str,
    error_type: &'a str,
}

pub struct LambdaRuntime {
    http: reqwest::Client,
    base_url: String,
}

impl LambdaRuntime {
    /// `endpoint` is `host:port` as found in `AWS_LAMBDA_RUNTIME_API`
    pub fn new(endpoint: &str) -> Result<Self> {
        // The next-invocation call blocks until an event arrives, so no overall timeout
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("http://{}/{}/runtime", endpoint.trim_end_matches('/'), API_VERSION),
        })
    }

    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var(RUNTIME_API_ENV).map_err(|_| {
            KitError::configuration_error(format!("{} is not set; not running inside Lambda", RUNTIME_API_ENV))
        })?;
        Self::new(&endpoint)
    }

    pub fn next_url(&self) -> String {
        format!("{}/invocation/next", self.base_url)
    }

    pub fn response_url(&self, request_id: &str) -> String {
        format!("{}/invocation/{}/response", self.base_url, request_id)
    }

    pub fn error_url(&self, request_id: &str) -> String {
        format!("{}/invocation/{}/error", self.base_url, request_id)
    }

    pub fn init_error_url(&self) -> String {
        format!("{}/init/error", self.base_url)
    }

    pub async fn next_invocation(&self) -> Result<Invocation> {
        let response = self.http.get(self.next_url()).send().await?.error_for_status()?;
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| KitError::internal_error(format!("Runtime API response has no {} header", REQUEST_ID_HEADER)))?;
        let payload = response.json::<Value>().await?;
        Ok(Invocation { request_id, payload })
    }

    pub async fn send_response<T: Serialize>(&self, request_id: &str, body: &T) -> Result<()> {
        self.http
            .post(self.response_url(request_id))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn send_error(&self, request_id: &str, error_type: &str, message: &str) -> Result<()> {
        self.http
            .post(self.error_url(request_id))
            .json(&ErrorReport {
                error_message: message,
                error_type,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn send_init_error(&self, error_type: &str, message: &str) -> Result<()> {
        self.http
            .post(self.init_error_url())
            .json(&ErrorReport {
                error_message: message,
                error_type,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Serve events until the runtime stops answering
    pub async fn run<R: Retriever>(&self, handler: &ActionGroupHandler<R>) -> Result<()> {
        info!("Waiting for invocations");
        loop {
            let invocation = self.next_invocation().await?;
            debug!(request_id = %invocation.request_id, "Received invocation");

            match serde_json::from_value::<ActionGroupEvent>(invocation.payload) {
                Ok(event) => {
                    let response = handler.handle(&event).await;
                    debug!(
                        request_id = %invocation.request_id,
                        status = response.status(),
                        "Sending response"
                    );
                    self.send_response(&invocation.request_id, &response).await?;
                }
                Err(err) => {
                    error!(request_id = %invocation.request_id, error = %err, "Event is not an action group request");
                    self.send_error(&invocation.request_id, "InvalidEvent", &err.to_string())
                        .await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_urls() {
        let runtime = LambdaRuntime::new("127.0.0.1:9001").unwrap();
        assert_eq!(runtime.next_url(), "http://127.0.0.1:9001/2018-06-01/runtime/invocation/next");
        assert_eq!(
            runtime.response_url("req-1"),
            "http://127.0.0.1:9001/2018-06-01/runtime/invocation/req-1/response"
        );
        assert_eq!(
            runtime.error_url("req-1"),
            "http://127.0.0.1:9001/2018-06-01/runtime/invocation/req-1/error"
        );
        assert_eq!(runtime.init_error_url(), "http://127.0.0.1:9001/2018-06-01/runtime/init/error");
    }

    #[test]
    fn test_error_report_field_names() {
        let value = serde_json::to_value(ErrorReport {
            error_message: "bad",
            error_type: "InvalidEvent",
        })
        .unwrap();
        assert_eq!(value["errorMessage"], "bad");
        assert_eq!(value["errorType"], "InvalidEvent");
    }
}
