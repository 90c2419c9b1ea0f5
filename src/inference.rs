//! Inference query client.
//!
//! Sends rows of features to a managed online endpoint and returns the
//! endpoint's JSON answer. Failures are logged and reported as `None`; the
//! caller decides whether a missing prediction matters.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Header selecting the deployment behind an endpoint
pub const DEPLOYMENT_HEADER: &str = "azureml-model-deployment";

/// Request body: `{"input_data": [[...], ...]}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRequest<'a> {
    pub input_data: &'a [Vec<f64>],
}

#[derive(Debug, Clone)]
pub struct InferenceClient {
    client: reqwest::Client,
}

impl InferenceClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("labflow/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Score `rows` against `deployment` behind `endpoint_url`.
    ///
    /// Returns `None` when the request cannot be sent, the endpoint answers
    /// with a non-success status, or the body is not JSON.
    pub async fn predict(
        &self,
        endpoint_url: &str,
        api_key: &str,
        deployment: &str,
        rows: &[Vec<f64>],
    ) -> Option<Value> {
        debug!("Scoring {} rows against {}/{}", rows.len(), endpoint_url, deployment);
        let response = match self
            .client
            .post(endpoint_url)
            .bearer_auth(api_key)
            .header(DEPLOYMENT_HEADER, deployment)
            .json(&InferenceRequest { input_data: rows })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("The request failed: {}", e);
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("The request failed with status code: {}", status.as_u16());
            warn!("Response body: {}", body);
            return None;
        }

        match response.json::<Value>().await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Endpoint {} returned a non-JSON body: {}", endpoint_url, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let rows = vec![vec![1.0, 2.5], vec![0.0, -1.0]];
        let body = serde_json::to_value(InferenceRequest { input_data: &rows }).unwrap();
        assert_eq!(body, serde_json::json!({"input_data": [[1.0, 2.5], [0.0, -1.0]]}));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_yields_none() {
        let client = InferenceClient::new(Duration::from_millis(500)).unwrap();
        let result = client
            .predict("http://127.0.0.1:1/score", "key", "blue", &[vec![0.0]])
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_malformed_url_yields_none() {
        let client = InferenceClient::new(Duration::from_millis(500)).unwrap();
        assert!(client.predict("not a url", "key", "blue", &[]).await.is_none());
    }
}
