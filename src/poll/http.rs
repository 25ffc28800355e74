//! HTTP status fetcher.

use super::StatusFetcher;
use crate::domain::{FetchError, WorkflowId};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// `GET status_url` with `{id}` replaced by the workflow id.
#[derive(Clone)]
pub struct HttpStatusFetcher {
    url_template: String,
    agent: ureq::Agent,
}

impl HttpStatusFetcher {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            url_template: url_template.into(),
            agent,
        }
    }

    pub fn url_for(&self, workflow_id: &WorkflowId) -> String {
        self.url_template.replace("{id}", workflow_id.as_str())
    }

    fn fetch_blocking(agent: &ureq::Agent, url: &str) -> Result<Value, FetchError> {
        let mut response = match agent.get(url).header("Accept", "application/json").call() {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(404)) => return Err(FetchError::NotFound),
            Err(ureq::Error::Timeout(_)) => return Err(FetchError::Timeout),
            Err(e) => return Err(FetchError::Transport(e.to_string())),
        };
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl StatusFetcher for HttpStatusFetcher {
    async fn fetch(&self, workflow_id: &WorkflowId) -> Result<Value, FetchError> {
        let agent = self.agent.clone();
        let url = self.url_for(workflow_id);
        tokio::task::spawn_blocking(move || Self::fetch_blocking(&agent, &url))
            .await
            .map_err(|e| FetchError::Transport(format!("fetch task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_template_substitutes_id() {
        let fetcher = HttpStatusFetcher::new(
            "http://localhost:8000/api/workflows/{id}/status",
            Duration::from_secs(1),
        );
        assert_eq!(
            fetcher.url_for(&WorkflowId::from("wf_9")),
            "http://localhost:8000/api/workflows/wf_9/status"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_a_transport_error() {
        // Nothing listens on the discard port.
        let fetcher = HttpStatusFetcher::new("http://127.0.0.1:9/{id}", Duration::from_secs(2));
        let result = fetcher.fetch(&WorkflowId::from("wf_1")).await;
        assert!(matches!(
            result,
            Err(FetchError::Transport(_)) | Err(FetchError::Timeout)
        ));
    }
}
