//! Supervisor side of the iterator HTTP control surface.

use std::time::Duration;

use async_trait::async_trait;
use txiter_core::config::IteratorEndpoint;
use txiter_core::supervisor::{ControlError, IteratorControl};
use txiter_core::{IteratorId, IteratorStatus};

/// Controls one iterator through its HTTP server.
#[derive(Debug, Clone)]
pub struct HttpIteratorControl {
    id: IteratorId,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpIteratorControl {
    /// Creates a control handle for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: &IteratorEndpoint, timeout: Duration) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;
        Ok(Self {
            id: endpoint.id.clone(),
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn transport_error(err: &reqwest::Error, timeout: Duration) -> ControlError {
    if err.is_timeout() {
        ControlError::Timeout(timeout)
    } else {
        ControlError::Unreachable(err.to_string())
    }
}

async fn rejected(response: reqwest::Response) -> ControlError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ControlError::Rejected { status, message }
}

#[async_trait]
impl IteratorControl for HttpIteratorControl {
    fn id(&self) -> &IteratorId {
        &self.id
    }

    async fn status(&self) -> Result<IteratorStatus, ControlError> {
        let response = self
            .client
            .get(self.url("/status"))
            .send()
            .await
            .map_err(|e| transport_error(&e, self.timeout))?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        let status: IteratorStatus = response
            .json()
            .await
            .map_err(|e| ControlError::Malformed(e.to_string()))?;
        if status.id != self.id {
            return Err(ControlError::Malformed(format!(
                "expected iterator '{}' but '{}' answered",
                self.id, status.id
            )));
        }
        Ok(status)
    }

    async fn terminate(&self) -> Result<(), ControlError> {
        let response = self
            .client
            .post(self.url("/terminate"))
            .send()
            .await
            .map_err(|e| transport_error(&e, self.timeout))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejected(response).await)
        }
    }
}
