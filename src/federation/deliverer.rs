//! Inbox delivery over HTTP

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::FederationConfig;
use crate::error::{QueueError, Result};

/// Sends one activity to one inbox
pub trait InboxDeliverer: Send + Sync {
    fn deliver<'a>(
        &'a self,
        inbox: &'a Url,
        activity: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Produces authentication headers (e.g. HTTP Signatures) for a request
pub trait RequestSigner: Send + Sync {
    fn sign(&self, method: &str, url: &Url, body: &[u8]) -> Result<Vec<(String, String)>>;
}

/// `reqwest`-based deliverer
#[derive(Clone)]
pub struct HttpDeliverer {
    http_client: reqwest::Client,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl HttpDeliverer {
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &FederationConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            http_client,
            signer: None,
        })
    }

    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    async fn post(&self, inbox: &Url, activity: &serde_json::Value) -> Result<()> {
        // 1. Serialize activity
        let body = serde_json::to_vec(activity)?;

        // 2. Build request, signed when a signer is configured
        let mut request = self
            .http_client
            .post(inbox.clone())
            .header("Content-Type", "application/activity+json");

        if let Some(signer) = &self.signer {
            for (name, value) in signer.sign("POST", inbox, &body)? {
                request = request.header(name, value);
            }
        }

        // 3. POST to inbox
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| QueueError::Delivery(format!("Failed to deliver to {}: {}", inbox, e)))?;

        // 4. Handle response
        if !response.status().is_success() {
            return Err(QueueError::Delivery(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox,
                response.status()
            )));
        }

        tracing::info!(inbox = %inbox, "Delivered activity");
        Ok(())
    }
}

impl InboxDeliverer for HttpDeliverer {
    fn deliver<'a>(
        &'a self,
        inbox: &'a Url,
        activity: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.post(inbox, activity))
    }
}
