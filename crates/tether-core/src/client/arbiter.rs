use crate::api::{ClaimRequest, ClaimResponse, SessionStatus};
use crate::client::types::ArbiterError;

use std::time::Duration;

/// Request helper for the session arbitration endpoints of the control API.
///
/// Stateless apart from the base URL. Servers without the endpoints answer
/// 404 or refuse the connection; both come back as errors and the caller
/// decides what "unknown" means.
#[derive(Clone)]
pub struct SessionArbiter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl SessionArbiter {
    /// `base_url` is the control API root, see `ConnectionTarget::api_base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Claim the session for `device`. Returns the new session id.
    pub async fn claim(&self, device: &str) -> Result<String, ArbiterError> {
        let resp = self
            .client
            .post(format!("{}/session/claim", self.base_url))
            .json(&ClaimRequest {
                device: device.to_string(),
            })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ArbiterError::Claim(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ArbiterError::Claim(format!("HTTP {}", resp.status())));
        }

        let claim: ClaimResponse = resp
            .json()
            .await
            .map_err(|e| ArbiterError::Claim(format!("invalid response: {}", e)))?;
        Ok(claim.session_id)
    }

    /// Ask whether `session_id` still owns the session.
    pub async fn check(&self, session_id: &str) -> Result<SessionStatus, ArbiterError> {
        let resp = self
            .client
            .get(format!("{}/session/check/{}", self.base_url, session_id))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ArbiterError::Check(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ArbiterError::Check(format!("HTTP {}", resp.status())));
        }

        resp.json()
            .await
            .map_err(|e| ArbiterError::Check(format!("invalid response: {}", e)))
    }
}
