//! Credential scope gate.
//!
//! The updater can send arbitrary requests through the proxy, and the proxy
//! attaches credentials to them. Any GitHub personal access token that can
//! write or delete is therefore refused before a container exists.

use reqwest::StatusCode;

use crate::config::DEFAULT_API_ENDPOINT;
use crate::error::SecurityError;
use crate::model::{Credential, Job};

/// Prefix of classic GitHub personal access tokens.
pub const PAT_PREFIX: &str = "ghp_";

const USER_AGENT: &str = concat!("update-sandbox/", env!("CARGO_PKG_VERSION"));

/// Checks token scopes against the job's API endpoint.
#[derive(Debug, Clone)]
pub struct CredentialGate {
    client: reqwest::Client,
    default_endpoint: String,
}

impl Default for CredentialGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialGate {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            default_endpoint: DEFAULT_API_ENDPOINT.to_string(),
        }
    }

    /// Use a different endpoint when the job does not name one.
    pub fn with_default_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.default_endpoint = endpoint.into();
        self
    }

    /// Reject the run if any token carries write or delete scopes.
    ///
    /// `credentials` must already have placeholders expanded.
    pub async fn check(&self, job: &Job, credentials: &[Credential]) -> Result<(), SecurityError> {
        let endpoint = job
            .source
            .api_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(&self.default_endpoint);

        for token in credentials.iter().filter_map(personal_access_token) {
            let response = self
                .client
                .get(endpoint)
                .header("Authorization", format!("token {token}"))
                .header("User-Agent", USER_AGENT)
                .send()
                .await?;

            if response.status() != StatusCode::OK {
                return Err(SecurityError::UnexpectedStatus {
                    status: response.status().to_string(),
                });
            }

            let scopes = response
                .headers()
                .get("x-oauth-scopes")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if scopes.contains("write") || scopes.contains("delete") {
                tracing::warn!(endpoint = %endpoint, "Refusing token with write scopes");
                return Err(SecurityError::WriteAccess);
            }
        }
        Ok(())
    }
}

/// The secret a credential would present, if it looks like a personal access token.
///
/// `token` wins over `password` when both are set.
fn personal_access_token(credential: &Credential) -> Option<&str> {
    let password = credential.get_str("password").filter(|s| !s.is_empty());
    let token = credential.get_str("token").filter(|s| !s.is_empty());
    token
        .or(password)
        .filter(|secret| secret.starts_with(PAT_PREFIX))
}
