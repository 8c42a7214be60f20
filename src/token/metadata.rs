//! Identity tokens from the instance metadata server.

use async_trait::async_trait;

use super::{IdentityToken, IdentityTokenSource, TokenError};

const IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";

/// Fetches tokens for the runtime's default service account. Requires no
/// credentials of its own; the metadata server only answers from inside the
/// workload.
pub struct MetadataServerSource {
    client: reqwest::Client,
    identity_url: String,
}

impl MetadataServerSource {
    /// `metadata_host` is a bare `host[:port]`, as in `GCE_METADATA_HOST`.
    pub fn new(client: reqwest::Client, metadata_host: &str) -> Self {
        Self {
            client,
            identity_url: format!("http://{metadata_host}{IDENTITY_PATH}"),
        }
    }
}

#[async_trait]
impl IdentityTokenSource for MetadataServerSource {
    #[tracing::instrument(skip(self))]
    async fn fetch(&self, audience: &str) -> Result<IdentityToken, TokenError> {
        let resp = self
            .client
            .get(&self.identity_url)
            .query(&[("audience", audience), ("format", "full")])
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(TokenError::Rejected { status, body });
        }

        Ok(IdentityToken::from_jwt(body.trim().to_string()))
    }
}
