//! Identity tokens proving this proxy's own service identity to the backend.
//!
//! Two sources, picked at startup:
//! - [`service_account`]: signs an assertion with a service account key file
//!   and exchanges it for an ID token.
//! - [`metadata`]: asks the instance metadata server, which is what managed
//!   runtimes provide when no key file is configured.
//!
//! [`TokenProvider`] puts the chosen source behind a per-audience cache.

pub mod metadata;
pub mod service_account;

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use moka::{Expiry, future::Cache};
use serde::Deserialize;

use crate::config::Settings;

/// Upper bound for a single call to the token issuer.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Cached tokens are dropped this long before they actually expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// A bearer token plus the expiry read from its `exp` claim, if any.
#[derive(Clone)]
pub struct IdentityToken {
    pub value: String,
    pub expires_at: Option<SystemTime>,
}

impl IdentityToken {
    /// Wraps a JWT, reading its expiry without verifying the signature.
    pub fn from_jwt(value: String) -> Self {
        let expires_at = read_expiry(&value);
        Self { value, expires_at }
    }

    /// How long the token may still be handed out from the cache.
    fn time_to_refresh(&self, now: SystemTime) -> Duration {
        self.expires_at
            .and_then(|exp| exp.duration_since(now).ok())
            .map(|left| left.saturating_sub(REFRESH_MARGIN))
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: u64,
}

fn read_expiry(token: &str) -> Option<SystemTime> {
    match jsonwebtoken::dangerous::insecure_decode::<ExpiryClaim>(token) {
        Ok(data) => Some(UNIX_EPOCH + Duration::from_secs(data.claims.exp)),
        Err(e) => {
            tracing::debug!("identity token has no readable expiry, it will not be cached: {}", e);
            None
        }
    }
}

/// Failures of the underlying token issuing mechanism.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("request to the identity issuer failed")]
    Request(#[from] reqwest::Error),
    #[error("identity issuer responded with {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to read credentials file {path}")]
    CredentialsFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("credentials file is not a valid service account key")]
    InvalidCredentials(#[from] serde_json::Error),
    #[error("unsupported credentials type `{0}`")]
    UnsupportedCredentials(String),
    #[error("failed to sign the token assertion")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("token response did not contain an id_token")]
    MissingIdToken,
    #[error("identity issuer did not answer within {0:?}")]
    Timeout(Duration),
}

/// Something that can mint an identity token scoped to an audience.
#[async_trait]
pub trait IdentityTokenSource: Send + Sync + 'static {
    async fn fetch(&self, audience: &str) -> Result<IdentityToken, TokenError>;
}

/// Identity token acquisition failed. The cause is kept for logging only.
#[derive(Debug, thiserror::Error)]
#[error("failed to obtain an identity token for audience {audience}")]
pub struct AuthError {
    pub audience: String,
    #[source]
    pub source: Arc<TokenError>,
}

struct UntilRefresh;

impl Expiry<String, IdentityToken> for UntilRefresh {
    fn expire_after_create(
        &self,
        _audience: &String,
        token: &IdentityToken,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(token.time_to_refresh(SystemTime::now()))
    }
}

/// Hands out identity tokens per audience, reusing them until shortly before
/// they expire. Concurrent callers for the same audience share one refresh.
#[derive(Clone)]
pub struct TokenProvider {
    source: Arc<dyn IdentityTokenSource>,
    cache: Cache<String, IdentityToken>,
    fetch_timeout: Duration,
}

impl TokenProvider {
    /// `fetch_timeout` bounds each call to the issuer.
    pub fn new(source: Arc<dyn IdentityTokenSource>, fetch_timeout: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(16)
            .expire_after(UntilRefresh)
            .build();

        Self {
            source,
            cache,
            fetch_timeout,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn fetch_token(&self, audience: &str) -> Result<String, AuthError> {
        let timeout = self.fetch_timeout;
        let token = self
            .cache
            .try_get_with(audience.to_string(), async {
                let token = tokio::time::timeout(timeout, self.source.fetch(audience))
                    .await
                    .map_err(|_| TokenError::Timeout(timeout))??;

                crate::audit!(
                    audience = %audience,
                    expires_at = ?token.expires_at,
                    "obtained identity token"
                );
                Ok::<_, TokenError>(token)
            })
            .await
            .map_err(|source| AuthError {
                audience: audience.to_string(),
                source,
            })?;

        Ok(token.value)
    }
}

/// Picks the token source the way the ambient credentials dictate: a service
/// account key file when one is configured, the metadata server otherwise.
pub fn source_from_settings(
    settings: &Settings,
    client: reqwest::Client,
) -> Result<Arc<dyn IdentityTokenSource>, TokenError> {
    match settings
        .google_application_credentials
        .as_deref()
        .filter(|path| !path.is_empty())
    {
        Some(path) => {
            let key = service_account::ServiceAccountKey::from_file(path)?;
            tracing::info!(
                client_email = %key.client_email,
                "using service account key file for identity tokens"
            );
            Ok(Arc::new(service_account::ServiceAccountSource::new(
                client, key,
            )?))
        }
        None => {
            tracing::info!(
                metadata_host = %settings.gce_metadata_host,
                "using metadata server for identity tokens"
            );
            Ok(Arc::new(metadata::MetadataServerSource::new(
                client,
                &settings.gce_metadata_host,
            )))
        }
    }
}
